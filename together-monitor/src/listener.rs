//! Joins the shared session as a listen-only client

use crate::metrics::{LogLevel, MonitorState, MonitorStatus};
use crate::BoxError;
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use together_core::api::ServerClient;
use together_core::config::{ServerEndpoint, SyncConfig};
use together_core::connection::ConnectionManager;
use together_core::fingerprint::{DeviceEnvironment, Fingerprint};
use together_core::player::{DeviceEvent, PlaybackDevice, PlayerEvent, Reconciler, ReconcilerConfig};
use together_core::storage::{JsonFileStore, LocalStore, UserInfo};
use together_core::sync::{ActionSink, OutboundAction};
use together_core::current_time_ms;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Default store file name
const STORE_FILE: &str = "together-monitor.json";

/// How often the playback clock reports progress
const CLOCK_TICK: Duration = Duration::from_secs(1);

pub struct ListenerConfig {
    pub server: String,
    pub password: Option<String>,
    pub username: String,
    pub store_path: PathBuf,
    pub enable_push: bool,
}

impl ListenerConfig {
    pub fn from_env(args: &[String]) -> Self {
        let store_path = std::env::var("TOGETHER_STORE").map(PathBuf::from).unwrap_or_else(|_| {
            // Default: same directory as executable, or current dir
            std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|p| p.to_path_buf()))
                .unwrap_or_else(|| PathBuf::from("."))
                .join(STORE_FILE)
        });

        Self {
            server: std::env::var("TOGETHER_SERVER").unwrap_or_else(|_| "http://127.0.0.1:8080".to_string()),
            password: std::env::var("TOGETHER_PASSWORD").ok().filter(|p| !p.is_empty()),
            username: std::env::var("TOGETHER_USER").unwrap_or_else(|_| "monitor".to_string()),
            store_path,
            enable_push: !args.contains(&"--no-push".to_string()),
        }
    }
}

/// Forwards only heartbeats so the monitor never changes shared playback
struct ListenOnlySink {
    connection: ConnectionManager,
}

impl ActionSink for ListenOnlySink {
    fn send(&self, action: OutboundAction) -> bool {
        match action {
            OutboundAction::Heartbeat { .. } => self.connection.send(action),
            other => {
                debug!("Listen-only, not sending {:?}", other);
                false
            }
        }
    }
}

#[derive(Default)]
struct Clock {
    loaded: bool,
    playing_since: Option<Instant>,
    offset: f64,
}

impl Clock {
    fn position(&self) -> f64 {
        self.offset + self.playing_since.map_or(0.0, |t| t.elapsed().as_secs_f64())
    }
}

/// Keeps time like an audio output would, without producing sound
struct ClockDevice {
    clock: Mutex<Clock>,
    events: mpsc::UnboundedSender<DeviceEvent>,
}

impl ClockDevice {
    fn new(events: mpsc::UnboundedSender<DeviceEvent>) -> Self {
        Self {
            clock: Mutex::new(Clock::default()),
            events,
        }
    }

    fn emit(&self, event: DeviceEvent) {
        let _ = self.events.send(event);
    }

    /// Report progress while running
    fn tick(&self) {
        let position = {
            let clock = self.clock.lock();
            clock.playing_since.is_some().then(|| clock.position())
        };
        if let Some(current_time) = position {
            self.emit(DeviceEvent::TimeUpdate { current_time, duration: 0.0 });
        }
    }
}

impl PlaybackDevice for ClockDevice {
    fn load(&self, url: &str) {
        debug!("Clock loaded {}", url);
        *self.clock.lock() = Clock {
            loaded: true,
            ..Clock::default()
        };
        self.emit(DeviceEvent::CanPlay { duration: 0.0 });
    }

    fn play(&self) {
        {
            let mut clock = self.clock.lock();
            if !clock.loaded || clock.playing_since.is_some() {
                return;
            }
            clock.playing_since = Some(Instant::now());
        }
        self.emit(DeviceEvent::Play);
    }

    fn pause(&self) {
        {
            let mut clock = self.clock.lock();
            if clock.playing_since.is_none() {
                return;
            }
            clock.offset = clock.position();
            clock.playing_since = None;
        }
        self.emit(DeviceEvent::Pause);
    }

    fn seek(&self, position: f64) {
        let mut clock = self.clock.lock();
        clock.offset = position.max(0.0);
        if clock.playing_since.is_some() {
            clock.playing_since = Some(Instant::now());
        }
    }

    fn stop(&self) {
        *self.clock.lock() = Clock::default();
    }

    fn set_volume(&self, _volume: f32) {}

    fn current_time(&self) -> f64 {
        self.clock.lock().position()
    }
}

fn environment() -> DeviceEnvironment {
    DeviceEnvironment {
        user_agent: format!("together-monitor/{}", env!("CARGO_PKG_VERSION")),
        platform: std::env::consts::OS.to_string(),
        device_model: std::env::consts::ARCH.to_string(),
        language: std::env::var("LANG").unwrap_or_default(),
        timezone: std::env::var("TZ").unwrap_or_default(),
        ..DeviceEnvironment::default()
    }
}

/// Reuse a stored login or exchange the password for a new token
async fn authenticate(
    store: &LocalStore,
    client: &ServerClient,
    config: &ListenerConfig,
    base: &str,
) -> Result<UserInfo, BoxError> {
    if let (Some(user), Some(token)) = (store.user_info(), store.token()) {
        if !user.is_expired(current_time_ms()) {
            info!("Reusing stored login for {}", user.username);
            client.set_token(Some(token));
            return Ok(user);
        }
    }

    let password = config
        .password
        .as_deref()
        .ok_or("No stored login and TOGETHER_PASSWORD is not set")?;
    let response = client.at(base).login(password).await?;

    let user = UserInfo::generate(config.username.clone(), current_time_ms());
    store.set_token(&response.token)?;
    store.set_user_info(&user)?;
    client.set_token(Some(response.token));
    info!("Logged in as {}", user.username);
    Ok(user)
}

async fn mirror_player_events(mut events: broadcast::Receiver<PlayerEvent>, state: Arc<RwLock<MonitorState>>) {
    loop {
        match events.recv().await {
            Ok(PlayerEvent::StateChanged(playback)) => state.write().apply_playback(&playback),
            Ok(PlayerEvent::TrackChanged { track, .. }) => state.write().track_changed(&track),
            Ok(PlayerEvent::Progress { current_time, duration }) => {
                let mut s = state.write();
                s.position = current_time;
                s.duration = duration;
            }
            Ok(PlayerEvent::PlaybackError { message, .. }) => state.write().log(LogLevel::Error, message),
            Ok(PlayerEvent::Notice(message)) => state.write().log(LogLevel::Info, message),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Monitor lagged, skipped {} player events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Run the listener until Ctrl-C
pub async fn run(state: Arc<RwLock<MonitorState>>, config: ListenerConfig) -> Result<(), BoxError> {
    info!("Music Together monitor starting...");
    state.write().log(LogLevel::Info, format!("Store: {}", config.store_path.display()));

    let store = LocalStore::new(Arc::new(JsonFileStore::open(&config.store_path)?));
    let fingerprint = Fingerprint::new(store.clone(), environment()).generate();
    info!("Fingerprint: {}", fingerprint);

    let sync_config = SyncConfig {
        enable_push: config.enable_push,
        ..SyncConfig::default()
    };
    let endpoint = ServerEndpoint::parse(&config.server)?;
    let base = endpoint.base_url();
    let client = ServerClient::new("", fingerprint, sync_config.request_timeout)?;

    let user = match authenticate(&store, &client, &config, &base).await {
        Ok(user) => user,
        Err(e) => {
            let mut s = state.write();
            s.status = MonitorStatus::Error;
            s.log(LogLevel::Error, format!("Login failed: {}", e));
            return Err(e);
        }
    };
    state.write().log(LogLevel::Info, format!("Listening as {}", user.username));

    let (sync_tx, mut sync_rx) = mpsc::unbounded_channel();
    let (device_tx, mut device_rx) = mpsc::unbounded_channel();
    let connection = ConnectionManager::new(client.clone(), sync_config.clone(), sync_tx, Handle::current());
    connection.set_identity(Some(user));

    let device = Arc::new(ClockDevice::new(device_tx));
    let player = Reconciler::new(
        device.clone(),
        Arc::new(ListenOnlySink {
            connection: connection.clone(),
        }),
        Arc::new(connection.clone()),
        ReconcilerConfig::from(&sync_config),
    )
    .into_shared();

    tokio::spawn(mirror_player_events(player.lock().subscribe(), Arc::clone(&state)));

    let mut connection_rx = connection.subscribe();
    let state_for_connection = Arc::clone(&state);
    tokio::spawn(async move {
        while connection_rx.changed().await.is_ok() {
            let current = connection_rx.borrow_and_update().clone();
            state_for_connection.write().apply_connection(&current);
        }
    });

    connection.connect(&base).await?;
    if connection.is_connected() {
        match client.at(&base).songs().await {
            Ok(snapshot) => {
                info!("Loaded playlist with {} tracks", snapshot.playlist.len());
                player.lock().apply_snapshot(snapshot);
            }
            Err(e) => warn!("Failed to load playlist: {}", e),
        }
    }

    let mut clock = tokio::time::interval(CLOCK_TICK);
    loop {
        tokio::select! {
            Some(event) = sync_rx.recv() => connection.apply_sync_event(event, &player),
            Some(event) = device_rx.recv() => player.lock().handle_device_event(event),
            _ = clock.tick() => device.tick(),
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    connection.disconnect();
    Ok(())
}

/// Run with plain logging to stderr
pub async fn run_with_logging(state: Arc<RwLock<MonitorState>>, config: ListenerConfig) -> Result<(), BoxError> {
    // Initialize tracing for logging mode
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("together_monitor=info".parse()?)
                .add_directive("together_core=info".parse()?)
                .add_directive("tungstenite=warn".parse()?),
        )
        .init();

    run(state, config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_device_tracks_position() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let device = ClockDevice::new(tx);

        device.play();
        assert!(rx.try_recv().is_err(), "play before load must be ignored");

        device.load("http://host/a.mp3");
        assert_eq!(rx.try_recv().unwrap(), DeviceEvent::CanPlay { duration: 0.0 });

        device.seek(30.0);
        device.play();
        assert_eq!(rx.try_recv().unwrap(), DeviceEvent::Play);
        assert!(device.current_time() >= 30.0);

        device.pause();
        assert_eq!(rx.try_recv().unwrap(), DeviceEvent::Pause);
        let paused_at = device.current_time();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(device.current_time(), paused_at);

        device.tick();
        assert!(rx.try_recv().is_err(), "no progress while paused");

        device.stop();
        assert_eq!(device.current_time(), 0.0);
    }
}
