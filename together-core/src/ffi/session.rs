//! Session implementation for FFI

use std::sync::{Arc, Once};

use parking_lot::RwLock;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::ServerClient;
use crate::config::{ServerConfig, SyncConfig};
use crate::connection::ConnectionManager;
use crate::current_time_ms;
use crate::fingerprint::Fingerprint;
use crate::liveness::LivenessKeeper;
use crate::player::{AudioSource, DeviceEvent, Reconciler, ReconcilerConfig, SharedReconciler};
use crate::storage::{LocalStore, PlayerSettings, UserInfo};
use crate::sync::PlayMode;

use super::handlers::{
    dispatch_inbound, forward_connection_state, forward_player_events, AudioAdapter, CallbackSlot, PowerAdapter,
    StorageAdapter,
};
use super::types::*;

static TRACING_INIT: Once = Once::new();

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let mut filter = EnvFilter::from_default_env();
        for directive in ["together_core=debug", "tungstenite=info", "hyper_util=off", "reqwest=off", "hyper=off"] {
            match directive.parse() {
                Ok(d) => filter = filter.add_directive(d),
                Err(e) => eprintln!("Ignoring log directive {}: {}", directive, e),
            }
        }

        let _ = tracing_subscriber::fmt()
            .with_ansi(false) // Disable colors for Xcode / logcat
            .with_target(false)
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

/// Main session interface
#[derive(uniffi::Object)]
pub struct Session {
    runtime: Runtime,
    store: LocalStore,
    client: ServerClient,
    connection: ConnectionManager,
    player: SharedReconciler,
    keeper: LivenessKeeper,
    /// Device events, drained by the inbound dispatcher
    device_events: mpsc::UnboundedSender<DeviceEvent>,
    callback: CallbackSlot,
    fingerprint: String,
}

#[uniffi::export]
impl Session {
    /// Create a new session
    #[uniffi::constructor]
    pub fn new(
        storage: Box<dyn HostStorage>,
        audio: Box<dyn AudioOutput>,
        power: Box<dyn HostPowerControl>,
        environment: EnvironmentInfo,
    ) -> Result<Self, CoreError> {
        init_tracing();
        info!("Initializing together-core session");

        let runtime = Runtime::new().map_err(|e| CoreError::Network(format!("Failed to create tokio runtime: {}", e)))?;
        let config = SyncConfig::default();
        let store = LocalStore::new(Arc::new(StorageAdapter(storage)));

        let fingerprint = Fingerprint::new(store.clone(), environment.into()).generate();
        debug!("Client fingerprint: {}", fingerprint);

        let client = ServerClient::new("", fingerprint.clone(), config.request_timeout)?;
        let identity = restore_login(&store, &client);

        let (sync_tx, sync_rx) = mpsc::unbounded_channel();
        let (device_tx, device_rx) = mpsc::unbounded_channel();
        let connection = ConnectionManager::new(client.clone(), config.clone(), sync_tx, runtime.handle().clone());
        connection.set_identity(identity);

        let player = Reconciler::new(
            Arc::new(AudioAdapter(audio)),
            Arc::new(connection.clone()),
            Arc::new(connection.clone()),
            ReconcilerConfig::from(&config),
        )
        .into_shared();

        let settings = store.player_settings();
        {
            let mut p = player.lock();
            p.set_volume(settings.volume);
            if settings.play_mode != PlayMode::default() {
                p.set_play_mode(settings.play_mode);
            }
        }

        let keeper = LivenessKeeper::new(
            Some(Arc::new(PowerAdapter(power))),
            Arc::new(connection.clone()),
            Arc::new(connection.clone()),
            runtime.handle().clone(),
            &config,
        );

        let callback: CallbackSlot = Arc::new(RwLock::new(None));

        runtime.spawn(dispatch_inbound(sync_rx, device_rx, player.clone(), connection.clone()));
        runtime.spawn(forward_player_events(player.lock().subscribe(), callback.clone(), store.clone()));
        runtime.spawn(forward_connection_state(connection.subscribe(), callback.clone(), store.clone()));

        Ok(Self {
            runtime,
            store,
            client,
            connection,
            player,
            keeper,
            device_events: device_tx,
            callback,
            fingerprint,
        })
    }

    /// Set the event callback
    pub fn set_callback(&self, callback: Box<dyn SessionCallback>) {
        *self.callback.write() = Some(Arc::from(callback));
    }

    // --- Server & account ---

    /// Validate and persist the server to connect to
    pub fn configure_server(&self, host: String, port: Option<u16>, use_https: bool) -> Result<String, CoreError> {
        let config = ServerConfig::new(host, port, use_https);
        let endpoint = config.normalize()?;
        self.store.set_server_config(&config)?;
        info!("Server configured: {}", endpoint.base_url());
        Ok(endpoint.base_url())
    }

    /// Normalized URL of the stored server, if one is configured and valid
    pub fn server_url(&self) -> Option<String> {
        self.store.server_config()?.normalize().ok().map(|e| e.base_url())
    }

    pub fn server_settings(&self) -> Option<ServerSettings> {
        let endpoint = self.store.server_config()?.normalize().ok()?;
        Some(ServerSettings {
            host: endpoint.host().to_string(),
            port: endpoint.port(),
            use_https: endpoint.is_secure(),
        })
    }

    pub fn login(&self, username: String, password: String) -> Result<LoginInfo, CoreError> {
        let username = username.trim().to_string();
        if username.is_empty() {
            return Err(CoreError::InvalidArgument("username is empty".to_string()));
        }
        let base = self.require_server()?;

        let response = self
            .runtime
            .block_on(self.client.at(&base).login(&password))
            .map_err(|e| {
                warn!("Login failed: {}", e);
                CoreError::from(e)
            })?;

        let user = UserInfo::generate(username, current_time_ms());
        self.store.set_token(&response.token)?;
        self.store.set_user_info(&user)?;
        self.client.set_token(Some(response.token));
        self.connection.set_identity(Some(user.clone()));

        info!("Logged in as {} ({})", user.username, user.user_id);
        Ok(LoginInfo {
            username: user.username,
            user_id: user.user_id,
            message: response.message,
        })
    }

    pub fn logout(&self) -> Result<(), CoreError> {
        self.connection.disconnect();
        self.client.set_token(None);
        self.connection.set_identity(None);
        self.store.clear_credentials()?;
        info!("Logged out");
        Ok(())
    }

    pub fn is_logged_in(&self) -> bool {
        self.client.token().is_some()
    }

    pub fn current_user(&self) -> Option<String> {
        self.store.user_info().map(|u| u.username)
    }

    /// Connect to the stored server and load the shared playlist
    pub fn connect(&self) -> Result<(), CoreError> {
        let base = self.require_server()?;
        self.runtime.block_on(self.connection.connect(&base))?;

        if !self.connection.is_connected() {
            debug!("Not connected after connect(), skipping playlist fetch");
            return Ok(());
        }

        match self.runtime.block_on(self.client.at(&base).songs()) {
            Ok(snapshot) => self.player.lock().apply_snapshot(snapshot),
            Err(e) => warn!("Failed to load playlist: {}", e),
        }
        Ok(())
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn connection_state(&self) -> ConnectionSnapshot {
        ConnectionSnapshot::from(&self.connection.state())
    }

    // --- Playback ---

    pub fn playback_state(&self) -> PlaybackSnapshot {
        PlaybackSnapshot::from(self.player.lock().state())
    }

    pub fn play_track(&self, index: u32) -> bool {
        self.player.lock().user_play(index as usize)
    }

    pub fn pause(&self) {
        self.player.lock().user_pause();
    }

    pub fn toggle_play(&self) {
        self.player.lock().user_toggle_play();
    }

    pub fn seek(&self, position: f64) {
        if !position.is_finite() || position < 0.0 {
            warn!("Ignoring seek to {}", position);
            return;
        }
        self.player.lock().user_seek(position);
    }

    /// Index of the track now selected, -1 for none
    pub fn next_track(&self) -> i32 {
        wire_index(self.player.lock().user_next())
    }

    pub fn previous_track(&self) -> i32 {
        wire_index(self.player.lock().user_previous())
    }

    pub fn set_play_mode(&self, mode: PlayMode) {
        self.player.lock().set_play_mode(mode);
        self.save_settings(|s| s.play_mode = mode);
    }

    pub fn set_volume(&self, volume: f32) {
        let volume = {
            let mut player = self.player.lock();
            player.set_volume(volume);
            player.state().volume
        };
        self.save_settings(|s| s.volume = volume);
    }

    pub fn add_track(&self, track: TrackInfo) -> bool {
        self.player.lock().add_track(track.into())
    }

    pub fn remove_track(&self, index: u32) -> bool {
        self.player.lock().remove_track(index as usize).is_some()
    }

    pub fn clear_playlist(&self) {
        self.player.lock().clear_playlist();
    }

    /// Report what the audio output did
    pub fn on_audio_event(&self, event: AudioEvent) {
        if self.device_events.send(event.into()).is_err() {
            warn!("Audio event dropped, dispatcher stopped");
        }
    }

    /// URL the host should load for `track`
    pub fn audio_url(&self, track: TrackInfo) -> Option<String> {
        self.connection.audio_url(&track.into())
    }

    // --- Background ---

    pub fn enable_background(&self) -> KeeperStatusInfo {
        self.keeper.enable().into()
    }

    pub fn disable_background(&self) {
        self.keeper.disable();
    }

    pub fn background_status(&self) -> KeeperStatusInfo {
        self.keeper.status().into()
    }

    pub fn on_visibility_changed(&self, visible: bool) {
        self.keeper.on_visibility_changed(visible);
    }

    pub fn on_wake_lock_lost(&self) {
        self.keeper.on_wake_lock_lost();
    }

    // --- Library ---

    pub fn fingerprint(&self) -> String {
        self.fingerprint.clone()
    }

    pub fn favorites(&self) -> Vec<TrackInfo> {
        self.store.favorites().iter().map(TrackInfo::from).collect()
    }

    pub fn is_favorite(&self, id: String) -> bool {
        self.store.is_favorite(&id)
    }

    /// Add or remove `track` from favorites. Returns whether it is now a favorite.
    pub fn toggle_favorite(&self, track: TrackInfo) -> Result<bool, CoreError> {
        if self.store.is_favorite(&track.id) {
            self.store.remove_favorite(&track.id)?;
            Ok(false)
        } else {
            self.store.add_favorite(&track.into())?;
            Ok(true)
        }
    }

    pub fn play_history(&self) -> Vec<HistoryItem> {
        self.store.play_history().iter().map(HistoryItem::from).collect()
    }

    pub fn clear_history(&self) -> Result<(), CoreError> {
        self.store.clear_history()?;
        Ok(())
    }
}

impl Session {
    fn require_server(&self) -> Result<String, CoreError> {
        let config = self
            .store
            .server_config()
            .ok_or_else(|| CoreError::Config("No server configured".to_string()))?;
        Ok(config.normalize()?.base_url())
    }

    fn save_settings(&self, update: impl FnOnce(&mut PlayerSettings)) {
        let mut settings = self.store.player_settings();
        update(&mut settings);
        if let Err(e) = self.store.set_player_settings(&settings) {
            warn!("Failed to save player settings: {}", e);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.keeper.disable();
        self.connection.disconnect();
        info!("Session closed");
    }
}

/// Put a stored, unexpired token back on the client
fn restore_login(store: &LocalStore, client: &ServerClient) -> Option<UserInfo> {
    let user = store.user_info();
    let token = store.token();

    match (user, token) {
        (Some(user), Some(token)) if !user.is_expired(current_time_ms()) => {
            info!("Restored login for {}", user.username);
            client.set_token(Some(token));
            Some(user)
        }
        (Some(user), _) if user.is_expired(current_time_ms()) => {
            info!("Stored login for {} expired", user.username);
            if let Err(e) = store.clear_credentials() {
                warn!("Failed to clear expired credentials: {}", e);
            }
            None
        }
        _ => None,
    }
}

fn wire_index(index: Option<usize>) -> i32 {
    index.and_then(|i| i32::try_from(i).ok()).unwrap_or(-1)
}
