//! Connection Manager
//!
//! Owns which transport is active and is the only writer of
//! [`ConnectionState`]. Polling always starts first; push is attempted once
//! polling is running and is never retried after it drops.

use std::future::Future;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::polling::PollingEngine;
use super::push::{PushLink, PushSender};
use super::state::{ConnectError, ConnectionState, TransportMode, TransportSignal};
use crate::api::{ApiError, ServerClient};
use crate::config::{ServerEndpoint, SyncConfig};
use crate::current_time_ms;
use crate::liveness::HealthProbe;
use crate::player::{AudioSource, SharedReconciler};
use crate::storage::UserInfo;
use crate::sync::{ActionSink, OutboundAction, PushMessage, SyncEvent, Track};

/// Everything tied to one connection attempt
#[derive(Default)]
struct Link {
    /// Client bound to the connected server
    client: Option<ServerClient>,
    polling: Option<Arc<PollingEngine>>,
    push: Option<PushLink>,
    heartbeat: Option<JoinHandle<()>>,
    supervisor: Option<JoinHandle<()>>,
    signals: Option<mpsc::UnboundedSender<TransportSignal>>,
}

struct Inner {
    config: SyncConfig,
    client: ServerClient,
    runtime: Handle,
    events: mpsc::UnboundedSender<SyncEvent>,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Link>,
    identity: Mutex<Option<UserInfo>>,
}

/// Handle to the connection layer. Clones share one connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// `events` receives every inbound [`SyncEvent`] from either transport
    pub fn new(
        client: ServerClient,
        config: SyncConfig,
        events: mpsc::UnboundedSender<SyncEvent>,
        runtime: Handle,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::default());
        Self {
            inner: Arc::new(Inner {
                config,
                client,
                runtime,
                events,
                state,
                link: Mutex::new(Link::default()),
                identity: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn transport(&self) -> TransportMode {
        self.inner.state.borrow().transport
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.borrow().connected
    }

    /// Root client (shares credentials with every bound client)
    pub fn client(&self) -> &ServerClient {
        &self.inner.client
    }

    /// Identity announced with `user_login` when push opens
    pub fn set_identity(&self, identity: Option<UserInfo>) {
        *self.inner.identity.lock() = identity;
    }

    /// Record a client count reported by the server
    pub fn set_user_count(&self, count: u32) {
        self.inner.state.send_if_modified(|s| {
            if s.user_count == count {
                return false;
            }
            s.user_count = count;
            true
        });
    }

    /// Connect to `server_url`. No-op while connected or connecting.
    ///
    /// Only configuration problems are returned as errors; network trouble
    /// is reported through [`ConnectionState::error`].
    pub async fn connect(&self, server_url: &str) -> Result<(), ConnectError> {
        let mut begun = false;
        self.inner.state.send_if_modified(|s| {
            if s.connected || s.connecting {
                return false;
            }
            s.connecting = true;
            s.error = None;
            s.needs_login = false;
            s.server_url = server_url.to_string();
            begun = true;
            true
        });
        if !begun {
            debug!("connect({}) ignored, already connected or connecting", server_url);
            return Ok(());
        }

        let endpoint = match ServerEndpoint::parse(server_url) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.inner.fail(e.to_string());
                return Err(e.into());
            }
        };
        if self.inner.client.token().is_none() {
            self.inner.fail("Not logged in".to_string());
            return Err(ConnectError::NotLoggedIn);
        }

        let base = endpoint.base_url();
        let client = self.inner.client.at(&base);
        info!("Connecting to {}", base);

        let healthy = client.health().await;
        if !self.inner.state.borrow().connecting {
            debug!("Connect to {} cancelled", base);
            return Ok(());
        }
        if !healthy {
            warn!("Health check failed for {}", base);
            if !self.inner.config.force_polling_on_failure {
                self.inner.fail(format!("Server {} is not reachable", base));
                return Ok(());
            }
        }

        self.inner.start_polling(client, &base);
        self.inner.state.send_modify(|s| {
            s.connecting = false;
            s.server_url = base.clone();
            // A 401 may already have torn the link down
            if s.connected && !healthy {
                s.error = Some(format!("Health check failed for {}, polling anyway", base));
            }
        });

        if self.inner.config.enable_push && healthy {
            self.try_push(&endpoint.push_url(&self.inner.config.push_path)).await;
        }
        Ok(())
    }

    /// Attempt to promote the running poll session to push
    async fn try_push(&self, url: &str) {
        let Some(signals) = self.inner.link.lock().signals.clone() else {
            return;
        };

        match PushLink::open(url, self.inner.config.handshake_timeout, self.inner.events.clone(), signals).await {
            Ok(push) => self.inner.promote(push),
            Err(e) => info!("Push unavailable ({}), staying on polling", e),
        }
    }

    /// Stop every transport and loop
    pub fn disconnect(&self) {
        info!("Disconnecting");
        self.inner.teardown();
    }

    /// Route an outbound action over the active transport
    pub fn send(&self, action: OutboundAction) -> bool {
        match self.transport() {
            TransportMode::None => {
                debug!("Dropping {:?}, no active transport", action);
                false
            }
            TransportMode::Poll => self.send_over_poll(action),
            TransportMode::Push => match self.send_over_push(action) {
                Ok(sent) => sent,
                Err(action) => {
                    self.inner.fall_back_to_polling("send failed");
                    if self.transport() == TransportMode::Poll {
                        self.send_over_poll(action)
                    } else {
                        false
                    }
                }
            },
        }
    }

    fn send_over_poll(&self, action: OutboundAction) -> bool {
        let Some(polling) = self.inner.link.lock().polling.clone() else {
            return false;
        };

        match action {
            OutboundAction::ChangeSong { index } => {
                self.inner.runtime.spawn(async move {
                    if let Err(e) = polling.change_song(index).await {
                        warn!("change-song {} failed: {}", index, e);
                    }
                });
            }
            OutboundAction::SetPlaying(is_playing) => {
                self.inner.runtime.spawn(async move {
                    polling.update_play_state(is_playing).await;
                });
            }
            OutboundAction::ReportPosition { position, .. } => {
                self.inner.runtime.spawn(async move {
                    polling.update_position(position).await;
                });
            }
            OutboundAction::Heartbeat { .. } => {
                let Some(client) = self.inner.link.lock().client.clone() else {
                    return false;
                };
                let weak = Arc::downgrade(&self.inner);
                self.inner.runtime.spawn(async move {
                    let result = client.heartbeat().await;
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_heartbeat(result);
                    }
                });
            }
            OutboundAction::AddSong(_) | OutboundAction::RemoveSong { .. } => {
                debug!("{:?} is only supported over push", action);
                return false;
            }
        }
        true
    }

    /// `Err` hands the action back when the push link is broken
    fn send_over_push(&self, action: OutboundAction) -> Result<bool, OutboundAction> {
        let (sender, client) = {
            let link = self.inner.link.lock();
            (link.push.as_ref().map(PushLink::sender), link.client.clone())
        };
        let Some(sender) = sender else {
            return Err(action);
        };
        let Some(client) = client else {
            return Ok(false);
        };

        match action {
            OutboundAction::ChangeSong { index } => {
                self.spawn_request("play", async move { client.play(index).await });
            }
            OutboundAction::SetPlaying(true) => {
                self.spawn_request("resume", async move { client.resume().await });
            }
            OutboundAction::SetPlaying(false) => {
                self.spawn_request("pause", async move { client.pause().await });
            }
            OutboundAction::ReportPosition { position, is_playing } => {
                if !sender.send(PushMessage::PlayStateChange { position, is_playing }) {
                    return Err(OutboundAction::ReportPosition { position, is_playing });
                }
                self.spawn_request("sync-position", async move { client.sync_position(position).await });
            }
            OutboundAction::Heartbeat { background } => {
                if !sender.send(PushMessage::Heartbeat { background }) {
                    return Err(OutboundAction::Heartbeat { background });
                }
                self.inner.record_heartbeat(None);
            }
            OutboundAction::AddSong(track) => {
                if !sender.send(PushMessage::AddSong(track.clone())) {
                    return Err(OutboundAction::AddSong(track));
                }
            }
            OutboundAction::RemoveSong { id } => {
                if !sender.send(PushMessage::RemoveSong { song_id: id.clone() }) {
                    return Err(OutboundAction::RemoveSong { id });
                }
            }
        }
        Ok(true)
    }

    fn spawn_request<F>(&self, what: &'static str, request: F)
    where
        F: Future<Output = Result<(), ApiError>> + Send + 'static,
    {
        let signals = self.inner.link.lock().signals.clone();
        self.inner.runtime.spawn(async move {
            if let Err(e) = request.await {
                warn!("{} failed: {}", what, e);
                if e.is_unauthorized() {
                    if let Some(signals) = signals {
                        let _ = signals.send(TransportSignal::Unauthorized);
                    }
                }
            }
        });
    }
}

impl Inner {
    fn fail(&self, error: String) {
        warn!("Connect failed: {}", error);
        self.state.send_modify(|s| {
            s.connecting = false;
            s.error = Some(error);
        });
    }

    /// The single place transports change. Rejects illegal moves and swaps
    /// the heartbeat loop to the one owned by the new transport.
    fn switch_transport(self: &Arc<Self>, link: &mut Link, next: TransportMode) -> bool {
        let current = self.state.borrow().transport;
        if !current.can_transition_to(next) {
            warn!("Rejected transport change {:?} -> {:?}", current, next);
            return false;
        }

        if let Some(heartbeat) = link.heartbeat.take() {
            heartbeat.abort();
        }
        link.heartbeat = match next {
            TransportMode::Poll => link.client.clone().map(|client| self.spawn_http_heartbeat(client)),
            TransportMode::Push => link.push.as_ref().map(|push| self.spawn_push_heartbeat(push.sender())),
            TransportMode::None => None,
        };

        self.state.send_modify(|s| {
            s.transport = next;
            s.connected = next != TransportMode::None;
            if next == TransportMode::None {
                s.user_count = 0;
            }
        });
        info!("Transport {:?} -> {:?}", current, next);
        true
    }

    fn start_polling(self: &Arc<Self>, client: ServerClient, base: &str) {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let polling = Arc::new(PollingEngine::new(
            client.clone(),
            self.events.clone(),
            signals_tx.clone(),
            self.runtime.clone(),
        ));
        polling.start(base, self.config.poll);

        let mut link = self.link.lock();
        link.client = Some(client);
        link.polling = Some(polling);
        link.signals = Some(signals_tx);
        link.supervisor = Some(self.runtime.spawn(supervise(Arc::downgrade(self), signals_rx)));
        self.switch_transport(&mut link, TransportMode::Poll);
    }

    fn promote(self: &Arc<Self>, push: PushLink) {
        let mut link = self.link.lock();
        if self.state.borrow().transport != TransportMode::Poll {
            debug!("Connection changed during push handshake, dropping link");
            push.close();
            return;
        }

        let sender = push.sender();
        link.push = Some(push);
        if !self.switch_transport(&mut link, TransportMode::Push) {
            link.push = None;
            return;
        }
        if let Some(polling) = link.polling.as_ref() {
            polling.stop();
        }

        match self.identity.lock().clone() {
            Some(user) => {
                sender.send(PushMessage::UserLogin {
                    username: user.username,
                    user_id: user.user_id,
                });
            }
            None => debug!("No identity to announce over push"),
        }
    }

    /// Downgrade PUSH to POLL. Returns whether a downgrade happened.
    fn fall_back_to_polling(self: &Arc<Self>, reason: &str) -> bool {
        let mut link = self.link.lock();
        if self.state.borrow().transport != TransportMode::Push {
            return false;
        }

        warn!("Push link lost ({}), falling back to polling", reason);
        if let Some(push) = link.push.take() {
            push.close();
        }

        let base = self.state.borrow().server_url.clone();
        if let Some(polling) = link.polling.as_ref() {
            polling.start(&base, self.config.poll);
        }
        self.switch_transport(&mut link, TransportMode::Poll);
        self.state.send_modify(|s| s.error = Some(format!("Push connection lost: {}", reason)));
        true
    }

    fn handle_unauthorized(self: &Arc<Self>) {
        warn!("Server rejected our token, login required");
        self.client.set_token(None);
        self.teardown();
        self.state.send_modify(|s| {
            s.needs_login = true;
            s.error = Some("Session expired, please log in again".to_string());
        });
    }

    fn teardown(self: &Arc<Self>) {
        let mut link = self.link.lock();
        if let Some(push) = link.push.take() {
            push.close();
        }
        if let Some(polling) = link.polling.take() {
            polling.stop();
        }
        if let Some(supervisor) = link.supervisor.take() {
            supervisor.abort();
        }

        if self.state.borrow().transport != TransportMode::None {
            self.switch_transport(&mut link, TransportMode::None);
        }
        if let Some(heartbeat) = link.heartbeat.take() {
            heartbeat.abort();
        }
        link.client = None;
        link.signals = None;

        self.state.send_modify(|s| {
            s.connected = false;
            s.connecting = false;
            s.user_count = 0;
        });
    }

    fn record_heartbeat(&self, online_count: Option<u32>) {
        self.state.send_modify(|s| {
            s.last_heartbeat = Some(current_time_ms());
            if let Some(count) = online_count {
                s.user_count = count;
            }
        });
    }

    fn handle_heartbeat(&self, result: Result<crate::api::HeartbeatResponse, ApiError>) {
        match result {
            Ok(resp) => self.record_heartbeat(Some(resp.online_count)),
            Err(ApiError::Unauthorized) => {
                if let Some(signals) = self.link.lock().signals.clone() {
                    let _ = signals.send(TransportSignal::Unauthorized);
                }
            }
            Err(e) => warn!("Heartbeat failed: {}", e),
        }
    }

    fn spawn_http_heartbeat(self: &Arc<Self>, client: ServerClient) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.config.http_heartbeat_interval;

        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let result = client.heartbeat().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.handle_heartbeat(result);
            }
        })
    }

    fn spawn_push_heartbeat(self: &Arc<Self>, sender: PushSender) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.config.push_heartbeat_interval;

        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !sender.send(PushMessage::Heartbeat { background: false }) {
                    debug!("Push heartbeat stopped, link closed");
                    break;
                }
                inner.record_heartbeat(None);
            }
        })
    }
}

/// Consumes transport signals for one connection
async fn supervise(inner: Weak<Inner>, mut signals: mpsc::UnboundedReceiver<TransportSignal>) {
    while let Some(signal) = signals.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match signal {
            TransportSignal::PushClosed { reason } => {
                inner.fall_back_to_polling(&reason);
            }
            TransportSignal::Unauthorized => {
                inner.handle_unauthorized();
                break;
            }
        }
    }
}

impl ActionSink for ConnectionManager {
    fn send(&self, action: OutboundAction) -> bool {
        ConnectionManager::send(self, action)
    }
}

impl ConnectionManager {
    /// Route one inbound sync event to the player and the user count
    pub fn apply_sync_event(&self, event: SyncEvent, player: &SharedReconciler) {
        match event {
            SyncEvent::State(update) => {
                if let Some(count) = update.connected_clients {
                    self.set_user_count(count);
                }
                player.lock().apply_remote_state(update);
            }
            SyncEvent::Position(sync) => {
                if player.lock().apply_remote_position(sync) {
                    debug!("Corrected drift from server position");
                }
            }
            SyncEvent::Clients(clients) => self.set_user_count(clients.connected_clients),
        }
    }
}

impl AudioSource for ConnectionManager {
    fn audio_url(&self, track: &Track) -> Option<String> {
        let server_url = self.inner.state.borrow().server_url.clone();
        if server_url.is_empty() {
            self.inner.client.audio_url(track)
        } else {
            self.inner.client.at(&server_url).audio_url(track)
        }
    }
}

impl HealthProbe for ConnectionManager {
    fn probe(&self) -> BoxFuture<'static, bool> {
        let client = self.inner.link.lock().client.clone();
        async move {
            match client {
                Some(client) => client.health().await,
                None => false,
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PollIntervals;
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_tungstenite::{accept_async, tungstenite::Message};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> SyncConfig {
        SyncConfig {
            poll: PollIntervals {
                state_ms: 50,
                position_ms: 50,
                clients_ms: 50,
            },
            http_heartbeat_interval: Duration::from_millis(100),
            push_heartbeat_interval: Duration::from_millis(100),
            enable_push: false,
            handshake_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(2),
            ..SyncConfig::default()
        }
    }

    fn build(config: SyncConfig, token: Option<&str>) -> (ConnectionManager, mpsc::UnboundedReceiver<SyncEvent>) {
        let client = ServerClient::new("", "fp_test", config.request_timeout).unwrap();
        client.set_token(token.map(String::from));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (ConnectionManager::new(client, config, events_tx, Handle::current()), events_rx)
    }

    async fn healthy_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "ok" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/poll/state"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "is_playing": false })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/poll/position"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "position": 0.0 })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/poll/clients"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "connected_clients": 2 })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/heartbeat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "online_count": 7 })))
            .mount(&server)
            .await;
        server
    }

    async fn wait_for(
        rx: &mut watch::Receiver<ConnectionState>,
        pred: impl Fn(&ConnectionState) -> bool,
    ) -> ConnectionState {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let state = rx.borrow_and_update();
                    if pred(&state) {
                        return state.clone();
                    }
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("timed out waiting for connection state")
    }

    /// Accepts one WebSocket client, reports text frames, closes on demand
    async fn ws_server() -> (String, mpsc::UnboundedReceiver<String>, oneshot::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        let (close_tx, mut close_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            loop {
                tokio::select! {
                    _ = &mut close_rx => {
                        let _ = ws.close(None).await;
                        break;
                    }
                    frame = ws.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            let _ = seen_tx.send(text);
                        }
                        Some(Ok(_)) => {}
                        _ => break,
                    },
                }
            }
        });

        (url, seen_rx, close_tx)
    }

    async fn next_frame_of(seen: &mut mpsc::UnboundedReceiver<String>, kind: &str) -> serde_json::Value {
        let needle = format!(r#""type":"{}""#, kind);
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let text = seen.recv().await.unwrap();
                if text.contains(&needle) {
                    return serde_json::from_str(&text).unwrap();
                }
            }
        })
        .await
        .expect("frame never arrived")
    }

    #[tokio::test]
    async fn test_connect_requires_login_and_valid_url() {
        let (manager, _events) = build(test_config(), None);
        assert_eq!(manager.connect("http://127.0.0.1:9").await, Err(ConnectError::NotLoggedIn));
        let state = manager.state();
        assert!(!state.connected && !state.connecting);
        assert!(state.error.is_some());

        let (manager, _events) = build(test_config(), Some("tok"));
        assert!(matches!(manager.connect("::nope::").await, Err(ConnectError::Config(_))));
        assert_eq!(manager.transport(), TransportMode::None);
    }

    #[tokio::test]
    async fn test_connect_polls_and_routes_actions() {
        let server = healthy_server().await;
        Mock::given(method("POST"))
            .and(path("/api/poll/change-song"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
            .expect(1)
            .mount(&server)
            .await;

        let (manager, mut events) = build(test_config(), Some("tok"));
        manager.connect(&server.uri()).await.unwrap();

        let state = manager.state();
        assert_eq!(state.transport, TransportMode::Poll);
        assert!(state.connected);
        assert!(state.error.is_none());

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap();
        assert!(event.is_some());

        assert!(manager.send(OutboundAction::ChangeSong { index: 1 }));
        assert!(!manager.send(OutboundAction::RemoveSong { id: "1".into() }));

        let mut rx = manager.subscribe();
        let state = wait_for(&mut rx, |s| s.user_count == 7).await;
        assert!(state.last_heartbeat.is_some());

        // Let the change-song request land before verifying expectations
        tokio::time::sleep(Duration::from_millis(200)).await;
        manager.disconnect();

        let state = manager.state();
        assert_eq!(state.transport, TransportMode::None);
        assert!(!state.connected);
        assert_eq!(state.user_count, 0);
        assert!(!manager.send(OutboundAction::SetPlaying(true)));
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let server = healthy_server().await;
        let (manager, _events) = build(test_config(), Some("tok"));
        manager.connect(&server.uri()).await.unwrap();
        manager.connect("http://elsewhere.invalid").await.unwrap();

        assert_eq!(manager.state().server_url, server.uri());
        assert_eq!(manager.transport(), TransportMode::Poll);
        manager.disconnect();
    }

    #[tokio::test]
    async fn test_health_failure_policy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let strict = SyncConfig {
            force_polling_on_failure: false,
            ..test_config()
        };
        let (manager, _events) = build(strict, Some("tok"));
        manager.connect(&server.uri()).await.unwrap();
        let state = manager.state();
        assert!(!state.connected);
        assert_eq!(state.transport, TransportMode::None);
        assert!(state.error.is_some());

        let (manager, _events) = build(test_config(), Some("tok"));
        manager.connect(&server.uri()).await.unwrap();
        let state = manager.state();
        assert_eq!(state.transport, TransportMode::Poll);
        assert!(state.error.is_some());
        manager.disconnect();
    }

    #[tokio::test]
    async fn test_unauthorized_forces_login() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/health"))
            .respond_with(ResponseTemplate::new(200))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let (manager, _events) = build(test_config(), Some("tok"));
        let mut rx = manager.subscribe();
        manager.connect(&server.uri()).await.unwrap();

        let state = wait_for(&mut rx, |s| s.needs_login).await;
        assert_eq!(state.transport, TransportMode::None);
        assert!(!state.connected);
        assert!(manager.client().token().is_none());
    }

    #[tokio::test]
    async fn test_push_promotion_and_downgrade() {
        let server = healthy_server().await;
        Mock::given(method("POST"))
            .and(path("/api/sync-position"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let (ws_url, mut seen, close) = ws_server().await;

        let (manager, _events) = build(test_config(), Some("tok"));
        manager.set_identity(Some(UserInfo::generate("Listener", 0)));
        manager.connect(&server.uri()).await.unwrap();
        manager.try_push(&ws_url).await;

        assert_eq!(manager.transport(), TransportMode::Push);
        let login = next_frame_of(&mut seen, "user_login").await;
        assert_eq!(login["data"]["username"], "Listener");
        let polling = manager.inner.link.lock().polling.clone().unwrap();
        assert_eq!(polling.live_tasks(), 0);

        assert!(manager.send(OutboundAction::ReportPosition { position: 12.0, is_playing: true }));
        let report = next_frame_of(&mut seen, "play_state_change").await;
        assert_eq!(report["data"]["position"], 12.0);
        assert!(manager.send(OutboundAction::AddSong(Track {
            id: "9".into(),
            name: "New".into(),
            format: "mp3".into(),
            url: None,
            filename: None,
            artist: None,
        })));
        next_frame_of(&mut seen, "add_song").await;

        close.send(()).unwrap();
        let mut rx = manager.subscribe();
        let state = wait_for(&mut rx, |s| s.transport == TransportMode::Poll).await;
        assert!(state.connected);
        assert!(state.error.is_some());
        assert_eq!(polling.live_tasks(), 3);
        manager.disconnect();
    }

    #[tokio::test]
    async fn test_failed_push_handshake_stays_on_poll() {
        let server = healthy_server().await;
        let config = SyncConfig {
            enable_push: true,
            ..test_config()
        };
        let (manager, _events) = build(config, Some("tok"));
        manager.connect(&server.uri()).await.unwrap();

        assert_eq!(manager.transport(), TransportMode::Poll);
        assert!(manager.is_connected());
        manager.disconnect();
    }
}
