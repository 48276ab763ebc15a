//! Polling Engine
//!
//! Three independently scheduled fetchers (state, position, client count)
//! feeding the shared `SyncEvent` channel. A failing fetcher logs and keeps
//! its schedule; it never takes the others down.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::state::TransportSignal;
use crate::api::{ApiError, ServerClient};
use crate::config::PollIntervals;
use crate::sync::SyncEvent;

pub struct PollingEngine {
    client: ServerClient,
    events: mpsc::UnboundedSender<SyncEvent>,
    signals: mpsc::UnboundedSender<TransportSignal>,
    runtime: Handle,
    active: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    bound: Mutex<Option<ServerClient>>,
}

impl PollingEngine {
    pub(crate) fn new(
        client: ServerClient,
        events: mpsc::UnboundedSender<SyncEvent>,
        signals: mpsc::UnboundedSender<TransportSignal>,
        runtime: Handle,
    ) -> Self {
        Self {
            client,
            events,
            signals,
            runtime,
            active: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
            bound: Mutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Scheduled tasks still held and not yet finished
    pub fn live_tasks(&self) -> usize {
        self.tasks.lock().iter().filter(|t| !t.is_finished()).count()
    }

    /// Start polling `server_url`. Restarts if already running.
    pub fn start(&self, server_url: &str, intervals: PollIntervals) {
        if self.is_active() {
            debug!("Polling already active, restarting");
            self.stop();
        }

        let client = self.client.at(server_url);
        *self.bound.lock() = Some(client.clone());
        self.active.store(true, Ordering::SeqCst);

        let tasks = vec![
            self.spawn_fetcher("state", intervals.state_ms, client.clone(), |c| async move {
                c.poll_state().await.map(SyncEvent::State)
            }),
            self.spawn_fetcher("position", intervals.position_ms, client.clone(), |c| async move {
                c.poll_position().await.map(SyncEvent::Position)
            }),
            self.spawn_fetcher("clients", intervals.clients_ms, client, |c| async move {
                c.poll_clients().await.map(SyncEvent::Clients)
            }),
        ];
        *self.tasks.lock() = tasks;

        info!(
            "Polling {} (state {}ms, position {}ms, clients {}ms)",
            server_url, intervals.state_ms, intervals.position_ms, intervals.clients_ms
        );
    }

    fn spawn_fetcher<F, Fut>(&self, name: &'static str, period_ms: u64, client: ServerClient, fetch: F) -> JoinHandle<()>
    where
        F: Fn(ServerClient) -> Fut + Send + 'static,
        Fut: Future<Output = Result<SyncEvent, ApiError>> + Send + 'static,
    {
        let active = self.active.clone();
        let events = self.events.clone();
        let signals = self.signals.clone();

        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(period_ms.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if !active.load(Ordering::SeqCst) {
                    break;
                }

                let result = fetch(client.clone()).await;

                // Completions racing with stop() are dropped
                if !active.load(Ordering::SeqCst) {
                    debug!("Discarding {} poll result after stop", name);
                    break;
                }

                match result {
                    Ok(event) => {
                        if events.send(event).is_err() {
                            debug!("Event receiver gone, stopping {} poller", name);
                            break;
                        }
                    }
                    Err(ApiError::Unauthorized) => {
                        warn!("{} poll rejected with 401", name);
                        let _ = signals.send(TransportSignal::Unauthorized);
                    }
                    Err(e) => warn!("{} poll failed: {}", name, e),
                }
            }
        })
    }

    /// Cancel every schedule. Safe to call repeatedly.
    pub fn stop(&self) {
        let was_active = self.active.swap(false, Ordering::SeqCst);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in &tasks {
            task.abort();
        }
        *self.bound.lock() = None;

        if was_active {
            info!("Polling stopped ({} tasks cancelled)", tasks.len());
        }
    }

    fn bound_client(&self) -> Option<ServerClient> {
        if !self.is_active() {
            return None;
        }
        self.bound.lock().clone()
    }

    fn report(&self, what: &str, result: Result<(), ApiError>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("{} failed: {}", what, e);
                if e.is_unauthorized() {
                    let _ = self.signals.send(TransportSignal::Unauthorized);
                }
                false
            }
        }
    }

    pub async fn update_position(&self, position: f64) -> bool {
        let Some(client) = self.bound_client() else {
            return false;
        };
        let result = client.update_position(position).await;
        self.report("update-position", result)
    }

    pub async fn update_play_state(&self, is_playing: bool) -> bool {
        let Some(client) = self.bound_client() else {
            return false;
        };
        let result = client.update_play_state(is_playing).await;
        self.report("update-play-state", result)
    }

    pub async fn change_song(&self, index: usize) -> Result<(), ApiError> {
        let client = self.bound_client().ok_or(ApiError::NotConnected)?;
        let result = client.change_song(index).await;
        if matches!(result, Err(ApiError::Unauthorized)) {
            let _ = self.signals.send(TransportSignal::Unauthorized);
        }
        result
    }
}

impl Drop for PollingEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn engine() -> (
        PollingEngine,
        mpsc::UnboundedReceiver<SyncEvent>,
        mpsc::UnboundedReceiver<TransportSignal>,
    ) {
        let client = ServerClient::new("http://unused", "fp_test", Duration::from_secs(2)).unwrap();
        client.set_token(Some("tok".into()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let engine = PollingEngine::new(client, events_tx, signals_tx, Handle::current());
        (engine, events_rx, signals_rx)
    }

    fn fast() -> PollIntervals {
        PollIntervals {
            state_ms: 50,
            position_ms: 50,
            clients_ms: 50,
        }
    }

    #[tokio::test]
    async fn test_stop_twice_leaves_no_tasks() {
        let server = MockServer::start().await;
        let (engine, _events, _signals) = engine();

        engine.start(&server.uri(), fast());
        assert_eq!(engine.live_tasks(), 3);

        engine.stop();
        engine.stop();
        assert!(!engine.is_active());
        assert_eq!(engine.live_tasks(), 0);
    }

    #[tokio::test]
    async fn test_in_flight_result_after_stop_is_dropped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/poll/state"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "current_index": 1, "is_playing": true }))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;

        let (engine, mut events, _signals) = engine();
        engine.start(&server.uri(), fast());

        // Wait until the state request is on the wire
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let requests = server.received_requests().await.unwrap_or_default();
            if requests.iter().any(|r| r.url.path() == "/api/poll/state") {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "state request never sent");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        engine.stop();

        let deadline = tokio::time::Instant::now() + Duration::from_millis(600);
        while let Ok(event) = tokio::time::timeout_at(deadline, events.recv()).await {
            match event {
                Some(SyncEvent::State(_)) => panic!("state result delivered after stop"),
                Some(_) => {}
                None => break,
            }
        }
        assert!(!engine.is_active());
    }

    #[tokio::test]
    async fn test_restart_replaces_tasks() {
        let server = MockServer::start().await;
        let (engine, _events, _signals) = engine();

        engine.start(&server.uri(), fast());
        engine.start(&server.uri(), fast());
        assert_eq!(engine.live_tasks(), 3);
        engine.stop();
    }

    #[tokio::test]
    async fn test_failing_fetcher_does_not_stop_others() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/poll/state"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/poll/position"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "position": 12.0 })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/poll/clients"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "connected_clients": 3 })))
            .mount(&server)
            .await;

        let (engine, mut events, _signals) = engine();
        engine.start(&server.uri(), fast());

        let mut positions = 0;
        let mut clients = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while (positions < 2 || clients < 2) && tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
                Ok(Some(SyncEvent::Position(p))) => {
                    assert_eq!(p.position, 12.0);
                    positions += 1;
                }
                Ok(Some(SyncEvent::Clients(c))) => {
                    assert_eq!(c.connected_clients, 3);
                    clients += 1;
                }
                Ok(Some(SyncEvent::State(_))) => panic!("state poll should be failing"),
                _ => {}
            }
        }
        assert!(positions >= 2 && clients >= 2);
        assert!(engine.is_active());
        assert_eq!(engine.live_tasks(), 3);
        engine.stop();
    }

    #[tokio::test]
    async fn test_unauthorized_poll_is_signalled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let (engine, _events, mut signals) = engine();
        engine.start(&server.uri(), fast());

        let signal = tokio::time::timeout(Duration::from_secs(5), signals.recv()).await.unwrap();
        assert_eq!(signal, Some(TransportSignal::Unauthorized));
        engine.stop();
    }

    #[tokio::test]
    async fn test_mutations_require_active_engine() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/poll/update-position"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/poll/change-song"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (engine, _events, _signals) = engine();
        assert!(!engine.update_position(3.0).await);
        assert!(matches!(engine.change_song(1).await, Err(ApiError::NotConnected)));

        engine.start(&server.uri(), fast());
        assert!(engine.update_position(3.0).await);
        assert!(matches!(engine.change_song(1).await, Err(ApiError::Status(404))));
        engine.stop();
    }
}
