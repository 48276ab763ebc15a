//! Background-Liveness Keeper
//!
//! Keeps the session alive while the host app is backgrounded: a periodic
//! health ping, periodic heartbeats through the active transport, and host
//! wake lock / sleep prevention. Each part is optional; a part the host
//! cannot provide is skipped and the rest still run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::sync::{ActionSink, OutboundAction};

/// Host-level power management
pub trait HostPower: Send + Sync {
    fn acquire_wake_lock(&self) -> Result<(), String>;
    fn release_wake_lock(&self);
    fn prevent_sleep(&self) -> Result<(), String>;
    fn allow_sleep(&self);
}

/// Cheap reachability check against the current server
pub trait HealthProbe: Send + Sync {
    fn probe(&self) -> BoxFuture<'static, bool>;
}

/// Which sub-resources are currently held
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeeperStatus {
    pub enabled: bool,
    pub wake_lock: bool,
    pub sleep_prevented: bool,
    pub network_ping: bool,
    pub heartbeat: bool,
    pub visibility_listener: bool,
}

#[derive(Default)]
struct Held {
    status: KeeperStatus,
    ping: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

pub struct LivenessKeeper {
    host: Option<Arc<dyn HostPower>>,
    sink: Arc<dyn ActionSink>,
    probe: Arc<dyn HealthProbe>,
    runtime: Handle,
    ping_interval: Duration,
    heartbeat_interval: Duration,
    visible: Arc<AtomicBool>,
    held: Mutex<Held>,
}

impl LivenessKeeper {
    /// `host` is `None` when the platform has no power management at all
    pub fn new(
        host: Option<Arc<dyn HostPower>>,
        sink: Arc<dyn ActionSink>,
        probe: Arc<dyn HealthProbe>,
        runtime: Handle,
        config: &SyncConfig,
    ) -> Self {
        Self {
            host,
            sink,
            probe,
            runtime,
            ping_interval: config.keepalive_ping_interval,
            heartbeat_interval: config.keepalive_heartbeat_interval,
            visible: Arc::new(AtomicBool::new(true)),
            held: Mutex::new(Held::default()),
        }
    }

    pub fn status(&self) -> KeeperStatus {
        self.held.lock().status
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }

    /// Acquire every supported sub-resource. Calling again is a no-op.
    pub fn enable(&self) -> KeeperStatus {
        let mut held = self.held.lock();
        if held.status.enabled {
            return held.status;
        }

        held.status.visibility_listener = true;

        match self.host.as_deref() {
            Some(host) => {
                held.status.wake_lock = acquire("wake lock", || host.acquire_wake_lock());
                held.status.sleep_prevented = acquire("sleep prevention", || host.prevent_sleep());
            }
            None => info!("Host power management unavailable, skipping wake lock and sleep prevention"),
        }

        held.ping = Some(self.spawn_ping());
        held.status.network_ping = true;
        held.heartbeat = Some(self.spawn_heartbeat());
        held.status.heartbeat = true;

        held.status.enabled = true;
        info!("Background keep-alive enabled: {:?}", held.status);
        held.status
    }

    /// Release exactly what `enable` acquired
    pub fn disable(&self) {
        let mut held = self.held.lock();
        if !held.status.enabled {
            return;
        }

        if let Some(task) = held.ping.take() {
            task.abort();
        }
        if let Some(task) = held.heartbeat.take() {
            task.abort();
        }
        if let Some(host) = self.host.as_deref() {
            if held.status.wake_lock {
                host.release_wake_lock();
            }
            if held.status.sleep_prevented {
                host.allow_sleep();
            }
        }

        held.status = KeeperStatus::default();
        info!("Background keep-alive disabled");
    }

    /// Host visibility changed. Going hidden re-acquires a lost wake lock
    /// and sends a heartbeat flagged as background.
    pub fn on_visibility_changed(&self, visible: bool) {
        let was_visible = self.visible.swap(visible, Ordering::SeqCst);
        if was_visible == visible {
            return;
        }
        debug!("Visibility changed: {}", if visible { "visible" } else { "hidden" });

        let mut held = self.held.lock();
        if !held.status.enabled {
            return;
        }

        if !visible && !held.status.wake_lock {
            if let Some(host) = self.host.as_deref() {
                held.status.wake_lock = acquire("wake lock", || host.acquire_wake_lock());
            }
        }
        drop(held);

        self.sink.send(OutboundAction::Heartbeat { background: !visible });
    }

    /// The host dropped our wake lock (e.g. the OS reclaimed it)
    pub fn on_wake_lock_lost(&self) {
        let mut held = self.held.lock();
        if held.status.wake_lock {
            warn!("Wake lock released by host");
            held.status.wake_lock = false;
        }
    }

    fn spawn_ping(&self) -> JoinHandle<()> {
        let probe = self.probe.clone();
        let period = self.ping_interval;

        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if probe.probe().await {
                    debug!("Keep-alive ping ok");
                } else {
                    warn!("Keep-alive ping failed");
                }
            }
        })
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let sink = self.sink.clone();
        let visible = self.visible.clone();
        let period = self.heartbeat_interval;

        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let background = !visible.load(Ordering::SeqCst);
                if !sink.send(OutboundAction::Heartbeat { background }) {
                    debug!("Keep-alive heartbeat dropped, no transport");
                }
            }
        })
    }
}

impl Drop for LivenessKeeper {
    fn drop(&mut self) {
        self.disable();
    }
}

fn acquire(what: &str, attempt: impl FnOnce() -> Result<(), String>) -> bool {
    match attempt() {
        Ok(()) => {
            debug!("Acquired {}", what);
            true
        }
        Err(e) => {
            info!("{} unsupported, skipping: {}", what, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct StubHost {
        wake_lock_fails: bool,
        acquired: AtomicUsize,
        released: AtomicUsize,
        prevented: AtomicUsize,
        allowed: AtomicUsize,
    }

    impl HostPower for StubHost {
        fn acquire_wake_lock(&self) -> Result<(), String> {
            if self.wake_lock_fails {
                return Err("not supported".into());
            }
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn release_wake_lock(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
        fn prevent_sleep(&self) -> Result<(), String> {
            self.prevented.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn allow_sleep(&self) {
            self.allowed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<OutboundAction>>,
    }

    impl ActionSink for RecordingSink {
        fn send(&self, action: OutboundAction) -> bool {
            self.sent.lock().push(action);
            true
        }
    }

    #[derive(Default)]
    struct CountingProbe {
        calls: Arc<AtomicUsize>,
    }

    impl HealthProbe for CountingProbe {
        fn probe(&self) -> BoxFuture<'static, bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            async { true }.boxed()
        }
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            keepalive_ping_interval: Duration::from_millis(20),
            keepalive_heartbeat_interval: Duration::from_millis(20),
            ..SyncConfig::default()
        }
    }

    fn keeper(host: Option<Arc<StubHost>>) -> (LivenessKeeper, Arc<RecordingSink>, Arc<AtomicUsize>) {
        let sink = Arc::new(RecordingSink::default());
        let probe = CountingProbe::default();
        let calls = probe.calls.clone();
        let keeper = LivenessKeeper::new(
            host.map(|h| h as Arc<dyn HostPower>),
            sink.clone(),
            Arc::new(probe),
            Handle::current(),
            &fast_config(),
        );
        (keeper, sink, calls)
    }

    #[tokio::test]
    async fn test_enable_is_idempotent() {
        let host = Arc::new(StubHost::default());
        let (keeper, _sink, _calls) = keeper(Some(host.clone()));

        let status = keeper.enable();
        assert!(status.enabled && status.wake_lock && status.sleep_prevented);
        assert!(status.network_ping && status.heartbeat && status.visibility_listener);

        keeper.enable();
        assert_eq!(host.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(host.prevented.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsupported_parts_are_skipped_and_not_released() {
        let host = Arc::new(StubHost {
            wake_lock_fails: true,
            ..StubHost::default()
        });
        let (keeper, _sink, _calls) = keeper(Some(host.clone()));

        let status = keeper.enable();
        assert!(status.enabled);
        assert!(!status.wake_lock);
        assert!(status.sleep_prevented);

        keeper.disable();
        assert_eq!(host.released.load(Ordering::SeqCst), 0);
        assert_eq!(host.allowed.load(Ordering::SeqCst), 1);
        assert_eq!(keeper.status(), KeeperStatus::default());

        keeper.disable();
        assert_eq!(host.allowed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_without_host_power() {
        let (keeper, _sink, _calls) = keeper(None);
        let status = keeper.enable();
        assert!(status.enabled && status.network_ping && status.heartbeat);
        assert!(!status.wake_lock && !status.sleep_prevented);
    }

    #[tokio::test]
    async fn test_periodic_ping_and_heartbeat_stop_on_disable() {
        let (keeper, sink, calls) = keeper(None);
        keeper.enable();
        keeper.on_visibility_changed(false);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(calls.load(Ordering::SeqCst) >= 2);
        {
            let sent = sink.sent.lock();
            assert!(sent.len() >= 2);
            assert!(sent
                .iter()
                .all(|a| matches!(a, OutboundAction::Heartbeat { background: true })));
        }

        keeper.disable();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let pings = calls.load(Ordering::SeqCst);
        let beats = sink.sent.lock().len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), pings);
        assert_eq!(sink.sent.lock().len(), beats);
    }

    #[tokio::test]
    async fn test_lost_wake_lock_reacquired_when_hidden() {
        let host = Arc::new(StubHost::default());
        let (keeper, _sink, _calls) = keeper(Some(host.clone()));
        keeper.enable();

        keeper.on_wake_lock_lost();
        assert!(!keeper.status().wake_lock);

        keeper.on_visibility_changed(false);
        assert!(keeper.status().wake_lock);
        assert_eq!(host.acquired.load(Ordering::SeqCst), 2);

        keeper.disable();
        assert_eq!(host.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_visibility_ignored_while_disabled() {
        let host = Arc::new(StubHost::default());
        let (keeper, sink, _calls) = keeper(Some(host.clone()));

        keeper.on_visibility_changed(false);
        assert!(!keeper.is_visible());
        assert_eq!(host.acquired.load(Ordering::SeqCst), 0);
        assert!(sink.sent.lock().is_empty());
    }
}
