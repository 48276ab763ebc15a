//! Host adapters and the event pumps that feed the session

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionManager, ConnectionState};
use crate::current_time_ms;
use crate::liveness::HostPower;
use crate::player::{DeviceEvent, PlaybackDevice, PlayerEvent, SharedReconciler};
use crate::storage::{KeyValueStore, LocalStore, StorageError};
use crate::sync::SyncEvent;

use super::types::{
    AudioOutput, ConnectionSnapshot, HostPowerControl, HostStorage, PlaybackSnapshot, SessionCallback, TrackInfo,
};

pub(super) type CallbackSlot = Arc<RwLock<Option<Arc<dyn SessionCallback>>>>;

/// Run `f` against the registered callback, outside the slot lock
fn notify(callback: &CallbackSlot, f: impl FnOnce(&dyn SessionCallback)) {
    let cb = callback.read().clone();
    if let Some(cb) = cb {
        f(cb.as_ref());
    }
}

pub(super) struct AudioAdapter(pub Box<dyn AudioOutput>);

impl PlaybackDevice for AudioAdapter {
    fn load(&self, url: &str) {
        self.0.load(url.to_string());
    }
    fn play(&self) {
        self.0.play();
    }
    fn pause(&self) {
        self.0.pause();
    }
    fn seek(&self, position: f64) {
        self.0.seek(position);
    }
    fn stop(&self) {
        self.0.stop();
    }
    fn set_volume(&self, volume: f32) {
        self.0.set_volume(volume);
    }
    fn current_time(&self) -> f64 {
        self.0.current_time()
    }
}

pub(super) struct StorageAdapter(pub Box<dyn HostStorage>);

impl KeyValueStore for StorageAdapter {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.0.get(key.to_string()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if self.0.set(key.to_string(), value.to_string()) {
            Ok(())
        } else {
            Err(StorageError::Backend(format!("host refused to store {}", key)))
        }
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.0.remove(key.to_string());
        Ok(())
    }
}

pub(super) struct PowerAdapter(pub Box<dyn HostPowerControl>);

impl HostPower for PowerAdapter {
    fn acquire_wake_lock(&self) -> Result<(), String> {
        self.0
            .acquire_wake_lock()
            .then_some(())
            .ok_or_else(|| "wake lock not supported by host".to_string())
    }
    fn release_wake_lock(&self) {
        self.0.release_wake_lock();
    }
    fn prevent_sleep(&self) -> Result<(), String> {
        self.0
            .prevent_sleep()
            .then_some(())
            .ok_or_else(|| "sleep prevention not supported by host".to_string())
    }
    fn allow_sleep(&self) {
        self.0.allow_sleep();
    }
}

/// Serializes every remote and device event onto the reconciler.
///
/// Device events arrive through a channel rather than a direct call so a
/// host that reports synchronously from inside a device call cannot
/// deadlock on the reconciler lock.
pub(super) async fn dispatch_inbound(
    mut sync_rx: mpsc::UnboundedReceiver<SyncEvent>,
    mut device_rx: mpsc::UnboundedReceiver<DeviceEvent>,
    player: SharedReconciler,
    connection: ConnectionManager,
) {
    loop {
        tokio::select! {
            event = sync_rx.recv() => match event {
                Some(event) => connection.apply_sync_event(event, &player),
                None => break,
            },
            event = device_rx.recv() => match event {
                Some(event) => player.lock().handle_device_event(event),
                None => break,
            },
        }
    }
    debug!("Inbound dispatcher stopped");
}

/// Forward player events to the host and record play history
pub(super) async fn forward_player_events(
    mut events: broadcast::Receiver<PlayerEvent>,
    callback: CallbackSlot,
    store: LocalStore,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Player event forwarder lagged, skipped {} events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            PlayerEvent::StateChanged(state) => {
                let snapshot = PlaybackSnapshot::from(&state);
                notify(&callback, |cb| cb.on_playback_changed(snapshot));
            }
            PlayerEvent::TrackChanged { index, track } => {
                if let Err(e) = store.record_play(&track, current_time_ms()) {
                    warn!("Failed to record play history: {}", e);
                }
                let info = TrackInfo::from(&track);
                let index = u32::try_from(index).unwrap_or(u32::MAX);
                notify(&callback, |cb| cb.on_track_changed(index, info));
            }
            PlayerEvent::Progress { current_time, duration } => {
                notify(&callback, |cb| cb.on_progress(current_time, duration));
            }
            PlayerEvent::PlaybackError { message, advancing } => {
                notify(&callback, |cb| cb.on_playback_error(message, advancing));
            }
            PlayerEvent::Notice(message) => notify(&callback, |cb| cb.on_notice(message)),
        }
    }
}

/// Forward connection changes and handle forced logouts
pub(super) async fn forward_connection_state(
    mut state: watch::Receiver<ConnectionState>,
    callback: CallbackSlot,
    store: LocalStore,
) {
    let mut needed_login = state.borrow().needs_login;

    while state.changed().await.is_ok() {
        let current = state.borrow_and_update().clone();

        if current.needs_login && !needed_login {
            info!("Session rejected by server, clearing stored credentials");
            if let Err(e) = store.clear_credentials() {
                warn!("Failed to clear credentials: {}", e);
            }
            notify(&callback, |cb| cb.on_login_required());
        }
        needed_login = current.needs_login;

        let snapshot = ConnectionSnapshot::from(&current);
        notify(&callback, |cb| cb.on_connection_changed(snapshot));
    }
}
