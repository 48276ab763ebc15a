//! Playback Reconciler
//!
//! Single writer of [`PlaybackState`]. Local user actions and server updates
//! both go through the same `play`/`pause` paths; the `from_server` flag
//! decides whether the change is echoed back to the server.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::device::{AudioSource, DeviceEvent, PlaybackDevice};
use crate::config::SyncConfig;
use crate::sync::{
    dedup_tracks, next_index, previous_index, ActionSink, OutboundAction, PlayMode, PlaybackState, PositionSync,
    SongsSnapshot, StateUpdate, Track, TrackPhase,
};

/// Capacity of the player event channel
const EVENT_CAPACITY: usize = 64;

/// Reconciler shared between the event pump and user-action callers
pub type SharedReconciler = Arc<Mutex<Reconciler>>;

/// Timing knobs for the reconciler
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcilerConfig {
    pub drift_tolerance_secs: f64,
    pub position_report_interval: Duration,
    pub error_debounce: Duration,
}

impl From<&SyncConfig> for ReconcilerConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            drift_tolerance_secs: config.drift_tolerance_secs,
            position_report_interval: config.position_report_interval,
            error_debounce: config.error_debounce,
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

/// Published after every state change
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    StateChanged(PlaybackState),
    TrackChanged { index: usize, track: Track },
    Progress { current_time: f64, duration: f64 },
    /// A track failed to play. `advancing` is true when another track was
    /// started in its place.
    PlaybackError { message: String, advancing: bool },
    Notice(String),
}

pub struct Reconciler {
    state: PlaybackState,
    device: Arc<dyn PlaybackDevice>,
    sink: Arc<dyn ActionSink>,
    source: Arc<dyn AudioSource>,
    config: ReconcilerConfig,
    events: broadcast::Sender<PlayerEvent>,
    /// Playlist entry currently loaded in the device
    loaded_index: Option<usize>,
    last_position_report: Option<Instant>,
    last_error_notice: Option<Instant>,
}

impl Reconciler {
    pub fn new(
        device: Arc<dyn PlaybackDevice>,
        sink: Arc<dyn ActionSink>,
        source: Arc<dyn AudioSource>,
        config: ReconcilerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: PlaybackState::default(),
            device,
            sink,
            source,
            config,
            events,
            loaded_index: None,
            last_position_report: None,
            last_error_notice: None,
        }
    }

    pub fn into_shared(self) -> SharedReconciler {
        Arc::new(Mutex::new(self))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    fn emit(&self, event: PlayerEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        self.emit(PlayerEvent::StateChanged(self.state.clone()));
    }

    fn set_phase(&mut self, next: TrackPhase) {
        if self.state.phase.can_transition_to(next) {
            self.state.phase = next;
        } else {
            debug!("Ignoring phase change {:?} -> {:?}", self.state.phase, next);
        }
    }

    // --- Core transitions ---

    /// Play `index`. With `from_server` the change is applied locally only.
    pub fn play(&mut self, index: usize, from_server: bool) -> bool {
        self.start(index, from_server, 0.0, false)
    }

    /// Start `index` at `start_at` seconds. `restart` reloads the track even
    /// if it is already loaded.
    fn start(&mut self, index: usize, from_server: bool, start_at: f64, restart: bool) -> bool {
        let Some(track) = self.state.playlist.get(index).cloned() else {
            debug!("play({}) ignored, playlist has {} tracks", index, self.state.playlist.len());
            return false;
        };

        if restart || self.loaded_index != Some(index) {
            let Some(url) = self.source.audio_url(&track) else {
                warn!("No playable URL for {:?}", track.name);
                self.emit(PlayerEvent::PlaybackError {
                    message: format!("Cannot play {}: no audio source", track.name),
                    advancing: false,
                });
                return false;
            };

            info!("Loading {:?} (index {}, from_server={})", track.name, index, from_server);
            self.state.current_index = Some(index);
            self.state.current_time = start_at;
            self.state.duration = 0.0;
            self.set_phase(TrackPhase::Loading);

            if !from_server {
                self.sink.send(OutboundAction::ChangeSong { index });
            }

            self.device.stop();
            self.device.load(&url);
            if start_at > 0.0 {
                self.device.seek(start_at);
            }
            self.loaded_index = Some(index);
            self.emit(PlayerEvent::TrackChanged { index, track });
        } else {
            self.set_phase(TrackPhase::Playing);
        }

        self.device.play();
        self.state.is_playing = true;
        if !from_server {
            self.sink.send(OutboundAction::SetPlaying(true));
        }
        self.publish();
        true
    }

    /// Pause. With `from_server` the change is applied locally only.
    pub fn pause(&mut self, from_server: bool) {
        self.device.pause();
        self.state.is_playing = false;
        if matches!(self.state.phase, TrackPhase::Playing | TrackPhase::Loading) {
            self.set_phase(TrackPhase::Paused);
        }
        if !from_server {
            self.sink.send(OutboundAction::SetPlaying(false));
        }
        self.publish();
    }

    // --- User actions ---

    pub fn user_play(&mut self, index: usize) -> bool {
        self.play(index, false)
    }

    pub fn user_pause(&mut self) {
        self.pause(false);
    }

    pub fn user_toggle_play(&mut self) {
        match self.state.current_index {
            Some(_) if self.state.is_playing => self.pause(false),
            Some(index) => {
                self.play(index, false);
            }
            None => debug!("toggle ignored, nothing selected"),
        }
    }

    pub fn user_seek(&mut self, position: f64) {
        self.user_seek_at(position, Instant::now());
    }

    pub fn user_seek_at(&mut self, position: f64, now: Instant) {
        if self.state.current_track().is_none() {
            return;
        }

        let mut position = position.max(0.0);
        if self.state.duration > 0.0 {
            position = position.min(self.state.duration);
        }

        self.device.seek(position);
        self.state.current_time = position;
        self.sink.send(OutboundAction::ReportPosition {
            position,
            is_playing: self.state.is_playing,
        });
        self.last_position_report = Some(now);
        self.publish();
    }

    /// Advance per the play mode. Returns the index started.
    pub fn user_next(&mut self) -> Option<usize> {
        let index = next_index(
            self.state.playlist.len(),
            self.state.current_index,
            self.state.play_mode,
            &mut rand::thread_rng(),
        )?;
        self.start(index, false, 0.0, true).then_some(index)
    }

    pub fn user_previous(&mut self) -> Option<usize> {
        let index = previous_index(self.state.playlist.len(), self.state.current_index)?;
        self.start(index, false, 0.0, true).then_some(index)
    }

    pub fn set_play_mode(&mut self, mode: PlayMode) {
        self.state.play_mode = mode;
        self.emit(PlayerEvent::Notice(format!("Play mode: {}", mode.label())));
        self.publish();
    }

    pub fn set_volume(&mut self, volume: f32) {
        let volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
        self.state.volume = volume;
        self.device.set_volume(volume);
        self.publish();
    }

    /// Append a track. Returns `false` for a duplicate id.
    pub fn add_track(&mut self, track: Track) -> bool {
        if self.state.position_of(&track.id).is_some() {
            debug!("Track {} already in playlist", track.id);
            return false;
        }

        self.state.playlist.push(track.clone());
        self.sink.send(OutboundAction::AddSong(track));
        self.publish();
        true
    }

    pub fn remove_track(&mut self, index: usize) -> Option<Track> {
        if index >= self.state.playlist.len() {
            return None;
        }

        let removed = self.state.playlist.remove(index);
        let len = self.state.playlist.len();

        // The loaded entry can differ from the selection after a paused remote index change
        self.loaded_index = match self.loaded_index {
            Some(loaded) if loaded == index => None,
            Some(loaded) if loaded > index => Some(loaded - 1),
            other => other,
        };

        match self.state.current_index {
            Some(current) if index < current => {
                self.state.current_index = Some(current - 1);
            }
            Some(current) if index == current => {
                if len == 0 {
                    self.device.stop();
                    self.state.current_index = None;
                    self.state.is_playing = false;
                    self.set_phase(TrackPhase::Idle);
                } else {
                    let next = if current >= len { 0 } else { current };
                    self.state.current_index = Some(next);
                    if self.state.is_playing {
                        self.start(next, false, 0.0, true);
                    }
                }
            }
            _ => {}
        }

        self.sink.send(OutboundAction::RemoveSong { id: removed.id.clone() });
        self.publish();
        Some(removed)
    }

    /// Local-only reset of the playlist
    pub fn clear_playlist(&mut self) {
        self.device.stop();
        self.state.playlist.clear();
        self.state.current_index = None;
        self.state.is_playing = false;
        self.state.current_time = 0.0;
        self.state.duration = 0.0;
        self.loaded_index = None;
        self.set_phase(TrackPhase::Idle);
        self.publish();
    }

    // --- Remote updates ---

    /// Swap in a server playlist, keeping our selection by track id
    fn replace_playlist(&mut self, tracks: Vec<Track>) {
        let loaded_id = self
            .loaded_index
            .and_then(|i| self.state.playlist.get(i))
            .map(|t| t.id.clone());
        let current_id = self.state.current_track().map(|t| t.id.clone());

        self.state.playlist = dedup_tracks(tracks);
        self.loaded_index = loaded_id.and_then(|id| self.state.position_of(&id));
        self.state.current_index = current_id.and_then(|id| self.state.position_of(&id));
    }

    /// Apply a partial server delta. Only present fields are touched.
    pub fn apply_remote_state(&mut self, update: StateUpdate) {
        if let Some(tracks) = update.playlist {
            self.replace_playlist(tracks);
        }

        let mut index_changed = false;
        if let Some(raw) = update.current_index {
            match self.state.index_from_wire(raw) {
                Some(index) if Some(index) != self.state.current_index => {
                    self.state.current_index = Some(index);
                    index_changed = true;
                }
                Some(_) => {}
                None if raw < 0 => {
                    if self.state.current_index.take().is_some() {
                        index_changed = true;
                    }
                }
                None => debug!("Ignoring out-of-range index {} for {} tracks", raw, self.state.playlist.len()),
            }
        }

        let remote_playing = update.is_playing.unwrap_or(self.state.is_playing);
        match (remote_playing, self.state.current_index) {
            (true, Some(index)) if index_changed || !self.state.is_playing => {
                self.play(index, true);
                return;
            }
            (false, _) if self.state.is_playing => {
                self.pause(true);
                return;
            }
            _ => {}
        }

        self.publish();
    }

    /// Correct drift against the server position. Returns whether a seek
    /// was issued.
    pub fn apply_remote_position(&mut self, sync: PositionSync) -> bool {
        if !self.state.is_playing {
            return false;
        }

        let drift = (self.device.current_time() - sync.position).abs();
        if drift <= self.config.drift_tolerance_secs {
            return false;
        }

        debug!("Drift {:.2}s, seeking to {:.2}", drift, sync.position);
        self.device.seek(sync.position);
        self.state.current_time = sync.position;
        self.publish();
        true
    }

    /// Initial `GET /api/songs` snapshot
    pub fn apply_snapshot(&mut self, snapshot: SongsSnapshot) {
        self.replace_playlist(snapshot.playlist);

        let index = snapshot
            .current_index
            .and_then(|raw| self.state.index_from_wire(raw))
            .or_else(|| (!self.state.playlist.is_empty()).then_some(0));

        match index {
            Some(index) if snapshot.is_playing => {
                self.start(index, true, snapshot.current_position.max(0.0), true);
            }
            _ => {
                self.state.current_index = index;
                self.publish();
            }
        }
    }

    // --- Device events ---

    pub fn handle_device_event(&mut self, event: DeviceEvent) {
        self.handle_device_event_at(event, Instant::now());
    }

    pub fn handle_device_event_at(&mut self, event: DeviceEvent, now: Instant) {
        match event {
            DeviceEvent::Play => {
                self.state.is_playing = true;
                self.set_phase(TrackPhase::Playing);
                self.publish();
            }
            DeviceEvent::Pause => {
                self.state.is_playing = false;
                if self.state.phase == TrackPhase::Playing {
                    self.set_phase(TrackPhase::Paused);
                }
                self.publish();
            }
            DeviceEvent::Ended => self.on_ended(),
            DeviceEvent::Error { message } => self.on_error(message, now),
            DeviceEvent::TimeUpdate { current_time, duration } => {
                self.state.current_time = current_time;
                if duration.is_finite() && duration > 0.0 {
                    self.state.duration = duration;
                }
                self.emit(PlayerEvent::Progress {
                    current_time,
                    duration: self.state.duration,
                });

                if self.state.is_playing && self.report_due(now) {
                    self.sink.send(OutboundAction::ReportPosition {
                        position: current_time,
                        is_playing: true,
                    });
                    self.last_position_report = Some(now);
                }
            }
            DeviceEvent::CanPlay { duration } => {
                if duration.is_finite() && duration > 0.0 {
                    self.state.duration = duration;
                }
            }
        }
    }

    fn report_due(&self, now: Instant) -> bool {
        self.last_position_report
            .map_or(true, |last| now.saturating_duration_since(last) >= self.config.position_report_interval)
    }

    fn on_ended(&mut self) {
        self.state.is_playing = false;
        self.set_phase(TrackPhase::Ended);

        let next = next_index(
            self.state.playlist.len(),
            self.state.current_index,
            self.state.play_mode,
            &mut rand::thread_rng(),
        );
        match next {
            Some(index) => {
                self.start(index, false, 0.0, true);
            }
            None => {
                self.set_phase(TrackPhase::Idle);
                self.publish();
            }
        }
    }

    fn on_error(&mut self, message: String, now: Instant) {
        let len = self.state.playlist.len();
        let advancing = len > 1;
        warn!("Playback failed: {}", message);

        self.state.is_playing = false;
        self.loaded_index = None;
        self.set_phase(TrackPhase::Error);

        let notify = match self.last_error_notice {
            Some(last) if now.saturating_duration_since(last) < self.config.error_debounce => false,
            _ => true,
        };
        if notify {
            self.last_error_notice = Some(now);
            self.emit(PlayerEvent::PlaybackError { message, advancing });
        } else {
            debug!("Suppressed repeated playback error");
        }

        if advancing {
            let next = self.state.current_index.map_or(0, |i| (i + 1) % len);
            self.start(next, false, 0.0, true);
        } else {
            self.set_phase(TrackPhase::Idle);
            self.publish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Load(String),
        Play,
        Pause,
        Seek(f64),
        Stop,
        Volume(f32),
    }

    #[derive(Default)]
    struct RecordingDevice {
        calls: Mutex<Vec<Call>>,
        position: Mutex<f64>,
    }

    impl RecordingDevice {
        fn take(&self) -> Vec<Call> {
            std::mem::take(&mut *self.calls.lock())
        }

        fn set_position(&self, position: f64) {
            *self.position.lock() = position;
        }
    }

    impl PlaybackDevice for RecordingDevice {
        fn load(&self, url: &str) {
            self.calls.lock().push(Call::Load(url.to_string()));
        }
        fn play(&self) {
            self.calls.lock().push(Call::Play);
        }
        fn pause(&self) {
            self.calls.lock().push(Call::Pause);
        }
        fn seek(&self, position: f64) {
            self.set_position(position);
            self.calls.lock().push(Call::Seek(position));
        }
        fn stop(&self) {
            self.calls.lock().push(Call::Stop);
        }
        fn set_volume(&self, volume: f32) {
            self.calls.lock().push(Call::Volume(volume));
        }
        fn current_time(&self) -> f64 {
            *self.position.lock()
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<OutboundAction>>,
    }

    impl RecordingSink {
        fn take(&self) -> Vec<OutboundAction> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl ActionSink for RecordingSink {
        fn send(&self, action: OutboundAction) -> bool {
            self.sent.lock().push(action);
            true
        }
    }

    struct MemorySource;

    impl AudioSource for MemorySource {
        fn audio_url(&self, track: &Track) -> Option<String> {
            Some(format!("mem://{}", track.id))
        }
    }

    fn track(id: &str) -> Track {
        Track {
            id: id.to_string(),
            name: id.to_uppercase(),
            format: "mp3".to_string(),
            url: None,
            filename: None,
            artist: None,
        }
    }

    fn setup(ids: &[&str]) -> (Reconciler, Arc<RecordingDevice>, Arc<RecordingSink>) {
        let device = Arc::new(RecordingDevice::default());
        let sink = Arc::new(RecordingSink::default());
        let mut reconciler = Reconciler::new(
            device.clone(),
            sink.clone(),
            Arc::new(MemorySource),
            ReconcilerConfig::default(),
        );
        reconciler.apply_remote_state(StateUpdate {
            playlist: Some(ids.iter().map(|id| track(id)).collect()),
            ..Default::default()
        });
        device.take();
        sink.take();
        (reconciler, device, sink)
    }

    fn errors(rx: &mut broadcast::Receiver<PlayerEvent>) -> Vec<(String, bool)> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PlayerEvent::PlaybackError { message, advancing } = event {
                out.push((message, advancing));
            }
        }
        out
    }

    #[test]
    fn test_remote_changes_are_not_echoed() {
        let (mut r, device, sink) = setup(&["a", "b"]);

        r.apply_remote_state(StateUpdate {
            current_index: Some(1),
            is_playing: Some(true),
            ..Default::default()
        });
        assert_eq!(r.state().current_index, Some(1));
        assert!(r.state().is_playing);
        assert!(device.take().contains(&Call::Load("mem://b".into())));

        r.handle_device_event(DeviceEvent::TimeUpdate { current_time: 10.0, duration: 200.0 });
        device.set_position(10.0);
        sink.take();

        r.apply_remote_position(PositionSync { position: 30.0, timestamp: None });
        r.apply_remote_state(StateUpdate {
            is_playing: Some(false),
            ..Default::default()
        });
        assert!(!r.state().is_playing);
        assert!(sink.take().is_empty());
        assert_eq!(device.take(), vec![Call::Seek(30.0), Call::Pause]);
    }

    #[test]
    fn test_user_play_is_forwarded() {
        let (mut r, _device, sink) = setup(&["a", "b"]);

        assert!(r.user_play(0));
        assert_eq!(
            sink.take(),
            vec![OutboundAction::ChangeSong { index: 0 }, OutboundAction::SetPlaying(true)]
        );

        r.user_pause();
        r.user_toggle_play();
        assert_eq!(
            sink.take(),
            vec![OutboundAction::SetPlaying(false), OutboundAction::SetPlaying(true)]
        );
        assert_eq!(r.state().phase, TrackPhase::Playing);
    }

    #[test]
    fn test_user_next_wraps_in_list_mode() {
        let (mut r, _device, _sink) = setup(&["a", "b", "c"]);
        r.play(0, true);

        assert_eq!(r.user_next(), Some(1));
        assert_eq!(r.user_next(), Some(2));
        assert_eq!(r.user_next(), Some(0));
        assert_eq!(r.state().current_index, Some(0));
        assert_eq!(r.user_previous(), Some(2));
    }

    #[test]
    fn test_next_on_empty_playlist_is_noop() {
        let (mut r, device, sink) = setup(&[]);
        assert_eq!(r.user_next(), None);
        assert_eq!(r.user_previous(), None);
        assert!(device.take().is_empty());
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_drift_tolerance() {
        let (mut r, device, _sink) = setup(&["a"]);
        r.play(0, true);
        device.take();

        device.set_position(48.0);
        assert!(!r.apply_remote_position(PositionSync { position: 50.0, timestamp: None }));
        assert!(device.take().is_empty());

        device.set_position(46.0);
        assert!(r.apply_remote_position(PositionSync { position: 50.0, timestamp: None }));
        assert_eq!(device.take(), vec![Call::Seek(50.0)]);

        r.pause(true);
        device.take();
        device.set_position(0.0);
        assert!(!r.apply_remote_position(PositionSync { position: 120.0, timestamp: None }));
        assert!(device.take().is_empty());
    }

    #[test]
    fn test_drift_uses_device_clock() {
        let (mut r, device, _sink) = setup(&["a"]);
        r.play(0, true);
        device.take();

        // Last reported progress says 50s but the device is already at 46s
        r.handle_device_event(DeviceEvent::TimeUpdate { current_time: 50.0, duration: 180.0 });
        device.set_position(46.0);
        assert!(r.apply_remote_position(PositionSync { position: 50.0, timestamp: None }));
        assert_eq!(device.take(), vec![Call::Seek(50.0)]);
        assert_eq!(r.state().current_time, 50.0);
    }

    #[test]
    fn test_position_reports_are_rate_limited() {
        let (mut r, _device, sink) = setup(&["a"]);
        r.play(0, true);

        let t0 = Instant::now();
        for (offset, time) in [(0, 1.0), (1, 2.0), (4, 5.0), (5, 6.0), (7, 8.0)] {
            r.handle_device_event_at(
                DeviceEvent::TimeUpdate { current_time: time, duration: 100.0 },
                t0 + Duration::from_secs(offset),
            );
        }

        let reports: Vec<_> = sink
            .take()
            .into_iter()
            .filter(|a| matches!(a, OutboundAction::ReportPosition { .. }))
            .collect();
        assert_eq!(
            reports,
            vec![
                OutboundAction::ReportPosition { position: 1.0, is_playing: true },
                OutboundAction::ReportPosition { position: 6.0, is_playing: true },
            ]
        );
    }

    #[test]
    fn test_error_on_single_track_goes_idle() {
        let (mut r, device, _sink) = setup(&["a"]);
        let mut rx = r.subscribe();
        r.play(0, true);
        device.take();

        r.handle_device_event(DeviceEvent::Error { message: "decode failed".into() });
        assert_eq!(errors(&mut rx), vec![("decode failed".to_string(), false)]);
        assert_eq!(r.state().phase, TrackPhase::Idle);
        assert!(!r.state().is_playing);
        assert!(!device.take().iter().any(|c| matches!(c, Call::Load(_))));
    }

    #[test]
    fn test_error_advances_in_same_call() {
        let (mut r, device, _sink) = setup(&["a", "b", "c"]);
        let mut rx = r.subscribe();
        r.play(0, true);
        device.take();

        r.handle_device_event(DeviceEvent::Error { message: "404".into() });
        assert_eq!(r.state().current_index, Some(1));
        assert_eq!(r.state().phase, TrackPhase::Loading);
        assert!(device.take().contains(&Call::Load("mem://b".into())));
        assert_eq!(errors(&mut rx), vec![("404".to_string(), true)]);
    }

    #[test]
    fn test_error_notice_is_debounced() {
        let (mut r, _device, _sink) = setup(&["a", "b", "c"]);
        let mut rx = r.subscribe();
        r.play(0, true);

        let t0 = Instant::now();
        let error = || DeviceEvent::Error { message: "network".into() };
        r.handle_device_event_at(error(), t0);
        r.handle_device_event_at(error(), t0 + Duration::from_millis(500));
        r.handle_device_event_at(error(), t0 + Duration::from_secs(2));
        assert_eq!(errors(&mut rx).len(), 1);

        r.handle_device_event_at(error(), t0 + Duration::from_secs(4));
        assert_eq!(errors(&mut rx).len(), 1);
    }

    #[test]
    fn test_loop_mode_restarts_on_end() {
        let (mut r, device, _sink) = setup(&["a", "b"]);
        r.set_play_mode(PlayMode::Loop);
        r.play(1, true);
        r.handle_device_event(DeviceEvent::Play);
        device.take();

        r.handle_device_event(DeviceEvent::Ended);
        assert_eq!(r.state().current_index, Some(1));
        assert_eq!(device.take(), vec![Call::Stop, Call::Load("mem://b".into()), Call::Play]);
    }

    #[test]
    fn test_playlist_replacement_keeps_selection() {
        let (mut r, device, _sink) = setup(&["a", "b", "c"]);
        r.play(2, true);
        device.take();

        r.apply_remote_state(StateUpdate {
            playlist: Some(vec![track("c"), track("a"), track("c")]),
            ..Default::default()
        });
        assert_eq!(r.state().playlist.len(), 2);
        assert_eq!(r.state().current_index, Some(0));
        assert!(device.take().is_empty());
    }

    #[test]
    fn test_out_of_range_index_is_ignored() {
        let (mut r, _device, _sink) = setup(&["a", "b"]);
        r.apply_remote_state(StateUpdate {
            current_index: Some(1),
            ..Default::default()
        });
        r.apply_remote_state(StateUpdate {
            current_index: Some(9),
            ..Default::default()
        });
        assert_eq!(r.state().current_index, Some(1));
    }

    #[test]
    fn test_snapshot_starts_at_position() {
        let device = Arc::new(RecordingDevice::default());
        let sink = Arc::new(RecordingSink::default());
        let mut r = Reconciler::new(device.clone(), sink.clone(), Arc::new(MemorySource), ReconcilerConfig::default());

        r.apply_snapshot(SongsSnapshot {
            playlist: vec![track("a"), track("b")],
            current_index: Some(1),
            is_playing: true,
            current_position: 42.0,
        });
        assert_eq!(r.state().current_index, Some(1));
        assert_eq!(r.state().current_time, 42.0);
        assert_eq!(
            device.take(),
            vec![Call::Stop, Call::Load("mem://b".into()), Call::Seek(42.0), Call::Play]
        );
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_add_and_remove_tracks() {
        let (mut r, _device, sink) = setup(&["a", "b", "c"]);
        r.play(2, true);
        sink.take();

        assert!(!r.add_track(track("a")));
        assert!(r.add_track(track("d")));

        let removed = r.remove_track(0).unwrap();
        assert_eq!(removed.id, "a");
        assert_eq!(r.state().current_index, Some(1));
        assert_eq!(r.state().current_track().unwrap().id, "c");

        assert_eq!(
            sink.take(),
            vec![
                OutboundAction::AddSong(track("d")),
                OutboundAction::RemoveSong { id: "a".into() },
            ]
        );
        assert!(r.remove_track(10).is_none());
    }

    #[test]
    fn test_removing_current_track_plays_replacement() {
        let (mut r, device, _sink) = setup(&["a", "b"]);
        r.play(1, true);
        device.take();

        r.remove_track(1);
        assert_eq!(r.state().current_index, Some(0));
        assert!(device.take().contains(&Call::Load("mem://a".into())));

        r.remove_track(0);
        assert_eq!(r.state().current_index, None);
        assert!(!r.state().is_playing);
        assert_eq!(r.state().phase, TrackPhase::Idle);
    }

    #[test]
    fn test_remove_shifts_loaded_entry_independently() {
        let (mut r, device, _sink) = setup(&["a", "b", "c"]);
        r.play(0, true);
        r.pause(true);
        r.apply_remote_state(StateUpdate {
            current_index: Some(2),
            is_playing: Some(false),
            ..Default::default()
        });
        device.take();

        // Loaded "a" sits before the removed entry and keeps its slot
        assert_eq!(r.remove_track(1).map(|t| t.id), Some("b".to_string()));
        assert_eq!(r.state().current_index, Some(1));
        assert_eq!(r.state().current_track().map(|t| t.id.as_str()), Some("c"));

        // Resuming "c" must load it rather than reuse the "a" load
        r.user_toggle_play();
        assert!(device.take().contains(&Call::Load("mem://c".into())));
    }

    #[test]
    fn test_removing_loaded_entry_forces_reload() {
        let (mut r, device, _sink) = setup(&["a", "b", "c"]);
        r.play(0, true);
        r.pause(true);
        r.apply_remote_state(StateUpdate {
            current_index: Some(2),
            ..Default::default()
        });

        r.remove_track(0);
        assert_eq!(r.state().current_index, Some(1));
        device.take();

        // "b" shifted into slot 0; selecting it must not count as already loaded
        r.play(0, true);
        assert!(device.take().contains(&Call::Load("mem://b".into())));
    }

    #[test]
    fn test_volume_is_clamped() {
        let (mut r, device, _sink) = setup(&["a"]);
        r.set_volume(1.7);
        r.set_volume(-0.2);
        assert_eq!(device.take(), vec![Call::Volume(1.0), Call::Volume(0.0)]);
        assert_eq!(r.state().volume, 0.0);
    }
}
