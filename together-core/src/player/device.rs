//! Playback device seam

use crate::sync::Track;

/// Platform audio output.
///
/// Calls are fire-and-forget; the device reports what actually happened
/// back through [`DeviceEvent`]s.
pub trait PlaybackDevice: Send + Sync {
    fn load(&self, url: &str);
    fn play(&self);
    fn pause(&self);
    /// Seconds from the start of the track
    fn seek(&self, position: f64);
    fn stop(&self);
    /// 0.0 to 1.0
    fn set_volume(&self, volume: f32);
    fn current_time(&self) -> f64;
}

/// Events emitted by the playback device
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Play,
    Pause,
    Ended,
    Error { message: String },
    TimeUpdate { current_time: f64, duration: f64 },
    /// Enough data buffered to start; carries the track length if known
    CanPlay { duration: f64 },
}

/// Resolves the URL the device should load for a track
pub trait AudioSource: Send + Sync {
    fn audio_url(&self, track: &Track) -> Option<String>;
}
