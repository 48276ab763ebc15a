//! FFI types exposed via uniffi

use crate::api::ApiError;
use crate::config::ConfigError;
use crate::connection::{ConnectError, ConnectionState, TransportMode};
use crate::fingerprint::DeviceEnvironment;
use crate::liveness::KeeperStatus;
use crate::player::DeviceEvent;
use crate::storage::{HistoryEntry, StorageError};
use crate::sync::{PlayMode, PlaybackState, Track, TrackPhase};

/// Error types exposed via FFI
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum CoreError {
    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Login failed: {0}")]
    LoginFailed(String),

    #[error("Invalid server configuration: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<ConfigError> for CoreError {
    fn from(e: ConfigError) -> Self {
        CoreError::Config(e.to_string())
    }
}

impl From<ConnectError> for CoreError {
    fn from(e: ConnectError) -> Self {
        match e {
            ConnectError::Config(e) => e.into(),
            ConnectError::NotLoggedIn => CoreError::NotLoggedIn,
        }
    }
}

impl From<ApiError> for CoreError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Unauthorized | ApiError::NotLoggedIn => CoreError::NotLoggedIn,
            ApiError::LoginRejected(msg) => CoreError::LoginFailed(msg),
            other => CoreError::Network(other.to_string()),
        }
    }
}

impl From<StorageError> for CoreError {
    fn from(e: StorageError) -> Self {
        CoreError::Storage(e.to_string())
    }
}

/// Playlist entry exposed via FFI
#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct TrackInfo {
    pub id: String,
    pub name: String,
    pub format: String,
    pub url: Option<String>,
    pub filename: Option<String>,
    pub artist: Option<String>,
}

impl From<&Track> for TrackInfo {
    fn from(t: &Track) -> Self {
        Self {
            id: t.id.clone(),
            name: t.name.clone(),
            format: t.format.clone(),
            url: t.url.clone(),
            filename: t.filename.clone(),
            artist: t.artist.clone(),
        }
    }
}

impl From<TrackInfo> for Track {
    fn from(t: TrackInfo) -> Self {
        Self {
            id: t.id,
            name: t.name,
            format: if t.format.is_empty() { "mp3".to_string() } else { t.format },
            url: t.url,
            filename: t.filename,
            artist: t.artist,
        }
    }
}

/// Player state exposed via FFI
#[derive(Debug, Clone, uniffi::Record)]
pub struct PlaybackSnapshot {
    pub playlist: Vec<TrackInfo>,
    /// -1 when nothing is selected
    pub current_index: i32,
    pub is_playing: bool,
    pub current_time: f64,
    pub duration: f64,
    pub play_mode: PlayMode,
    pub phase: TrackPhase,
    pub volume: f32,
}

impl From<&PlaybackState> for PlaybackSnapshot {
    fn from(s: &PlaybackState) -> Self {
        Self {
            playlist: s.playlist.iter().map(TrackInfo::from).collect(),
            current_index: s.current_index.and_then(|i| i32::try_from(i).ok()).unwrap_or(-1),
            is_playing: s.is_playing,
            current_time: s.current_time,
            duration: s.duration,
            play_mode: s.play_mode,
            phase: s.phase,
            volume: s.volume,
        }
    }
}

/// Connection status exposed via FFI
#[derive(Debug, Clone, uniffi::Record)]
pub struct ConnectionSnapshot {
    pub transport: TransportMode,
    pub connected: bool,
    pub connecting: bool,
    pub server_url: String,
    pub error: Option<String>,
    pub user_count: u32,
    pub last_heartbeat_ms: Option<u64>,
    pub needs_login: bool,
}

impl From<&ConnectionState> for ConnectionSnapshot {
    fn from(s: &ConnectionState) -> Self {
        Self {
            transport: s.transport,
            connected: s.connected,
            connecting: s.connecting,
            server_url: s.server_url.clone(),
            error: s.error.clone(),
            user_count: s.user_count,
            last_heartbeat_ms: s.last_heartbeat,
            needs_login: s.needs_login,
        }
    }
}

/// Result of a successful login
#[derive(Debug, Clone, uniffi::Record)]
pub struct LoginInfo {
    pub username: String,
    pub user_id: String,
    pub message: String,
}

/// Stored server settings
#[derive(Debug, Clone, uniffi::Record)]
pub struct ServerSettings {
    pub host: String,
    pub port: Option<u16>,
    pub use_https: bool,
}

/// Host environment used for the client fingerprint
#[derive(Debug, Clone, Default, uniffi::Record)]
pub struct EnvironmentInfo {
    pub user_agent: String,
    pub screen_width: u32,
    pub screen_height: u32,
    pub color_depth: u32,
    pub timezone: String,
    pub language: String,
    pub platform: String,
    pub device_model: String,
}

impl From<EnvironmentInfo> for DeviceEnvironment {
    fn from(e: EnvironmentInfo) -> Self {
        Self {
            user_agent: e.user_agent,
            screen_width: e.screen_width,
            screen_height: e.screen_height,
            color_depth: e.color_depth,
            timezone: e.timezone,
            language: e.language,
            platform: e.platform,
            device_model: e.device_model,
        }
    }
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct KeeperStatusInfo {
    pub enabled: bool,
    pub wake_lock: bool,
    pub sleep_prevented: bool,
    pub network_ping: bool,
    pub heartbeat: bool,
    pub visibility_listener: bool,
}

impl From<KeeperStatus> for KeeperStatusInfo {
    fn from(s: KeeperStatus) -> Self {
        Self {
            enabled: s.enabled,
            wake_lock: s.wake_lock,
            sleep_prevented: s.sleep_prevented,
            network_ping: s.network_ping,
            heartbeat: s.heartbeat,
            visibility_listener: s.visibility_listener,
        }
    }
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct HistoryItem {
    pub track: TrackInfo,
    /// Epoch millis when playback started
    pub play_time: u64,
}

impl From<&HistoryEntry> for HistoryItem {
    fn from(e: &HistoryEntry) -> Self {
        Self {
            track: TrackInfo::from(&e.track),
            play_time: e.play_time,
        }
    }
}

/// Events the host audio output reports back
#[derive(Debug, Clone, uniffi::Enum)]
pub enum AudioEvent {
    Play,
    Pause,
    Ended,
    Error { message: String },
    TimeUpdate { current_time: f64, duration: f64 },
    CanPlay { duration: f64 },
}

impl From<AudioEvent> for DeviceEvent {
    fn from(e: AudioEvent) -> Self {
        match e {
            AudioEvent::Play => DeviceEvent::Play,
            AudioEvent::Pause => DeviceEvent::Pause,
            AudioEvent::Ended => DeviceEvent::Ended,
            AudioEvent::Error { message } => DeviceEvent::Error { message },
            AudioEvent::TimeUpdate { current_time, duration } => DeviceEvent::TimeUpdate { current_time, duration },
            AudioEvent::CanPlay { duration } => DeviceEvent::CanPlay { duration },
        }
    }
}

/// Platform audio output. Report what happens through
/// `Session::on_audio_event`.
#[uniffi::export(callback_interface)]
pub trait AudioOutput: Send + Sync {
    fn load(&self, url: String);
    fn play(&self);
    fn pause(&self);
    fn seek(&self, position: f64);
    fn stop(&self);
    fn set_volume(&self, volume: f32);
    fn current_time(&self) -> f64;
}

/// Persistent key-value storage owned by the host
#[uniffi::export(callback_interface)]
pub trait HostStorage: Send + Sync {
    fn get(&self, key: String) -> Option<String>;
    /// Returns false if the value could not be stored
    fn set(&self, key: String, value: String) -> bool;
    fn remove(&self, key: String);
}

/// Host power management. Return false from the acquire calls when the
/// platform does not support them.
#[uniffi::export(callback_interface)]
pub trait HostPowerControl: Send + Sync {
    fn acquire_wake_lock(&self) -> bool;
    fn release_wake_lock(&self);
    fn prevent_sleep(&self) -> bool;
    fn allow_sleep(&self);
}

/// Callback interface for session events
#[uniffi::export(callback_interface)]
pub trait SessionCallback: Send + Sync {
    fn on_playback_changed(&self, playback: PlaybackSnapshot);
    fn on_track_changed(&self, index: u32, track: TrackInfo);
    fn on_progress(&self, current_time: f64, duration: f64);
    fn on_playback_error(&self, message: String, advancing: bool);
    fn on_notice(&self, message: String);
    fn on_connection_changed(&self, connection: ConnectionSnapshot);
    /// The server rejected our token; credentials have been cleared
    fn on_login_required(&self);
}
