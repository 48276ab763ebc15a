//! Request and response bodies for the playback server

use serde::{Deserialize, Serialize};

/// Heartbeat period the server asks for when it does not say otherwise
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Serialize)]
pub(crate) struct LoginRequest<'a> {
    pub password: &'a str,
}

/// Successful `POST /api/login`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    #[serde(default)]
    pub message: String,
    /// Seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
}

fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

/// `POST /api/heartbeat`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(default)]
    pub online_count: u32,
}

/// Error body some endpoints return alongside a failure status
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorBody {
    pub fn into_message(self) -> Option<String> {
        self.error.or(self.message).filter(|m| !m.is_empty())
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct PositionBody {
    pub position: f64,
}

#[derive(Debug, Serialize)]
pub(crate) struct PlayStateBody {
    pub is_playing: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChangeSongBody {
    pub index: usize,
}
