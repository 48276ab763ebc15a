//! Music Together - Core Library
//!
//! Keeps a shared playlist, play state and position in sync between every
//! client of one playback server, over a WebSocket push link when the server
//! offers one and HTTP polling otherwise.

pub mod api;
pub mod config;
pub mod connection;
pub mod ffi;
pub mod fingerprint;
pub mod liveness;
pub mod player;
pub mod storage;
pub mod sync;

// Re-exports for convenience
pub use api::ServerClient;
pub use config::{ServerConfig, SyncConfig};
pub use connection::{ConnectionManager, ConnectionState, TransportMode};
pub use player::{PlaybackDevice, Reconciler};
pub use sync::{PlaybackState, SyncEvent, Track};

/// Milliseconds since the UNIX epoch
pub fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

uniffi::setup_scaffolding!();
