//! Playback Server API
//!
//! Typed HTTP client for the shared playback server.

mod client;
mod types;

pub use client::{ApiError, ServerClient};
pub use types::*;
