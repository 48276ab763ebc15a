//! Music Together - Session Monitor
//!
//! Joins the shared session as a silent listener and shows connection,
//! now-playing and playlist state in a terminal dashboard.
//!
//! Usage:
//!   TOGETHER_SERVER=http://host:8080 TOGETHER_PASSWORD=... cargo run --release
//!   cargo run --release -- --no-dashboard  # Plain logging mode
//!   cargo run --release -- --no-push       # Stay on HTTP polling

mod dashboard;
mod listener;
mod metrics;

use std::sync::Arc;
use parking_lot::RwLock;

use listener::ListenerConfig;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args: Vec<String> = std::env::args().collect();
    let use_dashboard = !args.contains(&"--no-dashboard".to_string());
    let config = ListenerConfig::from_env(&args);

    // Shared monitor state
    let state = Arc::new(RwLock::new(metrics::MonitorState::new(config.server.clone())));

    if use_dashboard {
        // Run with TUI dashboard
        dashboard::run(state, config).await
    } else {
        // Run with plain logging
        listener::run_with_logging(state, config).await
    }
}
