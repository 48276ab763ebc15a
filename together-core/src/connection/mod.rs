//! Connection layer: polling, push and the manager that switches between them

mod manager;
mod polling;
mod push;
mod state;

pub use manager::ConnectionManager;
pub use polling::PollingEngine;
pub use push::{PushError, PushLink, PushSender};
pub use state::{ConnectError, ConnectionState, TransportMode};
