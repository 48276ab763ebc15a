//! Connection state and transport modes

use thiserror::Error;

use crate::config::ConfigError;

/// Which transport carries sync traffic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, uniffi::Enum)]
pub enum TransportMode {
    #[default]
    None,
    Poll,
    Push,
}

impl TransportMode {
    /// Legal moves: `None -> Poll -> Push -> Poll`, and back to `None`
    /// from anywhere. Push is only ever reached from an active poll.
    pub fn can_transition_to(self, next: TransportMode) -> bool {
        use TransportMode::*;
        matches!((self, next), (None, Poll) | (Poll, Push) | (Push, Poll) | (Poll, None) | (Push, None))
    }
}

/// Connection status published to observers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionState {
    pub transport: TransportMode,
    pub connected: bool,
    pub connecting: bool,
    pub server_url: String,
    pub error: Option<String>,
    pub user_count: u32,
    /// Epoch millis of the last successful heartbeat
    pub last_heartbeat: Option<u64>,
    /// The server rejected our token
    pub needs_login: bool,
}

/// Errors returned by `connect`
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Not logged in")]
    NotLoggedIn,
}

/// Internal notifications from transports to the connection supervisor
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TransportSignal {
    PushClosed { reason: String },
    Unauthorized,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_transitions() {
        use TransportMode::*;
        assert!(None.can_transition_to(Poll));
        assert!(Poll.can_transition_to(Push));
        assert!(Push.can_transition_to(Poll));
        assert!(Push.can_transition_to(None));
        assert!(Poll.can_transition_to(None));

        assert!(!None.can_transition_to(Push));
        assert!(!Poll.can_transition_to(Poll));
        assert!(!None.can_transition_to(None));
    }
}
