//! Configuration
//!
//! Server address normalization and sync tuning.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use url::Url;

/// Default poll interval for `/api/poll/state`
pub const DEFAULT_STATE_INTERVAL_MS: u64 = 2000;
/// Default poll interval for `/api/poll/position`
pub const DEFAULT_POSITION_INTERVAL_MS: u64 = 3000;
/// Default poll interval for `/api/poll/clients`
pub const DEFAULT_CLIENTS_INTERVAL_MS: u64 = 5000;

/// Seconds of position disagreement tolerated before seeking
pub const DRIFT_TOLERANCE_SECS: f64 = 3.0;

/// Default WebSocket path on the playback server
pub const DEFAULT_PUSH_PATH: &str = "/ws";

/// Errors from server configuration
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("No server configured")]
    Missing,

    #[error("Malformed server address: {0}")]
    Malformed(String),

    #[error("Invalid port: {0}")]
    InvalidPort(String),
}

/// Schedule for the three polling tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollIntervals {
    pub state_ms: u64,
    pub position_ms: u64,
    pub clients_ms: u64,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            state_ms: DEFAULT_STATE_INTERVAL_MS,
            position_ms: DEFAULT_POSITION_INTERVAL_MS,
            clients_ms: DEFAULT_CLIENTS_INTERVAL_MS,
        }
    }
}

/// Tuning for the connection, player and liveness layers
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub poll: PollIntervals,
    /// `POST /api/heartbeat` period while polling
    pub http_heartbeat_interval: Duration,
    /// Heartbeat envelope period while on push
    pub push_heartbeat_interval: Duration,
    /// Try to promote to push after polling starts
    pub enable_push: bool,
    pub push_path: String,
    /// Max wait for the WebSocket handshake
    pub handshake_timeout: Duration,
    /// Start polling even when the health probe fails
    pub force_polling_on_failure: bool,
    /// Per-request HTTP timeout
    pub request_timeout: Duration,
    pub drift_tolerance_secs: f64,
    /// Minimum gap between outbound position reports
    pub position_report_interval: Duration,
    /// Window in which repeated playback errors are shown once
    pub error_debounce: Duration,
    /// Background keeper health ping period
    pub keepalive_ping_interval: Duration,
    /// Background keeper heartbeat period
    pub keepalive_heartbeat_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll: PollIntervals::default(),
            http_heartbeat_interval: Duration::from_secs(10),
            push_heartbeat_interval: Duration::from_secs(30),
            enable_push: true,
            push_path: DEFAULT_PUSH_PATH.to_string(),
            handshake_timeout: Duration::from_secs(5),
            force_polling_on_failure: true,
            request_timeout: Duration::from_secs(5),
            drift_tolerance_secs: DRIFT_TOLERANCE_SECS,
            position_report_interval: Duration::from_secs(5),
            error_debounce: Duration::from_secs(3),
            keepalive_ping_interval: Duration::from_secs(30),
            keepalive_heartbeat_interval: Duration::from_secs(15),
        }
    }
}

/// Persisted server configuration (`serverConfig` key).
///
/// Two shapes exist in the wild: the modern `{serverHost, serverPort,
/// useHttps}` and the legacy `{url, port}`. Both deserialize into this
/// struct and are reconciled by [`ServerConfig::normalize`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "port_from_any")]
    pub server_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_https: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "port_from_any")]
    pub port: Option<u16>,
}

/// Ports are stored as numbers, numeric strings or empty strings
fn port_from_any<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawPort {
        Number(u16),
        Text(String),
    }

    match Option::<RawPort>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawPort::Number(p)) => Ok(Some(p)),
        Some(RawPort::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(RawPort::Text(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid port {:?}", s))),
    }
}

impl ServerConfig {
    /// Modern-form config
    pub fn new(host: impl Into<String>, port: Option<u16>, use_https: bool) -> Self {
        Self {
            server_host: Some(host.into()),
            server_port: port,
            use_https: Some(use_https),
            url: None,
            port: None,
        }
    }

    /// Resolve either stored shape into a validated endpoint
    pub fn normalize(&self) -> Result<ServerEndpoint, ConfigError> {
        if let Some(host) = self.server_host.as_deref().filter(|h| !h.trim().is_empty()) {
            let secure = self.use_https.unwrap_or(false);
            let (host, embedded_port) = split_host_port(strip_scheme(host).0)?;
            return ServerEndpoint::build(secure, host, self.server_port.or(embedded_port));
        }

        if let Some(raw) = self.url.as_deref().filter(|u| !u.trim().is_empty()) {
            let (rest, secure) = strip_scheme(raw.trim());
            let (host, embedded_port) = split_host_port(rest)?;
            return ServerEndpoint::build(secure, host, embedded_port.or(self.port));
        }

        Err(ConfigError::Missing)
    }
}

/// Strip `http(s)://` or `ws(s)://`, reporting whether it was a secure scheme
fn strip_scheme(raw: &str) -> (&str, bool) {
    for (prefix, secure) in [("https://", true), ("wss://", true), ("http://", false), ("ws://", false)] {
        if raw.len() >= prefix.len() && raw[..prefix.len()].eq_ignore_ascii_case(prefix) {
            return (&raw[prefix.len()..], secure);
        }
    }
    (raw, false)
}

/// Split `host[:port][/path]`, dropping any path
fn split_host_port(raw: &str) -> Result<(&str, Option<u16>), ConfigError> {
    let authority = raw.split('/').next().unwrap_or_default().trim();

    let (host, port) = match authority.rsplit_once(':') {
        // IPv6 literals keep their colons inside brackets
        Some((host, port)) if !port.contains(']') => {
            let port = port
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidPort(port.to_string()))?;
            (host, Some(port))
        }
        _ => (authority, None),
    };

    if host.is_empty() {
        return Err(ConfigError::Malformed(raw.to_string()));
    }
    Ok((host, port))
}

/// A validated server address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    base: Url,
}

impl ServerEndpoint {
    fn build(secure: bool, host: &str, port: Option<u16>) -> Result<Self, ConfigError> {
        let scheme = if secure { "https" } else { "http" };
        let raw = match port {
            Some(port) => format!("{}://{}:{}", scheme, host, port),
            None => format!("{}://{}", scheme, host),
        };
        Self::parse(&raw)
    }

    /// Parse a server URL such as `http://10.0.0.2:8080`
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let base = Url::parse(raw.trim()).map_err(|e| ConfigError::Malformed(format!("{} ({})", raw, e)))?;

        if !matches!(base.scheme(), "http" | "https") {
            return Err(ConfigError::Malformed(format!(
                "unsupported scheme {:?} in {}",
                base.scheme(),
                raw
            )));
        }
        if base.host_str().map_or(true, str::is_empty) {
            return Err(ConfigError::Malformed(raw.to_string()));
        }

        Ok(Self { base })
    }

    pub fn is_secure(&self) -> bool {
        self.base.scheme() == "https"
    }

    pub fn host(&self) -> &str {
        self.base.host_str().unwrap_or_default()
    }

    /// Explicit port, `None` when the scheme default is used
    pub fn port(&self) -> Option<u16> {
        self.base.port()
    }

    /// `scheme://host[:port]` without a trailing slash
    pub fn base_url(&self) -> String {
        self.base.origin().ascii_serialization()
    }

    /// WebSocket URL on the same host
    pub fn push_url(&self, path: &str) -> String {
        let scheme = if self.is_secure() { "wss" } else { "ws" };
        let authority = self
            .base_url()
            .split_once("://")
            .map(|(_, rest)| rest.to_string())
            .unwrap_or_default();

        if path.starts_with('/') {
            format!("{}://{}{}", scheme, authority, path)
        } else {
            format!("{}://{}/{}", scheme, authority, path)
        }
    }
}
