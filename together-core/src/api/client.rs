//! Playback Server HTTP Client

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;

use super::types::*;
use crate::fingerprint::is_header_safe;
use crate::player::AudioSource;
use crate::sync::{ClientsUpdate, PositionSync, SongsSnapshot, StateUpdate, Track};

/// Connection timeout for the playback server
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(3);

/// Header carrying the client fingerprint
pub const FINGERPRINT_HEADER: &str = "X-User-Fingerprint";

/// Errors that can occur when talking to the playback server
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Session expired or token rejected")]
    Unauthorized,

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Fingerprint is not header-safe, request not sent")]
    UnsafeFingerprint,

    #[error("Unexpected response (HTTP {0})")]
    Status(u16),

    #[error("Login rejected: {0}")]
    LoginRejected(String),

    #[error("Polling is not active")]
    NotConnected,
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized)
    }
}

#[derive(Default)]
struct Credentials {
    token: Option<String>,
    fingerprint: String,
}

/// Client for the playback server's REST API.
///
/// Clones share credentials, so a token set or cleared through one clone is
/// seen by all of them. [`ServerClient::at`] rebinds the base URL.
#[derive(Clone)]
pub struct ServerClient {
    http: Client,
    base_url: String,
    credentials: Arc<RwLock<Credentials>>,
}

impl std::fmt::Debug for ServerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerClient")
            .field("base_url", &self.base_url)
            .field("has_token", &self.credentials.read().token.is_some())
            .finish()
    }
}

impl ServerClient {
    /// Create a client with the given per-request timeout
    pub fn new(
        base_url: impl Into<String>,
        fingerprint: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, ApiError> {
        let http = Client::builder()
            .connect_timeout(CONNECTION_TIMEOUT)
            .timeout(request_timeout)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials: Arc::new(RwLock::new(Credentials {
                token: None,
                fingerprint: fingerprint.into(),
            })),
        })
    }

    /// Same client and credentials, different server
    pub fn at(&self, base_url: &str) -> Self {
        Self {
            http: self.http.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials: self.credentials.clone(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn token(&self) -> Option<String> {
        self.credentials.read().token.clone()
    }

    pub fn set_token(&self, token: Option<String>) {
        self.credentials.write().token = token;
    }

    pub fn fingerprint(&self) -> String {
        self.credentials.read().fingerprint.clone()
    }

    pub fn set_fingerprint(&self, fingerprint: impl Into<String>) {
        self.credentials.write().fingerprint = fingerprint.into();
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Request with only the fingerprint header (login, before a token exists)
    fn anonymous(&self, method: Method, path: &str) -> Result<RequestBuilder, ApiError> {
        let fingerprint = self.fingerprint();
        if !is_header_safe(&fingerprint) {
            warn!("Refusing to send {} with unsafe fingerprint", path);
            return Err(ApiError::UnsafeFingerprint);
        }

        Ok(self
            .http
            .request(method, self.url(path))
            .header(FINGERPRINT_HEADER, fingerprint))
    }

    /// Request carrying bearer token and fingerprint
    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ApiError> {
        let token = self.token().ok_or(ApiError::NotLoggedIn)?;
        Ok(self.anonymous(method, path)?.bearer_auth(token))
    }

    fn check(resp: Response) -> Result<Response, ApiError> {
        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else if status == StatusCode::UNAUTHORIZED {
            Err(ApiError::Unauthorized)
        } else {
            Err(ApiError::Status(status.as_u16()))
        }
    }

    async fn post_json<B: serde::Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), ApiError> {
        let resp = self.request(Method::POST, path)?.json(body).send().await?;
        Self::check(resp)?;
        Ok(())
    }

    async fn post_empty(&self, path: &str) -> Result<(), ApiError> {
        let resp = self.request(Method::POST, path)?.send().await?;
        Self::check(resp)?;
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let resp = self.request(Method::GET, path)?.send().await?;
        Ok(Self::check(resp)?.json().await?)
    }

    /// Probe `GET /api/health`. Any failure means unhealthy.
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    pub async fn health(&self) -> bool {
        match self.http.get(self.url("/api/health")).send().await {
            Ok(resp) => {
                debug!("Health status: {}", resp.status());
                resp.status().is_success()
            }
            Err(e) => {
                debug!("Health probe failed: {}", e);
                false
            }
        }
    }

    /// Exchange the shared password for a token
    #[instrument(skip(self, password), fields(base_url = %self.base_url))]
    pub async fn login(&self, password: &str) -> Result<LoginResponse, ApiError> {
        let resp = self
            .anonymous(Method::POST, "/api/login")?
            .json(&LoginRequest { password })
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json().await?);
        }

        let reason = resp
            .json::<ErrorBody>()
            .await
            .ok()
            .and_then(ErrorBody::into_message)
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
        warn!("Login rejected: {}", reason);
        Err(ApiError::LoginRejected(reason))
    }

    pub async fn heartbeat(&self) -> Result<HeartbeatResponse, ApiError> {
        let resp = self.request(Method::POST, "/api/heartbeat")?.send().await?;
        Ok(Self::check(resp)?.json().await?)
    }

    /// Full playlist snapshot
    pub async fn songs(&self) -> Result<SongsSnapshot, ApiError> {
        self.get_json("/api/songs").await
    }

    // --- Polling endpoints ---

    pub async fn poll_state(&self) -> Result<StateUpdate, ApiError> {
        self.get_json("/api/poll/state").await
    }

    pub async fn poll_position(&self) -> Result<PositionSync, ApiError> {
        self.get_json("/api/poll/position").await
    }

    pub async fn poll_clients(&self) -> Result<ClientsUpdate, ApiError> {
        self.get_json("/api/poll/clients").await
    }

    pub async fn update_position(&self, position: f64) -> Result<(), ApiError> {
        self.post_json("/api/poll/update-position", &PositionBody { position }).await
    }

    pub async fn update_play_state(&self, is_playing: bool) -> Result<(), ApiError> {
        self.post_json("/api/poll/update-play-state", &PlayStateBody { is_playing })
            .await
    }

    pub async fn change_song(&self, index: usize) -> Result<(), ApiError> {
        self.post_json("/api/poll/change-song", &ChangeSongBody { index }).await
    }

    // --- Push-mode control endpoints ---

    pub async fn play(&self, index: usize) -> Result<(), ApiError> {
        self.post_empty(&format!("/api/play/{}", index)).await
    }

    pub async fn pause(&self) -> Result<(), ApiError> {
        self.post_empty("/api/pause").await
    }

    pub async fn resume(&self) -> Result<(), ApiError> {
        self.post_empty("/api/resume").await
    }

    pub async fn sync_position(&self, position: f64) -> Result<(), ApiError> {
        self.post_json("/api/sync-position", &PositionBody { position }).await
    }

    /// Where the audio for `track` can be fetched.
    ///
    /// Absolute http(s) URLs are used as-is. Otherwise the file is served
    /// from `/api/music/storage/{filename}?token=...`.
    pub fn audio_url(&self, track: &Track) -> Option<String> {
        if let Some(raw) = track.url.as_deref() {
            if Url::parse(raw).is_ok_and(|u| matches!(u.scheme(), "http" | "https")) {
                return Some(raw.to_string());
            }
        }

        let stored = track
            .filename
            .clone()
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| {
                let format = if track.format.is_empty() { "mp3" } else { track.format.as_str() };
                format!("{}.{}", track.name, format)
            });
        let filename = stored.rsplit(['/', '\\']).next().unwrap_or(stored.as_str());

        let mut url = Url::parse(&self.base_url).ok()?;
        url.path_segments_mut()
            .ok()?
            .pop_if_empty()
            .extend(["api", "music", "storage", filename]);
        if let Some(token) = self.token() {
            url.query_pairs_mut().append_pair("token", &token);
        }
        Some(url.to_string())
    }
}

impl AudioSource for ServerClient {
    fn audio_url(&self, track: &Track) -> Option<String> {
        ServerClient::audio_url(self, track)
    }
}
