//! Typed access to persisted client data

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::store::{KeyValueStore, StorageError};
use crate::config::ServerConfig;
use crate::sync::{PlayMode, Track};

/// Storage keys
pub mod keys {
    pub const SERVER_CONFIG: &str = "serverConfig";
    pub const TOKEN: &str = "token";
    pub const USER_INFO: &str = "userInfo";
    pub const PLAYER_SETTINGS: &str = "playerSettings";
    pub const PLAY_HISTORY: &str = "playHistory";
    pub const FAVORITES: &str = "favorites";
    pub const FINGERPRINT_SEED: &str = "fingerprint_seed";
}

/// Maximum number of play history entries kept
pub const MAX_HISTORY: usize = 50;

/// How long a login stays valid without re-entering the password
pub const LOGIN_TTL_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Identity created at login
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user_id: String,
    pub username: String,
    /// Epoch millis
    pub login_time: u64,
}

impl UserInfo {
    /// Fresh identity with a random `user_` id
    pub fn generate(username: impl Into<String>, now_ms: u64) -> Self {
        use rand::distributions::Alphanumeric;
        use rand::Rng;

        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(9)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect();

        Self {
            user_id: format!("user_{}", suffix),
            username: username.into(),
            login_time: now_ms,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.login_time) > LOGIN_TTL_MS
    }
}

/// Player preferences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerSettings {
    pub volume: f32,
    pub play_mode: PlayMode,
    pub autoplay: bool,
    pub quality: String,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            volume: 0.8,
            play_mode: PlayMode::List,
            autoplay: true,
            quality: "high".to_string(),
        }
    }
}

/// A played track with the time it started
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub track: Track,
    pub play_time: u64,
}

/// Typed view over a [`KeyValueStore`].
///
/// Reads never fail: a missing or unreadable value yields the default and is
/// logged. Writes report backend errors to the caller.
#[derive(Clone)]
pub struct LocalStore {
    backend: Arc<dyn KeyValueStore>,
}

impl LocalStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.backend.get(key) {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("Discarding unreadable {}: {}", key, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read {}: {}", key, e);
                None
            }
        }
    }

    fn write<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let raw = serde_json::to_string(value)?;
        self.backend.set(key, &raw)
    }

    // --- Server config ---

    pub fn server_config(&self) -> Option<ServerConfig> {
        self.read(keys::SERVER_CONFIG)
    }

    pub fn set_server_config(&self, config: &ServerConfig) -> Result<(), StorageError> {
        self.write(keys::SERVER_CONFIG, config)
    }

    // --- Credentials ---

    /// Raw token string (stored unquoted)
    pub fn token(&self) -> Option<String> {
        match self.backend.get(keys::TOKEN) {
            Ok(token) => token.filter(|t| !t.is_empty()),
            Err(e) => {
                warn!("Failed to read token: {}", e);
                None
            }
        }
    }

    pub fn set_token(&self, token: &str) -> Result<(), StorageError> {
        self.backend.set(keys::TOKEN, token)
    }

    pub fn user_info(&self) -> Option<UserInfo> {
        self.read(keys::USER_INFO)
    }

    pub fn set_user_info(&self, info: &UserInfo) -> Result<(), StorageError> {
        self.write(keys::USER_INFO, info)
    }

    /// Forget token and identity
    pub fn clear_credentials(&self) -> Result<(), StorageError> {
        self.backend.remove(keys::TOKEN)?;
        self.backend.remove(keys::USER_INFO)
    }

    // --- Fingerprint ---

    /// Unlike the other getters this surfaces backend failures, so the
    /// fingerprint generator can fall back instead of minting a new seed.
    pub fn fingerprint_seed(&self) -> Result<Option<String>, StorageError> {
        self.backend.get(keys::FINGERPRINT_SEED)
    }

    pub fn set_fingerprint_seed(&self, seed: &str) -> Result<(), StorageError> {
        self.backend.set(keys::FINGERPRINT_SEED, seed)
    }

    // --- Player settings ---

    pub fn player_settings(&self) -> PlayerSettings {
        self.read(keys::PLAYER_SETTINGS).unwrap_or_default()
    }

    pub fn set_player_settings(&self, settings: &PlayerSettings) -> Result<(), StorageError> {
        self.write(keys::PLAYER_SETTINGS, settings)
    }

    // --- History ---

    /// Most recent first
    pub fn play_history(&self) -> Vec<HistoryEntry> {
        self.read(keys::PLAY_HISTORY).unwrap_or_default()
    }

    /// Move `track` to the front of the history
    pub fn record_play(&self, track: &Track, now_ms: u64) -> Result<(), StorageError> {
        let mut history = self.play_history();
        history.retain(|entry| entry.track.id != track.id);
        history.insert(
            0,
            HistoryEntry {
                track: track.clone(),
                play_time: now_ms,
            },
        );
        history.truncate(MAX_HISTORY);
        self.write(keys::PLAY_HISTORY, &history)
    }

    pub fn clear_history(&self) -> Result<(), StorageError> {
        self.backend.remove(keys::PLAY_HISTORY)
    }

    // --- Favorites ---

    pub fn favorites(&self) -> Vec<Track> {
        self.read(keys::FAVORITES).unwrap_or_default()
    }

    pub fn is_favorite(&self, id: &str) -> bool {
        self.favorites().iter().any(|t| t.id == id)
    }

    /// Returns `false` if the track was already a favorite
    pub fn add_favorite(&self, track: &Track) -> Result<bool, StorageError> {
        let mut favorites = self.favorites();
        if favorites.iter().any(|t| t.id == track.id) {
            return Ok(false);
        }
        favorites.push(track.clone());
        self.write(keys::FAVORITES, &favorites)?;
        Ok(true)
    }

    /// Returns `false` if no favorite had that id
    pub fn remove_favorite(&self, id: &str) -> Result<bool, StorageError> {
        let mut favorites = self.favorites();
        let before = favorites.len();
        favorites.retain(|t| t.id != id);
        if favorites.len() == before {
            return Ok(false);
        }
        self.write(keys::FAVORITES, &favorites)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn store() -> LocalStore {
        LocalStore::new(Arc::new(MemoryStore::new()))
    }

    fn track(id: &str) -> Track {
        Track {
            id: id.to_string(),
            name: format!("Song {}", id),
            format: "mp3".to_string(),
            url: None,
            filename: None,
            artist: None,
        }
    }

    #[test]
    fn test_history_is_mru_and_bounded() {
        let store = store();
        for i in 0..60 {
            store.record_play(&track(&i.to_string()), i).unwrap();
        }
        store.record_play(&track("10"), 100).unwrap();

        let history = store.play_history();
        assert_eq!(history.len(), MAX_HISTORY);
        assert_eq!(history[0].track.id, "10");
        assert_eq!(history[0].play_time, 100);
        assert_eq!(history[1].track.id, "59");
        assert_eq!(history.iter().filter(|e| e.track.id == "10").count(), 1);
    }

    #[test]
    fn test_favorites_unique() {
        let store = store();
        assert!(store.add_favorite(&track("a")).unwrap());
        assert!(!store.add_favorite(&track("a")).unwrap());
        assert!(store.is_favorite("a"));
        assert!(store.remove_favorite("a").unwrap());
        assert!(!store.remove_favorite("a").unwrap());
        assert!(store.favorites().is_empty());
    }

    #[test]
    fn test_player_settings_default_and_partial() {
        let backend = Arc::new(MemoryStore::new());
        let store = LocalStore::new(backend.clone());
        assert_eq!(store.player_settings(), PlayerSettings::default());

        backend.set(keys::PLAYER_SETTINGS, r#"{"volume":0.3,"playMode":"loop"}"#).unwrap();
        let settings = store.player_settings();
        assert_eq!(settings.volume, 0.3);
        assert_eq!(settings.play_mode, PlayMode::Loop);
        assert!(settings.autoplay);
    }

    #[test]
    fn test_unreadable_values_fall_back() {
        let backend = Arc::new(MemoryStore::new());
        let store = LocalStore::new(backend.clone());
        backend.set(keys::FAVORITES, "[oops").unwrap();
        assert!(store.favorites().is_empty());
    }

    #[test]
    fn test_credentials_round() {
        let store = store();
        let user = UserInfo::generate("Listener", 1_000);
        assert!(user.user_id.starts_with("user_"));
        store.set_token("tok").unwrap();
        store.set_user_info(&user).unwrap();
        assert_eq!(store.token().as_deref(), Some("tok"));
        assert_eq!(store.user_info(), Some(user.clone()));

        store.clear_credentials().unwrap();
        assert!(store.token().is_none());
        assert!(store.user_info().is_none());

        assert!(!user.is_expired(1_000 + LOGIN_TTL_MS));
        assert!(user.is_expired(1_001 + LOGIN_TTL_MS));
    }
}
