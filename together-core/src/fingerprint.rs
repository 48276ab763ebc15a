//! Client Fingerprint
//!
//! A stable, anonymous per-install identifier sent as `X-User-Fingerprint`
//! so the server can tell apart clients behind one address. It is derived
//! from host-reported environment traits plus one persisted random seed,
//! hashed so that arbitrary (non-ASCII) input never reaches a header.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::current_time_ms;
use crate::storage::{LocalStore, StorageError};

/// Bytes of the digest kept in the identifier
const DIGEST_BYTES: usize = 18;

/// Host-reported environment traits. Any of them may be empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceEnvironment {
    pub user_agent: String,
    pub screen_width: u32,
    pub screen_height: u32,
    pub color_depth: u32,
    /// IANA name or UTC offset, whatever the host has
    pub timezone: String,
    pub language: String,
    pub platform: String,
    pub device_model: String,
}

impl DeviceEnvironment {
    fn components(&self) -> Vec<String> {
        vec![
            self.user_agent.clone(),
            format!("{}x{}", self.screen_width, self.screen_height),
            self.color_depth.to_string(),
            self.timezone.clone(),
            self.language.clone(),
            self.platform.clone(),
            self.device_model.clone(),
        ]
    }
}

/// Whether `value` can go into an HTTP header as-is
pub fn is_header_safe(value: &str) -> bool {
    !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Builds the fingerprint for this install
pub struct Fingerprint {
    store: LocalStore,
    environment: DeviceEnvironment,
}

impl Fingerprint {
    pub fn new(store: LocalStore, environment: DeviceEnvironment) -> Self {
        Self { store, environment }
    }

    /// Never fails: internal errors produce a `safe_` fallback id
    pub fn generate(&self) -> String {
        match self.try_generate() {
            Ok(fingerprint) if is_header_safe(&fingerprint) => fingerprint,
            Ok(fingerprint) => {
                warn!("Generated fingerprint {:?} is not header-safe, using fallback", fingerprint);
                fallback()
            }
            Err(e) => {
                warn!("Fingerprint generation failed ({}), using fallback", e);
                fallback()
            }
        }
    }

    fn try_generate(&self) -> Result<String, StorageError> {
        let mut components = self.environment.components();
        components.push(self.seed()?);
        if let Some(user) = self.store.user_info() {
            components.push(format!("user_{}", user.user_id));
        }

        let digest = Sha256::digest(components.join("|").as_bytes());
        Ok(format!("fp_{}", URL_SAFE_NO_PAD.encode(&digest[..DIGEST_BYTES])))
    }

    fn seed(&self) -> Result<String, StorageError> {
        if let Some(seed) = self.store.fingerprint_seed()?.filter(|s| !s.is_empty()) {
            return Ok(seed);
        }

        let seed = random_token(13);
        self.store.set_fingerprint_seed(&seed)?;
        debug!("Created new fingerprint seed");
        Ok(seed)
    }
}

/// `safe_<timestamp base36>_<random>`
pub fn fallback() -> String {
    format!("safe_{}_{}", to_base36(current_time_ms()), random_token(8))
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if value == 0 {
        return "0".to_string();
    }

    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
