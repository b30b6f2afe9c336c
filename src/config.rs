//! Optional JSON configuration.
//!
//! ```json
//! {
//!   "uid_key": "q3bu^t1nqfZ(pf$1",
//!   "payload_key": "484043466B526E7A404B4174424A7032",
//!   "extra_candidates": ["A1B2C3D4E5F6"],
//!   "verify": true
//! }
//! ```
//!
//! Every field is optional; missing fields take the built-in defaults.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{CodecKeys, APP_KEY_LEN};
use crate::tag::SectorKey;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid {field}: must be 16 ASCII characters or 32 hex digits")]
    InvalidKey { field: &'static str },
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Replaces the vendor UID diversification key.
    pub uid_key:          Option<String>,
    /// Replaces the vendor payload key.
    pub payload_key:      Option<String>,
    /// Tried after the canonical candidates when reading.
    pub extra_candidates: Vec<SectorKey>,
    /// Default for write verification.
    pub verify:           bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            uid_key:          None,
            payload_key:      None,
            extra_candidates: Vec::new(),
            verify:           true,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |key: &Option<String>| key.as_ref().map(|_| "<redacted>");
        f.debug_struct("Config")
            .field("uid_key", &redact(&self.uid_key))
            .field("payload_key", &redact(&self.payload_key))
            .field("extra_candidates", &self.extra_candidates)
            .field("verify", &self.verify)
            .finish()
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Application keys with any configured substitution applied.
    pub fn codec_keys(&self) -> Result<CodecKeys, ConfigError> {
        let mut keys = CodecKeys::default();
        if let Some(s) = &self.uid_key {
            keys.uid_key = parse_app_key(s, "uid_key")?;
        }
        if let Some(s) = &self.payload_key {
            keys.payload_key = parse_app_key(s, "payload_key")?;
        }
        Ok(keys)
    }
}

/// Accept the key as its 16 raw ASCII characters or as 32 hex digits.
fn parse_app_key(s: &str, field: &'static str) -> Result<[u8; APP_KEY_LEN], ConfigError> {
    let bytes = match s.len() {
        APP_KEY_LEN if s.is_ascii() => s.as_bytes().to_vec(),
        n if n == APP_KEY_LEN * 2 => hex::decode(s).map_err(|_| ConfigError::InvalidKey { field })?,
        _ => return Err(ConfigError::InvalidKey { field }),
    };
    bytes.try_into().map_err(|_| ConfigError::InvalidKey { field })
}
