//! Engine configuration with file-backed overrides.
//!
//! Settings resolve in three layers: built-in defaults, then an optional
//! JSON config file under the user's configuration area, then CLI flags.
//! The file may specify any subset of keys; missing keys keep their
//! defaults, and an unreadable file falls back to defaults with a warning
//! rather than refusing to start.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::download::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP, DEFAULT_CHECKPOINT_INTERVAL,
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_RETRIES, READ_TIMEOUT_SECS,
};

/// Tuning knobs for the download engine.
///
/// None of these affect correctness; resume semantics are identical across
/// any combination of values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Transfer chunk size in bytes.
    pub chunk_size: usize,
    /// Maximum retries after the initial attempt.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    #[serde(with = "duration_millis")]
    pub backoff_base: Duration,
    /// Backoff delay cap.
    #[serde(with = "duration_millis")]
    pub backoff_cap: Duration,
    /// Minimum interval between ledger checkpoints and progress events.
    #[serde(with = "duration_millis")]
    pub checkpoint_interval: Duration,
    /// HTTP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// HTTP read timeout in seconds.
    pub read_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from the default per-user config file, falling
    /// back to defaults when the file is absent.
    #[must_use]
    pub fn load() -> Self {
        Self::load_from(&Self::default_path())
    }

    /// Loads configuration from `path`, falling back to defaults when the
    /// file is absent or unreadable.
    #[must_use]
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(config) => {
                    debug!(path = %path.display(), "config file loaded");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "config file invalid, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config file unreadable, using defaults");
                Self::default()
            }
        }
    }

    /// Well-known per-user config file path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("downdraft")
            .join("config.json")
    }
}

/// Durations serialize as integer milliseconds in the config file.
mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
