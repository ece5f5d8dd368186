//! Configuration loading.
//!
//! Every component takes a builder-style config struct. [`SyncConfig`]
//! groups them for TOML files:
//!
//! ```toml
//! [cache]
//! max_entries = 5000
//! default_ttl_ms = 120000
//!
//! [mutation]
//! debounce_ms = 300
//!
//! [fetch]
//! max_retries_per_candidate = 3
//! base_delay_ms = 250
//!
//! [transport]
//! base_url = "https://api.example.com/v1"
//! ```
//!
//! Resolution order:
//! 1. Explicit path (must exist)
//! 2. `<config dir>/repsync/config.toml`
//! 3. Built-in defaults

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::fetch::FetchConfig;
use crate::mutation::MutationConfig;
use crate::{Result, SyncError};

/// All tunables of a [`SyncClient`](crate::SyncClient).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub cache: CacheConfig,
    pub mutation: MutationConfig,
    pub fetch: FetchConfig,
    pub transport: TransportConfig,
}

/// Settings for the bundled HTTP transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Base URL that resource names and relative fetch sources resolve against.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Persistent store key holding the bearer token. Default: `"auth_token"`.
    pub token_key: String,
    /// Whole-request timeout. Default: 30s.
    #[serde(rename = "request_timeout_ms", with = "millis")]
    pub request_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token_key: "auth_token".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    /// Load configuration from the standard locations.
    ///
    /// An explicit path that does not exist is an error; a missing default
    /// file yields the built-in defaults.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        match Self::resolve_config_path(explicit_path)? {
            Some(path) => Self::load_from_file(&path),
            None => Ok(Self::default()),
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| SyncError::Configuration(format!("Failed to parse config: {e}")))
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SyncError::Configuration(format!("Failed to render config: {e}")))
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            SyncError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            SyncError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })
    }

    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
            return Err(SyncError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        Ok(default_config_path().filter(|path| path.exists()))
    }
}

/// Default config path: `<config dir>/repsync/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("repsync").join("config.toml"))
}

/// `Duration` as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// `Option<Duration>` as integer milliseconds; absent means disabled.
pub(crate) mod millis_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => super::millis::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
