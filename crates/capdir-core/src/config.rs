//! Configuration for the discovery directory.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CAPDIR_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/capdir/config.toml
//!   3. ~/.config/capdir/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::qos::DEFAULT_DISCOVERY_TIMEOUT_MS;

/// Default name of the local-capabilities snapshot file.
pub const PERSIST_FILE_NAME: &str = "LocalCapabilitiesDirectory.persist";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CapdirConfig {
    pub directory: DirectorySettings,
    pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorySettings {
    /// Period of the expiry sweep.
    pub purge_expired_interval_ms: u64,
    /// Global entries older than this are dropped by the sweep.
    pub cache_max_age_ms: u64,
    /// Period of the keep-alive sent for local global providers.
    pub freshness_update_interval_ms: u64,
    /// Lifetime granted to a local global entry on each keep-alive.
    pub default_expiry_interval_ms: u64,
    /// Timeout applied when a caller does not pick one.
    pub default_discovery_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    /// If false, nothing is read from or written to disk.
    pub enabled: bool,
    pub local_capabilities_file: PathBuf,
    /// Static provisioning file of global entries. Empty = none.
    pub global_capabilities_file: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            purge_expired_interval_ms: 3_600_000,
            cache_max_age_ms: 3_600_000,
            freshness_update_interval_ms: 3_600_000,
            default_expiry_interval_ms: 6 * 7 * 24 * 3_600_000, // 6 weeks
            default_discovery_timeout_ms: DEFAULT_DISCOVERY_TIMEOUT_MS,
        }
    }
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            local_capabilities_file: data_dir().join(PERSIST_FILE_NAME),
            global_capabilities_file: PathBuf::new(),
        }
    }
}

impl DirectorySettings {
    pub fn purge_expired_interval(&self) -> Duration {
        Duration::from_millis(self.purge_expired_interval_ms)
    }

    pub fn freshness_update_interval(&self) -> Duration {
        Duration::from_millis(self.freshness_update_interval_ms)
    }

    pub fn cache_max_age(&self) -> Duration {
        Duration::from_millis(self.cache_max_age_ms)
    }
}

impl PersistenceSettings {
    /// Settings that keep everything in memory.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            local_capabilities_file: PathBuf::new(),
            global_capabilities_file: PathBuf::new(),
        }
    }

    /// Snapshot path, if persistence is on.
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        if self.enabled && !self.local_capabilities_file.as_os_str().is_empty() {
            Some(self.local_capabilities_file.clone())
        } else {
            None
        }
    }

    pub fn provisioning_path(&self) -> Option<PathBuf> {
        if self.global_capabilities_file.as_os_str().is_empty() {
            None
        } else {
            Some(self.global_capabilities_file.clone())
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("capdir")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("capdir")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CapdirConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_file(&Self::file_path())?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a config file; a missing file yields defaults.
    pub fn load_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(CapdirConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CAPDIR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &std::path::Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text =
            toml::to_string_pretty(&CapdirConfig::default()).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply CAPDIR_* overrides. `lookup` resolves a variable name.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let millis = |key: &str| lookup(key).and_then(|v| v.parse::<u64>().ok());

        if let Some(v) = millis("CAPDIR_DIRECTORY__PURGE_EXPIRED_INTERVAL_MS") {
            self.directory.purge_expired_interval_ms = v;
        }
        if let Some(v) = millis("CAPDIR_DIRECTORY__CACHE_MAX_AGE_MS") {
            self.directory.cache_max_age_ms = v;
        }
        if let Some(v) = millis("CAPDIR_DIRECTORY__FRESHNESS_UPDATE_INTERVAL_MS") {
            self.directory.freshness_update_interval_ms = v;
        }
        if let Some(v) = millis("CAPDIR_DIRECTORY__DEFAULT_EXPIRY_INTERVAL_MS") {
            self.directory.default_expiry_interval_ms = v;
        }
        if let Some(v) = millis("CAPDIR_DIRECTORY__DEFAULT_DISCOVERY_TIMEOUT_MS") {
            self.directory.default_discovery_timeout_ms = v;
        }
        if let Some(v) = lookup("CAPDIR_PERSISTENCE__ENABLED") {
            self.persistence.enabled = v == "true" || v == "1";
        }
        if let Some(v) = lookup("CAPDIR_PERSISTENCE__LOCAL_CAPABILITIES_FILE") {
            self.persistence.local_capabilities_file = PathBuf::from(v);
        }
        if let Some(v) = lookup("CAPDIR_PERSISTENCE__GLOBAL_CAPABILITIES_FILE") {
            self.persistence.global_capabilities_file = PathBuf::from(v);
        }
    }
}
