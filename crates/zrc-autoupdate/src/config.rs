//! Configuration for the update engine.
//!
//! Two layers live here:
//!
//! - [`UpdaterConfig`]: static settings shipped with the host application
//!   (feed URL, channel, network tuning, trusted keys), stored as TOML.
//! - [`ConfigStore`]: the persistent preference store the policy writes to
//!   across runs (auto-check flag, last check time, skipped version, ...).
//!   Values are plain strings under the keys listed in [`ConfigKey`].

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::trust::TrustStore;

/// Main updater configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Appcast URL (`https://`, `file://` or a release-indirection URL).
    #[serde(default)]
    pub appcast_url: String,

    /// Required channel; empty means the release channel.
    #[serde(default)]
    pub channel: String,

    /// Asset name looked up when the appcast URL is a release-indirection
    /// endpoint.
    #[serde(default = "default_manifest_file_name")]
    pub manifest_file_name: String,

    /// Overrides the detected generic OS label. Empty disables OS filtering.
    #[serde(default)]
    pub os_label: Option<String>,

    /// Directory installers are downloaded to (default: system temp dir).
    #[serde(default)]
    pub download_dir: Option<PathBuf>,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub security: SecurityConfig,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            appcast_url: String::new(),
            channel: String::new(),
            manifest_file_name: default_manifest_file_name(),
            os_label: None,
            download_dir: None,
            network: NetworkConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

impl UpdaterConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&content).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::Write(e.to_string()))?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        fs::write(path, content).map_err(|e| ConfigError::Write(e.to_string()))
    }

    /// Directory downloads are written to.
    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

/// Network settings handed to the HTTP transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Read timeout for streaming in seconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Extra attempts for the appcast fetch on unreachable/timeout.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between appcast fetch attempts in milliseconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            user_agent: default_user_agent(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

/// Trust settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Trusted Ed25519 public keys.
    /// Format: `"<key_version>:<base64_public_key>"`, or a bare base64 key
    /// for key version 1.
    #[serde(default)]
    pub trusted_keys: Vec<String>,
}

impl SecurityConfig {
    /// Build the trust store from the configured keys.
    pub fn trust_store(&self) -> Result<TrustStore, ConfigError> {
        TrustStore::from_entries(&self.trusted_keys)
    }
}

// Default value functions for serde
fn default_manifest_file_name() -> String {
    "appcast.xml".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    60
}

fn default_user_agent() -> String {
    format!("zrc-autoupdate/{}", env!("CARGO_PKG_VERSION"))
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay() -> u64 {
    500
}

// ============================================================================
// Persistent preferences
// ============================================================================

/// Keys of the persistent preference store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    AutoCheck,
    AutoInterval,
    AutoOnce,
    AutoLast,
    AutoSkip,
    AutoChannel,
    AutoHost,
    SkipVersion,
    SkipTime,
    SkipInterval,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 10] = [
        Self::AutoCheck,
        Self::AutoInterval,
        Self::AutoOnce,
        Self::AutoLast,
        Self::AutoSkip,
        Self::AutoChannel,
        Self::AutoHost,
        Self::SkipVersion,
        Self::SkipTime,
        Self::SkipInterval,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AutoCheck => "AutoCheck",
            Self::AutoInterval => "AutoInterval",
            Self::AutoOnce => "AutoOnce",
            Self::AutoLast => "AutoLast",
            Self::AutoSkip => "AutoSkip",
            Self::AutoChannel => "AutoChannel",
            Self::AutoHost => "AutoHost",
            Self::SkipVersion => "SkipVersion",
            Self::SkipTime => "SkipTime",
            Self::SkipInterval => "SkipInterval",
        }
    }
}

impl std::fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistent string key-value store.
///
/// Implementations must serialize concurrent readers and writers.
pub trait ConfigStore: Send + Sync {
    /// Read a value. `Ok(None)` if the key is not set.
    fn read(&self, key: ConfigKey) -> Result<Option<String>, ConfigError>;

    /// Write a value, replacing any previous one.
    fn write(&self, key: ConfigKey, value: &str) -> Result<(), ConfigError>;

    /// Delete a value. Deleting a missing key succeeds.
    fn delete(&self, key: ConfigKey) -> Result<(), ConfigError>;
}

/// Delete every preference key.
pub fn reset(store: &dyn ConfigStore) -> Result<(), ConfigError> {
    for key in ConfigKey::ALL {
        store.delete(key)?;
    }
    debug!("Update preferences reset");
    Ok(())
}

/// Read every preference key for diagnostics. Unreadable keys show as
/// `None`.
pub fn dump(store: &dyn ConfigStore) -> Vec<(ConfigKey, Option<String>)> {
    ConfigKey::ALL
        .iter()
        .map(|&key| {
            let value = store.read(key).unwrap_or_else(|e| {
                warn!(%key, error = %e, "Cannot read preference");
                None
            });
            (key, value)
        })
        .collect()
}

/// In-memory store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>, ConfigError> {
        self.values
            .lock()
            .map_err(|_| ConfigError::Read("preference store lock poisoned".to_string()))
    }
}

impl ConfigStore for MemoryConfigStore {
    fn read(&self, key: ConfigKey) -> Result<Option<String>, ConfigError> {
        Ok(self.values()?.get(key.as_str()).cloned())
    }

    fn write(&self, key: ConfigKey, value: &str) -> Result<(), ConfigError> {
        self.values()?.insert(key.as_str().to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: ConfigKey) -> Result<(), ConfigError> {
        self.values()?.remove(key.as_str());
        Ok(())
    }
}

/// File-backed store: a flat TOML table, rewritten atomically on every
/// change.
#[derive(Debug)]
pub struct TomlConfigStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TomlConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", self.path.display(), e)))?;
        toml::from_str(&content).map_err(|e| ConfigError::Read(e.to_string()))
    }

    fn store(&self, values: &BTreeMap<String, String>) -> Result<(), ConfigError> {
        let write_err = |e: std::io::Error| ConfigError::Write(format!("{}: {}", self.path.display(), e));

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let content = toml::to_string(values).map_err(|e| ConfigError::Write(e.to_string()))?;

        // Write atomically using a temp file
        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).map_err(write_err)?;
        file.write_all(content.as_bytes()).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        drop(file);

        fs::rename(&temp_path, &self.path).map_err(write_err)
    }

    fn update<F>(&self, change: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| ConfigError::Write("preference store lock poisoned".to_string()))?;
        let mut values = self.load().unwrap_or_else(|e| {
            warn!(error = %e, "Preference file unreadable; starting from empty");
            BTreeMap::new()
        });
        change(&mut values);
        self.store(&values)
    }
}

impl ConfigStore for TomlConfigStore {
    fn read(&self, key: ConfigKey) -> Result<Option<String>, ConfigError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| ConfigError::Read("preference store lock poisoned".to_string()))?;
        Ok(self.load()?.remove(key.as_str()))
    }

    fn write(&self, key: ConfigKey, value: &str) -> Result<(), ConfigError> {
        self.update(|values| {
            values.insert(key.as_str().to_string(), value.to_string());
        })
    }

    fn delete(&self, key: ConfigKey) -> Result<(), ConfigError> {
        self.update(|values| {
            values.remove(key.as_str());
        })
    }
}
