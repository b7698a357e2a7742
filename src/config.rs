//! Configuration and versioned configuration providers
//!
//! The core never reads global state. Callers hand it a [`ConfigProvider`],
//! and every read returns the configuration together with a monotonically
//! increasing version. The version is folded into cache keys, so a reload
//! invalidates every previously cached result without a sweep.

use crate::normalizer::{DEFAULT_QUALITY_ORDER, SynonymEntry};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

static MISSING_CONFIG_NOTICE: Once = Once::new();

/// Errors that can occur while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file
    #[error("Failed to read configuration file {path}: {source}")]
    ReadFailed { path: PathBuf, source: io::Error },

    /// Failed to parse the configuration file
    #[error("Failed to parse configuration: {0}")]
    ParseFailed(#[from] toml::de::Error),

    /// A value is outside its allowed range
    #[error("Invalid configuration value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Retry settings for provider fetches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub enabled: bool,
    /// Total attempts per provider, including the first one
    pub max_attempts: u32,
    /// Base delay; attempt `n` waits `delay_ms * n`
    pub delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 2,
            delay_ms: 500,
        }
    }
}

/// Process-wide aggregation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Upper bound on concurrent provider fetches
    pub max_parallel_requests: usize,
    /// Timeout of a single provider call
    pub request_timeout_ms: u64,
    /// Hard ceiling for the whole fan-out
    pub overall_deadline_ms: u64,
    /// Time-to-live of cached aggregation results
    pub cache_time_secs: u64,
    pub retry: RetrySettings,
    /// When non-empty, only these providers are queried
    pub provider_include_list: Vec<String>,
    /// Providers never queried
    pub provider_exclude_list: Vec<String>,
    /// Providers that only serve anime, by name
    pub anime_providers: Vec<String>,
    /// Quality codes from most to least preferred
    pub quality_priority_order: Vec<String>,
    pub allow_4k: bool,
    pub allow_hdr: bool,
    /// Replaces the built-in quality synonyms when set
    pub quality_synonyms: Option<Vec<SynonymEntry>>,
    /// Replaces the built-in voice synonyms when set
    pub voice_synonyms: Option<Vec<SynonymEntry>>,
    /// Provider discovery endpoint used by the CLI
    pub discovery_url: Option<String>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            max_parallel_requests: 5,
            request_timeout_ms: 10_000,
            overall_deadline_ms: 30_000,
            cache_time_secs: 20 * 60,
            retry: RetrySettings::default(),
            provider_include_list: Vec::new(),
            provider_exclude_list: Vec::new(),
            anime_providers: Vec::new(),
            quality_priority_order: DEFAULT_QUALITY_ORDER.iter().map(|s| s.to_string()).collect(),
            allow_4k: true,
            allow_hdr: true,
            quality_synonyms: None,
            voice_synonyms: None,
            discovery_url: None,
        }
    }
}

impl Configuration {
    /// Parses and validates a TOML document
    ///
    /// Missing keys take their default values.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Configuration = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_requests == 0 {
            return Err(ConfigError::Invalid {
                field: "max_parallel_requests",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "request_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.overall_deadline_ms < self.request_timeout_ms {
            return Err(ConfigError::Invalid {
                field: "overall_deadline_ms",
                reason: format!(
                    "{} ms is shorter than request_timeout_ms ({} ms)",
                    self.overall_deadline_ms, self.request_timeout_ms
                ),
            });
        }
        if self.retry.enabled && self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.max_attempts",
                reason: "must be at least 1 when retries are enabled".to_string(),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn overall_deadline(&self) -> Duration {
        Duration::from_millis(self.overall_deadline_ms)
    }

    pub fn cache_time(&self) -> Duration {
        Duration::from_secs(self.cache_time_secs)
    }
}

/// A configuration snapshot tagged with its version
#[derive(Debug, Clone)]
pub struct VersionedConfig {
    pub version: u64,
    pub config: Arc<Configuration>,
}

/// Supplies the current configuration to the core
///
/// Implementations must bump the version on every change.
pub trait ConfigProvider: Send + Sync {
    fn current(&self) -> VersionedConfig;
}

/// Hot-swappable configuration holder
///
/// Version and configuration are swapped together under one lock so a
/// reader never pairs a new version with an old configuration.
pub struct ConfigHandle {
    state: RwLock<VersionedConfig>,
}

impl ConfigHandle {
    /// Creates a handle at version 1
    pub fn new(config: Configuration) -> Self {
        Self {
            state: RwLock::new(VersionedConfig {
                version: 1,
                config: Arc::new(config),
            }),
        }
    }

    /// Loads configuration from a TOML file
    ///
    /// A missing file is not an error: built-in defaults are used and the
    /// fallback is logged once per process. Unreadable or invalid files are
    /// reported to the caller.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let handle = ConfigHandle::load_or_default(Path::new("aggregator.toml"))?;
    /// println!("config version {}", handle.current().version);
    /// ```
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::new(load_file(path)?))
    }

    /// Installs a new configuration and returns its version
    pub fn replace(&self, config: Configuration) -> u64 {
        let mut state = self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.version += 1;
        state.config = Arc::new(config);
        info!(version = state.version, "Configuration replaced");
        state.version
    }

    /// Re-reads the file and installs it as a new version
    pub fn reload(&self, path: &Path) -> Result<u64, ConfigError> {
        let config = load_file(path)?;
        Ok(self.replace(config))
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(Configuration::default())
    }
}

impl ConfigProvider for ConfigHandle {
    fn current(&self) -> VersionedConfig {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

fn load_file(path: &Path) -> Result<Configuration, ConfigError> {
    match fs::read_to_string(path) {
        Ok(content) => Configuration::from_toml_str(&content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            MISSING_CONFIG_NOTICE.call_once(|| {
                warn!(path = %path.display(), "Configuration file not found, using defaults");
            });
            Ok(Configuration::default())
        }
        Err(e) => Err(ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Configuration::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.quality_priority_order[0], "2160p");
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Configuration::from_toml_str(
            r#"
            max_parallel_requests = 3
            allow_4k = false
            provider_exclude_list = ["slow"]

            [retry]
            max_attempts = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.max_parallel_requests, 3);
        assert!(!config.allow_4k);
        assert!(config.allow_hdr);
        assert_eq!(config.provider_exclude_list, vec!["slow".to_string()]);
        assert_eq!(config.retry.max_attempts, 4);
        assert!(config.retry.enabled);
        assert_eq!(config.retry.delay_ms, 500);
    }

    #[test]
    fn test_synonym_tables_from_toml() {
        let config = Configuration::from_toml_str(
            r#"
            [[quality_synonyms]]
            code = "2160p"
            label = "4K"
            variants = ["4K", "UHD"]
            "#,
        )
        .unwrap();

        let table = config.quality_synonyms.unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].variants, vec!["4K".to_string(), "UHD".to_string()]);
        assert!(config.voice_synonyms.is_none());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Configuration::from_toml_str("max_parallel_requests = 0").is_err());
        assert!(
            Configuration::from_toml_str("request_timeout_ms = 5000\noverall_deadline_ms = 100")
                .is_err()
        );
        assert!(Configuration::from_toml_str("max_parallel_requests = \"many\"").is_err());
    }

    #[test]
    fn test_replace_bumps_version() {
        let handle = ConfigHandle::default();
        let before = handle.current();
        assert_eq!(before.version, 1);

        let version = handle.replace(Configuration {
            allow_hdr: false,
            ..Configuration::default()
        });
        let after = handle.current();
        assert_eq!(version, 2);
        assert_eq!(after.version, 2);
        assert!(!after.config.allow_hdr);
        assert!(before.config.allow_hdr);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let missing = Path::new("/nonexistent/stream_aggregator.toml");
        let handle = ConfigHandle::load_or_default(missing).unwrap();
        assert_eq!(*handle.current().config, Configuration::default());
    }

    #[test]
    fn test_reload_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aggregator.toml");
        fs::write(&path, "max_parallel_requests = 2").unwrap();

        let handle = ConfigHandle::load_or_default(&path).unwrap();
        assert_eq!(handle.current().config.max_parallel_requests, 2);

        fs::write(&path, "max_parallel_requests = 7").unwrap();
        let version = handle.reload(&path).unwrap();
        assert_eq!(version, 2);
        assert_eq!(handle.current().config.max_parallel_requests, 7);
    }
}
