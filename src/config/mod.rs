//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod replication;
mod storage;

pub use replication::{AlertSinkConfig, ReplicaConfig, ReplicationConfig, ValidatorConfig};
pub use storage::{
    EncryptionConfig, LockTableConfig, StorageConfig, VersionStoreConfig, MIN_DURABLE_COPIES,
};

use std::time::Duration;

use serde::Deserialize;

use crate::state_store::StoreConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "STATEWARD_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "STATEWARD";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "STATEWARD_LOG";

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("{backend} backend requires the `{feature}` feature")]
    FeatureDisabled {
        backend: &'static str,
        feature: &'static str,
    },
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Version store copies and lock table.
    pub storage: StorageConfig,
    /// Master keys for envelope encryption.
    pub encryption: EncryptionConfig,
    /// State store tunables.
    pub state: StateConfig,
    /// Replica destination.
    pub replica: ReplicaConfig,
    /// Replication retry and concurrency settings.
    pub replication: ReplicationConfig,
    /// Where alerts go (log only if unset).
    pub alerts: Option<AlertSinkConfig>,
    /// Backup validation schedule.
    pub validator: ValidatorConfig,
}

/// State store and lock tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Default `list_versions` page size.
    pub page_size: usize,
    /// Largest page a caller may request.
    pub max_page_size: usize,
    /// Deadline for state and lock operations, in milliseconds. Unset: none.
    pub request_timeout_ms: Option<u64>,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_page_size: 1000,
            request_timeout_ms: None,
        }
    }
}

impl StateConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            page_size: self.page_size,
            max_page_size: self.max_page_size,
            request_timeout: self.request_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the backend misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.storage.validate()?;
        self.encryption.validate()?;
        self.replication.validate()?;
        if self.state.page_size == 0 || self.state.page_size > self.state.max_page_size {
            return Err(ConfigError::Invalid(format!(
                "state.page_size must be between 1 and max_page_size ({})",
                self.state.max_page_size
            )));
        }
        if self.validator.max_lag_secs == 0 {
            return Err(ConfigError::Invalid(
                "validator.max_lag_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}
