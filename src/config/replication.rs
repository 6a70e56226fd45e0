//! Replication, alerting and backup validation configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;

/// Replica destination (discriminated union).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplicaConfig {
    /// In-process copy. Useful only for tests and demos.
    #[default]
    Memory,
    /// Directory on a local or mounted volume.
    Filesystem {
        #[serde(default)]
        name: Option<String>,
        path: PathBuf,
    },
    /// S3 bucket (or any S3-compatible endpoint).
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        region: Option<String>,
    },
}

/// Replication retry and concurrency settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Copy attempts per version, counting the first.
    pub max_attempts: u32,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    /// Keys replicated concurrently.
    pub workers: usize,
    /// Seconds between reconcile passes in `stateward-sync`.
    pub reconcile_interval_secs: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay_ms: 200,
            max_delay_ms: 30_000,
            jitter: true,
            workers: 4,
            reconcile_interval_secs: 60,
        }
    }
}

impl ReplicationConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "replication.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid(
                "replication.workers must be at least 1".to_string(),
            ));
        }
        if self.min_delay_ms > self.max_delay_ms {
            return Err(ConfigError::Invalid(
                "replication.min_delay_ms exceeds max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Alert sink (discriminated union).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertSinkConfig {
    Log,
    /// Append-only JSON lines file.
    File { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Age of the oldest unreplicated version before a key is reported.
    pub max_lag_secs: u64,
    /// Seconds between validation runs in `stateward-sync`.
    pub interval_secs: u64,
    /// How far back the replica must reach. Unset disables the check.
    pub min_retention_secs: Option<u64>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_lag_secs: 300,
            interval_secs: 300,
            min_retention_secs: None,
        }
    }
}

impl ValidatorConfig {
    pub fn max_lag(&self) -> Duration {
        Duration::from_secs(self.max_lag_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn min_retention(&self) -> Option<Duration> {
        self.min_retention_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replication_defaults() {
        let config = ReplicationConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.min_delay(), Duration::from_millis(200));
        assert_eq!(config.max_delay(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_replication_rejects_inverted_delays() {
        let config = ReplicationConfig {
            min_delay_ms: 5_000,
            max_delay_ms: 100,
            ..ReplicationConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validator_defaults() {
        let config = ValidatorConfig::default();
        assert_eq!(config.max_lag(), Duration::from_secs(300));
        assert_eq!(config.min_retention(), None);
    }
}
