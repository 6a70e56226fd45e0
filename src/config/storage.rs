//! Storage configuration types.

use std::collections::HashMap;

use serde::Deserialize;

use super::ConfigError;
use crate::crypto::LocalKeyring;

/// Copies a durable write must reach before `put` acknowledges it.
pub const MIN_DURABLE_COPIES: usize = 2;

/// One copy of the version history (discriminated union).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VersionStoreConfig {
    /// In-process map. Lost on restart.
    Memory,
    /// SQLite database, e.g. `sqlite://state.db?mode=rwc`.
    Sqlite { url: String },
}

impl VersionStoreConfig {
    /// Whether the copy survives a restart.
    pub fn is_durable(&self) -> bool {
        !matches!(self, VersionStoreConfig::Memory)
    }
}

/// Lock table backend (discriminated union).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LockTableConfig {
    #[default]
    Memory,
    Sqlite {
        url: String,
    },
    /// DynamoDB table keyed on `state_key`.
    Dynamo {
        table: String,
        #[serde(default)]
        endpoint: Option<String>,
    },
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Version store copies. The first is the primary and decides the head.
    pub copies: Vec<VersionStoreConfig>,
    /// Copies that must acknowledge a write. Defaults to a majority.
    pub write_quorum: Option<usize>,
    /// Accept durable storage that acknowledges writes from a single copy.
    pub allow_single_copy: bool,
    pub locks: LockTableConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            copies: vec![VersionStoreConfig::Memory],
            write_quorum: None,
            allow_single_copy: false,
            locks: LockTableConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Write quorum after applying the majority default.
    pub fn effective_quorum(&self) -> usize {
        self.write_quorum
            .unwrap_or(self.copies.len() / 2 + 1)
            .clamp(1, self.copies.len().max(1))
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.copies.is_empty() {
            return Err(ConfigError::Invalid(
                "storage.copies must list at least one version store".to_string(),
            ));
        }
        if let Some(quorum) = self.write_quorum {
            if quorum == 0 || quorum > self.copies.len() {
                return Err(ConfigError::Invalid(format!(
                    "storage.write_quorum must be between 1 and {}",
                    self.copies.len()
                )));
            }
        }
        let durable = self.copies.iter().any(VersionStoreConfig::is_durable);
        if durable && self.effective_quorum() < MIN_DURABLE_COPIES && !self.allow_single_copy {
            return Err(ConfigError::Invalid(format!(
                "storage acknowledges writes from {} copy; configure at least {} copies with \
                 write_quorum >= {} or set storage.allow_single_copy",
                self.effective_quorum(),
                MIN_DURABLE_COPIES,
                MIN_DURABLE_COPIES
            )));
        }
        Ok(())
    }
}

/// Master keys for envelope encryption.
///
/// Keys are base64-encoded 32-byte values. Retired keys stay listed so older
/// versions remain readable. If `keys` is empty an ephemeral key is generated
/// at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Key id new versions are sealed under.
    pub active_key: String,
    pub keys: HashMap<String, String>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            active_key: "default".to_string(),
            keys: HashMap::new(),
        }
    }
}

impl EncryptionConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.keys.is_empty() {
            return Ok(());
        }
        if !self.keys.contains_key(&self.active_key) {
            return Err(ConfigError::Invalid(format!(
                "encryption.active_key {:?} is not among the configured keys",
                self.active_key
            )));
        }
        LocalKeyring::from_encoded(
            &self.active_key,
            self.keys.iter().map(|(id, key)| (id.as_str(), key.as_str())),
        )
        .map(|_| ())
        .map_err(|e| ConfigError::Invalid(format!("encryption: {}", e)))
    }
}
