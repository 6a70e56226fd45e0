//! Storage backend contracts and implementations.
//!
//! These traits are the boundary between the state/lock logic and whatever
//! durable store sits underneath:
//! - `VersionStore`: append-only version history with a compare-and-swap head
//! - `LockTable`: lock rows with revision-conditioned writes
//! - `ReplicaStore`: eventually consistent backup destination
//!
//! ## Backends
//!
//! - `memory` - In-process maps with failure injection, for tests and embedding
//! - `sqlite` (feature: sqlite) - Version store and lock table in one database
//! - `filesystem` - Replica destination on a local or mounted volume
//! - `mirrored` - Version store fan-out with a write quorum
//! - `s3` (feature: s3) - Replica destination in an S3 bucket
//! - `dynamo` (feature: dynamo) - Lock table using DynamoDB condition expressions

pub mod filesystem;
pub mod memory;
pub mod mirrored;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "dynamo")]
pub mod dynamo;
#[cfg(feature = "s3")]
pub mod s3;

pub use filesystem::FilesystemReplicaStore;
pub use memory::{MemoryLockTable, MemoryReplicaStore, MemoryVersionStore};
pub use mirrored::MirroredVersionStore;
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteLockTable, SqliteVersionStore};

#[cfg(feature = "dynamo")]
pub use dynamo::DynamoLockTable;
#[cfg(feature = "s3")]
pub use s3::S3ReplicaStore;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::backend::BackendError;
use crate::config::{
    ConfigError, LockTableConfig, ReplicaConfig, StorageConfig, VersionStoreConfig,
    MIN_DURABLE_COPIES,
};
use crate::model::{FencingToken, LockEntry, VersionId, VersionMeta, VersionRecord};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Precondition failed for {state_key}: {reason}")]
    PreconditionFailed { state_key: String, reason: String },

    #[error("Write quorum not reached: {acked}/{required} copies")]
    QuorumNotReached { acked: usize, required: usize },

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Conditions a commit must satisfy atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitPrecondition {
    /// Head the writer based its change on (`None` for an empty key).
    pub expected_head: Option<VersionId>,
    /// Writer's fencing token; must be ≥ the token recorded on the head.
    pub fencing_token: FencingToken,
}

impl CommitPrecondition {
    /// Check the precondition against the current head.
    ///
    /// Returns the reason it fails, if it does.
    pub fn violation(&self, head: Option<&VersionMeta>, new_version: VersionId) -> Option<String> {
        let head_id = head.map(|h| h.version_id);
        if head_id != self.expected_head {
            return Some(format!(
                "head moved: expected {}, found {}",
                display_head(self.expected_head),
                display_head(head_id)
            ));
        }
        if let Some(head) = head {
            if head.fencing_token > self.fencing_token {
                return Some(format!(
                    "head written with newer fencing token {} > {}",
                    head.fencing_token, self.fencing_token
                ));
            }
        }
        if new_version != VersionId::after(head_id) {
            return Some(format!(
                "version {} does not follow head {}",
                new_version,
                display_head(head_id)
            ));
        }
        None
    }
}

fn display_head(head: Option<VersionId>) -> String {
    head.map(|h| h.to_string())
        .unwrap_or_else(|| "<empty>".to_string())
}

/// Interface for versioned state persistence.
///
/// Versions are immutable once committed. The head (current pointer) only
/// moves through [`VersionStore::commit`].
///
/// Implementations:
/// - `MemoryVersionStore`: in-process map
/// - `SqliteVersionStore`: SQLite tables
/// - `MirroredVersionStore`: quorum fan-out over other version stores
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Append `record` as the new head if `precondition` holds.
    ///
    /// Check and append are a single atomic step. Fails with
    /// `StorageError::PreconditionFailed` otherwise.
    async fn commit(&self, record: VersionRecord, precondition: CommitPrecondition) -> Result<()>;

    /// Metadata of the current head.
    async fn head(&self, state_key: &str) -> Result<Option<VersionMeta>>;

    /// Retrieve a specific version.
    async fn get(&self, state_key: &str, version: VersionId) -> Result<Option<VersionRecord>>;

    /// List version metadata oldest first, strictly after `after`.
    async fn list(
        &self,
        state_key: &str,
        after: Option<VersionId>,
        limit: usize,
    ) -> Result<Vec<VersionMeta>>;

    /// List all state keys with at least one version.
    async fn list_keys(&self) -> Result<Vec<String>>;
}

/// Interface for lock rows.
///
/// The only required primitive is a conditional write keyed on the row
/// revision: "write only if revision equals X, or the row is absent".
///
/// Implementations:
/// - `MemoryLockTable`: in-process map
/// - `SqliteLockTable`: SQLite table
/// - `DynamoLockTable`: DynamoDB table with condition expressions
#[async_trait]
pub trait LockTable: Send + Sync {
    /// Load the lock row for a key.
    async fn load(&self, state_key: &str) -> Result<Option<LockEntry>>;

    /// Store `entry` only if the stored row's revision equals
    /// `expected_revision` (`None`: the row must not exist).
    ///
    /// Returns `false` when the condition fails.
    async fn put_if(&self, entry: LockEntry, expected_revision: Option<u64>) -> Result<bool>;
}

/// Interface for replica (backup) destinations.
///
/// Uses the same `{state_key}/{version_id}` layout as the primary store.
///
/// Implementations:
/// - `MemoryReplicaStore`: in-process map with outage simulation
/// - `FilesystemReplicaStore`: files under a base directory
/// - `S3ReplicaStore`: objects in an S3 bucket
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    /// Store a copy of `record`. Re-putting an identical record is a no-op.
    async fn put_replica(&self, record: &VersionRecord) -> Result<()>;

    /// Retrieve a replicated version.
    async fn get_replica(&self, state_key: &str, version: VersionId)
        -> Result<Option<VersionRecord>>;

    /// Metadata of the newest replicated version for a key.
    async fn latest_replicated(&self, state_key: &str) -> Result<Option<VersionMeta>>;

    /// Every replicated version id for a key, oldest first.
    async fn list_replicated(&self, state_key: &str) -> Result<Vec<VersionId>>;

    /// Whether `version` of `state_key` has been replicated.
    async fn has_replica(&self, state_key: &str, version: VersionId) -> Result<bool> {
        Ok(self.get_replica(state_key, version).await?.is_some())
    }

    /// Destination name for logs and alerts.
    fn name(&self) -> &str;
}

/// Initialize the version store and lock table based on configuration.
///
/// With more than one copy configured, the copies are wrapped in a
/// `MirroredVersionStore` with the configured write quorum.
pub async fn init_storage(
    config: &StorageConfig,
) -> std::result::Result<(Arc<dyn VersionStore>, Arc<dyn LockTable>), BackendError> {
    let mut pools = SqlitePools::default();

    let mut copies = Vec::with_capacity(config.copies.len());
    for copy in &config.copies {
        copies.push(init_version_store(copy, &mut pools).await?);
    }
    let mut copies = copies.into_iter();
    let primary = copies.next().ok_or_else(|| {
        BackendError::Config(ConfigError::Invalid(
            "storage.copies is empty".to_string(),
        ))
    })?;
    let mirrors: Vec<_> = copies.collect();

    let versions: Arc<dyn VersionStore> = if mirrors.is_empty() {
        primary
    } else {
        let mirrored = MirroredVersionStore::new(primary, mirrors, config.effective_quorum());
        info!(
            copies = mirrored.copies(),
            write_quorum = mirrored.write_quorum(),
            "Storage: mirrored version store"
        );
        Arc::new(mirrored)
    };

    if config.effective_quorum() < MIN_DURABLE_COPIES {
        warn!(
            copies = config.copies.len(),
            write_quorum = config.effective_quorum(),
            "Storage: writes are acknowledged from a single copy"
        );
    }

    let locks = init_lock_table(&config.locks, &mut pools).await?;
    Ok((versions, locks))
}

async fn init_version_store(
    config: &VersionStoreConfig,
    pools: &mut SqlitePools,
) -> std::result::Result<Arc<dyn VersionStore>, BackendError> {
    match config {
        VersionStoreConfig::Memory => {
            info!("Storage: in-memory version store");
            Ok(Arc::new(MemoryVersionStore::new()))
        }
        #[cfg(feature = "sqlite")]
        VersionStoreConfig::Sqlite { url } => {
            info!("Storage: sqlite version store at {}", url);
            let store = SqliteVersionStore::new(pools.get(url).await?);
            store.init().await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "sqlite"))]
        VersionStoreConfig::Sqlite { .. } => {
            let _ = pools;
            tracing::error!("SQLite version store requested but 'sqlite' feature is not enabled");
            Err(ConfigError::FeatureDisabled {
                backend: "sqlite",
                feature: "sqlite",
            }
            .into())
        }
    }
}

async fn init_lock_table(
    config: &LockTableConfig,
    pools: &mut SqlitePools,
) -> std::result::Result<Arc<dyn LockTable>, BackendError> {
    match config {
        LockTableConfig::Memory => {
            info!("Locks: in-memory lock table");
            Ok(Arc::new(MemoryLockTable::new()))
        }
        #[cfg(feature = "sqlite")]
        LockTableConfig::Sqlite { url } => {
            info!("Locks: sqlite lock table at {}", url);
            let table = SqliteLockTable::new(pools.get(url).await?);
            table.init().await?;
            Ok(Arc::new(table))
        }
        #[cfg(not(feature = "sqlite"))]
        LockTableConfig::Sqlite { .. } => {
            let _ = pools;
            tracing::error!("SQLite lock table requested but 'sqlite' feature is not enabled");
            Err(ConfigError::FeatureDisabled {
                backend: "sqlite",
                feature: "sqlite",
            }
            .into())
        }
        #[cfg(feature = "dynamo")]
        LockTableConfig::Dynamo { table, endpoint } => {
            info!("Locks: dynamodb table {}", table);
            Ok(Arc::new(
                DynamoLockTable::new(table.clone(), endpoint.as_deref()).await?,
            ))
        }
        #[cfg(not(feature = "dynamo"))]
        LockTableConfig::Dynamo { .. } => {
            tracing::error!("DynamoDB lock table requested but 'dynamo' feature is not enabled");
            Err(ConfigError::FeatureDisabled {
                backend: "dynamo",
                feature: "dynamo",
            }
            .into())
        }
    }
}

/// Initialize the replica destination based on configuration.
pub async fn init_replica_store(
    config: &ReplicaConfig,
) -> std::result::Result<Arc<dyn ReplicaStore>, BackendError> {
    match config {
        ReplicaConfig::Memory => {
            info!("Replica: in-memory destination");
            Ok(Arc::new(MemoryReplicaStore::default()))
        }
        ReplicaConfig::Filesystem { name, path } => {
            info!("Replica: filesystem destination at {}", path.display());
            let name = name.clone().unwrap_or_else(|| "filesystem".to_string());
            Ok(Arc::new(FilesystemReplicaStore::new(name, path).await?))
        }
        #[cfg(feature = "s3")]
        ReplicaConfig::S3 {
            bucket,
            prefix,
            endpoint,
            region,
        } => {
            info!("Replica: s3 destination s3://{}", bucket);
            Ok(Arc::new(
                S3ReplicaStore::new(
                    format!("s3://{}", bucket),
                    bucket.clone(),
                    prefix.clone(),
                    endpoint.as_deref(),
                    region.as_deref(),
                )
                .await?,
            ))
        }
        #[cfg(not(feature = "s3"))]
        ReplicaConfig::S3 { .. } => {
            tracing::error!("S3 replica requested but 's3' feature is not enabled");
            Err(ConfigError::FeatureDisabled {
                backend: "s3",
                feature: "s3",
            }
            .into())
        }
    }
}

/// SQLite pools opened so far, so copies and the lock table can share a database.
#[derive(Default)]
struct SqlitePools {
    #[cfg(feature = "sqlite")]
    pools: std::collections::HashMap<String, sqlx::SqlitePool>,
}

#[cfg(feature = "sqlite")]
impl SqlitePools {
    async fn get(&mut self, url: &str) -> Result<sqlx::SqlitePool> {
        if let Some(pool) = self.pools.get(url) {
            return Ok(pool.clone());
        }
        // Each in-memory connection is its own database.
        let max_connections = if url.contains(":memory:") { 1 } else { 8 };
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        self.pools.insert(url.to_string(), pool.clone());
        Ok(pool)
    }
}
