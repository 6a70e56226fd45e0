//! In-memory ReplicaStore implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::model::{VersionId, VersionMeta, VersionRecord};
use crate::storage::{ReplicaStore, Result, StorageError};

/// Replica destination held in memory.
///
/// Supports simulated outages: [`MemoryReplicaStore::fail_next`] makes the
/// next N puts fail with `StorageError::Unavailable`.
pub struct MemoryReplicaStore {
    name: String,
    records: RwLock<HashMap<String, BTreeMap<VersionId, VersionRecord>>>,
    failures_remaining: AtomicU32,
    put_attempts: AtomicU32,
}

impl MemoryReplicaStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: RwLock::new(HashMap::new()),
            failures_remaining: AtomicU32::new(0),
            put_attempts: AtomicU32::new(0),
        }
    }

    /// Fail the next `count` puts.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Total puts attempted, including failed ones.
    pub fn put_attempts(&self) -> u32 {
        self.put_attempts.load(Ordering::SeqCst)
    }

    /// Version ids replicated for a key, oldest first.
    pub async fn replicated_versions(&self, state_key: &str) -> Vec<VersionId> {
        self.records
            .read()
            .await
            .get(state_key)
            .map(|versions| versions.keys().copied().collect())
            .unwrap_or_default()
    }

    fn take_failure(&self) -> bool {
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryReplicaStore {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl ReplicaStore for MemoryReplicaStore {
    async fn put_replica(&self, record: &VersionRecord) -> Result<()> {
        self.put_attempts.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            return Err(StorageError::Unavailable(format!(
                "replica {} unavailable",
                self.name
            )));
        }

        let mut records = self.records.write().await;
        let versions = records.entry(record.meta.state_key.clone()).or_default();
        if let Some(existing) = versions.get(&record.meta.version_id) {
            if existing.meta.content_hash != record.meta.content_hash {
                return Err(StorageError::Corrupt(format!(
                    "replica {} already holds {} with a different hash",
                    self.name,
                    record.meta.object_key()
                )));
            }
            return Ok(());
        }
        versions.insert(record.meta.version_id, record.clone());
        Ok(())
    }

    async fn get_replica(
        &self,
        state_key: &str,
        version: VersionId,
    ) -> Result<Option<VersionRecord>> {
        Ok(self
            .records
            .read()
            .await
            .get(state_key)
            .and_then(|versions| versions.get(&version))
            .cloned())
    }

    async fn latest_replicated(&self, state_key: &str) -> Result<Option<VersionMeta>> {
        Ok(self
            .records
            .read()
            .await
            .get(state_key)
            .and_then(|versions| versions.values().next_back())
            .map(|r| r.meta.clone()))
    }

    async fn list_replicated(&self, state_key: &str) -> Result<Vec<VersionId>> {
        Ok(self.replicated_versions(state_key).await)
    }

    async fn has_replica(&self, state_key: &str, version: VersionId) -> Result<bool> {
        Ok(self
            .records
            .read()
            .await
            .get(state_key)
            .is_some_and(|versions| versions.contains_key(&version)))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
