//! In-memory VersionStore implementation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::model::{VersionId, VersionMeta, VersionRecord};
use crate::storage::{CommitPrecondition, Result, StorageError, VersionStore};

/// Version store that keeps every record in process memory.
///
/// Versions for a key are held in commit order, so the last entry is the head.
#[derive(Default)]
pub struct MemoryVersionStore {
    versions: RwLock<HashMap<String, Vec<VersionRecord>>>,
    fail_on_commit: RwLock<bool>,
    fail_on_read: RwLock<bool>,
    delay: RwLock<Option<Duration>>,
}

impl MemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_commit(&self, fail: bool) {
        *self.fail_on_commit.write().await = fail;
    }

    pub async fn set_fail_on_read(&self, fail: bool) {
        *self.fail_on_read.write().await = fail;
    }

    /// Delay every operation, to simulate a slow backend.
    pub async fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write().await = delay;
    }

    /// Flip a byte of a stored version, to simulate corruption at rest.
    ///
    /// Returns `false` if the version doesn't exist.
    pub async fn tamper(&self, state_key: &str, version: VersionId) -> bool {
        let mut store = self.versions.write().await;
        let record = store
            .get_mut(state_key)
            .and_then(|records| records.iter_mut().find(|r| r.meta.version_id == version));
        match record {
            Some(record) => {
                match record.ciphertext.last_mut() {
                    Some(byte) => *byte ^= 0xff,
                    None => record.ciphertext.push(0),
                }
                true
            }
            None => false,
        }
    }

    pub async fn version_count(&self, state_key: &str) -> usize {
        self.versions
            .read()
            .await
            .get(state_key)
            .map(Vec::len)
            .unwrap_or(0)
    }

    async fn simulate(&self, fail: &RwLock<bool>) -> Result<()> {
        let delay = *self.delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *fail.read().await {
            return Err(StorageError::Unavailable(
                "memory version store failure injected".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl VersionStore for MemoryVersionStore {
    async fn commit(&self, record: VersionRecord, precondition: CommitPrecondition) -> Result<()> {
        self.simulate(&self.fail_on_commit).await?;

        let mut store = self.versions.write().await;
        let records = store.entry(record.meta.state_key.clone()).or_default();
        if let Some(reason) =
            precondition.violation(records.last().map(|r| &r.meta), record.meta.version_id)
        {
            return Err(StorageError::PreconditionFailed {
                state_key: record.meta.state_key,
                reason,
            });
        }
        records.push(record);
        Ok(())
    }

    async fn head(&self, state_key: &str) -> Result<Option<VersionMeta>> {
        self.simulate(&self.fail_on_read).await?;
        let store = self.versions.read().await;
        Ok(store
            .get(state_key)
            .and_then(|records| records.last())
            .map(|r| r.meta.clone()))
    }

    async fn get(&self, state_key: &str, version: VersionId) -> Result<Option<VersionRecord>> {
        self.simulate(&self.fail_on_read).await?;
        let store = self.versions.read().await;
        Ok(store.get(state_key).and_then(|records| {
            records
                .binary_search_by_key(&version, |r| r.meta.version_id)
                .ok()
                .map(|idx| records[idx].clone())
        }))
    }

    async fn list(
        &self,
        state_key: &str,
        after: Option<VersionId>,
        limit: usize,
    ) -> Result<Vec<VersionMeta>> {
        self.simulate(&self.fail_on_read).await?;
        let store = self.versions.read().await;
        Ok(store
            .get(state_key)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| after.map_or(true, |after| r.meta.version_id > after))
                    .take(limit)
                    .map(|r| r.meta.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        self.simulate(&self.fail_on_read).await?;
        let store = self.versions.read().await;
        let mut keys: Vec<_> = store
            .iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
