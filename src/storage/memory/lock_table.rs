//! In-memory LockTable implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::model::LockEntry;
use crate::storage::{LockTable, Result, StorageError};

/// Lock table backed by a map guarded by a single write lock.
#[derive(Default)]
pub struct MemoryLockTable {
    rows: RwLock<HashMap<String, LockEntry>>,
    fail_on_write: RwLock<bool>,
}

impl MemoryLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_write(&self, fail: bool) {
        *self.fail_on_write.write().await = fail;
    }
}

#[async_trait]
impl LockTable for MemoryLockTable {
    async fn load(&self, state_key: &str) -> Result<Option<LockEntry>> {
        Ok(self.rows.read().await.get(state_key).cloned())
    }

    async fn put_if(&self, entry: LockEntry, expected_revision: Option<u64>) -> Result<bool> {
        if *self.fail_on_write.read().await {
            return Err(StorageError::Unavailable(
                "memory lock table failure injected".to_string(),
            ));
        }

        let mut rows = self.rows.write().await;
        let current = rows.get(&entry.state_key).map(|row| row.revision);
        if current != expected_revision {
            return Ok(false);
        }
        rows.insert(entry.state_key.clone(), entry);
        Ok(true)
    }
}
