//! Version store fan-out across several physical copies.
//!
//! The primary copy decides every commit: its head CAS is the single point of
//! truth. Mirrors then receive the same record, back-filling any versions they
//! missed while unreachable. A commit is acknowledged once `write_quorum`
//! copies (primary included) hold it.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, warn};

use super::{CommitPrecondition, Result, StorageError, VersionStore};
use crate::model::{VersionId, VersionMeta, VersionRecord};

/// Page size used when back-filling a lagging mirror.
const BACKFILL_PAGE: usize = 100;

/// VersionStore that writes through to mirrors with a write quorum.
pub struct MirroredVersionStore {
    primary: Arc<dyn VersionStore>,
    mirrors: Vec<Arc<dyn VersionStore>>,
    write_quorum: usize,
}

impl MirroredVersionStore {
    /// Create a mirrored store.
    ///
    /// `write_quorum` is clamped to `1..=copies`.
    pub fn new(
        primary: Arc<dyn VersionStore>,
        mirrors: Vec<Arc<dyn VersionStore>>,
        write_quorum: usize,
    ) -> Self {
        let copies = mirrors.len() + 1;
        Self {
            primary,
            mirrors,
            write_quorum: write_quorum.clamp(1, copies),
        }
    }

    pub fn copies(&self) -> usize {
        self.mirrors.len() + 1
    }

    pub fn write_quorum(&self) -> usize {
        self.write_quorum
    }

    /// Bring `mirror` up to `record` and append it.
    async fn mirror_commit(&self, mirror: &dyn VersionStore, record: &VersionRecord) -> Result<()> {
        let state_key = &record.meta.state_key;
        let target = record.meta.version_id;

        let expected_head = loop {
            let head_id = mirror.head(state_key).await?.map(|h| h.version_id);
            if head_id >= Some(target) {
                return Ok(());
            }
            if VersionId::after(head_id) == target {
                break head_id;
            }

            let missing = self.primary.list(state_key, head_id, BACKFILL_PAGE).await?;
            let mut expected = head_id;
            for meta in missing.into_iter().filter(|m| m.version_id < target) {
                let Some(stored) = self.primary.get(state_key, meta.version_id).await? else {
                    return Err(StorageError::Corrupt(format!(
                        "primary lost {} during backfill",
                        meta.object_key()
                    )));
                };
                debug!(object_key = %meta.object_key(), "Back-filling mirror");
                mirror
                    .commit(
                        stored,
                        CommitPrecondition {
                            expected_head: expected,
                            fencing_token: meta.fencing_token,
                        },
                    )
                    .await?;
                expected = Some(meta.version_id);
            }
            if expected == head_id {
                return Err(StorageError::Corrupt(format!(
                    "primary history for {} has a gap before {}",
                    state_key, target
                )));
            }
        };

        mirror
            .commit(
                record.clone(),
                CommitPrecondition {
                    expected_head,
                    fencing_token: record.meta.fencing_token,
                },
            )
            .await
    }
}

#[async_trait]
impl VersionStore for MirroredVersionStore {
    async fn commit(&self, record: VersionRecord, precondition: CommitPrecondition) -> Result<()> {
        self.primary.commit(record.clone(), precondition).await?;

        let results = join_all(
            self.mirrors
                .iter()
                .map(|mirror| self.mirror_commit(mirror.as_ref(), &record)),
        )
        .await;

        let mut acked = 1;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(()) => acked += 1,
                Err(e) => warn!(
                    mirror = index,
                    object_key = %record.meta.object_key(),
                    error = %e,
                    "Mirror commit failed"
                ),
            }
        }

        if acked < self.write_quorum {
            return Err(StorageError::QuorumNotReached {
                acked,
                required: self.write_quorum,
            });
        }
        Ok(())
    }

    async fn head(&self, state_key: &str) -> Result<Option<VersionMeta>> {
        self.primary.head(state_key).await
    }

    async fn get(&self, state_key: &str, version: VersionId) -> Result<Option<VersionRecord>> {
        match self.primary.get(state_key, version).await {
            Ok(Some(record)) if record.is_intact() => return Ok(Some(record)),
            Ok(found) => {
                // Serve a mirror's intact copy when the primary's is damaged.
                for mirror in &self.mirrors {
                    if let Ok(Some(copy)) = mirror.get(state_key, version).await {
                        if copy.is_intact() {
                            warn!(state_key, version = %version, "Served version from mirror");
                            return Ok(Some(copy));
                        }
                    }
                }
                Ok(found)
            }
            Err(e) => Err(e),
        }
    }

    async fn list(
        &self,
        state_key: &str,
        after: Option<VersionId>,
        limit: usize,
    ) -> Result<Vec<VersionMeta>> {
        self.primary.list(state_key, after, limit).await
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        self.primary.list_keys().await
    }
}
