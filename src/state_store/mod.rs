//! Versioned, encrypted state storage.
//!
//! Every `put` seals the payload under a fresh data key, appends an immutable
//! version and moves the head with a single conditional commit. Writers must
//! present the fencing token of the lock they hold; the token is checked
//! against the lock table and again against the head inside the commit.

mod pagination;

pub use pagination::VersionPage;

use std::sync::Arc;
use std::time::Duration;

use futures::{stream, Stream, TryStreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::crypto::{content_hash, CryptoError, EnvelopeCipher};
use crate::error::{Result, StateError};
use crate::lock::LockManager;
use crate::model::{
    object_key, validate_state_key, CommitEvent, FencingToken, StateVersion, VersionId,
    VersionMeta, VersionRecord,
};
use crate::storage::{CommitPrecondition, StorageError, VersionStore};
use crate::utils::deadline::with_deadline;
use pagination::{decode_cursor, encode_cursor};

/// Tunables for a [`StateStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Page size used when `list_versions` is called without a limit.
    pub page_size: usize,
    /// Upper bound applied to caller-supplied limits.
    pub max_page_size: usize,
    /// Deadline applied to every operation unless overridden by `with_timeout`.
    pub request_timeout: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_page_size: 1000,
            request_timeout: None,
        }
    }
}

/// Versioned state store fronting a [`VersionStore`].
#[derive(Clone)]
pub struct StateStore {
    versions: Arc<dyn VersionStore>,
    locks: LockManager,
    cipher: EnvelopeCipher,
    clock: Arc<dyn Clock>,
    events: Option<mpsc::UnboundedSender<CommitEvent>>,
    config: StoreConfig,
}

impl StateStore {
    pub fn new(versions: Arc<dyn VersionStore>, locks: LockManager, cipher: EnvelopeCipher) -> Self {
        Self {
            versions,
            locks,
            cipher,
            clock: Arc::new(SystemClock),
            events: None,
            config: StoreConfig::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Publish a [`CommitEvent`] after every successful `put`.
    pub fn with_commit_events(mut self, sender: mpsc::UnboundedSender<CommitEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// A handle whose operations fail with `StateError::Timeout` after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut store = self.clone();
        store.config.request_timeout = Some(timeout);
        store
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn version_store(&self) -> &Arc<dyn VersionStore> {
        &self.versions
    }

    /// Write a new version of `state_key`.
    ///
    /// Fails with `Conflict` unless `fencing_token` is the token of the
    /// unexpired lock on the key. On `Timeout` or `QuorumNotReached` the
    /// write may have happened: re-read before retrying.
    pub async fn put(
        &self,
        state_key: &str,
        payload: &[u8],
        fencing_token: FencingToken,
    ) -> Result<VersionMeta> {
        validate_state_key(state_key)?;
        with_deadline("put", self.config.request_timeout, async {
            self.locks.validate(state_key, fencing_token).await?;

            let head = self.versions.head(state_key).await?;
            if let Some(head) = &head {
                if head.fencing_token > fencing_token {
                    return Err(StateError::Conflict {
                        state_key: state_key.to_string(),
                        fencing_token,
                        reason: format!("head written under newer token {}", head.fencing_token),
                    });
                }
            }

            let version_id = VersionId::after(head.as_ref().map(|h| h.version_id));
            let now = self.clock.now();
            let created_at = match &head {
                Some(head) if head.created_at >= now => {
                    head.created_at + chrono::Duration::microseconds(1)
                }
                _ => now,
            };

            let aad = object_key(state_key, version_id);
            let (encryption_key_id, ciphertext) = self.cipher.seal(aad.as_bytes(), payload).await?;
            let meta = VersionMeta {
                state_key: state_key.to_string(),
                version_id,
                created_at,
                content_hash: content_hash(&ciphertext),
                encryption_key_id,
                fencing_token,
                size: ciphertext.len() as u64,
            };

            let precondition = CommitPrecondition {
                expected_head: head.as_ref().map(|h| h.version_id),
                fencing_token,
            };
            let record = VersionRecord {
                meta: meta.clone(),
                ciphertext,
            };
            self.versions
                .commit(record, precondition)
                .await
                .map_err(|e| match e {
                    StorageError::PreconditionFailed { state_key, reason } => StateError::Conflict {
                        state_key,
                        fencing_token,
                        reason,
                    },
                    other => other.into(),
                })?;

            info!(
                state_key,
                version = %meta.version_id,
                fencing_token,
                size = meta.size,
                "Committed state version"
            );
            self.publish(&meta);
            Ok(meta)
        })
        .await
    }

    /// Read the current version, or a specific historical one.
    ///
    /// A version whose stored bytes fail the content hash or fail to decrypt
    /// is reported as `Integrity`; no other version is served in its place.
    pub async fn get(&self, state_key: &str, version: Option<VersionId>) -> Result<StateVersion> {
        validate_state_key(state_key)?;
        with_deadline("get", self.config.request_timeout, async {
            let version = match version {
                Some(version) => version,
                None => self
                    .versions
                    .head(state_key)
                    .await?
                    .map(|head| head.version_id)
                    .ok_or_else(|| StateError::NotFound {
                        state_key: state_key.to_string(),
                        version: None,
                    })?,
            };

            let record = self
                .versions
                .get(state_key, version)
                .await?
                .ok_or_else(|| StateError::NotFound {
                    state_key: state_key.to_string(),
                    version: Some(version),
                })?;
            self.open(record).await
        })
        .await
    }

    /// Read the newest version that passes integrity checks.
    ///
    /// Explicit opt-in fallback: skips damaged versions from the head
    /// backwards and logs each one skipped.
    pub async fn get_latest_intact(&self, state_key: &str) -> Result<StateVersion> {
        validate_state_key(state_key)?;
        with_deadline("get_latest_intact", self.config.request_timeout, async {
            let head = self
                .versions
                .head(state_key)
                .await?
                .ok_or_else(|| StateError::NotFound {
                    state_key: state_key.to_string(),
                    version: None,
                })?;

            for sequence in (1..=head.version_id.sequence()).rev() {
                let version = VersionId::new(sequence);
                let Some(record) = self.versions.get(state_key, version).await? else {
                    continue;
                };
                match self.open(record).await {
                    Ok(state) => return Ok(state),
                    Err(e @ StateError::Integrity { .. }) => {
                        warn!(state_key, version = %version, error = %e, "Skipping damaged version");
                    }
                    Err(e) => return Err(e),
                }
            }

            Err(StateError::NotFound {
                state_key: state_key.to_string(),
                version: None,
            })
        })
        .await
    }

    /// List version metadata oldest first, one page at a time.
    ///
    /// Pass the previous page's `next_cursor` to continue. `limit` defaults
    /// to the configured page size and is capped at the maximum page size.
    pub async fn list_versions(
        &self,
        state_key: &str,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<VersionPage> {
        validate_state_key(state_key)?;
        let after = cursor
            .map(|cursor| decode_cursor(state_key, cursor))
            .transpose()?;
        let limit = limit
            .unwrap_or(self.config.page_size)
            .clamp(1, self.config.max_page_size.max(1));

        with_deadline("list_versions", self.config.request_timeout, async {
            let mut versions = self.versions.list(state_key, after, limit + 1).await?;
            let next_cursor = if versions.len() > limit {
                versions.truncate(limit);
                versions
                    .last()
                    .map(|meta| encode_cursor(state_key, meta.version_id))
            } else {
                None
            };
            Ok::<_, StateError>(VersionPage {
                versions,
                next_cursor,
            })
        })
        .await
    }

    /// Lazily stream every version of `state_key`, oldest first.
    pub fn versions(&self, state_key: &str) -> impl Stream<Item = Result<VersionMeta>> + Send + 'static {
        let store = self.clone();
        let state_key = state_key.to_string();

        stream::try_unfold(Some(None::<String>), move |cursor| {
            let store = store.clone();
            let state_key = state_key.clone();
            async move {
                let Some(cursor) = cursor else {
                    return Ok::<_, StateError>(None);
                };
                let page = store
                    .list_versions(&state_key, cursor.as_deref(), None)
                    .await?;
                let next = page.next_cursor.map(Some);
                Ok(Some((stream::iter(page.versions.into_iter().map(Ok::<_, StateError>)), next)))
            }
        })
        .try_flatten()
    }

    async fn open(&self, record: VersionRecord) -> Result<StateVersion> {
        let meta = record.meta;
        let actual = content_hash(&record.ciphertext);
        if actual != meta.content_hash {
            return Err(StateError::Integrity {
                state_key: meta.state_key,
                version: meta.version_id,
                expected: meta.content_hash,
                actual,
            });
        }

        let aad = meta.object_key();
        match self
            .cipher
            .open(&meta.encryption_key_id, aad.as_bytes(), &record.ciphertext)
            .await
        {
            Ok(payload) => Ok(StateVersion { meta, payload }),
            Err(CryptoError::Decrypt { .. } | CryptoError::MalformedEnvelope(_)) => {
                Err(StateError::Integrity {
                    state_key: meta.state_key,
                    version: meta.version_id,
                    expected: meta.content_hash,
                    actual: "undecryptable envelope".to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn publish(&self, meta: &VersionMeta) {
        let Some(events) = &self.events else {
            return;
        };
        let event = CommitEvent {
            version: meta.clone(),
        };
        if events.send(event).is_err() {
            debug!(object_key = %meta.object_key(), "Commit event receiver closed");
        }
    }
}
