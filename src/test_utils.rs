//! Builders for records and metadata used across unit and contract tests.

use chrono::{DateTime, Utc};

use crate::crypto::content_hash;
use crate::model::{FencingToken, LockEntry, VersionId, VersionMeta, VersionRecord};
use crate::storage::CommitPrecondition;

/// Build a stored record with a correct content hash over `ciphertext`.
pub fn record(
    state_key: &str,
    version: u64,
    fencing_token: FencingToken,
    ciphertext: &[u8],
) -> VersionRecord {
    VersionRecord {
        meta: VersionMeta {
            state_key: state_key.to_string(),
            version_id: VersionId::new(version),
            created_at: Utc::now(),
            content_hash: content_hash(ciphertext),
            encryption_key_id: "test-key".to_string(),
            fencing_token,
            size: ciphertext.len() as u64,
        },
        ciphertext: ciphertext.to_vec(),
    }
}

/// Precondition for appending version `version` on top of `version - 1`.
pub fn follows(version: u64, fencing_token: FencingToken) -> CommitPrecondition {
    CommitPrecondition {
        expected_head: (version > 1).then(|| VersionId::new(version - 1)),
        fencing_token,
    }
}

/// A lock row held by `holder`.
pub fn held_entry(
    state_key: &str,
    holder: &str,
    fencing_token: FencingToken,
    revision: u64,
    expires_at: Option<DateTime<Utc>>,
) -> LockEntry {
    LockEntry {
        state_key: state_key.to_string(),
        holder_id: Some(holder.to_string()),
        acquired_at: Some(Utc::now()),
        expires_at,
        fencing_token,
        revision,
    }
}
