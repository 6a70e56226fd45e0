//! Public error taxonomy for state and lock operations.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::crypto::CryptoError;
use crate::model::{FencingToken, VersionId};
use crate::storage::StorageError;

/// Result type for state and lock operations.
pub type Result<T> = std::result::Result<T, StateError>;

/// Errors surfaced by [`StateStore`](crate::StateStore) and
/// [`LockManager`](crate::LockManager).
///
/// `Conflict`, `LockHeld` and `StaleHolder` are expected control-flow outcomes:
/// callers decide whether to back off and retry.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Fencing conflict on {state_key} with token {fencing_token}: {reason}")]
    Conflict {
        state_key: String,
        fencing_token: FencingToken,
        reason: String,
    },

    #[error("Lock on {state_key} is held by {}", .holder_id.as_deref().unwrap_or("another holder"))]
    LockHeld {
        state_key: String,
        holder_id: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    },

    #[error("Stale lock holder on {state_key}: presented token {presented}, current {}", .current.map(|t| t.to_string()).unwrap_or_else(|| "none".to_string()))]
    StaleHolder {
        state_key: String,
        presented: FencingToken,
        current: Option<FencingToken>,
    },

    #[error("State not found: {state_key}{}", .version.map(|v| format!(" version {}", v)).unwrap_or_default())]
    NotFound {
        state_key: String,
        version: Option<VersionId>,
    },

    #[error("Integrity check failed for {state_key} version {version}: expected {expected}, got {actual}")]
    Integrity {
        state_key: String,
        version: VersionId,
        expected: String,
        actual: String,
    },

    #[error("{operation} timed out after {after:?}; outcome unknown, re-read before retrying")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Invalid state key {0}")]
    InvalidKey(String),

    #[error("Invalid version id: {0}")]
    InvalidVersion(String),

    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("Encryption error: {0}")]
    Encryption(#[from] CryptoError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl StateError {
    /// Whether backing off and retrying the same call can succeed.
    ///
    /// `Conflict` is not retryable as-is: the caller must re-acquire the lock
    /// and re-read state first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StateError::LockHeld { .. } | StateError::Storage(StorageError::Unavailable(_))
        )
    }

    /// Whether the operation may or may not have taken effect.
    pub fn outcome_unknown(&self) -> bool {
        matches!(
            self,
            StateError::Timeout { .. } | StateError::Storage(StorageError::QuorumNotReached { .. })
        )
    }
}
