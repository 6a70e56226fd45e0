//! Retry utilities: backoff builders and retryable error classification.
//!
//! Uses `backon` for exponential backoff with jitter. Provides standard
//! backoff configurations for lock contention and replica copies.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::storage::StorageError;

/// Standard backoff for lock acquisition under contention.
///
/// - Min delay: 50ms
/// - Max delay: 2s
/// - Max attempts: 10
/// - Jitter enabled
pub fn lock_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(10)
        .with_jitter()
}

/// Backoff for replica copies.
///
/// `max_attempts` counts the first try, so the builder allows
/// `max_attempts - 1` retries.
pub fn replication_backoff(
    min_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    jitter: bool,
) -> ExponentialBuilder {
    let builder = ExponentialBuilder::default()
        .with_min_delay(min_delay)
        .with_max_delay(max_delay)
        .with_max_times(max_attempts.saturating_sub(1) as usize);
    if jitter {
        builder.with_jitter()
    } else {
        builder
    }
}

/// Determines if a storage error is transient.
///
/// Retryable:
/// - `Unavailable`, `Io`, `Database`: the backend may recover
///
/// Non-retryable:
/// - `PreconditionFailed`: the write lost a race and will never succeed as-is
/// - `Corrupt`, `Serialization`: the data itself is bad
/// - `QuorumNotReached`: the outcome is unknown; callers must re-read
pub fn is_retryable_storage(error: &StorageError) -> bool {
    match error {
        StorageError::Unavailable(_) | StorageError::Io(_) => true,
        #[cfg(feature = "sqlite")]
        StorageError::Database(_) => true,
        _ => false,
    }
}
