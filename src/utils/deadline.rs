//! Caller-supplied deadlines for backend operations.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{Result, StateError};

/// Run `fut` under an optional deadline.
///
/// On expiry the future is dropped and `StateError::Timeout` is returned. The
/// backend may still have applied the operation.
pub async fn with_deadline<T, F>(
    operation: &'static str,
    deadline: Option<Duration>,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let Some(after) = deadline else {
        return fut.await;
    };
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(operation, ?after, "Operation timed out; outcome unknown");
            Err(StateError::Timeout { operation, after })
        }
    }
}
