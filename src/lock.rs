//! Fenced mutual exclusion per state key.
//!
//! Per key the lock moves `UNLOCKED -> LOCKED(holder, token) -> UNLOCKED`.
//! Every transition is a conditional write on the lock row's revision, so any
//! number of managers in any number of processes may share one [`LockTable`].
//!
//! The row is never deleted. Release clears the holder but keeps the fencing
//! token as a high-water mark, so tokens strictly increase for the lifetime
//! of the key.

use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{expiry_after, Clock, SystemClock};
use crate::error::{Result, StateError};
use crate::model::{validate_state_key, FencingToken, LockEntry, LockRecord};
use crate::storage::LockTable;
use crate::utils::deadline::with_deadline;

/// Default bound on conditional-write races lost in a single call.
pub const DEFAULT_MAX_CAS_ATTEMPTS: u32 = 16;

/// Issues, renews and validates fenced locks.
#[derive(Clone)]
pub struct LockManager {
    table: Arc<dyn LockTable>,
    clock: Arc<dyn Clock>,
    max_cas_attempts: u32,
    timeout: Option<Duration>,
}

impl LockManager {
    pub fn new(table: Arc<dyn LockTable>) -> Self {
        Self {
            table,
            clock: Arc::new(SystemClock),
            max_cas_attempts: DEFAULT_MAX_CAS_ATTEMPTS,
            timeout: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_max_cas_attempts(mut self, attempts: u32) -> Self {
        self.max_cas_attempts = attempts.max(1);
        self
    }

    /// A handle whose operations fail with `StateError::Timeout` after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self.clone()
        }
    }

    /// Generate a fresh opaque holder id.
    pub fn new_holder_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Acquire the lock on `state_key` for `holder_id`.
    ///
    /// Fails with `LockHeld` while another holder's lock is unexpired. A
    /// holder re-acquiring its own lock gets a new token. `ttl: None` never
    /// expires.
    pub async fn acquire(
        &self,
        state_key: &str,
        holder_id: &str,
        ttl: Option<Duration>,
    ) -> Result<FencingToken> {
        validate_state_key(state_key)?;
        with_deadline("acquire", self.timeout, async {
            for attempt in 1..=self.max_cas_attempts {
                let row = self.table.load(state_key).await?;
                let now = self.clock.now();

                if let Some(active) = row.as_ref().and_then(|r| r.active_lock(now)) {
                    if active.holder_id != holder_id {
                        debug!(state_key, holder = %active.holder_id, "Lock held by another holder");
                        return Err(StateError::LockHeld {
                            state_key: state_key.to_string(),
                            holder_id: Some(active.holder_id),
                            expires_at: active.expires_at,
                        });
                    }
                }

                let fencing_token = row.as_ref().map(|r| r.fencing_token).unwrap_or(0) + 1;
                let expected_revision = row.as_ref().map(|r| r.revision);
                let entry = LockEntry {
                    state_key: state_key.to_string(),
                    holder_id: Some(holder_id.to_string()),
                    acquired_at: Some(now),
                    expires_at: ttl.and_then(|ttl| expiry_after(now, ttl)),
                    fencing_token,
                    revision: expected_revision.map(|r| r + 1).unwrap_or(1),
                };

                if self.table.put_if(entry, expected_revision).await? {
                    info!(state_key, holder = holder_id, fencing_token, "Lock acquired");
                    return Ok(fencing_token);
                }
                debug!(state_key, attempt, "Lost lock row race, reloading");
            }

            warn!(state_key, attempts = self.max_cas_attempts, "Lock acquire gave up under contention");
            Err(StateError::LockHeld {
                state_key: state_key.to_string(),
                holder_id: None,
                expires_at: None,
            })
        })
        .await
    }

    /// Acquire, backing off and retrying while the lock is held.
    pub async fn acquire_with_backoff(
        &self,
        state_key: &str,
        holder_id: &str,
        ttl: Option<Duration>,
        backoff: ExponentialBuilder,
    ) -> Result<FencingToken> {
        (|| async { self.acquire(state_key, holder_id, ttl).await })
            .retry(backoff)
            .when(|e| matches!(e, StateError::LockHeld { .. }))
            .notify(|e, delay| {
                debug!(state_key, error = %e, ?delay, "Lock busy, backing off");
            })
            .await
    }

    /// Release the lock held by `holder_id` with `fencing_token`.
    ///
    /// Releasing an already released lock with its last token succeeds.
    pub async fn release(
        &self,
        state_key: &str,
        holder_id: &str,
        fencing_token: FencingToken,
    ) -> Result<()> {
        validate_state_key(state_key)?;
        with_deadline("release", self.timeout, async {
            for attempt in 1..=self.max_cas_attempts {
                let row = self.table.load(state_key).await?;
                let Some(row) = row else {
                    return Err(self.stale(state_key, fencing_token, None));
                };
                if row.fencing_token != fencing_token {
                    return Err(self.stale(state_key, fencing_token, Some(row.fencing_token)));
                }
                match row.holder_id.as_deref() {
                    None => {
                        debug!(state_key, fencing_token, "Lock already released");
                        return Ok(());
                    }
                    Some(holder) if holder != holder_id => {
                        return Err(self.stale(state_key, fencing_token, Some(row.fencing_token)));
                    }
                    Some(_) => {}
                }

                let released = LockEntry {
                    holder_id: None,
                    acquired_at: None,
                    expires_at: None,
                    revision: row.revision + 1,
                    ..row.clone()
                };
                if self.table.put_if(released, Some(row.revision)).await? {
                    info!(state_key, holder = holder_id, fencing_token, "Lock released");
                    return Ok(());
                }
                debug!(state_key, attempt, "Lost lock row race, reloading");
            }
            Err(self.stale(state_key, fencing_token, None))
        })
        .await
    }

    /// Extend the lock's TTL without changing its token.
    ///
    /// An expired lock can still be renewed as long as nobody re-acquired it.
    pub async fn renew(
        &self,
        state_key: &str,
        holder_id: &str,
        fencing_token: FencingToken,
        new_ttl: Option<Duration>,
    ) -> Result<LockRecord> {
        validate_state_key(state_key)?;
        with_deadline("renew", self.timeout, async {
            for attempt in 1..=self.max_cas_attempts {
                let row = self.table.load(state_key).await?;
                let Some(row) = row else {
                    return Err(self.stale(state_key, fencing_token, None));
                };
                if row.fencing_token != fencing_token || row.holder_id.as_deref() != Some(holder_id)
                {
                    let current = row.holder_id.as_ref().map(|_| row.fencing_token);
                    return Err(self.stale(state_key, fencing_token, current));
                }

                let now = self.clock.now();
                let renewed = LockEntry {
                    expires_at: new_ttl.and_then(|ttl| expiry_after(now, ttl)),
                    revision: row.revision + 1,
                    ..row.clone()
                };
                let record = renewed.recorded_lock();
                if self.table.put_if(renewed, Some(row.revision)).await? {
                    debug!(state_key, fencing_token, "Lock renewed");
                    if let Some(record) = record {
                        return Ok(record);
                    }
                }
                debug!(state_key, attempt, "Lost lock row race, reloading");
            }
            Err(self.stale(state_key, fencing_token, None))
        })
        .await
    }

    /// The unexpired lock on `state_key`, if any.
    pub async fn current(&self, state_key: &str) -> Result<Option<LockRecord>> {
        validate_state_key(state_key)?;
        with_deadline("current", self.timeout, async {
            let row = self.table.load(state_key).await?;
            Ok::<_, StateError>(row.and_then(|r| r.active_lock(self.clock.now())))
        })
        .await
    }

    /// Check that `fencing_token` belongs to the unexpired lock on `state_key`.
    ///
    /// Fails with `Conflict` otherwise.
    pub async fn validate(&self, state_key: &str, fencing_token: FencingToken) -> Result<LockRecord> {
        let conflict = |reason: String| StateError::Conflict {
            state_key: state_key.to_string(),
            fencing_token,
            reason,
        };

        let row = self.table.load(state_key).await?;
        let Some(row) = row else {
            return Err(conflict("no lock held".to_string()));
        };
        if row.fencing_token != fencing_token {
            return Err(conflict(format!(
                "token superseded by {}",
                row.fencing_token
            )));
        }
        let Some(record) = row.recorded_lock() else {
            return Err(conflict("lock released".to_string()));
        };
        if record.is_expired(self.clock.now()) {
            return Err(conflict("lock expired".to_string()));
        }
        Ok(record)
    }

    fn stale(
        &self,
        state_key: &str,
        presented: FencingToken,
        current: Option<FencingToken>,
    ) -> StateError {
        warn!(state_key, presented, ?current, "Stale lock holder");
        StateError::StaleHolder {
            state_key: state_key.to_string(),
            presented,
            current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::storage::MemoryLockTable;

    fn manager() -> (LockManager, Arc<MockClock>, Arc<MemoryLockTable>) {
        let clock = Arc::new(MockClock::default());
        let table = Arc::new(MemoryLockTable::new());
        let manager = LockManager::new(table.clone()).with_clock(clock.clone());
        (manager, clock, table)
    }

    const TTL: Option<Duration> = Some(Duration::from_secs(30));

    #[tokio::test]
    async fn test_first_acquire_issues_token_one() {
        let (locks, _, _) = manager();
        assert_eq!(locks.acquire("dev/db", "a", TTL).await.unwrap(), 1);
        let current = locks.current("dev/db").await.unwrap().unwrap();
        assert_eq!(current.holder_id, "a");
    }

    #[tokio::test]
    async fn test_acquire_rejects_other_holder() {
        let (locks, _, _) = manager();
        locks.acquire("dev/db", "a", TTL).await.unwrap();
        let err = locks.acquire("dev/db", "b", TTL).await.unwrap_err();
        assert!(matches!(
            err,
            StateError::LockHeld { holder_id: Some(ref h), .. } if h == "a"
        ));
    }

    #[tokio::test]
    async fn test_same_holder_reacquire_gets_new_token() {
        let (locks, _, _) = manager();
        assert_eq!(locks.acquire("dev/db", "a", TTL).await.unwrap(), 1);
        assert_eq!(locks.acquire("dev/db", "a", TTL).await.unwrap(), 2);
        assert!(locks.validate("dev/db", 1).await.is_err());
        assert!(locks.validate("dev/db", 2).await.is_ok());
    }

    #[tokio::test]
    async fn test_release_keeps_token_high_water() {
        let (locks, _, _) = manager();
        let token = locks.acquire("dev/db", "a", TTL).await.unwrap();
        locks.release("dev/db", "a", token).await.unwrap();
        assert!(locks.current("dev/db").await.unwrap().is_none());

        assert_eq!(locks.acquire("dev/db", "b", TTL).await.unwrap(), token + 1);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (locks, _, _) = manager();
        let token = locks.acquire("dev/db", "a", TTL).await.unwrap();
        locks.release("dev/db", "a", token).await.unwrap();
        locks.release("dev/db", "a", token).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_by_superseded_holder() {
        let (locks, clock, _) = manager();
        let old = locks.acquire("dev/db", "a", TTL).await.unwrap();
        clock.advance(Duration::from_secs(31));
        let new = locks.acquire("dev/db", "b", TTL).await.unwrap();

        let err = locks.release("dev/db", "a", old).await.unwrap_err();
        assert!(matches!(
            err,
            StateError::StaleHolder { presented, current: Some(current), .. }
                if presented == old && current == new
        ));
        assert!(locks.current("dev/db").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_wrong_holder_same_token() {
        let (locks, _, _) = manager();
        let token = locks.acquire("dev/db", "a", TTL).await.unwrap();
        assert!(matches!(
            locks.release("dev/db", "b", token).await,
            Err(StateError::StaleHolder { .. })
        ));
    }

    #[tokio::test]
    async fn test_release_unknown_key() {
        let (locks, _, _) = manager();
        assert!(matches!(
            locks.release("dev/db", "a", 1).await,
            Err(StateError::StaleHolder { current: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimable() {
        let (locks, clock, _) = manager();
        locks.acquire("dev/db", "a", TTL).await.unwrap();
        clock.advance(Duration::from_secs(30));
        assert!(locks.current("dev/db").await.unwrap().is_none());
        assert_eq!(locks.acquire("dev/db", "b", TTL).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_renew_extends_without_new_token() {
        let (locks, clock, _) = manager();
        let token = locks.acquire("dev/db", "a", TTL).await.unwrap();
        clock.advance(Duration::from_secs(20));
        let renewed = locks
            .renew("dev/db", "a", token, Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(renewed.fencing_token, token);

        clock.advance(Duration::from_secs(40));
        assert!(locks.validate("dev/db", token).await.is_ok());
    }

    #[tokio::test]
    async fn test_renew_after_expiry_before_reclaim() {
        let (locks, clock, _) = manager();
        let token = locks.acquire("dev/db", "a", TTL).await.unwrap();
        clock.advance(Duration::from_secs(45));
        assert!(locks.validate("dev/db", token).await.is_err());

        locks.renew("dev/db", "a", token, TTL).await.unwrap();
        assert!(locks.validate("dev/db", token).await.is_ok());
    }

    #[tokio::test]
    async fn test_renew_after_reclaim_is_stale() {
        let (locks, clock, _) = manager();
        let token = locks.acquire("dev/db", "a", TTL).await.unwrap();
        clock.advance(Duration::from_secs(45));
        locks.acquire("dev/db", "b", TTL).await.unwrap();

        assert!(matches!(
            locks.renew("dev/db", "a", token, TTL).await,
            Err(StateError::StaleHolder { .. })
        ));
    }

    #[tokio::test]
    async fn test_validate_reasons() {
        let (locks, clock, _) = manager();
        let missing = locks.validate("dev/db", 1).await.unwrap_err();
        assert!(matches!(missing, StateError::Conflict { ref reason, .. } if reason == "no lock held"));

        let token = locks.acquire("dev/db", "a", TTL).await.unwrap();
        locks.release("dev/db", "a", token).await.unwrap();
        let released = locks.validate("dev/db", token).await.unwrap_err();
        assert!(matches!(released, StateError::Conflict { ref reason, .. } if reason == "lock released"));

        let token = locks.acquire("dev/db", "a", TTL).await.unwrap();
        clock.advance(Duration::from_secs(31));
        let expired = locks.validate("dev/db", token).await.unwrap_err();
        assert!(matches!(expired, StateError::Conflict { ref reason, .. } if reason == "lock expired"));
    }

    #[tokio::test]
    async fn test_no_ttl_never_expires() {
        let (locks, clock, _) = manager();
        let token = locks.acquire("dev/db", "a", None).await.unwrap();
        clock.advance(Duration::from_secs(365 * 24 * 3600));
        assert!(locks.validate("dev/db", token).await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_key_rejected() {
        let (locks, _, _) = manager();
        assert!(matches!(
            locks.acquire("../etc", "a", TTL).await,
            Err(StateError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_backend_failure_propagates() {
        let (locks, _, table) = manager();
        table.set_fail_on_write(true).await;
        assert!(matches!(
            locks.acquire("dev/db", "a", TTL).await,
            Err(StateError::Storage(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_with_backoff_waits_for_release() {
        let (locks, _, _) = manager();
        let token = locks.acquire("dev/db", "a", TTL).await.unwrap();

        let releaser = locks.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            releaser.release("dev/db", "a", token).await.unwrap();
        });

        let next = locks
            .acquire_with_backoff("dev/db", "b", TTL, crate::utils::retry::lock_backoff())
            .await
            .unwrap();
        assert_eq!(next, token + 1);
    }
}
