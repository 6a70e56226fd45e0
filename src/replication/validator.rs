//! Periodic backup health checks.
//!
//! A key's replica counts as caught up through the end of its gap-free run
//! `1..=k`. Each run records per-key lag (the age of the oldest version past
//! that run, zero when caught up) and reports:
//! - `Gap`: a replicated version sits above a missing predecessor
//! - `NotReplicated` / `Lagging`: the lag exceeds `max_lag`
//! - `RetentionShort`: with a minimum retention set, the replica reaches back
//!   less than 90% of it while the primary has that much history
//!
//! Versions younger than `max_lag` are still in flight and don't count against a key.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{replicated_through, AlertKind, AlertSink, ReplicationAlert, ReplicationError};
use crate::clock::{Clock, SystemClock};
use crate::model::VersionId;
use crate::storage::{ReplicaStore, VersionStore};

/// Default allowed replication lag.
pub const DEFAULT_MAX_LAG: Duration = Duration::from_secs(300);

/// Share of the minimum retention that must be covered, in percent.
const RETENTION_COVERAGE_PCT: u32 = 90;

/// A problem found by a validation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupIssue {
    /// The key has versions but none of them reached the replica.
    NotReplicated {
        state_key: String,
        primary_head: VersionId,
        lag: Duration,
    },
    /// The replica is behind the primary by more than the allowed lag.
    Lagging {
        state_key: String,
        primary_head: VersionId,
        /// End of the gap-free run, if any.
        replicated: Option<VersionId>,
        behind_by: u64,
        lag: Duration,
    },
    /// Replicated versions sit above missing ones.
    Gap {
        state_key: String,
        first_missing: VersionId,
        missing: u64,
        newest_replicated: VersionId,
    },
    /// The oldest replicated version is younger than the retention floor.
    RetentionShort {
        state_key: String,
        earliest_replicated: VersionId,
        covered: Duration,
        required: Duration,
    },
    /// The key could not be checked.
    Error { state_key: String, reason: String },
}

impl BackupIssue {
    pub fn state_key(&self) -> &str {
        match self {
            BackupIssue::NotReplicated { state_key, .. }
            | BackupIssue::Lagging { state_key, .. }
            | BackupIssue::Gap { state_key, .. }
            | BackupIssue::RetentionShort { state_key, .. }
            | BackupIssue::Error { state_key, .. } => state_key,
        }
    }

    fn alert_kind(&self) -> AlertKind {
        match self {
            BackupIssue::NotReplicated { .. } => AlertKind::NotReplicated,
            BackupIssue::Lagging { .. } => AlertKind::ReplicationLagging,
            BackupIssue::Gap { .. } => AlertKind::ReplicaGap,
            BackupIssue::RetentionShort { .. } => AlertKind::RetentionShort,
            BackupIssue::Error { .. } => AlertKind::ValidationError,
        }
    }

    #[cfg(feature = "otel")]
    fn kind_label(&self) -> &'static str {
        match self {
            BackupIssue::NotReplicated { .. } => "not_replicated",
            BackupIssue::Lagging { .. } => "lagging",
            BackupIssue::Gap { .. } => "gap",
            BackupIssue::RetentionShort { .. } => "retention_short",
            BackupIssue::Error { .. } => "error",
        }
    }

    fn message(&self) -> String {
        match self {
            BackupIssue::NotReplicated {
                primary_head, lag, ..
            } => format!(
                "no replicated versions; primary head {} unreplicated for {}s",
                primary_head,
                lag.as_secs()
            ),
            BackupIssue::Lagging {
                primary_head,
                replicated,
                behind_by,
                lag,
                ..
            } => format!(
                "replica through {} is {} versions behind primary head {} (oldest missing is {}s old)",
                replicated.map_or_else(|| "nothing".to_string(), |v| v.to_string()),
                behind_by,
                primary_head,
                lag.as_secs()
            ),
            BackupIssue::Gap {
                first_missing,
                missing,
                newest_replicated,
                ..
            } => format!(
                "replica holds {} but is missing {} older versions starting at {}",
                newest_replicated, missing, first_missing
            ),
            BackupIssue::RetentionShort {
                earliest_replicated,
                covered,
                required,
                ..
            } => format!(
                "oldest replicated version {} is {}s old; retention requires {}s",
                earliest_replicated,
                covered.as_secs(),
                required.as_secs()
            ),
            BackupIssue::Error { reason, .. } => reason.clone(),
        }
    }
}

/// Outcome of a validation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub checked: usize,
    pub issues: Vec<BackupIssue>,
    /// Per-key lag; zero for keys that are caught up.
    pub lag: BTreeMap<String, Duration>,
    pub checked_at: DateTime<Utc>,
}

impl ValidationReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

#[derive(Default)]
struct KeyCheck {
    lag: Duration,
    retention: Option<Duration>,
    issues: Vec<BackupIssue>,
}

/// Checks that the replica keeps up with the primary.
pub struct BackupValidator {
    source: Arc<dyn VersionStore>,
    destination: Arc<dyn ReplicaStore>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    max_lag: Duration,
    min_retention: Option<Duration>,
}

impl BackupValidator {
    pub fn new(
        source: Arc<dyn VersionStore>,
        destination: Arc<dyn ReplicaStore>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            source,
            destination,
            alerts,
            clock: Arc::new(SystemClock),
            max_lag: DEFAULT_MAX_LAG,
            min_retention: None,
        }
    }

    pub fn with_max_lag(mut self, max_lag: Duration) -> Self {
        self.max_lag = max_lag;
        self
    }

    /// Require the replica to reach back at least this far.
    pub fn with_min_retention(mut self, min_retention: Duration) -> Self {
        self.min_retention = Some(min_retention);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Check every key and raise one alert per issue found.
    pub async fn validate(&self) -> Result<ValidationReport, ReplicationError> {
        let keys = self.source.list_keys().await?;
        let checked_at = self.clock.now();
        let mut issues = Vec::new();
        let mut lag = BTreeMap::new();

        for state_key in &keys {
            match self.check_key(state_key, checked_at).await {
                Ok(check) => {
                    self.record_key(state_key, &check);
                    lag.insert(state_key.clone(), check.lag);
                    issues.extend(check.issues);
                }
                Err(e) => issues.push(BackupIssue::Error {
                    state_key: state_key.clone(),
                    reason: e.to_string(),
                }),
            }
        }

        for issue in &issues {
            self.raise(issue).await;
        }

        if issues.is_empty() {
            info!(
                destination = %self.destination.name(),
                checked = keys.len(),
                "Backup validation passed"
            );
        } else {
            warn!(
                destination = %self.destination.name(),
                checked = keys.len(),
                issues = issues.len(),
                "Backup validation found issues"
            );
        }

        Ok(ValidationReport {
            checked: keys.len(),
            issues,
            lag,
            checked_at,
        })
    }

    async fn check_key(
        &self,
        state_key: &str,
        now: DateTime<Utc>,
    ) -> Result<KeyCheck, ReplicationError> {
        let Some(head) = self.source.head(state_key).await? else {
            return Ok(KeyCheck::default());
        };
        let present: BTreeSet<VersionId> = self
            .destination
            .list_replicated(state_key)
            .await?
            .into_iter()
            .collect();
        let through = replicated_through(&present);
        let mut check = KeyCheck::default();

        if let Some(newest) = present.last().copied().filter(|v| Some(*v) != through) {
            let held = present.len() as u64;
            check.issues.push(BackupIssue::Gap {
                state_key: state_key.to_string(),
                first_missing: through.map_or(VersionId::FIRST, |t| t.next()),
                missing: newest.sequence() - held,
                newest_replicated: newest,
            });
        }

        if through.is_none_or(|t| t < head.version_id) {
            if let Some(oldest_missing) = self
                .source
                .list(state_key, through, 1)
                .await?
                .into_iter()
                .next()
            {
                check.lag = age(now, oldest_missing.created_at);
            }
        }
        if check.lag > self.max_lag {
            check.issues.push(match through {
                None if present.is_empty() => BackupIssue::NotReplicated {
                    state_key: state_key.to_string(),
                    primary_head: head.version_id,
                    lag: check.lag,
                },
                _ => BackupIssue::Lagging {
                    state_key: state_key.to_string(),
                    primary_head: head.version_id,
                    replicated: through,
                    behind_by: head.version_id.sequence()
                        - through.map_or(0, |t| t.sequence()),
                    lag: check.lag,
                },
            });
        }

        if let Some(earliest) = present.first().copied() {
            if let Some(record) = self.destination.get_replica(state_key, earliest).await? {
                let covered = age(now, record.meta.created_at);
                check.retention = Some(covered);
                if let Some(issue) = self
                    .check_retention(state_key, earliest, covered, now)
                    .await?
                {
                    check.issues.push(issue);
                }
            }
        }
        Ok(check)
    }

    /// Flag a replica that covers less than 90% of the required retention,
    /// provided the primary itself holds that much history.
    async fn check_retention(
        &self,
        state_key: &str,
        earliest_replicated: VersionId,
        covered: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<BackupIssue>, ReplicationError> {
        let Some(required) = self.min_retention else {
            return Ok(None);
        };
        let floor = required * RETENTION_COVERAGE_PCT / 100;
        if covered >= floor {
            return Ok(None);
        }
        let Some(oldest) = self.source.list(state_key, None, 1).await?.into_iter().next() else {
            return Ok(None);
        };
        if age(now, oldest.created_at) < floor {
            debug!(state_key = %state_key, "Primary history is shorter than the retention floor");
            return Ok(None);
        }
        Ok(Some(BackupIssue::RetentionShort {
            state_key: state_key.to_string(),
            earliest_replicated,
            covered,
            required,
        }))
    }

    #[cfg_attr(not(feature = "otel"), allow(unused_variables))]
    fn record_key(&self, state_key: &str, check: &KeyCheck) {
        #[cfg(feature = "otel")]
        {
            use crate::utils::metrics::{
                self, BACKUP_ISSUES_TOTAL, BACKUP_LAG, BACKUP_RETENTION,
            };
            let attrs = [
                metrics::state_key_attr(state_key),
                metrics::destination_attr(self.destination.name()),
            ];
            BACKUP_LAG.record(check.lag.as_secs_f64(), &attrs);
            if let Some(retention) = check.retention {
                BACKUP_RETENTION.record(retention.as_secs_f64(), &attrs);
            }
            for issue in &check.issues {
                BACKUP_ISSUES_TOTAL.add(1, &[
                    metrics::destination_attr(self.destination.name()),
                    metrics::kind_attr(issue.kind_label()),
                ]);
            }
        }
    }

    async fn raise(&self, issue: &BackupIssue) {
        let alert = ReplicationAlert::new(
            issue.alert_kind(),
            issue.state_key(),
            self.destination.name(),
            issue.message(),
        );
        if let Err(e) = self.alerts.raise(alert).await {
            warn!(state_key = %issue.state_key(), error = %e, "Failed to raise backup alert");
        }
    }
}

fn age(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or(Duration::ZERO)
}
