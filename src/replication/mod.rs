//! Asynchronous one-way replication of committed versions.
//!
//! The agent consumes [`CommitEvent`]s and copies each version (still
//! encrypted) to a [`ReplicaStore`]. Ordering is FIFO per state key: each key
//! has its own lane, processed oldest version first. Lanes for different keys
//! run concurrently, bounded by `workers`.
//!
//! ## Job Lifecycle
//!
//! ```text
//! Pending -> Running -> Completed
//!                   \-> Failed (after max_attempts, alert raised)
//! ```
//!
//! The replica of a key is always a gap-free run `1..=k`. A version is copied
//! only once its predecessor is at the destination; when a lane reaches a
//! version whose predecessor is missing (a lost or late commit event), the
//! missing versions are read from the primary and queued ahead of it.
//!
//! A failed job stalls its key: later versions stay parked until
//! [`ReplicationAgent::reconcile`] rebuilds lanes from the primary and replica
//! contents and un-stalls them.

pub mod alert;
pub mod validator;

pub use alert::{
    create_alert_sink, AlertError, AlertKind, AlertSink, ChannelAlertSink, FileAlertSink,
    LogAlertSink, ReplicationAlert,
};
pub use validator::{BackupIssue, BackupValidator, ValidationReport};

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use backon::{ExponentialBuilder, Retryable};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ReplicationConfig;
use crate::model::{CommitEvent, VersionId, VersionMeta};
use crate::storage::{ReplicaStore, StorageError, VersionStore};
use crate::utils::retry::{is_retryable_storage, replication_backoff};

/// Page size used when scanning the primary during reconcile.
const RECONCILE_PAGE: usize = 100;

/// Errors that can occur while replicating a version.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("Source version {0} is missing from the primary store")]
    SourceMissing(String),

    #[error("Source version {0} failed its integrity check; refusing to replicate")]
    SourceCorrupt(String),

    #[error("Cannot replicate {object_key}: predecessor {missing} is not at the destination")]
    PredecessorMissing {
        object_key: String,
        missing: VersionId,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ReplicationError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicationError::Storage(e) => is_retryable_storage(e),
            _ => false,
        }
    }
}

/// Highest version `k` such that `1..=k` are all present.
pub(crate) fn replicated_through(present: &BTreeSet<VersionId>) -> Option<VersionId> {
    let mut through = None;
    for (expected, version) in (1..).zip(present.iter()) {
        if version.sequence() != expected {
            break;
        }
        through = Some(*version);
    }
    through
}

/// Create the channel that connects a `StateStore` to a `ReplicationAgent`.
pub fn commit_channel() -> (
    mpsc::UnboundedSender<CommitEvent>,
    mpsc::UnboundedReceiver<CommitEvent>,
) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A single version copy to a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationJob {
    pub version: VersionMeta,
    pub destination: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl ReplicationJob {
    fn new(version: VersionMeta, destination: &str) -> Self {
        Self {
            version,
            destination: destination.to_string(),
            status: JobStatus::Pending,
            attempts: 0,
            last_error: None,
        }
    }
}

/// Counters since the agent started.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationStats {
    pub completed: u64,
    pub failed: u64,
    pub retries: u64,
    /// Versions queued but not yet copied.
    pub pending: usize,
    pub stalled_keys: Vec<String>,
}

/// Replication position of a single key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationProgress {
    pub state_key: String,
    pub primary_head: Option<VersionId>,
    /// End of the gap-free run `1..=k` at the destination.
    pub replicated: Option<VersionId>,
    pub pending: usize,
    pub stalled: bool,
}

#[derive(Default)]
struct Lane {
    queue: BTreeMap<VersionId, VersionMeta>,
    running: bool,
    stalled: bool,
}

struct Inner {
    source: Arc<dyn VersionStore>,
    destination: Arc<dyn ReplicaStore>,
    alerts: Arc<dyn AlertSink>,
    config: ReplicationConfig,
    lanes: Mutex<HashMap<String, Lane>>,
    workers: Semaphore,
    active_lanes: watch::Sender<usize>,
    failed_jobs: RwLock<Vec<ReplicationJob>>,
    completed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
}

/// Background replicator from a primary [`VersionStore`] to a [`ReplicaStore`].
#[derive(Clone)]
pub struct ReplicationAgent {
    inner: Arc<Inner>,
}

impl ReplicationAgent {
    pub fn new(
        source: Arc<dyn VersionStore>,
        destination: Arc<dyn ReplicaStore>,
        alerts: Arc<dyn AlertSink>,
        config: ReplicationConfig,
    ) -> Self {
        let (active_lanes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                source,
                destination,
                alerts,
                workers: Semaphore::new(config.workers.max(1)),
                config,
                lanes: Mutex::new(HashMap::new()),
                active_lanes,
                failed_jobs: RwLock::new(Vec::new()),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                retries: AtomicU64::new(0),
            }),
        }
    }

    pub fn destination(&self) -> &str {
        self.inner.destination.name()
    }

    /// Run the agent on a background task.
    pub fn spawn(&self, events: mpsc::UnboundedReceiver<CommitEvent>) -> JoinHandle<()> {
        let agent = self.clone();
        tokio::spawn(async move { agent.run(events).await })
    }

    /// Consume commit events until the channel closes, then drain every lane.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<CommitEvent>) {
        info!(destination = %self.destination(), "Replication agent started");
        while let Some(event) = events.recv().await {
            self.enqueue(event.version).await;
        }
        self.drain().await;
        info!(destination = %self.destination(), "Replication agent stopped");
    }

    /// Queue a version for replication on its key's lane.
    pub async fn enqueue(&self, version: VersionMeta) {
        let state_key = version.state_key.clone();
        let start = {
            let mut lanes = self.inner.lanes.lock().await;
            let lane = lanes.entry(state_key.clone()).or_default();
            lane.queue.insert(version.version_id, version);
            if lane.stalled {
                debug!(state_key = %state_key, "Lane stalled; version parked until reconcile");
            }
            self.claim_lane(lane)
        };
        if start {
            self.start_lane(state_key);
        }
    }

    /// Wait until every lane is idle or stalled.
    pub async fn drain(&self) {
        let mut active = self.inner.active_lanes.subscribe();
        // The sender lives in `inner`, so the channel can't close under us.
        let _ = active.wait_for(|count| *count == 0).await;
    }

    /// Rebuild lanes from what the replica is missing and un-stall them.
    ///
    /// Scans every key of the primary from the first version absent at the
    /// destination, queues every missing version oldest first (including
    /// holes below the replica's newest version) and restarts the lanes.
    /// Returns how many versions were queued. Run at startup to recover
    /// retry state lost in a restart.
    pub async fn reconcile(&self) -> Result<usize, ReplicationError> {
        let mut queued = 0;
        for state_key in self.inner.source.list_keys().await? {
            let present = self.replicated_set(&state_key).await?;
            let missing = self.scan_missing(&state_key, &present, None).await?;
            queued += missing.len();
            if self.requeue(&state_key, &present, missing).await {
                self.start_lane(state_key);
            }
        }

        if queued > 0 {
            info!(destination = %self.destination(), queued, "Reconcile queued missing versions");
        }
        Ok(queued)
    }

    /// Copy one version, retrying with backoff up to `max_attempts`.
    ///
    /// On exhaustion the returned job is `Failed` and an alert has been raised.
    pub async fn replicate(&self, version: VersionMeta) -> ReplicationJob {
        let mut job = ReplicationJob::new(version, self.destination());
        job.status = JobStatus::Running;

        let attempts = AtomicU32::new(0);
        let backoff = self.backoff();

        let counter = &attempts;
        let version = &job.version;
        let result = (|| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            self.copy_once(version).await
        })
        .retry(backoff)
        .when(|e: &ReplicationError| e.is_retryable())
        .notify(|e, delay| {
            self.inner.retries.fetch_add(1, Ordering::Relaxed);
            #[cfg(feature = "otel")]
            {
                use crate::utils::metrics::{self, REPLICATION_RETRY_TOTAL};
                REPLICATION_RETRY_TOTAL.add(1, &[metrics::destination_attr(&job.destination)]);
            }
            warn!(
                object_key = %job.version.object_key(),
                destination = %job.destination,
                error = %e,
                ?delay,
                "Replica copy failed, retrying"
            );
        })
        .await;

        job.attempts = attempts.load(Ordering::SeqCst);
        match result {
            Ok(()) => {
                job.status = JobStatus::Completed;
                self.inner.completed.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "otel")]
                {
                    use crate::utils::metrics::{self, REPLICATION_JOBS_TOTAL};
                    REPLICATION_JOBS_TOTAL.add(1, &[
                        metrics::destination_attr(&job.destination),
                        metrics::outcome_attr("completed"),
                    ]);
                }
                debug!(
                    object_key = %job.version.object_key(),
                    attempts = job.attempts,
                    "Replicated version"
                );
            }
            Err(e) => self.record_failure(&mut job, &e).await,
        }
        job
    }

    /// Jobs that exhausted their retries since the agent started.
    pub async fn failed_jobs(&self) -> Vec<ReplicationJob> {
        self.inner.failed_jobs.read().await.clone()
    }

    pub async fn stats(&self) -> ReplicationStats {
        let lanes = self.inner.lanes.lock().await;
        let mut stalled_keys: Vec<_> = lanes
            .iter()
            .filter(|(_, lane)| lane.stalled)
            .map(|(key, _)| key.clone())
            .collect();
        stalled_keys.sort();
        ReplicationStats {
            completed: self.inner.completed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            retries: self.inner.retries.load(Ordering::Relaxed),
            pending: lanes.values().map(|lane| lane.queue.len()).sum(),
            stalled_keys,
        }
    }

    pub async fn progress(&self, state_key: &str) -> Result<ReplicationProgress, ReplicationError> {
        let primary_head = self
            .inner
            .source
            .head(state_key)
            .await?
            .map(|meta| meta.version_id);
        let replicated = replicated_through(&self.replicated_set(state_key).await?);

        let lanes = self.inner.lanes.lock().await;
        let lane = lanes.get(state_key);
        Ok(ReplicationProgress {
            state_key: state_key.to_string(),
            primary_head,
            replicated,
            pending: lane.map(|l| l.queue.len()).unwrap_or(0),
            stalled: lane.is_some_and(|l| l.stalled),
        })
    }

    fn backoff(&self) -> ExponentialBuilder {
        let config = &self.inner.config;
        replication_backoff(
            config.min_delay(),
            config.max_delay(),
            config.max_attempts.max(1),
            config.jitter,
        )
    }

    async fn copy_once(&self, version: &VersionMeta) -> Result<(), ReplicationError> {
        if let Some(previous) = version.version_id.previous() {
            if !self
                .inner
                .destination
                .has_replica(&version.state_key, previous)
                .await?
            {
                return Err(ReplicationError::PredecessorMissing {
                    object_key: version.object_key(),
                    missing: previous,
                });
            }
        }

        let record = self
            .inner
            .source
            .get(&version.state_key, version.version_id)
            .await?
            .ok_or_else(|| ReplicationError::SourceMissing(version.object_key()))?;
        if !record.is_intact() || record.meta.content_hash != version.content_hash {
            return Err(ReplicationError::SourceCorrupt(version.object_key()));
        }
        self.inner.destination.put_replica(&record).await?;
        Ok(())
    }

    async fn replicated_set(&self, state_key: &str) -> Result<BTreeSet<VersionId>, ReplicationError> {
        Ok(self
            .inner
            .destination
            .list_replicated(state_key)
            .await?
            .into_iter()
            .collect())
    }

    /// Primary versions absent from `present`, oldest first, stopping before `below`.
    async fn scan_missing(
        &self,
        state_key: &str,
        present: &BTreeSet<VersionId>,
        below: Option<VersionId>,
    ) -> Result<Vec<VersionMeta>, ReplicationError> {
        let mut missing = Vec::new();
        let mut after = replicated_through(present);
        loop {
            let page = self
                .inner
                .source
                .list(state_key, after, RECONCILE_PAGE)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.version_id);
            let full = page.len() == RECONCILE_PAGE;
            for meta in page {
                if below.is_some_and(|below| meta.version_id >= below) {
                    return Ok(missing);
                }
                if !present.contains(&meta.version_id) {
                    missing.push(meta);
                }
            }
            if !full {
                break;
            }
        }
        Ok(missing)
    }

    /// Queue the versions below `version` that the destination lacks.
    ///
    /// Returns how many were added to the lane.
    async fn queue_predecessors(&self, version: &VersionMeta) -> Result<usize, ReplicationError> {
        let Some(previous) = version.version_id.previous() else {
            return Ok(0);
        };
        if self
            .inner
            .destination
            .has_replica(&version.state_key, previous)
            .await?
        {
            return Ok(0);
        }

        let present = self.replicated_set(&version.state_key).await?;
        let missing = self
            .scan_missing(&version.state_key, &present, Some(version.version_id))
            .await?;

        let mut lanes = self.inner.lanes.lock().await;
        let lane = lanes.entry(version.state_key.clone()).or_default();
        let mut queued = 0;
        for meta in missing {
            if let Entry::Vacant(slot) = lane.queue.entry(meta.version_id) {
                slot.insert(meta);
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Merge reconcile results into a lane and clear its stall.
    ///
    /// Returns whether the caller must start the lane.
    async fn requeue(
        &self,
        state_key: &str,
        present: &BTreeSet<VersionId>,
        missing: Vec<VersionMeta>,
    ) -> bool {
        let mut lanes = self.inner.lanes.lock().await;
        if missing.is_empty() && !lanes.contains_key(state_key) {
            return false;
        }

        let lane = lanes.entry(state_key.to_string()).or_default();
        if lane.stalled && missing.is_empty() {
            info!(state_key = %state_key, "Replica caught up; lane un-stalled");
        }
        lane.stalled = false;
        lane.queue.retain(|version, _| !present.contains(version));
        for meta in missing {
            lane.queue.insert(meta.version_id, meta);
        }
        let start = self.claim_lane(lane);
        Self::prune_lane(&mut lanes, state_key);
        start
    }

    /// Drop a lane that has nothing left to track.
    fn prune_lane(lanes: &mut HashMap<String, Lane>, state_key: &str) {
        if lanes
            .get(state_key)
            .is_some_and(|lane| !lane.running && !lane.stalled && lane.queue.is_empty())
        {
            lanes.remove(state_key);
        }
    }

    async fn record_failure(&self, job: &mut ReplicationJob, e: &ReplicationError) {
        job.status = JobStatus::Failed;
        job.last_error = Some(e.to_string());
        self.inner.failed.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "otel")]
        {
            use crate::utils::metrics::{self, REPLICATION_JOBS_TOTAL};
            REPLICATION_JOBS_TOTAL.add(1, &[
                metrics::destination_attr(&job.destination),
                metrics::outcome_attr("failed"),
            ]);
        }
        error!(
            object_key = %job.version.object_key(),
            destination = %job.destination,
            attempts = job.attempts,
            error = %e,
            "Replication job failed"
        );
        self.raise_failure(job, e).await;
        self.inner.failed_jobs.write().await.push(job.clone());
    }

    async fn raise_failure(&self, job: &ReplicationJob, e: &ReplicationError) {
        let alert = ReplicationAlert::new(
            AlertKind::ReplicationFailed,
            job.version.state_key.clone(),
            job.destination.clone(),
            e.to_string(),
        )
        .with_version(job.version.version_id)
        .with_attempts(job.attempts);

        if let Err(alert_err) = self.inner.alerts.raise(alert).await {
            error!(
                object_key = %job.version.object_key(),
                error = %alert_err,
                "Failed to raise replication alert"
            );
        }
    }

    /// Mark the lane running if it has work and nobody is driving it.
    fn claim_lane(&self, lane: &mut Lane) -> bool {
        if lane.running || lane.stalled || lane.queue.is_empty() {
            return false;
        }
        lane.running = true;
        self.inner.active_lanes.send_modify(|count| *count += 1);
        true
    }

    fn start_lane(&self, state_key: String) {
        let agent = self.clone();
        tokio::spawn(async move { agent.drive_lane(state_key).await });
    }

    async fn drive_lane(&self, state_key: String) {
        loop {
            let next = {
                let mut lanes = self.inner.lanes.lock().await;
                let next = lanes.get_mut(&state_key).and_then(|lane| {
                    let next = match lane.queue.first_key_value() {
                        Some((_, version)) if !lane.stalled => Some(version.clone()),
                        _ => None,
                    };
                    if next.is_none() {
                        lane.running = false;
                    }
                    next
                });
                if next.is_none() {
                    Self::prune_lane(&mut lanes, &state_key);
                }
                next
            };
            let Some(version) = next else {
                break;
            };

            let backfill = (|| self.queue_predecessors(&version))
                .retry(self.backoff())
                .when(ReplicationError::is_retryable)
                .await;
            let job = match backfill {
                Ok(0) => match self.inner.workers.acquire().await {
                    Ok(_permit) => self.replicate(version.clone()).await,
                    Err(_) => break,
                },
                Ok(queued) => {
                    info!(
                        state_key = %state_key,
                        version = %version.version_id,
                        queued,
                        "Queued missing predecessors"
                    );
                    continue;
                }
                Err(e) => {
                    let mut job = ReplicationJob::new(version.clone(), self.destination());
                    self.record_failure(&mut job, &e).await;
                    job
                }
            };

            let mut lanes = self.inner.lanes.lock().await;
            let lane = lanes.entry(state_key.clone()).or_default();
            if job.status == JobStatus::Completed {
                // Only drop the entry we copied; reconcile may have replaced it.
                if lane.queue.get(&version.version_id) == Some(&version) {
                    lane.queue.remove(&version.version_id);
                }
            } else {
                warn!(state_key = %state_key, version = %version.version_id, "Lane stalled");
                lane.stalled = true;
                lane.running = false;
                break;
            }
        }
        self.inner.active_lanes.send_modify(|count| *count = count.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests;
