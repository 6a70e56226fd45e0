use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::*;
use crate::config::ReplicationConfig;
use crate::storage::{MemoryReplicaStore, MemoryVersionStore};
use crate::test_utils::{follows, record};

struct Fixture {
    agent: ReplicationAgent,
    source: Arc<MemoryVersionStore>,
    replica: Arc<MemoryReplicaStore>,
    alerts: mpsc::UnboundedReceiver<ReplicationAlert>,
}

fn config() -> ReplicationConfig {
    ReplicationConfig {
        jitter: false,
        ..ReplicationConfig::default()
    }
}

fn fixture() -> Fixture {
    let source = Arc::new(MemoryVersionStore::new());
    let replica = Arc::new(MemoryReplicaStore::new("backup"));
    let (sink, alerts) = ChannelAlertSink::new();
    let agent = ReplicationAgent::new(source.clone(), replica.clone(), Arc::new(sink), config());
    Fixture {
        agent,
        source,
        replica,
        alerts,
    }
}

async fn commit(fx: &Fixture, key: &str, version: u64) -> VersionMeta {
    let rec = record(key, version, 1, format!("{}-{}", key, version).as_bytes());
    let meta = rec.meta.clone();
    fx.source.commit(rec, follows(version, 1)).await.unwrap();
    meta
}

#[tokio::test(start_paused = true)]
async fn test_replicate_first_try() {
    let fx = fixture();
    let meta = commit(&fx, "dev/db", 1).await;

    let job = fx.agent.replicate(meta.clone()).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.destination, "backup");
    assert!(job.last_error.is_none());

    let copy = fx
        .replica
        .get_replica("dev/db", meta.version_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(copy.meta.content_hash, meta.content_hash);
}

#[tokio::test(start_paused = true)]
async fn test_outage_shorter_than_retry_bound_recovers() {
    let mut fx = fixture();
    let meta = commit(&fx, "prod/network", 1).await;
    fx.replica.fail_next(4);

    let job = fx.agent.replicate(meta).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 5);
    assert_eq!(fx.replica.put_attempts(), 5);
    assert!(fx.alerts.try_recv().is_err());

    let stats = fx.agent.stats().await;
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.retries, 4);
    assert_eq!(stats.failed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fail_and_alert() {
    let mut fx = fixture();
    let meta = commit(&fx, "prod/network", 1).await;
    fx.replica.fail_next(5);

    let job = fx.agent.replicate(meta.clone()).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 5);
    assert!(job.last_error.as_deref().unwrap().contains("unavailable"));
    assert!(fx.replica.replicated_versions("prod/network").await.is_empty());

    let alert = fx.alerts.try_recv().unwrap();
    assert_eq!(alert.kind, AlertKind::ReplicationFailed);
    assert_eq!(alert.state_key, "prod/network");
    assert_eq!(alert.version, Some(meta.version_id));
    assert_eq!(alert.attempts, 5);
    assert_eq!(alert.destination, "backup");

    let failed = fx.agent.failed_jobs().await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].version, meta);
}

#[tokio::test(start_paused = true)]
async fn test_retry_delays_back_off() {
    let fx = fixture();
    let meta = commit(&fx, "dev/db", 1).await;
    fx.replica.fail_next(3);

    let started = tokio::time::Instant::now();
    let job = fx.agent.replicate(meta).await;
    assert_eq!(job.status, JobStatus::Completed);
    // 200ms + 400ms + 800ms
    assert!(started.elapsed() >= Duration::from_millis(1400));
}

#[tokio::test(start_paused = true)]
async fn test_missing_source_is_not_retried() {
    let mut fx = fixture();
    let meta = record("dev/db", 1, 1, b"never committed").meta;

    let job = fx.agent.replicate(meta).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(fx.replica.put_attempts(), 0);
    assert_eq!(fx.alerts.try_recv().unwrap().kind, AlertKind::ReplicationFailed);
}

#[tokio::test(start_paused = true)]
async fn test_corrupt_source_is_not_replicated() {
    let fx = fixture();
    let meta = commit(&fx, "dev/db", 1).await;
    assert!(fx.source.tamper("dev/db", meta.version_id).await);

    let job = fx.agent.replicate(meta).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.unwrap().contains("integrity"));
    assert_eq!(fx.replica.put_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_replicates_in_commit_order() {
    let fx = fixture();
    let (tx, rx) = commit_channel();
    let handle = fx.agent.spawn(rx);

    for version in 1..=3 {
        let meta = commit(&fx, "dev/db", version).await;
        tx.send(CommitEvent { version: meta }).unwrap();
    }
    let other = commit(&fx, "prod/network", 1).await;
    tx.send(CommitEvent { version: other }).unwrap();
    drop(tx);
    handle.await.unwrap();

    assert_eq!(
        fx.replica.replicated_versions("dev/db").await,
        vec![VersionId::new(1), VersionId::new(2), VersionId::new(3)]
    );
    assert_eq!(
        fx.replica.replicated_versions("prod/network").await,
        vec![VersionId::FIRST]
    );
    let stats = fx.agent.stats().await;
    assert_eq!(stats.completed, 4);
    assert_eq!(stats.pending, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_job_stalls_lane_until_reconcile() {
    let mut fx = fixture();
    fx.replica.fail_next(5);
    let v1 = commit(&fx, "dev/db", 1).await;
    let v2 = commit(&fx, "dev/db", 2).await;

    fx.agent.enqueue(v1).await;
    fx.agent.enqueue(v2).await;
    fx.agent.drain().await;

    assert!(fx.replica.replicated_versions("dev/db").await.is_empty());
    let stats = fx.agent.stats().await;
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.stalled_keys, vec!["dev/db".to_string()]);
    assert_eq!(fx.alerts.try_recv().unwrap().version, Some(VersionId::FIRST));

    let progress = fx.agent.progress("dev/db").await.unwrap();
    assert!(progress.stalled);
    assert_eq!(progress.primary_head, Some(VersionId::new(2)));
    assert_eq!(progress.replicated, None);

    let queued = fx.agent.reconcile().await.unwrap();
    assert_eq!(queued, 2);
    fx.agent.drain().await;

    assert_eq!(
        fx.replica.replicated_versions("dev/db").await,
        vec![VersionId::new(1), VersionId::new(2)]
    );
    let stats = fx.agent.stats().await;
    assert!(stats.stalled_keys.is_empty());
    assert_eq!(stats.pending, 0);
}

#[tokio::test(start_paused = true)]
async fn test_other_keys_keep_flowing_while_one_is_stalled() {
    let fx = fixture();
    fx.replica.fail_next(5);
    let stalled = commit(&fx, "dev/db", 1).await;
    fx.agent.enqueue(stalled).await;
    fx.agent.drain().await;

    let healthy = commit(&fx, "prod/network", 1).await;
    fx.agent.enqueue(healthy).await;
    fx.agent.drain().await;

    assert_eq!(
        fx.replica.replicated_versions("prod/network").await,
        vec![VersionId::FIRST]
    );
    assert_eq!(fx.agent.stats().await.stalled_keys, vec!["dev/db".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_recovers_after_restart() {
    let fx = fixture();
    let v1 = commit(&fx, "dev/db", 1).await;
    commit(&fx, "dev/db", 2).await;
    commit(&fx, "dev/db", 3).await;
    commit(&fx, "prod/network", 1).await;

    let stored = fx.source.get("dev/db", v1.version_id).await.unwrap().unwrap();
    fx.replica.put_replica(&stored).await.unwrap();

    let queued = fx.agent.reconcile().await.unwrap();
    assert_eq!(queued, 3);
    fx.agent.drain().await;

    assert_eq!(
        fx.replica.replicated_versions("dev/db").await,
        vec![VersionId::new(1), VersionId::new(2), VersionId::new(3)]
    );
    assert_eq!(fx.agent.reconcile().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_enqueue_is_idempotent() {
    let fx = fixture();
    let meta = commit(&fx, "dev/db", 1).await;
    fx.agent.enqueue(meta.clone()).await;
    fx.agent.enqueue(meta).await;
    fx.agent.drain().await;

    assert_eq!(
        fx.replica.replicated_versions("dev/db").await,
        vec![VersionId::FIRST]
    );
    assert_eq!(fx.agent.stats().await.pending, 0);
}

fn versions(range: std::ops::RangeInclusive<u64>) -> Vec<VersionId> {
    range.map(VersionId::new).collect()
}

#[tokio::test(start_paused = true)]
async fn test_lost_commit_event_is_backfilled() {
    let fx = fixture();
    commit(&fx, "dev/db", 1).await;
    let v2 = commit(&fx, "dev/db", 2).await;

    fx.agent.enqueue(v2).await;
    fx.agent.drain().await;

    assert_eq!(fx.replica.replicated_versions("dev/db").await, versions(1..=2));
    assert_eq!(fx.agent.stats().await.completed, 2);
    assert_eq!(fx.agent.reconcile().await.unwrap(), 0);

    let report = BackupValidator::new(fx.source.clone(), fx.replica.clone(), Arc::new(LogAlertSink))
        .validate()
        .await
        .unwrap();
    assert!(report.is_healthy());
}

#[tokio::test(start_paused = true)]
async fn test_copy_without_predecessor_is_refused() {
    let mut fx = fixture();
    commit(&fx, "dev/db", 1).await;
    let v2 = commit(&fx, "dev/db", 2).await;

    let job = fx.agent.replicate(v2).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    let reason = job.last_error.unwrap();
    assert!(reason.contains("predecessor"));
    assert!(reason.contains(&VersionId::FIRST.to_string()));
    assert_eq!(fx.replica.put_attempts(), 0);
    assert_eq!(fx.alerts.try_recv().unwrap().version, Some(VersionId::new(2)));
}

#[tokio::test(start_paused = true)]
async fn test_late_events_do_not_leave_holes() {
    let fx = fixture();
    let v1 = commit(&fx, "dev/db", 1).await;
    let v2 = commit(&fx, "dev/db", 2).await;
    let v3 = commit(&fx, "dev/db", 3).await;

    fx.agent.enqueue(v3).await;
    fx.agent.drain().await;
    fx.agent.enqueue(v1).await;
    fx.agent.enqueue(v2).await;
    fx.agent.drain().await;

    assert_eq!(fx.replica.replicated_versions("dev/db").await, versions(1..=3));
    let stats = fx.agent.stats().await;
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.pending, 0);
}

#[tokio::test(start_paused = true)]
async fn test_any_event_order_yields_a_prefix() {
    let orders: [[u64; 4]; 6] = [
        [1, 2, 3, 4],
        [4, 3, 2, 1],
        [2, 4, 1, 3],
        [3, 1, 4, 2],
        [4, 1, 2, 3],
        [2, 3, 4, 1],
    ];
    for order in orders {
        let fx = fixture();
        let mut metas = Vec::new();
        for version in 1..=4 {
            metas.push(commit(&fx, "dev/db", version).await);
        }
        for version in order {
            fx.agent.enqueue(metas[version as usize - 1].clone()).await;
            // Let the lane make partial progress between events.
            tokio::task::yield_now().await;
        }
        fx.agent.drain().await;

        assert_eq!(
            fx.replica.replicated_versions("dev/db").await,
            versions(1..=4),
            "order {:?}",
            order
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_fills_holes_below_newest_replica() {
    let fx = fixture();
    commit(&fx, "dev/db", 1).await;
    let v2 = commit(&fx, "dev/db", 2).await;
    commit(&fx, "dev/db", 3).await;

    let stored = fx.source.get("dev/db", v2.version_id).await.unwrap().unwrap();
    fx.replica.put_replica(&stored).await.unwrap();
    let progress = fx.agent.progress("dev/db").await.unwrap();
    assert_eq!(progress.replicated, None);

    assert_eq!(fx.agent.reconcile().await.unwrap(), 2);
    fx.agent.drain().await;

    assert_eq!(fx.replica.replicated_versions("dev/db").await, versions(1..=3));
    let progress = fx.agent.progress("dev/db").await.unwrap();
    assert_eq!(progress.replicated, Some(VersionId::new(3)));
}

#[tokio::test(start_paused = true)]
async fn test_idle_lanes_are_released() {
    let fx = fixture();
    for key in ["dev/db", "prod/network", "prod/dns"] {
        let meta = commit(&fx, key, 1).await;
        fx.agent.enqueue(meta).await;
    }
    fx.agent.drain().await;

    assert!(fx.agent.inner.lanes.lock().await.is_empty());
    assert_eq!(fx.agent.reconcile().await.unwrap(), 0);
    assert!(fx.agent.inner.lanes.lock().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_lane_is_kept_until_reconcile() {
    let fx = fixture();
    fx.replica.fail_next(5);
    let meta = commit(&fx, "dev/db", 1).await;
    fx.agent.enqueue(meta).await;
    fx.agent.drain().await;
    assert!(fx.agent.inner.lanes.lock().await.contains_key("dev/db"));

    fx.agent.reconcile().await.unwrap();
    fx.agent.drain().await;
    assert!(fx.agent.inner.lanes.lock().await.is_empty());
}

#[test]
fn test_replicated_through_stops_at_first_hole() {
    let set = |ids: &[u64]| ids.iter().copied().map(VersionId::new).collect::<BTreeSet<_>>();
    assert_eq!(replicated_through(&set(&[])), None);
    assert_eq!(replicated_through(&set(&[2, 3])), None);
    assert_eq!(replicated_through(&set(&[1, 2, 4])), Some(VersionId::new(2)));
    assert_eq!(replicated_through(&set(&[1, 2, 3])), Some(VersionId::new(3)));
}

#[test]
fn test_error_classification() {
    assert!(ReplicationError::Storage(StorageError::Unavailable("down".to_string())).is_retryable());
    assert!(!ReplicationError::SourceMissing("dev/db/1".to_string()).is_retryable());
    assert!(!ReplicationError::SourceCorrupt("dev/db/1".to_string()).is_retryable());
    assert!(!ReplicationError::PredecessorMissing {
        object_key: crate::model::object_key("dev/db", VersionId::new(2)),
        missing: VersionId::FIRST,
    }
    .is_retryable());
}
