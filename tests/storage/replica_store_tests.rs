//! ReplicaStore interface tests.
//!
//! These tests verify the contract of the ReplicaStore trait.
//! Each destination implementation should run these tests.

use chrono::SubsecRound;

use stateward::model::VersionRecord;
use stateward::storage::ReplicaStore;
use stateward::test_utils::record;
use stateward::VersionId;

fn replica_record(key: &str, version: u64, ciphertext: &[u8]) -> VersionRecord {
    let mut rec = record(key, version, 1, ciphertext);
    rec.meta.created_at = rec.meta.created_at.trunc_subsecs(6);
    rec
}

pub async fn test_empty_destination<S: ReplicaStore>(store: &S) {
    assert!(store
        .latest_replicated("replica/empty")
        .await
        .unwrap()
        .is_none());
    assert!(store
        .get_replica("replica/empty", VersionId::FIRST)
        .await
        .unwrap()
        .is_none());
}

pub async fn test_put_and_get<S: ReplicaStore>(store: &S) {
    let rec = replica_record("replica/put", 1, b"sealed bytes");
    store.put_replica(&rec).await.unwrap();

    let copy = store
        .get_replica("replica/put", VersionId::FIRST)
        .await
        .unwrap()
        .expect("replica should exist");
    assert_eq!(copy, rec);
    assert!(copy.is_intact());
}

pub async fn test_put_is_idempotent<S: ReplicaStore>(store: &S) {
    let rec = replica_record("replica/idempotent", 1, b"same");
    store.put_replica(&rec).await.unwrap();
    store
        .put_replica(&rec)
        .await
        .expect("re-putting an identical record should succeed");
}

pub async fn test_divergent_put_rejected<S: ReplicaStore>(store: &S) {
    store
        .put_replica(&replica_record("replica/divergent", 1, b"original"))
        .await
        .unwrap();
    assert!(store
        .put_replica(&replica_record("replica/divergent", 1, b"different"))
        .await
        .is_err());

    let copy = store
        .get_replica("replica/divergent", VersionId::FIRST)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(copy.ciphertext, b"original");
}

pub async fn test_latest_replicated<S: ReplicaStore>(store: &S) {
    let key = "replica/latest";
    store.put_replica(&replica_record(key, 2, b"two")).await.unwrap();
    store.put_replica(&replica_record(key, 1, b"one")).await.unwrap();
    store.put_replica(&replica_record(key, 10, b"ten")).await.unwrap();

    let latest = store.latest_replicated(key).await.unwrap().unwrap();
    assert_eq!(latest.version_id, VersionId::new(10));
}

pub async fn test_nested_keys_are_separate<S: ReplicaStore>(store: &S) {
    store
        .put_replica(&replica_record("replica/env", 1, b"parent"))
        .await
        .unwrap();
    store
        .put_replica(&replica_record("replica/env/app", 4, b"child"))
        .await
        .unwrap();

    let parent = store.latest_replicated("replica/env").await.unwrap().unwrap();
    assert_eq!(parent.version_id, VersionId::FIRST);
    let child = store
        .latest_replicated("replica/env/app")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(child.version_id, VersionId::new(4));
}

pub async fn test_list_and_has_replica<S: ReplicaStore>(store: &S) {
    let key = "replica/listing";
    assert!(store.list_replicated(key).await.unwrap().is_empty());
    store.put_replica(&replica_record(key, 3, b"three")).await.unwrap();
    store.put_replica(&replica_record(key, 1, b"one")).await.unwrap();
    store
        .put_replica(&replica_record("replica/listing/nested", 2, b"nested"))
        .await
        .unwrap();

    assert_eq!(
        store.list_replicated(key).await.unwrap(),
        vec![VersionId::FIRST, VersionId::new(3)]
    );
    assert!(store.has_replica(key, VersionId::new(3)).await.unwrap());
    assert!(!store.has_replica(key, VersionId::new(2)).await.unwrap());
}

/// Run all ReplicaStore interface tests against a destination.
#[macro_export]
macro_rules! run_replica_store_tests {
    ($store:expr) => {
        use $crate::storage::replica_store_tests::*;

        test_empty_destination($store).await;
        println!("  test_empty_destination: PASSED");

        test_put_and_get($store).await;
        println!("  test_put_and_get: PASSED");

        test_put_is_idempotent($store).await;
        println!("  test_put_is_idempotent: PASSED");

        test_divergent_put_rejected($store).await;
        println!("  test_divergent_put_rejected: PASSED");

        test_latest_replicated($store).await;
        println!("  test_latest_replicated: PASSED");

        test_nested_keys_are_separate($store).await;
        println!("  test_nested_keys_are_separate: PASSED");

        test_list_and_has_replica($store).await;
        println!("  test_list_and_has_replica: PASSED");
    };
}
