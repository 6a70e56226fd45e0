//! VersionStore interface tests.
//!
//! These tests verify the contract of the VersionStore trait.
//! Each storage implementation should run these tests.
//!
//! Stores are shared across tests, so every test uses its own keys.

use stateward::storage::{CommitPrecondition, StorageError, VersionStore};
use stateward::test_utils::{follows, record};
use stateward::VersionId;

async fn commit_n<S: VersionStore>(store: &S, key: &str, count: u64) {
    for version in 1..=count {
        store
            .commit(
                record(key, version, 1, format!("{}-{}", key, version).as_bytes()),
                follows(version, 1),
            )
            .await
            .expect("commit should succeed");
    }
}

// =============================================================================
// Empty key
// =============================================================================

pub async fn test_empty_key<S: VersionStore>(store: &S) {
    let key = "contract/empty";
    assert!(store.head(key).await.unwrap().is_none());
    assert!(store.get(key, VersionId::FIRST).await.unwrap().is_none());
    assert!(store.list(key, None, 10).await.unwrap().is_empty());
}

// =============================================================================
// VersionStore::commit tests
// =============================================================================

pub async fn test_commit_and_get<S: VersionStore>(store: &S) {
    let key = "contract/commit";
    let rec = record(key, 1, 7, b"first version");
    store.commit(rec.clone(), follows(1, 7)).await.unwrap();

    let head = store.head(key).await.unwrap().expect("head should exist");
    assert_eq!(head.version_id, VersionId::FIRST);
    assert_eq!(head.fencing_token, 7);
    assert_eq!(head.content_hash, rec.meta.content_hash);
    assert_eq!(head.size, rec.ciphertext.len() as u64);

    let stored = store.get(key, VersionId::FIRST).await.unwrap().unwrap();
    assert_eq!(stored.ciphertext, b"first version");
    assert_eq!(stored.meta.encryption_key_id, "test-key");
    assert!(stored.is_intact());
}

pub async fn test_commit_rejects_moved_head<S: VersionStore>(store: &S) {
    let key = "contract/moved";
    store
        .commit(record(key, 1, 1, b"winner"), follows(1, 1))
        .await
        .unwrap();

    let result = store
        .commit(record(key, 1, 1, b"loser"), follows(1, 1))
        .await;
    assert!(
        matches!(result, Err(StorageError::PreconditionFailed { .. })),
        "second commit on the same head should fail, got {:?}",
        result
    );

    let stored = store.get(key, VersionId::FIRST).await.unwrap().unwrap();
    assert_eq!(stored.ciphertext, b"winner", "loser must not overwrite");
    assert_eq!(store.list(key, None, 10).await.unwrap().len(), 1);
}

pub async fn test_commit_rejects_older_fencing_token<S: VersionStore>(store: &S) {
    let key = "contract/fenced";
    store
        .commit(record(key, 1, 5, b"new holder"), follows(1, 5))
        .await
        .unwrap();

    let result = store
        .commit(record(key, 2, 4, b"stale holder"), follows(2, 4))
        .await;
    assert!(matches!(result, Err(StorageError::PreconditionFailed { .. })));
    assert_eq!(
        store.head(key).await.unwrap().unwrap().version_id,
        VersionId::FIRST
    );
}

pub async fn test_commit_rejects_version_gap<S: VersionStore>(store: &S) {
    let key = "contract/gap";
    commit_n(store, key, 1).await;

    let precondition = CommitPrecondition {
        expected_head: Some(VersionId::FIRST),
        fencing_token: 1,
    };
    let result = store.commit(record(key, 3, 1, b"skip"), precondition).await;
    assert!(matches!(result, Err(StorageError::PreconditionFailed { .. })));
}

pub async fn test_concurrent_commits_single_winner<S: VersionStore>(store: &S) {
    let key = "contract/race";
    let attempts = (0..8).map(|i| {
        store.commit(
            record(key, 1, 1, format!("writer-{}", i).as_bytes()),
            follows(1, 1),
        )
    });
    let results = futures::future::join_all(attempts).await;

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one racing commit should win");
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, StorageError::PreconditionFailed { .. })));
}

pub async fn test_large_payload<S: VersionStore>(store: &S) {
    let key = "contract/large";
    let payload: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    store
        .commit(record(key, 1, 1, &payload), follows(1, 1))
        .await
        .unwrap();

    let stored = store.get(key, VersionId::FIRST).await.unwrap().unwrap();
    assert_eq!(stored.ciphertext.len(), payload.len());
    assert!(stored.is_intact());
}

// =============================================================================
// VersionStore::list tests
// =============================================================================

pub async fn test_list_pages_oldest_first<S: VersionStore>(store: &S) {
    let key = "contract/pages";
    commit_n(store, key, 5).await;

    let ids = |page: Vec<stateward::VersionMeta>| -> Vec<u64> {
        page.iter().map(|m| m.version_id.sequence()).collect()
    };

    assert_eq!(ids(store.list(key, None, 2).await.unwrap()), vec![1, 2]);
    assert_eq!(
        ids(store.list(key, Some(VersionId::new(2)), 2).await.unwrap()),
        vec![3, 4]
    );
    assert_eq!(
        ids(store.list(key, Some(VersionId::new(4)), 2).await.unwrap()),
        vec![5]
    );
    assert!(store
        .list(key, Some(VersionId::new(5)), 2)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        store.head(key).await.unwrap().unwrap().version_id,
        VersionId::new(5)
    );
}

pub async fn test_key_isolation<S: VersionStore>(store: &S) {
    commit_n(store, "contract/iso", 2).await;
    commit_n(store, "contract/iso2", 1).await;
    commit_n(store, "contract/iso/nested", 3).await;

    assert_eq!(store.list("contract/iso", None, 10).await.unwrap().len(), 2);
    assert_eq!(store.list("contract/iso2", None, 10).await.unwrap().len(), 1);
    assert_eq!(
        store
            .head("contract/iso/nested")
            .await
            .unwrap()
            .unwrap()
            .version_id,
        VersionId::new(3)
    );
}

pub async fn test_list_keys<S: VersionStore>(store: &S) {
    commit_n(store, "contract/keys/a", 1).await;
    commit_n(store, "contract/keys/b", 2).await;

    let keys = store.list_keys().await.unwrap();
    assert!(keys.contains(&"contract/keys/a".to_string()));
    assert!(keys.contains(&"contract/keys/b".to_string()));
    assert!(!keys.contains(&"contract/empty".to_string()));
    let unique: std::collections::HashSet<_> = keys.iter().collect();
    assert_eq!(unique.len(), keys.len(), "keys should not repeat");
}

// =============================================================================
// Test runner macro
// =============================================================================

/// Run all VersionStore interface tests against a store implementation.
#[macro_export]
macro_rules! run_version_store_tests {
    ($store:expr) => {
        use $crate::storage::version_store_tests::*;

        test_empty_key($store).await;
        println!("  test_empty_key: PASSED");

        // commit tests
        test_commit_and_get($store).await;
        println!("  test_commit_and_get: PASSED");

        test_commit_rejects_moved_head($store).await;
        println!("  test_commit_rejects_moved_head: PASSED");

        test_commit_rejects_older_fencing_token($store).await;
        println!("  test_commit_rejects_older_fencing_token: PASSED");

        test_commit_rejects_version_gap($store).await;
        println!("  test_commit_rejects_version_gap: PASSED");

        test_concurrent_commits_single_winner($store).await;
        println!("  test_concurrent_commits_single_winner: PASSED");

        test_large_payload($store).await;
        println!("  test_large_payload: PASSED");

        // list tests
        test_list_pages_oldest_first($store).await;
        println!("  test_list_pages_oldest_first: PASSED");

        test_key_isolation($store).await;
        println!("  test_key_isolation: PASSED");

        test_list_keys($store).await;
        println!("  test_list_keys: PASSED");
    };
}
