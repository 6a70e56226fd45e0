//! LockTable interface tests.
//!
//! These tests verify the contract of the LockTable trait: a conditional
//! write keyed on the row revision. Each storage implementation should run
//! these tests.

use chrono::{Duration, SubsecRound, Utc};

use stateward::model::LockEntry;
use stateward::storage::LockTable;

/// Timestamps at millisecond precision, the coarsest any backend stores.
fn entry(key: &str, holder: Option<&str>, token: u64, revision: u64) -> LockEntry {
    let now = Utc::now().trunc_subsecs(3);
    LockEntry {
        state_key: key.to_string(),
        holder_id: holder.map(str::to_string),
        acquired_at: holder.map(|_| now),
        expires_at: holder.map(|_| now + Duration::seconds(30)),
        fencing_token: token,
        revision,
    }
}

// =============================================================================
// LockTable::load tests
// =============================================================================

pub async fn test_load_missing<S: LockTable>(table: &S) {
    assert!(table.load("locks/missing").await.unwrap().is_none());
}

// =============================================================================
// LockTable::put_if tests
// =============================================================================

pub async fn test_create_and_load<S: LockTable>(table: &S) {
    let key = "locks/create";
    let row = entry(key, Some("runner-1"), 1, 1);
    assert!(table.put_if(row.clone(), None).await.unwrap());

    let loaded = table.load(key).await.unwrap().expect("row should exist");
    assert_eq!(loaded, row);
}

pub async fn test_create_only_once<S: LockTable>(table: &S) {
    let key = "locks/create-once";
    assert!(table.put_if(entry(key, Some("a"), 1, 1), None).await.unwrap());
    assert!(
        !table.put_if(entry(key, Some("b"), 1, 1), None).await.unwrap(),
        "creating an existing row should fail"
    );
    assert_eq!(
        table.load(key).await.unwrap().unwrap().holder_id.as_deref(),
        Some("a")
    );
}

pub async fn test_update_requires_current_revision<S: LockTable>(table: &S) {
    let key = "locks/revision";
    assert!(table.put_if(entry(key, Some("a"), 1, 1), None).await.unwrap());
    assert!(table
        .put_if(entry(key, Some("b"), 2, 2), Some(1))
        .await
        .unwrap());

    assert!(
        !table
            .put_if(entry(key, Some("c"), 3, 2), Some(1))
            .await
            .unwrap(),
        "stale revision should fail"
    );
    let loaded = table.load(key).await.unwrap().unwrap();
    assert_eq!(loaded.holder_id.as_deref(), Some("b"));
    assert_eq!(loaded.fencing_token, 2);
    assert_eq!(loaded.revision, 2);
}

pub async fn test_update_missing_row_fails<S: LockTable>(table: &S) {
    assert!(!table
        .put_if(entry("locks/absent", Some("a"), 1, 2), Some(1))
        .await
        .unwrap());
    assert!(table.load("locks/absent").await.unwrap().is_none());
}

pub async fn test_released_row_keeps_token<S: LockTable>(table: &S) {
    let key = "locks/released";
    assert!(table.put_if(entry(key, Some("a"), 9, 1), None).await.unwrap());
    assert!(table.put_if(entry(key, None, 9, 2), Some(1)).await.unwrap());

    let loaded = table.load(key).await.unwrap().unwrap();
    assert!(loaded.holder_id.is_none());
    assert!(loaded.expires_at.is_none());
    assert_eq!(loaded.fencing_token, 9);
}

pub async fn test_racing_updates_single_winner<S: LockTable>(table: &S) {
    let key = "locks/race";
    assert!(table.put_if(entry(key, None, 0, 1), None).await.unwrap());

    let attempts = (0..8).map(|i| {
        let holder = format!("runner-{}", i);
        table.put_if(entry(key, Some(&holder), 1, 2), Some(1))
    });
    let results = futures::future::join_all(attempts).await;
    let winners = results
        .into_iter()
        .filter(|r| matches!(r, Ok(true)))
        .count();
    assert_eq!(winners, 1, "exactly one conditional write should win");
}

// =============================================================================
// Test runner macro
// =============================================================================

/// Run all LockTable interface tests against a table implementation.
#[macro_export]
macro_rules! run_lock_table_tests {
    ($table:expr) => {
        use $crate::storage::lock_table_tests::*;

        test_load_missing($table).await;
        println!("  test_load_missing: PASSED");

        test_create_and_load($table).await;
        println!("  test_create_and_load: PASSED");

        test_create_only_once($table).await;
        println!("  test_create_only_once: PASSED");

        test_update_requires_current_revision($table).await;
        println!("  test_update_requires_current_revision: PASSED");

        test_update_missing_row_fails($table).await;
        println!("  test_update_missing_row_fails: PASSED");

        test_released_row_keeps_token($table).await;
        println!("  test_released_row_keeps_token: PASSED");

        test_racing_updates_single_winner($table).await;
        println!("  test_racing_updates_single_winner: PASSED");
    };
}
