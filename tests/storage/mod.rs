//! Shared storage contract tests.
//!
//! Tests the VersionStore, LockTable and ReplicaStore interfaces against all
//! implementations. Each backend's test binary imports these test functions
//! and runs them.

pub mod lock_table_tests;
pub mod replica_store_tests;
pub mod version_store_tests;
