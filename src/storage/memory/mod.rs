//! In-memory storage implementations.
//!
//! Used by tests and by embedders that don't need durability. Each store
//! carries failure-injection hooks for exercising error paths.

mod lock_table;
mod replica_store;
mod version_store;

pub use lock_table::MemoryLockTable;
pub use replica_store::MemoryReplicaStore;
pub use version_store::MemoryVersionStore;
