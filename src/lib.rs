//! Stateward - self-hosted remote state backend
//!
//! Stores infrastructure state as immutable, encrypted, versioned blobs
//! behind a compare-and-swap head, serializes writers with fenced leases and
//! replicates every committed version to a backup destination.
//!
//! ## Components
//!
//! - [`StateStore`]: `put`, `get` and paginated `list_versions`
//! - [`LockManager`]: `acquire`, `release`, `renew`, `validate` with fencing tokens
//! - [`ReplicationAgent`]: per-key FIFO replication with bounded retries and alerts
//! - [`StateBackend`]: all of the above wired from a [`Config`](config::Config)

pub mod backend;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod lock;
pub mod model;
pub mod replication;
pub mod state_store;
pub mod storage;
pub mod test_utils;
pub mod utils;

pub use backend::{BackendError, StateBackend};
pub use error::{Result, StateError};
pub use lock::LockManager;
pub use model::{CommitEvent, FencingToken, LockRecord, StateVersion, VersionId, VersionMeta};
pub use replication::{JobStatus, ReplicationAgent, ReplicationJob};
pub use state_store::{StateStore, VersionPage};
