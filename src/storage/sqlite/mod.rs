//! SQLite implementations of storage interfaces.
//!
//! Both stores share one pool. Timestamps are stored as RFC 3339 text with
//! microsecond precision; unsigned counters as signed 64-bit integers.

mod lock_table;
mod version_store;

pub use lock_table::SqliteLockTable;
pub use version_store::SqliteVersionStore;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::storage::{Result, StorageError};

fn encode_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("bad timestamp {:?}: {}", raw, e)))
}

fn encode_u64(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| StorageError::Corrupt(format!("value {} exceeds INTEGER range", value)))
}

fn decode_u64(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| StorageError::Corrupt(format!("negative counter {}", value)))
}
