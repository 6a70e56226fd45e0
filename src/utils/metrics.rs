//! OTel-native metrics instruments.
//!
//! Centralized metric definitions using OpenTelemetry meters.
//! All instruments are lazily initialized and feature-gated behind `otel`.
//!
//! Naming follows OTel semantic conventions (dot-separated).
//! The OTel Collector / Prometheus exporter converts dots to underscores.

use std::sync::LazyLock;

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::{global, KeyValue};

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("stateward"));

// ============================================================================
// Replication
// ============================================================================

/// Replication jobs by final outcome (completed, failed).
pub static REPLICATION_JOBS_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("stateward.replication.jobs.total")
        .with_description("Replication jobs by final outcome")
        .build()
});

/// Replica copy retries after a transient failure.
pub static REPLICATION_RETRY_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("stateward.replication.retry.total")
        .with_description("Total replica copy retries")
        .build()
});

// ============================================================================
// Backup Validation
// ============================================================================

/// Age of the oldest unreplicated version per key; zero when caught up.
pub static BACKUP_LAG: LazyLock<Gauge<f64>> = LazyLock::new(|| {
    METER
        .f64_gauge("stateward.backup.lag")
        .with_description("Age of the oldest unreplicated version")
        .with_unit("s")
        .build()
});

/// Age of the oldest replicated version per key.
pub static BACKUP_RETENTION: LazyLock<Gauge<f64>> = LazyLock::new(|| {
    METER
        .f64_gauge("stateward.backup.retention")
        .with_description("Age of the oldest replicated version")
        .with_unit("s")
        .build()
});

/// Issues found by backup validation runs.
pub static BACKUP_ISSUES_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("stateward.backup.issues.total")
        .with_description("Backup validation issues by kind")
        .build()
});

// ============================================================================
// Helper
// ============================================================================

/// Create a state_key label.
pub fn state_key_attr(state_key: &str) -> KeyValue {
    KeyValue::new("state_key", state_key.to_string())
}

/// Create a destination label.
pub fn destination_attr(destination: &str) -> KeyValue {
    KeyValue::new("destination", destination.to_string())
}

/// Create an outcome label.
pub fn outcome_attr(outcome: &str) -> KeyValue {
    KeyValue::new("outcome", outcome.to_string())
}

/// Create an issue kind label.
pub fn kind_attr(kind: &str) -> KeyValue {
    KeyValue::new("kind", kind.to_string())
}
