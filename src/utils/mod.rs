//! Shared helpers: tracing bootstrap, backoff policies, deadlines, metrics.

pub mod bootstrap;
pub mod deadline;
#[cfg(feature = "otel")]
pub mod metrics;
pub mod retry;
