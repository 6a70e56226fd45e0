//! Bootstrap utilities for stateward binaries.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing with STATEWARD_LOG environment variable.
///
/// Defaults to "info" level if STATEWARD_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("STATEWARD_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Install an OTLP meter provider as the global provider.
///
/// The collector endpoint comes from the standard `OTEL_EXPORTER_OTLP_*`
/// environment variables. Returns `None` (metrics stay no-ops) if the
/// exporter can't be built.
#[cfg(feature = "otel")]
pub fn init_metrics() -> Option<opentelemetry_sdk::metrics::SdkMeterProvider> {
    use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};

    let exporter = match opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .build()
    {
        Ok(exporter) => exporter,
        Err(e) => {
            tracing::warn!(error = %e, "OTLP metric exporter unavailable; metrics disabled");
            return None;
        }
    };
    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio).build();
    let provider = SdkMeterProvider::builder().with_reader(reader).build();
    opentelemetry::global::set_meter_provider(provider.clone());
    Some(provider)
}
