//! stateward-sync: replication and backup validation daemon
//!
//! Opens the configured primary and replica, then periodically reconciles
//! the replica against the primary and validates backup lag. Intended to run
//! alongside writers that share the primary store (e.g. a SQLite file or a
//! set of mirrored copies).
//!
//! ## Configuration
//! - First argument: path to a YAML config file (optional)
//! - STATEWARD_CONFIG: path to a YAML config file (optional)
//! - STATEWARD__<SECTION>__<KEY>: per-setting overrides
//! - STATEWARD_LOG: tracing filter (default: info)
//! - OTEL_EXPORTER_OTLP_ENDPOINT: metrics collector (with the `otel` feature)

use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use stateward::config::Config;
use stateward::utils::bootstrap::init_tracing;
use stateward::StateBackend;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    #[cfg(feature = "otel")]
    let meter_provider = stateward::utils::bootstrap::init_metrics();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;
    let backend = StateBackend::open(&config).await?;

    let mut reconcile_tick = interval(config.replication.reconcile_interval());
    reconcile_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut validate_tick = interval(config.validator.interval());
    validate_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        destination = %backend.replication().destination(),
        reconcile_every = ?config.replication.reconcile_interval(),
        validate_every = ?config.validator.interval(),
        "stateward-sync started"
    );

    loop {
        tokio::select! {
            _ = reconcile_tick.tick() => {
                if let Err(e) = backend.replication().reconcile().await {
                    error!(error = %e, "Reconcile pass failed");
                }
            }
            _ = validate_tick.tick() => {
                match backend.validator().validate().await {
                    Ok(report) if !report.is_healthy() => {
                        for issue in &report.issues {
                            warn!(state_key = %issue.state_key(), ?issue, "Backup issue");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Backup validation failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    let stats = backend.replication().stats().await;
    info!(
        completed = stats.completed,
        failed = stats.failed,
        retries = stats.retries,
        "stateward-sync stopping"
    );
    backend.shutdown().await;

    #[cfg(feature = "otel")]
    if let Some(provider) = meter_provider {
        if let Err(e) = provider.shutdown() {
            warn!(error = %e, "Metrics shutdown failed");
        }
    }
    Ok(())
}
