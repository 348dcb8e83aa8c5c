// src/observability/mod.rs
//! Logging and metrics setup
//!
//! Logs go through `tracing`; the filter comes from `WORLDLOG_LOG` (same
//! syntax as `RUST_LOG`) and defaults to `info`. Dropped records are always
//! logged under the `worldlog::data_loss` target so they can be routed
//! separately.
//!
//! Metrics use the `metrics` facade. Without an exporter installed every
//! counter is a no-op.

use crate::utils::config::ObservabilityConfig;
use crate::utils::errors::{EngineError, Result};
use metrics::describe_counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "WORLDLOG_LOG";

/// Install the global tracing subscriber
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
    };

    installed.map_err(|e| EngineError::Config(format!("failed to initialize tracing: {}", e)))
}

/// Start the Prometheus exporter when `metrics_addr` is set.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    let Some(addr) = config.metrics_addr.as_deref() else {
        return Ok(());
    };

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| EngineError::Config(format!("invalid metrics_addr `{}`: {}", addr, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| EngineError::Config(format!("failed to start metrics exporter: {}", e)))?;

    describe_metrics();
    info!("Metrics exporter listening on {}", addr);
    Ok(())
}

fn describe_metrics() {
    describe_counter!("worldlog_records_enqueued_total", "Records accepted into the buffer");
    describe_counter!("worldlog_records_persisted_total", "Records written to storage");
    describe_counter!("worldlog_records_dropped_total", "Records lost, by reason");
    describe_counter!("worldlog_flush_retries_total", "Batch write retries");
    describe_counter!("worldlog_rollback_applied_total", "World actions applied by direction");
    describe_counter!(
        "worldlog_rollback_conflicts_total",
        "World actions skipped on conflict by direction"
    );
}
