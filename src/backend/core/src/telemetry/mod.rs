//! Telemetry: structured logging, optional OTLP trace export, and Prometheus
//! metrics.
//!
//! ```rust,no_run
//! use research_queue_core::config::TelemetryConfig;
//! use research_queue_core::telemetry::init_telemetry;
//!
//! let handle = init_telemetry(&TelemetryConfig::default()).expect("telemetry");
//! handle.shutdown();
//! ```

pub mod logging;
pub mod metrics;
pub mod tracing;

pub use self::logging::init_logging;
pub use self::metrics::{init_metrics, render, SERVICE_METRICS};
pub use self::tracing::{init_tracer, shutdown_tracing};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::TelemetryConfig;

/// Initialize metrics, tracing and logging, in that order.
///
/// Call once at startup; a second call fails because the global subscriber
/// and recorder are already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<TelemetryHandle> {
    let metrics = init_metrics(config)?;
    let tracer = init_tracer(config)?;
    let exporting = tracer.is_some();
    init_logging(config, tracer)?;

    ::tracing::info!(
        log_level = %config.log_level,
        otlp = exporting,
        metrics = metrics.is_some(),
        "Telemetry initialized"
    );

    Ok(TelemetryHandle { metrics, exporting })
}

/// Keeps the Prometheus handle and flushes spans on shutdown.
pub struct TelemetryHandle {
    pub metrics: Option<PrometheusHandle>,
    exporting: bool,
}

impl TelemetryHandle {
    pub fn shutdown(self) {
        if self.exporting {
            shutdown_tracing();
        }
        // Note: `::tracing` is the crate, not the sibling module
        ::tracing::info!("Telemetry shutdown complete");
    }
}
