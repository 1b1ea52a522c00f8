//! OpenTelemetry OTLP export, enabled when `telemetry.otlp_endpoint` is set.

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{self as sdktrace, Tracer};
use opentelemetry_sdk::Resource;

use crate::config::TelemetryConfig;

pub const SERVICE_NAME: &str = "research-queue";

/// Install the batch OTLP pipeline and return its tracer, or `None` when no
/// endpoint is configured.
pub fn init_tracer(config: &TelemetryConfig) -> anyhow::Result<Option<Tracer>> {
    let Some(endpoint) = config.otlp_endpoint.as_deref() else {
        return Ok(None);
    };

    let resource = Resource::new(vec![
        KeyValue::new("service.name", SERVICE_NAME),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(sdktrace::Config::default().with_resource(resource))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    Ok(Some(tracer))
}

/// Flush and drop the global tracer provider.
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
}
