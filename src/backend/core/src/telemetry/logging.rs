//! Subscriber setup: JSON, pretty or compact output behind an `EnvFilter`.

use opentelemetry_sdk::trace::Tracer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use crate::config::{LogFormat, TelemetryConfig};

/// Build the filter from `RUST_LOG`, falling back to the configured level.
pub fn env_filter(default_level: &str) -> anyhow::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(default_level)?),
    }
}

/// Install the global subscriber. When `tracer` is set, spans are also
/// exported through OpenTelemetry.
pub fn init_logging(config: &TelemetryConfig, tracer: Option<Tracer>) -> anyhow::Result<()> {
    let filter = env_filter(&config.log_level)?;

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer().pretty().with_file(true).with_line_number(true).boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(false).boxed(),
    };

    let otel_layer = tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .with(otel_layer)
        .try_init()?;

    Ok(())
}
