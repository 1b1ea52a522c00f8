//! Prometheus metrics.
//!
//! Metrics are emitted at their call sites through the `metrics` macros;
//! this module installs the recorder and registers descriptions.

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::config::TelemetryConfig;

/// Every metric the service emits.
pub const SERVICE_METRICS: [&str; 11] = [
    "rq_jobs_enqueued_total",
    "rq_jobs_processed_total",
    "rq_jobs_recovered_total",
    "rq_jobs_unsettled_total",
    "rq_job_duration_seconds",
    "rq_store_fallbacks_total",
    "rq_store_operation_failures_total",
    "rq_job_events_total",
    "rq_events_dropped_total",
    "rq_queue_depth",
    "rq_errors_total",
];

const DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

/// Install the global Prometheus recorder. Returns `None` when metrics are
/// disabled.
pub fn init_metrics(config: &TelemetryConfig) -> anyhow::Result<Option<PrometheusHandle>> {
    if !config.metrics_enabled {
        return Ok(None);
    }

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("rq_job_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )?
        .install_recorder()?;

    register_metric_descriptions();
    Ok(Some(handle))
}

/// Render the current snapshot in the Prometheus text format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

fn register_metric_descriptions() {
    describe_counter!("rq_jobs_enqueued_total", "Jobs accepted, by priority");
    describe_counter!("rq_jobs_processed_total", "Job attempts that settled, by outcome");
    describe_counter!("rq_jobs_recovered_total", "Jobs returned from an abandoned processing state");
    describe_counter!("rq_jobs_unsettled_total", "Attempts whose outcome could not be written");
    describe_histogram!(
        "rq_job_duration_seconds",
        Unit::Seconds,
        "Wall time of one job attempt, claim to final write"
    );
    describe_counter!(
        "rq_store_fallbacks_total",
        "Calls served by a tier other than the primary, by store and operation"
    );
    describe_counter!(
        "rq_store_operation_failures_total",
        "Store calls that failed on one tier, by store and operation"
    );
    describe_counter!("rq_job_events_total", "Job events recorded, by kind");
    describe_counter!("rq_events_dropped_total", "Job events dropped before reaching the sink");
    describe_gauge!("rq_queue_depth", "Jobs per status at the last stats call");
    describe_counter!("rq_errors_total", "Errors raised, by code and category");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_metrics_install_nothing() {
        let config = TelemetryConfig {
            metrics_enabled: false,
            ..Default::default()
        };
        assert!(init_metrics(&config).unwrap().is_none());
    }

    #[test]
    fn test_metric_names_are_prefixed() {
        assert!(SERVICE_METRICS.iter().all(|name| name.starts_with("rq_")));
    }
}
