//! Prometheus metrics for the submission queue.
//!
//! Metric helpers are safe to call before (or without) [`init_metrics`]: the
//! `metrics` facade drops measurements when no recorder is installed.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Deserialize;
use std::net::SocketAddr;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default)]
    pub enabled: bool,

    /// Prometheus scrape endpoint (e.g., "0.0.0.0:9090")
    #[serde(default = "default_metrics_endpoint")]
    pub endpoint: String,

    /// Histogram buckets for gateway call durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_metrics_endpoint(),
            duration_buckets: default_duration_buckets(),
        }
    }
}

fn default_metrics_endpoint() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
}

/// Initialize the metrics subsystem and start the Prometheus scrape listener.
///
/// # Errors
///
/// Returns an error if the endpoint does not parse or the exporter cannot be
/// installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config.endpoint.parse()?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .add_global_label("service", service_name)
        .set_buckets(&config.duration_buckets)?
        .install()?;

    register_metric_descriptions();

    tracing::info!(
        service_name = %service_name,
        endpoint = %config.endpoint,
        "Metrics initialized"
    );

    Ok(())
}

fn register_metric_descriptions() {
    describe_counter!("submitq_errors_total", "Total number of errors by code");

    describe_counter!("submitq_jobs_submitted_total", "Total number of submit jobs enqueued");
    describe_counter!(
        "submitq_job_attempts_total",
        "Submission attempts by outcome (completed, retrying, failed)"
    );
    describe_histogram!(
        "submitq_gateway_duration_seconds",
        "Ledger gateway invocation duration in seconds"
    );
    describe_counter!(
        "submitq_jobs_promoted_total",
        "Delayed jobs promoted back to waiting by a scheduler"
    );
    describe_counter!(
        "submitq_jobs_recovered_total",
        "Stalled active jobs released by a scheduler"
    );
    describe_counter!(
        "submitq_store_conflicts_total",
        "Compare-and-swap transitions lost to another actor"
    );
    describe_counter!(
        "submitq_retention_evictions_total",
        "Terminal jobs evicted from a retention list"
    );
    describe_gauge!("submitq_active_jobs", "Jobs currently held active by this pool");
}

/// Queue-level metric helpers.
pub struct QueueMetrics;

impl QueueMetrics {
    /// Record an enqueued job.
    pub fn record_submitted(operation: &str) {
        counter!(
            "submitq_jobs_submitted_total",
            "operation" => operation.to_string(),
        )
        .increment(1);
    }

    /// Record the outcome of one submission attempt.
    pub fn record_attempt(operation: &str, outcome: &'static str, duration_seconds: f64) {
        counter!(
            "submitq_job_attempts_total",
            "operation" => operation.to_string(),
            "outcome" => outcome,
        )
        .increment(1);

        histogram!(
            "submitq_gateway_duration_seconds",
            "operation" => operation.to_string(),
        )
        .record(duration_seconds);
    }

    /// Record promotions performed by a scheduler tick.
    pub fn record_promoted(count: usize) {
        counter!("submitq_jobs_promoted_total").increment(count as u64);
    }

    /// Record stalled jobs released by a scheduler tick.
    pub fn record_recovered(count: usize) {
        counter!("submitq_jobs_recovered_total").increment(count as u64);
    }

    /// Record a lost compare-and-swap race.
    pub fn record_conflict(actor: &'static str) {
        counter!("submitq_store_conflicts_total", "actor" => actor).increment(1);
    }

    /// Record retention evictions for a list.
    pub fn record_evicted(list: &'static str, count: usize) {
        counter!("submitq_retention_evictions_total", "list" => list).increment(count as u64);
    }

    /// Set the number of jobs held active by a pool.
    pub fn set_active(pool: &str, active: u64) {
        gauge!("submitq_active_jobs", "pool" => pool.to_string()).set(active as f64);
    }
}
