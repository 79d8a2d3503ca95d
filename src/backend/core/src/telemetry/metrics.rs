//! Prometheus metrics for jobs, worker control and cleanup sweeps.
//!
//! Recording goes through the `metrics` facade and is a no-op until
//! [`init_metrics`] installs the Prometheus recorder.
//!
//! # Example
//!
//! ```rust,no_run
//! use hive_core::telemetry::metrics::JobMetrics;
//!
//! JobMetrics::record_outcome("mail", "processed", 0.125);
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;

use crate::error::{HiveError, Result};

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether the Prometheus exporter is started
    #[serde(default)]
    pub enabled: bool,

    /// Listen address of the scrape endpoint (e.g., "0.0.0.0:9090")
    #[serde(default = "default_metrics_endpoint")]
    pub endpoint: String,

    /// Histogram buckets for job durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_metrics_endpoint(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_endpoint() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]
}

/// Initialize the metrics subsystem.
///
/// Returns `false` without touching the global recorder when metrics are
/// disabled. Must be called inside a Tokio runtime because the exporter
/// serves scrapes from a background task.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> Result<bool> {
    if !config.enabled {
        return Ok(false);
    }

    let addr: SocketAddr = config.endpoint.parse().map_err(|e| {
        HiveError::configuration(format!("Invalid metrics endpoint {}: {}", config.endpoint, e))
    })?;

    let mut builder = PrometheusBuilder::new().with_http_listener(addr);

    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    builder = builder
        .set_buckets(&config.duration_buckets)
        .map_err(|e| HiveError::configuration(format!("Invalid histogram buckets: {}", e)))?;

    builder
        .install()
        .map_err(|e| HiveError::internal(format!("Failed to install metrics exporter: {}", e)))?;

    register_metric_descriptions();

    tracing::info!(
        service_name = %service_name,
        endpoint = %config.endpoint,
        "Metrics initialized"
    );

    Ok(true)
}

fn register_metric_descriptions() {
    describe_counter!("hive_jobs_total", "Jobs that reached a terminal state, by queue and outcome");
    describe_counter!("hive_jobs_enqueued_total", "Jobs pushed or delayed, by queue and kind");
    describe_histogram!(
        "hive_job_duration_seconds",
        metrics::Unit::Seconds,
        "Wall-clock time of job execution"
    );
    describe_counter!("hive_worker_signals_total", "Control signals observed by workers");
    describe_counter!("hive_cleanup_removed_total", "Entries removed by cleanup sweeps, by kind");
    describe_counter!("hive_errors_total", "Errors by code, category and severity");
}

/// Job lifecycle metrics.
pub struct JobMetrics;

impl JobMetrics {
    /// Record a push (`kind` = "queued") or delay (`kind` = "delayed").
    pub fn record_enqueued(queue: &str, kind: &'static str) {
        counter!(
            "hive_jobs_enqueued_total",
            "queue" => queue.to_string(),
            "kind" => kind,
        )
        .increment(1);
    }

    /// Record a terminal outcome and how long the job ran.
    pub fn record_outcome(queue: &str, outcome: &'static str, duration_secs: f64) {
        counter!(
            "hive_jobs_total",
            "queue" => queue.to_string(),
            "outcome" => outcome,
        )
        .increment(1);

        histogram!("hive_job_duration_seconds", "queue" => queue.to_string()).record(duration_secs);
    }
}

/// Worker control metrics.
pub struct WorkerMetrics;

impl WorkerMetrics {
    pub fn record_signal(signal: &'static str) {
        counter!("hive_worker_signals_total", "signal" => signal).increment(1);
    }
}

/// Cleanup sweep metrics.
pub struct CleanupMetrics;

impl CleanupMetrics {
    /// Record removals; `kind` is one of "zombie", "processed", "worker", "host".
    pub fn record_removed(kind: &'static str, count: u64) {
        if count > 0 {
            counter!("hive_cleanup_removed_total", "kind" => kind).increment(count);
        }
    }
}
