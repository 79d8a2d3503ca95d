//! Telemetry: logging and metrics infrastructure.
//!
//! - **Logging**: structured JSON/pretty/compact logging with redaction
//! - **Metrics**: Prometheus counters and histograms for jobs and workers
//!
//! # Example
//!
//! ```rust,no_run
//! use hive_core::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let config = TelemetryConfig::default();
//! init_telemetry(&config).expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig, RedactionConfig, RedactionPattern, SensitiveFieldRedactor};
pub use metrics::{init_metrics, CleanupMetrics, JobMetrics, MetricsConfig, WorkerMetrics};

use crate::error::Result;

/// Unified telemetry configuration.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name used in log and metric labels
    pub service_name: String,

    pub logging: LoggingConfig,

    pub metrics: MetricsConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl TelemetryConfig {
    /// Build from the application config sections.
    pub fn from_config(config: &crate::config::Config, service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            logging: config.logging.clone(),
            metrics: config.metrics.clone(),
        }
    }
}

fn default_service_name() -> String {
    "hive".to_string()
}

/// Initialize logging, then metrics.
///
/// Returns whether the metrics exporter was started.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<bool> {
    init_logging(&config.logging)?;
    init_metrics(&config.metrics, &config.service_name)
}
