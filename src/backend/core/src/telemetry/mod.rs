//! Telemetry: structured logging and Prometheus metrics.
//!
//! # Example
//!
//! ```rust,no_run
//! use submitq_core::config::ObservabilityConfig;
//! use submitq_core::telemetry::init_telemetry;
//!
//! let config = ObservabilityConfig::default();
//! init_telemetry(&config, "submitq-server").expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use self::logging::{init_logging, LogFormat, LoggingConfig};
pub use self::metrics::{init_metrics, MetricsConfig, QueueMetrics};

use crate::config::ObservabilityConfig;

/// Initialize logging, then metrics.
///
/// Must be called from within a tokio runtime when metrics are enabled, since
/// the Prometheus listener is spawned onto it.
pub fn init_telemetry(config: &ObservabilityConfig, service_name: &str) -> anyhow::Result<()> {
    init_logging(&config.logging)?;
    init_metrics(&config.metrics, service_name)?;
    Ok(())
}
