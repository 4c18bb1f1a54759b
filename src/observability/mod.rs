//! Logging bootstrap and per-run metrics

pub mod logging;
pub mod run_metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use run_metrics::RunMetrics;
