//! Per-run Prometheus metrics
//!
//! Each run owns its own [`Registry`]; nothing is registered globally, so two
//! runs in one process (tests, embedding) never share counters.

use prometheus::{
    register_gauge_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, Gauge,
    IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::engine::RunSummary;

/// Counters describing one finished run
pub struct RunMetrics {
    registry: Registry,
    outcomes: IntCounterVec,
    connect_failures: IntCounter,
    sink_errors: IntCounter,
    instances: IntGauge,
    run_duration: Gauge,
}

impl RunMetrics {
    /// Create and register the run metrics
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let outcomes = register_int_counter_vec_with_registry!(
            Opts::new(
                "mssql_collector_outcomes_total",
                "Outcomes delivered to the result sink, by outcome kind"
            ),
            &["outcome"],
            registry
        )?;
        let connect_failures = register_int_counter_with_registry!(
            Opts::new(
                "mssql_collector_connect_failures_total",
                "Instances that could not be connected"
            ),
            registry
        )?;
        let sink_errors = register_int_counter_with_registry!(
            Opts::new(
                "mssql_collector_sink_errors_total",
                "Outcomes the result sink failed to record or forward"
            ),
            registry
        )?;
        let instances = register_int_gauge_with_registry!(
            Opts::new("mssql_collector_instances", "Instances polled in the run"),
            registry
        )?;
        let run_duration = register_gauge_with_registry!(
            Opts::new(
                "mssql_collector_run_duration_seconds",
                "Wall-clock duration of the run"
            ),
            registry
        )?;

        Ok(Self {
            registry,
            outcomes,
            connect_failures,
            sink_errors,
            instances,
            run_duration,
        })
    }

    /// Fold a finished run into the counters
    pub fn record(&self, summary: &RunSummary, sink_errors: u64) {
        self.outcomes
            .with_label_values(&["success"])
            .inc_by(summary.successes as u64);
        self.outcomes
            .with_label_values(&["query_failure"])
            .inc_by(summary.query_failures as u64);
        self.outcomes
            .with_label_values(&["connect_failure"])
            .inc_by(summary.synthetic_failures as u64);
        self.connect_failures.inc_by(summary.connect_failures as u64);
        self.sink_errors.inc_by(sink_errors);
        self.instances.set(summary.instances as i64);
        self.run_duration.set(summary.elapsed.as_secs_f64());
    }

    /// Encode all run metrics in the text exposition format
    pub fn encode(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| format!("Failed to encode metrics: {}", e))?;
        String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
    }
}
