//! MSSQL fleet collector
//!
//! Runs once: polls every configured instance with every configured query
//! and exits when all outcomes have been delivered.
//!
//! # Configuration
//!
//! The configuration file is taken from:
//! 1. the first command-line argument
//! 2. the `MSSQL_COLLECTOR_CONFIG` environment variable
//! 3. `./collector.toml`
//!
//! Blank instance passwords are read from `MSSQL_<USER>_PASSWORD` or
//! prompted for on the terminal.
//!
//! # Example
//!
//! ```bash
//! MSSQL_MONITOR_PASSWORD=... ./mssql-collector /etc/collector.toml
//! RUST_LOG=mssql_collector=debug ./mssql-collector
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use mssql_collector::config::CONFIG_ENV_VAR;
use mssql_collector::observability::{init_logging, LoggingConfig, RunMetrics};
use mssql_collector::{
    Collector, CollectorConfig, Error, PasswordResolver, ResultSink, RunContext, RunSummary,
    TdsConnectionProvider,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let path = CollectorConfig::resolve_path(
        std::env::args().nth(1),
        std::env::var(CONFIG_ENV_VAR).ok(),
    );
    let config = CollectorConfig::load(&path);

    // Logging comes up before the config error is reported
    let logging = config
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_else(|_| LoggingConfig::default());
    if let Err(e) = init_logging(&logging) {
        eprintln!("{}", e);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "MSSQL collector starting");

    let result = match config {
        Ok(config) => run(config).await,
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(summary) => {
            info!(
                instances = summary.instances,
                connected = summary.connected,
                connect_failures = summary.connect_failures,
                outcomes = summary.outcomes,
                successes = summary.successes,
                query_failures = summary.query_failures,
                sink_panics = summary.sink_panics,
                panicked = summary.panicked,
                elapsed_ms = summary.elapsed.as_millis() as u64,
                "Run complete"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Collector setup failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: CollectorConfig) -> Result<RunSummary, Error> {
    let ctx = RunContext::new();
    info!(run_id = %ctx.run_id, started_at = %ctx.started_at, "Run context created");

    let mut instances = config.instance_descriptors();
    PasswordResolver::new().resolve_all(&mut instances)?;

    let sink = Arc::new(ResultSink::from_config(
        &config.destination,
        &ctx,
        config.connect_timeout(),
    )?);

    let collector = Collector::builder()
        .with_provider(TdsConnectionProvider::new(config.connect_timeout()))
        .with_shared_sink(sink.clone())
        .with_max_parallelism(config.max_parallelism)
        .build()?;

    let summary = collector.run(instances, config.queries.clone()).await;

    let stats = sink.stats();
    info!(
        destination = sink.destination().kind(),
        handled = stats.handled(),
        errors = stats.errors(),
        "Sink statistics"
    );

    if config.destination.push_run_metrics() {
        push_run_metrics(&sink, &summary).await;
    }

    Ok(summary)
}

/// Push the collector's own run metrics through the metrics sink
async fn push_run_metrics(sink: &ResultSink, summary: &RunSummary) {
    let Some(push) = sink.metrics_push() else {
        return;
    };

    let body = RunMetrics::new()
        .map_err(|e| e.to_string())
        .and_then(|metrics| {
            metrics.record(summary, sink.stats().errors());
            metrics.encode()
        });

    match body {
        Ok(body) => match push.push(body).await {
            Ok(()) => info!(url = %push.url(), "Run metrics pushed"),
            Err(e) => warn!(url = %push.url(), error = %e, "Failed to push run metrics"),
        },
        Err(e) => warn!(error = %e, "Failed to encode run metrics"),
    }
}
