//! Result Sink
//!
//! Receives exactly one [`ExecutionOutcome`] per (instance, query) and routes
//! it to the configured destination. `handle` never fails: destination
//! errors are logged with the instance and query ids, counted, and dropped.
//!
//! # Architecture
//!
//! ```text
//!                         ┌──────────────────────┐
//!  orchestrator ─────────▶│  ResultSink::handle  │── SinkStats (handled / errors)
//!                         └──────────┬───────────┘
//!              ┌─────────────┬───────┴──────┬──────────────────┐
//!              ▼             ▼              ▼                  ▼
//!          FileSink   DatabaseCallback  MetricsPush      Unimplemented
//!        (JSON docs)   (stored routine)  (HTTP POST)     (warn once, drop)
//! ```

pub mod callback;
pub mod document;
pub mod exposition;
pub mod file;
pub mod metrics_push;

pub use callback::{callback_statement, CallbackTarget, DatabaseCallbackSink};
pub use document::ResultDocument;
pub use exposition::{sanitize_name, MetricColumns};
pub use file::FileSink;
pub use metrics_push::MetricsPushSink;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::config::SinkConfiguration;
use crate::context::RunContext;
use crate::error::SinkError;
use crate::types::{ExecutionOutcome, InstanceDescriptor};

// ============================================================================
// Trait
// ============================================================================

/// Consumer of execution outcomes
#[async_trait]
pub trait OutcomeSink: Send + Sync {
    /// Record one outcome; must not fail the caller
    async fn handle(
        &self,
        instance: &InstanceDescriptor,
        request_id: &str,
        outcome: ExecutionOutcome,
    );
}

// ============================================================================
// Statistics
// ============================================================================

/// Delivery counters of a sink
#[derive(Debug, Default)]
pub struct SinkStats {
    handled: AtomicU64,
    errors: AtomicU64,
}

impl SinkStats {
    /// Outcomes received
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    /// Outcomes the destination failed to record
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Destinations
// ============================================================================

/// Destination that drops every outcome
#[derive(Debug)]
pub struct UnimplementedSink {
    kind: String,
    warned: AtomicBool,
}

impl UnimplementedSink {
    /// Create a dropping sink for the named destination type
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            warned: AtomicBool::new(false),
        }
    }

    fn record(&self) {
        if !self.warned.swap(true, Ordering::Relaxed) {
            warn!(destination = %self.kind, "Destination type is not implemented, results are dropped");
        }
    }
}

/// The closed set of destinations
pub enum Destination {
    /// JSON documents on disk
    File(FileSink),
    /// Stored routine on a separate server
    DatabaseCallback(DatabaseCallbackSink),
    /// Prometheus text pushed over HTTP
    MetricsPush(MetricsPushSink),
    /// Unknown destination type
    Unimplemented(UnimplementedSink),
}

impl Destination {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Destination::File(_) => "file",
            Destination::DatabaseCallback(_) => "database_callback",
            Destination::MetricsPush(_) => "metrics_push",
            Destination::Unimplemented(_) => "unimplemented",
        }
    }
}

/// Sink selected once from configuration
pub struct ResultSink {
    destination: Destination,
    stats: SinkStats,
}

impl ResultSink {
    /// Wrap a destination
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            stats: SinkStats::default(),
        }
    }

    /// Build the sink described by `config`
    pub fn from_config(
        config: &SinkConfiguration,
        ctx: &RunContext,
        connect_timeout: Duration,
    ) -> Result<Self, SinkError> {
        let destination = match config {
            SinkConfiguration::File(file) => Destination::File(FileSink::new(&file.directory, ctx)),
            SinkConfiguration::DatabaseCallback(cb) => Destination::DatabaseCallback(
                DatabaseCallbackSink::new(&cb.connection_string, &cb.routine, connect_timeout)?,
            ),
            SinkConfiguration::MetricsPush(push) => Destination::MetricsPush(MetricsPushSink::new(
                push.url.clone(),
                MetricColumns {
                    name: push.name_column.clone(),
                    value: push.value_column.clone(),
                },
            )?),
            SinkConfiguration::Unimplemented { kind } => {
                Destination::Unimplemented(UnimplementedSink::new(kind.clone()))
            }
        };

        info!(destination = destination.kind(), run_id = %ctx.run_id, "Result sink ready");
        Ok(Self::new(destination))
    }

    /// The active destination
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Delivery counters
    pub fn stats(&self) -> &SinkStats {
        &self.stats
    }

    /// The metrics push destination, if that is the active one
    pub fn metrics_push(&self) -> Option<&MetricsPushSink> {
        match &self.destination {
            Destination::MetricsPush(sink) => Some(sink),
            _ => None,
        }
    }
}

#[async_trait]
impl OutcomeSink for ResultSink {
    async fn handle(
        &self,
        instance: &InstanceDescriptor,
        request_id: &str,
        outcome: ExecutionOutcome,
    ) {
        self.stats.handled.fetch_add(1, Ordering::Relaxed);

        let result = match &self.destination {
            Destination::File(sink) => sink.record(instance, request_id, outcome).await,
            Destination::DatabaseCallback(sink) => sink.record(instance, request_id, outcome).await,
            Destination::MetricsPush(sink) => sink.record(instance, request_id, outcome).await,
            Destination::Unimplemented(sink) => {
                sink.record();
                Ok(())
            }
        };

        if let Err(e) = result {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            error!(
                ci = %instance.ci,
                request_id = %request_id,
                destination = self.destination.kind(),
                error = %e,
                "Sink failed to record outcome"
            );
        }
    }
}
