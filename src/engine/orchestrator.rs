//! Instance Orchestrator
//!
//! Fans the query list out over all instances with a bounded number of
//! instance tasks in flight, and returns once every task has finished.
//!
//! ```text
//!                      Semaphore(min(instances, max_parallelism))
//!                                      │
//!   instances ──▶ JoinSet ─┬─ task(CI1): open ─▶ pipeline ─▶ close
//!                          ├─ task(CI2): open ✗ ─▶ synthetic failures
//!                          └─ task(CIn): ...
//!                                      │
//!                             join_next() barrier ──▶ RunSummary
//! ```
//!
//! Every (instance, query) pair yields exactly one outcome at the sink,
//! whether the instance was reachable or not.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::pipeline::{deliver, run_pipeline};
use crate::connection::ConnectionProvider;
use crate::sink::OutcomeSink;
use crate::types::{ExecutionOutcome, InstanceDescriptor, QueryDescriptor};

// ============================================================================
// Instance state machine
// ============================================================================

/// Lifecycle of one instance task
///
/// ```text
/// Idle → Connecting ─┬─▶ Connected → RunningQueries → Closed
///                    └─▶ ConnectFailed → SyntheticFailuresEmitted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Task created, waiting for a worker slot
    Idle,
    /// Opening the connection
    Connecting,
    /// Connection open
    Connected,
    /// Executing the query list
    RunningQueries,
    /// Connection released (terminal)
    Closed,
    /// Connection could not be opened
    ConnectFailed,
    /// One failure outcome per query has been delivered (terminal)
    SyntheticFailuresEmitted,
}

impl InstanceState {
    /// Whether `next` is a legal successor
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Connected)
                | (Connecting, ConnectFailed)
                | (Connected, RunningQueries)
                | (RunningQueries, Closed)
                | (ConnectFailed, SyntheticFailuresEmitted)
        )
    }

    /// Whether the task is done
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceState::Closed | InstanceState::SyntheticFailuresEmitted
        )
    }
}

struct StateTracker<'a> {
    ci: &'a str,
    state: InstanceState,
}

impl<'a> StateTracker<'a> {
    fn new(ci: &'a str) -> Self {
        Self {
            ci,
            state: InstanceState::Idle,
        }
    }

    fn advance(&mut self, next: InstanceState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(ci = %self.ci, from = ?self.state, to = ?next, "Instance state");
        self.state = next;
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Result of one instance task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceReport {
    /// Terminal state reached
    pub final_state: InstanceState,
    /// Queries that returned rows
    pub succeeded: usize,
    /// Queries that failed on an open connection
    pub failed: usize,
    /// Failure outcomes emitted because the connection never opened
    pub synthetic: usize,
    /// Outcomes lost to a panicking sink
    pub sink_panics: usize,
}

/// Totals of one run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Instances scheduled
    pub instances: usize,
    /// Instances whose connection opened
    pub connected: usize,
    /// Instances whose connection failed
    pub connect_failures: usize,
    /// Outcomes delivered to the sink
    pub outcomes: usize,
    /// Successful query outcomes
    pub successes: usize,
    /// Query-level failure outcomes
    pub query_failures: usize,
    /// Failure outcomes synthesized for unreachable instances
    pub synthetic_failures: usize,
    /// Outcomes lost because the sink panicked while handling them
    pub sink_panics: usize,
    /// Instance tasks that panicked
    pub panicked: usize,
    /// Wall-clock duration of the fan-out
    pub elapsed: Duration,
}

impl RunSummary {
    fn absorb(&mut self, report: InstanceReport) {
        match report.final_state {
            InstanceState::Closed => self.connected += 1,
            _ => self.connect_failures += 1,
        }
        self.successes += report.succeeded;
        self.query_failures += report.failed;
        self.synthetic_failures += report.synthetic;
        self.sink_panics += report.sink_panics;
        self.outcomes += report.succeeded + report.failed + report.synthetic;
    }
}

// ============================================================================
// Fan-out
// ============================================================================

/// Number of concurrent instance tasks for a run
pub fn worker_budget(instances: usize, max_parallelism: usize) -> usize {
    instances.min(max_parallelism).max(1)
}

/// Poll every instance with every query
///
/// At most `min(instances, max_parallelism)` instances are worked on at
/// once. Never fails: errors become outcomes and log lines.
pub async fn run_all(
    provider: Arc<dyn ConnectionProvider>,
    instances: Vec<InstanceDescriptor>,
    queries: Arc<[QueryDescriptor]>,
    sink: Arc<dyn OutcomeSink>,
    max_parallelism: usize,
) -> RunSummary {
    let started = Instant::now();
    let mut summary = RunSummary {
        instances: instances.len(),
        ..Default::default()
    };
    if instances.is_empty() {
        info!("No instances configured, nothing to do");
        return summary;
    }

    let workers = worker_budget(instances.len(), max_parallelism);
    info!(
        instances = instances.len(),
        queries = queries.len(),
        workers,
        "Starting collection"
    );

    let semaphore = Arc::new(Semaphore::new(workers));
    let mut join_set = JoinSet::new();

    for instance in instances {
        let semaphore = Arc::clone(&semaphore);
        let provider = Arc::clone(&provider);
        let queries = Arc::clone(&queries);
        let sink = Arc::clone(&sink);

        join_set.spawn(async move {
            // The semaphore is never closed, so acquisition only waits
            let _permit = semaphore.acquire_owned().await.ok();
            run_instance(provider.as_ref(), &instance, &queries, sink.as_ref()).await
        });
    }

    while let Some(result) = join_set.join_next().await {
        match result {
            Ok(report) => summary.absorb(report),
            Err(e) => {
                summary.panicked += 1;
                error!(error = %e, "Instance task aborted");
            }
        }
    }

    summary.elapsed = started.elapsed();
    let avg_ms = summary.elapsed.as_millis() as u64 / summary.instances as u64;
    info!(
        elapsed_ms = summary.elapsed.as_millis() as u64,
        avg_per_instance_ms = avg_ms,
        "Collection finished"
    );
    summary
}

/// Connect, run the pipeline, close; or emit one failure per query
pub async fn run_instance(
    provider: &dyn ConnectionProvider,
    instance: &InstanceDescriptor,
    queries: &[QueryDescriptor],
    sink: &dyn OutcomeSink,
) -> InstanceReport {
    let mut state = StateTracker::new(&instance.ci);
    state.advance(InstanceState::Connecting);

    match provider.open(instance).await {
        Ok(mut conn) => {
            state.advance(InstanceState::Connected);
            state.advance(InstanceState::RunningQueries);
            let report = run_pipeline(conn.as_mut(), instance, queries, sink).await;
            conn.close().await;
            state.advance(InstanceState::Closed);

            InstanceReport {
                final_state: state.state,
                succeeded: report.succeeded,
                failed: report.failed,
                synthetic: 0,
                sink_panics: report.sink_panics,
            }
        }
        Err(e) => {
            state.advance(InstanceState::ConnectFailed);
            error!(
                ci = %instance.ci,
                address = %instance.address,
                error = %e,
                "Connect failed"
            );

            let message = e.to_string();
            let mut sink_panics = 0;
            for query in queries {
                let outcome = ExecutionOutcome::connect_failure(message.clone());
                if !deliver(sink, instance, &query.request_id, outcome).await {
                    sink_panics += 1;
                }
            }
            state.advance(InstanceState::SyntheticFailuresEmitted);

            InstanceReport {
                final_state: state.state,
                succeeded: 0,
                failed: 0,
                synthetic: queries.len(),
                sink_panics,
            }
        }
    }
}
