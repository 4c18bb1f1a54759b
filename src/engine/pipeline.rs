//! Query Pipeline
//!
//! Runs the configured queries against one open connection, strictly in
//! order. A failing query is reported and the pipeline moves on; nothing
//! escapes to the caller.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures::FutureExt;
use tracing::{debug, error};

use crate::connection::Connection;
use crate::sink::OutcomeSink;
use crate::types::{ExecutionOutcome, InstanceDescriptor, QueryDescriptor};

/// Per-instance pipeline counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineReport {
    /// Queries that returned rows
    pub succeeded: usize,
    /// Queries that failed
    pub failed: usize,
    /// Outcomes lost because the sink panicked while handling them
    pub sink_panics: usize,
}

impl PipelineReport {
    /// Outcomes handed to the sink
    pub fn delivered(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Execute `queries` in order, delivering one outcome per query to `sink`
///
/// The next query starts only after the previous outcome has been handled.
pub async fn run_pipeline(
    conn: &mut dyn Connection,
    instance: &InstanceDescriptor,
    queries: &[QueryDescriptor],
    sink: &dyn OutcomeSink,
) -> PipelineReport {
    let mut report = PipelineReport::default();

    for query in queries {
        let started = Instant::now();
        let outcome = match conn.execute(&query.query_text).await {
            Ok(rows) => {
                debug!(
                    ci = %instance.ci,
                    request_id = %query.request_id,
                    rows = rows.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Query finished"
                );
                report.succeeded += 1;
                ExecutionOutcome::Success(rows)
            }
            Err(e) => {
                error!(
                    ci = %instance.ci,
                    request_id = %query.request_id,
                    class = e.class(),
                    error = %e,
                    "Query failed"
                );
                report.failed += 1;
                ExecutionOutcome::query_failure(e.to_string())
            }
        };

        if !deliver(sink, instance, &query.request_id, outcome).await {
            report.sink_panics += 1;
        }
    }

    report
}

/// Hand one outcome to the sink, containing a panic inside it
///
/// Returns `false` when the sink panicked; the outcome is lost and logged.
pub(crate) async fn deliver(
    sink: &dyn OutcomeSink,
    instance: &InstanceDescriptor,
    request_id: &str,
    outcome: ExecutionOutcome,
) -> bool {
    let handled = AssertUnwindSafe(sink.handle(instance, request_id, outcome))
        .catch_unwind()
        .await;
    match handled {
        Ok(()) => true,
        Err(payload) => {
            error!(
                ci = %instance.ci,
                request_id = %request_id,
                panic = %panic_message(payload.as_ref()),
                "Sink panicked, outcome lost"
            );
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionProvider;
    use crate::testing::{PanickingSink, RecordingSink, ScriptedProvider};
    use crate::types::{Credentials, InstanceAddress};

    fn instance() -> InstanceDescriptor {
        InstanceDescriptor::new(
            "CI1",
            InstanceAddress::with_port("db01", 1433),
            Credentials::new("monitor", "pw"),
        )
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_later_queries() {
        let provider = ScriptedProvider::new()
            .serve("CI1", "pw")
            .fail_query("SELECT broken");
        let sink = RecordingSink::default();
        let queries = vec![
            QueryDescriptor::new("first", "SELECT 1"),
            QueryDescriptor::new("second", "SELECT broken"),
            QueryDescriptor::new("third", "SELECT 3"),
        ];

        let mut conn = provider.open(&instance()).await.unwrap();
        let report = run_pipeline(conn.as_mut(), &instance(), &queries, &sink).await;

        assert_eq!(
            report,
            PipelineReport {
                succeeded: 2,
                failed: 1,
                sink_panics: 0,
            }
        );
        assert_eq!(report.delivered(), 3);

        let delivered = sink.deliveries();
        let ids: Vec<_> = delivered.iter().map(|d| d.request_id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
        assert!(delivered[0].outcome.is_success());
        assert!(delivered[1].outcome.outcome_text().contains("SQL error"));
        assert!(delivered[2].outcome.is_success());
        assert_eq!(
            provider.executed("CI1"),
            vec!["SELECT 1", "SELECT broken", "SELECT 3"]
        );
    }

    #[tokio::test]
    async fn test_empty_query_list() {
        let provider = ScriptedProvider::new().serve("CI1", "pw");
        let sink = RecordingSink::default();

        let mut conn = provider.open(&instance()).await.unwrap();
        let report = run_pipeline(conn.as_mut(), &instance(), &[], &sink).await;

        assert_eq!(report.delivered(), 0);
        assert!(sink.deliveries().is_empty());
    }

    #[tokio::test]
    async fn test_sink_panic_does_not_stop_later_queries() {
        let provider = ScriptedProvider::new().serve("CI1", "pw");
        let sink = PanickingSink::on("second");
        let queries = vec![
            QueryDescriptor::new("first", "SELECT 1"),
            QueryDescriptor::new("second", "SELECT 2"),
            QueryDescriptor::new("third", "SELECT 3"),
        ];

        let mut conn = provider.open(&instance()).await.unwrap();
        let report = run_pipeline(conn.as_mut(), &instance(), &queries, &sink).await;

        assert_eq!(report.succeeded, 3);
        assert_eq!(report.sink_panics, 1);
        let ids: Vec<_> = sink
            .recorded()
            .deliveries()
            .into_iter()
            .map(|d| d.request_id)
            .collect();
        assert_eq!(ids, vec!["first", "third"]);
    }
}
