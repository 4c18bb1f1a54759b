//! Metrics push sink
//!
//! Converts row-sets to exposition lines and POSTs them, one request per
//! outcome, to a Prometheus-compatible import endpoint.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE as CONTENT_TYPE_HEADER;
use reqwest::Client;
use tracing::{debug, info};

use super::exposition::{render_rows, render_unavailable, MetricColumns, CONTENT_TYPE};
use crate::error::SinkError;
use crate::types::{ExecutionOutcome, FailureKind, InstanceDescriptor};

/// TCP connect bound for the push endpoint
pub const PUSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(4);

/// Whole-request bound for one push
pub const PUSH_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Pushes result rows as metrics
#[derive(Debug, Clone)]
pub struct MetricsPushSink {
    client: Client,
    url: String,
    columns: MetricColumns,
}

impl MetricsPushSink {
    /// Create a sink posting to `url`
    pub fn new(url: impl Into<String>, columns: MetricColumns) -> Result<Self, SinkError> {
        let client = Client::builder()
            .connect_timeout(PUSH_CONNECT_TIMEOUT)
            .timeout(PUSH_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            columns,
        })
    }

    /// Target URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Render and push one outcome
    ///
    /// Connect failures become a single `availability 0` sample; query
    /// failures push nothing.
    pub async fn record(
        &self,
        instance: &InstanceDescriptor,
        request_id: &str,
        outcome: ExecutionOutcome,
    ) -> Result<(), SinkError> {
        let body = match outcome {
            ExecutionOutcome::Success(rows) => {
                let batch = render_rows(instance, request_id, rows, &self.columns);
                debug!(
                    ci = %instance.ci,
                    request_id = %request_id,
                    samples = batch.samples,
                    skipped = batch.skipped,
                    "Rendered metrics"
                );
                batch.body
            }
            ExecutionOutcome::Failure {
                kind: FailureKind::Connect,
                ..
            } => render_unavailable(instance),
            ExecutionOutcome::Failure {
                kind: FailureKind::Query,
                message,
            } => {
                info!(
                    ci = %instance.ci,
                    request_id = %request_id,
                    error = %message,
                    "Query failed, no metrics pushed"
                );
                return Ok(());
            }
        };

        if body.is_empty() {
            debug!(ci = %instance.ci, request_id = %request_id, "Nothing to push");
            return Ok(());
        }
        self.push(body).await
    }

    /// POST an exposition body to the endpoint
    pub async fn push(&self, body: String) -> Result<(), SinkError> {
        let bytes = body.len();
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE_HEADER, CONTENT_TYPE)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::HttpStatus {
                status: status.as_u16(),
                url: self.url.clone(),
            });
        }

        debug!(url = %self.url, bytes, status = status.as_u16(), "Metrics pushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CaptureServer;
    use crate::types::{Credentials, InstanceAddress, RowSet};

    fn instance() -> InstanceDescriptor {
        InstanceDescriptor::new(
            "CI00042",
            InstanceAddress::with_port("db01", 1433),
            Credentials::new("monitor", "pw"),
        )
        .with_label("env", "prod")
        .with_label("team", "dba")
    }

    fn cpu_rows() -> RowSet {
        RowSet::new(
            vec!["metric_name".into(), "metric_value".into()],
            vec![vec![Some("cpu pct".into()), Some("42".into())]],
        )
    }

    #[tokio::test]
    async fn test_success_rows_are_posted() {
        let server = CaptureServer::start(200).await;
        let sink = MetricsPushSink::new(server.url(), MetricColumns::default()).unwrap();

        sink.record(&instance(), "cpu", ExecutionOutcome::Success(cpu_rows()))
            .await
            .unwrap();

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        let (content_type, body) = &requests[0];
        assert_eq!(content_type, CONTENT_TYPE);
        assert!(body.contains("cpu_pct"));
        assert!(body.contains(" 42"));
        assert!(body.contains("ci=\"CI00042\""));
        assert!(body.contains("env=\"prod\""));
        assert!(body.contains("team=\"dba\""));
    }

    #[tokio::test]
    async fn test_connect_failure_pushes_availability() {
        let server = CaptureServer::start(204).await;
        let sink = MetricsPushSink::new(server.url(), MetricColumns::default()).unwrap();

        sink.record(
            &instance(),
            "cpu",
            ExecutionOutcome::connect_failure("login failed"),
        )
        .await
        .unwrap();

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].1,
            "availability{ci=\"CI00042\",env=\"prod\",team=\"dba\"} 0\n"
        );
    }

    #[tokio::test]
    async fn test_query_failure_pushes_nothing() {
        let server = CaptureServer::start(200).await;
        let sink = MetricsPushSink::new(server.url(), MetricColumns::default()).unwrap();

        sink.record(&instance(), "cpu", ExecutionOutcome::query_failure("bad sql"))
            .await
            .unwrap();

        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn test_empty_result_pushes_nothing() {
        let server = CaptureServer::start(200).await;
        let sink = MetricsPushSink::new(server.url(), MetricColumns::default()).unwrap();
        let rows = RowSet::new(vec!["metric_name".into(), "metric_value".into()], vec![]);

        sink.record(&instance(), "cpu", ExecutionOutcome::Success(rows))
            .await
            .unwrap();

        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let server = CaptureServer::start(500).await;
        let sink = MetricsPushSink::new(server.url(), MetricColumns::default()).unwrap();

        let err = sink
            .record(&instance(), "cpu", ExecutionOutcome::Success(cpu_rows()))
            .await
            .unwrap_err();

        assert!(matches!(err, SinkError::HttpStatus { status: 500, .. }));
        assert_eq!(server.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        let sink =
            MetricsPushSink::new("http://127.0.0.1:1/import", MetricColumns::default()).unwrap();
        let err = sink
            .record(&instance(), "cpu", ExecutionOutcome::Success(cpu_rows()))
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Http(_)));
    }
}
