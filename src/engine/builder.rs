//! Collector builder with pluggable connection provider and sink

use std::sync::Arc;

use super::orchestrator::{run_all, RunSummary};
use crate::connection::ConnectionProvider;
use crate::error::{ConfigError, Error, Result};
use crate::sink::OutcomeSink;
use crate::types::{InstanceDescriptor, QueryDescriptor};

/// Default upper bound on concurrently polled instances
pub const DEFAULT_MAX_PARALLELISM: usize = 8;

/// Builder for a [`Collector`]
pub struct CollectorBuilder {
    provider: Option<Arc<dyn ConnectionProvider>>,
    sink: Option<Arc<dyn OutcomeSink>>,
    max_parallelism: usize,
}

impl CollectorBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            provider: None,
            sink: None,
            max_parallelism: DEFAULT_MAX_PARALLELISM,
        }
    }

    /// Set the connection provider
    pub fn with_provider<P>(mut self, provider: P) -> Self
    where
        P: ConnectionProvider + 'static,
    {
        self.provider = Some(Arc::new(provider));
        self
    }

    /// Set a sink the caller keeps a handle to
    pub fn with_shared_sink(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Set the sink
    pub fn with_sink<S>(self, sink: S) -> Self
    where
        S: OutcomeSink + 'static,
    {
        self.with_shared_sink(Arc::new(sink))
    }

    /// Set the upper bound on concurrently polled instances
    pub fn with_max_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism;
        self
    }

    /// Build the collector
    pub fn build(self) -> Result<Collector> {
        let provider = self.provider.ok_or_else(|| {
            Error::Config(ConfigError::Invalid(
                "No connection provider configured".to_string(),
            ))
        })?;
        let sink = self
            .sink
            .ok_or_else(|| Error::Config(ConfigError::Invalid("No result sink configured".to_string())))?;
        if self.max_parallelism == 0 {
            return Err(Error::Config(ConfigError::Invalid(
                "max_parallelism must be at least 1".to_string(),
            )));
        }

        Ok(Collector {
            provider,
            sink,
            max_parallelism: self.max_parallelism,
        })
    }
}

impl Default for CollectorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls a fleet with a fixed provider and sink
pub struct Collector {
    provider: Arc<dyn ConnectionProvider>,
    sink: Arc<dyn OutcomeSink>,
    max_parallelism: usize,
}

impl Collector {
    /// Create a builder
    pub fn builder() -> CollectorBuilder {
        CollectorBuilder::new()
    }

    /// Upper bound on concurrently polled instances
    pub fn max_parallelism(&self) -> usize {
        self.max_parallelism
    }

    /// Run every query against every instance
    pub async fn run(
        &self,
        instances: Vec<InstanceDescriptor>,
        queries: Vec<QueryDescriptor>,
    ) -> RunSummary {
        run_all(
            Arc::clone(&self.provider),
            instances,
            queries.into(),
            Arc::clone(&self.sink),
            self.max_parallelism,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingSink, ScriptedProvider};
    use crate::types::{Credentials, InstanceAddress};

    #[test]
    fn test_build_requires_provider_and_sink() {
        let err = CollectorBuilder::new()
            .with_sink(RecordingSink::default())
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("connection provider"));

        let err = CollectorBuilder::new()
            .with_provider(ScriptedProvider::new())
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("result sink"));

        let err = Collector::builder()
            .with_provider(ScriptedProvider::new())
            .with_sink(RecordingSink::default())
            .with_max_parallelism(0)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_collector_run() {
        let sink = Arc::new(RecordingSink::default());
        let collector = Collector::builder()
            .with_provider(ScriptedProvider::new().serve("CI1", "pw"))
            .with_shared_sink(sink.clone())
            .with_max_parallelism(2)
            .build()
            .unwrap();
        assert_eq!(collector.max_parallelism(), 2);

        let instance = InstanceDescriptor::new(
            "CI1",
            InstanceAddress::with_port("db", 1433),
            Credentials::new("monitor", "pw"),
        );
        let summary = collector
            .run(
                vec![instance],
                vec![
                    QueryDescriptor::new("a", "SELECT 1"),
                    QueryDescriptor::new("b", "SELECT 2"),
                ],
            )
            .await;

        assert_eq!(summary.outcomes, 2);
        assert_eq!(sink.deliveries().len(), 2);
    }
}
