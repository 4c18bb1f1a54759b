//! SQL Server fleet collector
//!
//! Runs a fixed list of queries against every instance of a SQL Server
//! fleet and routes each (instance, query) outcome to one destination:
//! JSON files, a stored routine on another server, or a Prometheus-style
//! push endpoint.
//!
//! ```text
//! CollectorConfig ──▶ PasswordResolver ──▶ Collector::run ──▶ RunSummary
//!                                              │
//!                          ┌───────────────────┼──────────────────┐
//!                          ▼                   ▼                  ▼
//!                  ConnectionProvider    run_pipeline       ResultSink
//!                   (tiberius, TDS)    (ordered queries)  (file/callback/push)
//! ```
//!
//! Failures never abort a run: an unreachable instance yields one failure
//! outcome per query, a failing query yields one failure outcome, and a
//! failing destination is logged and counted.

pub mod config;
pub mod connection;
pub mod context;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod observability;
pub mod sink;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{CollectorConfig, SinkConfiguration};
pub use connection::{Connection, ConnectionProvider, TdsConnectionProvider};
pub use context::RunContext;
pub use credentials::PasswordResolver;
pub use engine::{Collector, CollectorBuilder, RunSummary};
pub use error::{Error, Result};
pub use sink::{OutcomeSink, ResultSink};
pub use types::{
    Credentials, ExecutionOutcome, FailureKind, InstanceAddress, InstanceDescriptor,
    QueryDescriptor, RowSet,
};
