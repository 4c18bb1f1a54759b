//! Collection engine: per-instance query pipeline and bounded fan-out

pub mod builder;
pub mod orchestrator;
pub mod pipeline;

pub use builder::{Collector, CollectorBuilder, DEFAULT_MAX_PARALLELISM};
pub use orchestrator::{run_all, run_instance, worker_budget, InstanceReport, InstanceState, RunSummary};
pub use pipeline::{run_pipeline, PipelineReport};
