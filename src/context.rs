//! Per-run context
//!
//! Everything that used to be process-wide state (run timestamp, output
//! directory naming) is derived from one `RunContext` built at startup and
//! handed to the sinks.

use chrono::{DateTime, Local};
use uuid::Uuid;

/// Identity and start time of one collection run
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Unique id, attached to log lines of this run
    pub run_id: Uuid,
    /// Wall-clock start of the run
    pub started_at: DateTime<Local>,
}

impl RunContext {
    /// Context for a run starting now
    pub fn new() -> Self {
        Self::started_at(Local::now())
    }

    /// Context for a run with a fixed start time
    pub fn started_at(started_at: DateTime<Local>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
        }
    }

    /// Timestamp label used for run-scoped names (`yyyyMMdd_HHmm`)
    pub fn stamp(&self) -> String {
        self.started_at.format("%Y%m%d_%H%M").to_string()
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}
