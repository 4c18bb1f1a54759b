//! Result documents written by the file and callback sinks

use serde::{Deserialize, Serialize};

use crate::error::SinkError;
use crate::types::{ExecutionOutcome, Row};

/// Serialized form of one outcome
///
/// Rows are arrays aligned with `columns`; a failure produces a marker
/// document with no columns and no rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultDocument {
    /// Instance identifier
    pub ci: String,
    /// Query identifier
    pub request_id: String,
    /// `"OK"` or the failure message; omitted in compact documents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    /// Column names in result order
    pub columns: Vec<String>,
    /// Cell text, `null` for SQL NULL
    pub rows: Vec<Row>,
}

impl ResultDocument {
    /// Build a document from an outcome, consuming its rows
    pub fn from_outcome(ci: &str, request_id: &str, outcome: ExecutionOutcome) -> Self {
        let text = outcome.outcome_text().to_string();
        let (columns, rows) = match outcome {
            ExecutionOutcome::Success(rows) => {
                let (columns, rows) = rows.into_parts();
                (columns, rows.collect())
            }
            ExecutionOutcome::Failure { .. } => (Vec::new(), Vec::new()),
        };
        Self {
            ci: ci.to_string(),
            request_id: request_id.to_string(),
            outcome: Some(text),
            columns,
            rows,
        }
    }

    /// Whether this is a failure marker
    pub fn is_marker(&self) -> bool {
        self.outcome.as_deref().is_some_and(|o| o != "OK") && self.columns.is_empty()
    }

    /// Pretty JSON for files
    pub fn to_pretty_json(&self) -> Result<String, SinkError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Single-line JSON without the outcome, for the callback routine
    pub fn to_compact_json(&self) -> Result<String, SinkError> {
        #[derive(Serialize)]
        struct Compact<'a> {
            ci: &'a str,
            request_id: &'a str,
            columns: &'a [String],
            rows: &'a [Row],
        }
        Ok(serde_json::to_string(&Compact {
            ci: &self.ci,
            request_id: &self.request_id,
            columns: &self.columns,
            rows: &self.rows,
        })?)
    }
}
