//! File sink: one JSON document per (instance, query)
//!
//! Layout:
//!
//! ```text
//! <base>/
//! └── out_<yyyyMMdd_HHmm>/        one directory per run
//!     ├── <ci>_<request_id>.json
//!     └── ...
//! ```

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::document::ResultDocument;
use crate::context::RunContext;
use crate::error::SinkError;
use crate::types::{ExecutionOutcome, InstanceDescriptor};

/// Writes result documents into a run-scoped directory
#[derive(Debug)]
pub struct FileSink {
    /// Directory that receives the run directory
    base_dir: PathBuf,
    /// `out_<stamp>` name of this run's directory
    run_dir_name: String,
    /// Created on first write, exactly once
    run_dir: OnceCell<PathBuf>,
}

impl FileSink {
    /// Create a sink rooted at `base_dir` for the given run
    pub fn new(base_dir: impl Into<PathBuf>, ctx: &RunContext) -> Self {
        Self {
            base_dir: base_dir.into(),
            run_dir_name: format!("out_{}", ctx.stamp()),
            run_dir: OnceCell::new(),
        }
    }

    /// Path of the run directory (it may not exist yet)
    pub fn run_dir_path(&self) -> PathBuf {
        self.base_dir.join(&self.run_dir_name)
    }

    async fn ensure_run_dir(&self) -> Result<&Path, SinkError> {
        let dir = self
            .run_dir
            .get_or_try_init(|| async {
                let dir = self.run_dir_path();
                fs::create_dir_all(&dir).await?;
                info!(path = %dir.display(), "Created run output directory");
                Ok::<_, SinkError>(dir)
            })
            .await?;
        Ok(dir.as_path())
    }

    /// File name for one outcome
    pub fn document_name(ci: &str, request_id: &str) -> String {
        format!(
            "{}_{}.json",
            sanitize_component(ci),
            sanitize_component(request_id)
        )
    }

    /// Serialize and write one outcome
    pub async fn record(
        &self,
        instance: &InstanceDescriptor,
        request_id: &str,
        outcome: ExecutionOutcome,
    ) -> Result<(), SinkError> {
        let dir = self.ensure_run_dir().await?;
        let document = ResultDocument::from_outcome(&instance.ci, request_id, outcome);
        let contents = document.to_pretty_json()?;
        let name = Self::document_name(&instance.ci, request_id);
        if name != format!("{}_{}.json", instance.ci.trim(), request_id.trim()) {
            warn!(
                ci = %instance.ci,
                request_id = %request_id,
                file = %name,
                "Sanitized document name, distinct outcomes may share a file"
            );
        }
        let path = dir.join(name);

        // Atomic write: write to a temp file unique to this write, then rename
        let temp_path = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
        fs::write(&temp_path, contents).await?;
        fs::rename(&temp_path, &path).await?;

        debug!(
            ci = %instance.ci,
            request_id = %request_id,
            rows = document.rows.len(),
            marker = document.is_marker(),
            path = %path.display(),
            "Wrote result document"
        );
        Ok(())
    }
}

/// Replace filesystem-hostile characters with `_`
fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}
