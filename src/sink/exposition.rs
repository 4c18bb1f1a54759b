//! Prometheus text exposition helpers
//!
//! Turns row-sets into `name{label="value",...} number` lines. Metric and
//! label names are forced into the token grammar `[a-zA-Z_:][a-zA-Z0-9_:]*`.

use std::fmt::Write;

use tracing::warn;

use crate::types::{InstanceDescriptor, RowSet};

/// Content type of a pushed exposition body
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Name used when a metric name is missing or empty
pub const FALLBACK_NAME: &str = "no_name_metric";

/// Metric emitted for an instance that could not be connected
pub const AVAILABILITY_METRIC: &str = "availability";

/// Label carrying the instance identifier
pub const CI_LABEL: &str = "ci";

/// Force `raw` into the metric/label token grammar
///
/// Each run of invalid characters becomes a single `_`, a leading digit gets
/// a `_` prefix and an empty result falls back to [`FALLBACK_NAME`].
/// Idempotent: valid tokens are returned unchanged.
pub fn sanitize_name(raw: &str) -> String {
    let raw = raw.trim();
    let mut out = String::with_capacity(raw.len() + 1);
    let mut in_invalid_run = false;

    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
            out.push(c);
            in_invalid_run = false;
        } else if !in_invalid_run {
            out.push('_');
            in_invalid_run = true;
        }
    }

    if out.is_empty() {
        return FALLBACK_NAME.to_string();
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Escape a label value: backslash, double quote and newline
pub fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

/// Sample value text for a cell; `None` when the cell is not a float
///
/// Finite values keep the cell's own digits so large integer counters are
/// not rounded through `f64`. `NaN` and `±Inf` are accepted in any of the
/// spellings Rust parses and re-spelled for the exposition format.
pub fn sample_value_text(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let value = raw.parse::<f64>().ok()?;
    if value.is_finite() {
        Some(raw.to_string())
    } else {
        Some(format_sample_value(value))
    }
}

/// Render a sample value the way the exposition format spells it
pub fn format_sample_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        let spelled = if value > 0.0 { "+Inf" } else { "-Inf" };
        spelled.to_string()
    } else {
        value.to_string()
    }
}

/// Ordered label set with first-occurrence-wins semantics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LabelSet {
    labels: Vec<(String, String)>,
}

impl LabelSet {
    /// Label set seeded with the instance identifier and extra labels
    pub fn for_instance(instance: &InstanceDescriptor) -> Self {
        let mut set = Self::default();
        set.insert(CI_LABEL, &instance.ci);
        for (key, value) in &instance.extra_labels {
            set.insert(key, value);
        }
        set
    }

    /// Add a label unless its sanitized name is already present
    ///
    /// Empty values are skipped.
    pub fn insert(&mut self, name: &str, value: &str) {
        if value.is_empty() {
            return;
        }
        let name = sanitize_name(name);
        if self.labels.iter().any(|(existing, _)| *existing == name) {
            return;
        }
        self.labels.push((name, value.to_string()));
    }

    /// Number of labels
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    fn write_to(&self, out: &mut String) {
        if self.labels.is_empty() {
            return;
        }
        out.push('{');
        for (i, (name, value)) in self.labels.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let _ = write!(out, "{}=\"{}\"", name, escape_label_value(value));
        }
        out.push('}');
    }
}

/// Append one sample line
pub fn write_sample(out: &mut String, name: &str, labels: &LabelSet, value: &str) {
    out.push_str(name);
    labels.write_to(out);
    let _ = writeln!(out, " {}", value);
}

/// Column roles of a metrics row-set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricColumns {
    /// Column holding the metric name
    pub name: String,
    /// Column holding the sample value
    pub value: String,
}

impl Default for MetricColumns {
    fn default() -> Self {
        Self {
            name: "metric_name".to_string(),
            value: "metric_value".to_string(),
        }
    }
}

/// Exposition body built from one row-set
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RenderedBatch {
    /// Newline-terminated sample lines
    pub body: String,
    /// Rows turned into samples
    pub samples: usize,
    /// Rows dropped for a missing or invalid value
    pub skipped: usize,
}

/// Render every row of `rows` as a sample
///
/// Label precedence: `ci`, then the instance's extra labels, then row
/// columns in result order. Null or empty cells produce no label.
pub fn render_rows(
    instance: &InstanceDescriptor,
    request_id: &str,
    rows: RowSet,
    columns: &MetricColumns,
) -> RenderedBatch {
    let name_idx = rows.column_index(&columns.name);
    let value_idx = rows.column_index(&columns.value);
    let base = LabelSet::for_instance(instance);
    let (column_names, rows) = rows.into_parts();

    let mut batch = RenderedBatch::default();
    let Some(value_idx) = value_idx else {
        batch.skipped = rows.len();
        if batch.skipped > 0 {
            warn!(
                ci = %instance.ci,
                request_id = %request_id,
                column = %columns.value,
                "Value column missing, no samples emitted"
            );
        }
        return batch;
    };

    for row in rows {
        let value = row[value_idx].as_deref().and_then(sample_value_text);
        let Some(value) = value else {
            warn!(
                ci = %instance.ci,
                request_id = %request_id,
                value = ?row[value_idx],
                "Skipping row with invalid metric value"
            );
            batch.skipped += 1;
            continue;
        };

        let name = name_idx
            .and_then(|i| row[i].as_deref())
            .map(sanitize_name)
            .unwrap_or_else(|| FALLBACK_NAME.to_string());

        let mut labels = base.clone();
        for (i, cell) in row.iter().enumerate() {
            if Some(i) == name_idx || i == value_idx {
                continue;
            }
            if let Some(cell) = cell {
                labels.insert(&column_names[i], cell);
            }
        }

        write_sample(&mut batch.body, &name, &labels, &value);
        batch.samples += 1;
    }

    batch
}

/// Render the synthetic `availability 0` sample for an unreachable instance
pub fn render_unavailable(instance: &InstanceDescriptor) -> String {
    let mut body = String::new();
    write_sample(
        &mut body,
        AVAILABILITY_METRIC,
        &LabelSet::for_instance(instance),
        "0",
    );
    body
}
