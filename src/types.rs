//! Core data types shared by the connection layer, the pipeline and the sinks

use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound for a single extra label value
pub const MAX_LABEL_VALUE_LEN: usize = 8000;

/// Default SQL Server TCP port
pub const DEFAULT_PORT: u16 = 1433;

/// Network location of one SQL Server instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceAddress {
    /// Host name or IP address
    pub host: String,
    /// TCP port (takes precedence over `instance_name`)
    pub port: Option<u16>,
    /// Named instance, resolved through the SQL Browser service
    pub instance_name: Option<String>,
}

impl InstanceAddress {
    /// Address with an explicit port
    pub fn with_port(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: Some(port),
            instance_name: None,
        }
    }

    /// Address of a named instance
    pub fn named(host: impl Into<String>, instance_name: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            instance_name: Some(instance_name.into()),
        }
    }
}

impl fmt::Display for InstanceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.port, self.instance_name.as_deref()) {
            (Some(port), _) => write!(f, "{},{}", self.host, port),
            (None, Some(name)) if !name.trim().is_empty() => {
                write!(f, "{}\\{}", self.host, name.trim())
            }
            _ => write!(f, "{},{}", self.host, DEFAULT_PORT),
        }
    }
}

/// SQL Server login
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    /// Login name
    pub username: String,
    /// Password (resolved before orchestration starts)
    pub password: String,
}

impl Credentials {
    /// Create credentials
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Whether a password still has to be resolved
    pub fn needs_password(&self) -> bool {
        self.password.is_empty()
    }
}

// Keep passwords out of Debug output and therefore out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// One target database server to poll
#[derive(Debug, Clone)]
pub struct InstanceDescriptor {
    /// Instance identifier (`ci` code)
    pub ci: String,
    /// Network location
    pub address: InstanceAddress,
    /// Login
    pub credentials: Credentials,
    /// Free-form metadata forwarded as metric labels, in configured order
    pub extra_labels: Vec<(String, String)>,
}

impl InstanceDescriptor {
    /// Create a descriptor without extra labels
    pub fn new(ci: impl Into<String>, address: InstanceAddress, credentials: Credentials) -> Self {
        Self {
            ci: ci.into(),
            address,
            credentials,
            extra_labels: Vec::new(),
        }
    }

    /// Append an extra label
    ///
    /// Blank keys and blank values are ignored, values are trimmed and capped
    /// at [`MAX_LABEL_VALUE_LEN`] characters, and a repeated key replaces the
    /// earlier value in place.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push_label(key.into(), value.into());
        self
    }

    pub(crate) fn push_label(&mut self, key: String, value: String) {
        let key = key.trim().to_string();
        let value = value.trim();
        if key.is_empty() || value.is_empty() {
            return;
        }
        let value: String = value.chars().take(MAX_LABEL_VALUE_LEN).collect();
        match self.extra_labels.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.extra_labels.push((key, value)),
        }
    }
}

/// A named query applied to every instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    /// Identifier used for output naming and labeling
    pub request_id: String,
    /// Opaque SQL text
    pub query_text: String,
}

impl QueryDescriptor {
    /// Create a query descriptor
    pub fn new(request_id: impl Into<String>, query_text: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            query_text: query_text.into(),
        }
    }
}

/// One record of a row-set; cells are rendered as text, `None` is SQL NULL
pub type Row = Vec<Option<String>>;

/// Result of one statement: column names plus rows
///
/// A row-set is moved from the connection into the sink and consumed there,
/// so at most one row-set per instance is alive at any time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowSet {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl RowSet {
    /// Create a row-set
    ///
    /// Rows shorter than the column list are padded with NULLs; longer rows
    /// are truncated.
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, None);
                row
            })
            .collect();
        Self { columns, rows }
    }

    /// Column names in result order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether there are no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column, compared case-insensitively
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Split into column names and a single-pass row iterator
    pub fn into_parts(self) -> (Vec<String>, std::vec::IntoIter<Row>) {
        (self.columns, self.rows.into_iter())
    }
}

/// Which stage produced a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The instance never came online (unreachable, login rejected)
    Connect,
    /// The statement failed on a healthy connection
    Query,
}

impl FailureKind {
    /// Label value used in logs and run metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Connect => "connect_failure",
            FailureKind::Query => "query_failure",
        }
    }
}

/// Result of running one query against one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The query ran; carries its rows
    Success(RowSet),
    /// The query did not produce rows
    Failure {
        /// Stage that failed
        kind: FailureKind,
        /// Human-readable message
        message: String,
    },
}

impl ExecutionOutcome {
    /// Build a connect-level failure
    pub fn connect_failure(message: impl Into<String>) -> Self {
        ExecutionOutcome::Failure {
            kind: FailureKind::Connect,
            message: message.into(),
        }
    }

    /// Build a query-level failure
    pub fn query_failure(message: impl Into<String>) -> Self {
        ExecutionOutcome::Failure {
            kind: FailureKind::Query,
            message: message.into(),
        }
    }

    /// Whether this outcome carries rows
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success(_))
    }

    /// Failure stage, if any
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            ExecutionOutcome::Success(_) => None,
            ExecutionOutcome::Failure { kind, .. } => Some(*kind),
        }
    }

    /// Outcome text handed to the sinks
    pub fn outcome_text(&self) -> &str {
        match self {
            ExecutionOutcome::Success(_) => "OK",
            ExecutionOutcome::Failure { message, .. } => message,
        }
    }

    /// Label value used in logs and run metrics
    pub fn kind_label(&self) -> &'static str {
        match self {
            ExecutionOutcome::Success(_) => "success",
            ExecutionOutcome::Failure { kind, .. } => kind.as_str(),
        }
    }
}
