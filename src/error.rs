//! Error types for the collector

use std::time::Duration;

use thiserror::Error;

/// Main error type for the collector
///
/// Only setup paths (configuration, credentials, sink construction) surface
/// this type to the caller. Failures that happen while a run is in flight are
/// converted into outcomes and log lines instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Sink error
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Credential resolution error
    #[error("Credential error: {0}")]
    Credentials(String),
}

/// Connection errors: the instance is unreachable or rejected the login
#[derive(Error, Debug, Clone)]
pub enum ConnectError {
    /// The address or connection string could not be built or parsed
    #[error("invalid address: {0}")]
    Address(String),

    /// Connect + login did not finish in time
    #[error("connect timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The server rejected the login
    #[error("login failed (error {code}): {message}")]
    Login {
        /// SQL Server error number
        code: u32,
        /// Server-provided message
        message: String,
    },

    /// Network failure
    #[error("network error: {0}")]
    Io(String),

    /// Any other driver-level failure
    #[error("driver error: {0}")]
    Driver(String),
}

impl ConnectError {
    /// Replace every verbatim occurrence of `secret` in the message
    pub fn redacted(self, secret: &str) -> Self {
        let scrub = |s: String| crate::connection::redact(&s, secret);
        match self {
            ConnectError::Address(m) => ConnectError::Address(scrub(m)),
            ConnectError::Timeout(d) => ConnectError::Timeout(d),
            ConnectError::Login { code, message } => ConnectError::Login {
                code,
                message: scrub(message),
            },
            ConnectError::Io(m) => ConnectError::Io(scrub(m)),
            ConnectError::Driver(m) => ConnectError::Driver(scrub(m)),
        }
    }
}

/// Query errors: one statement failed on an otherwise healthy connection
#[derive(Error, Debug, Clone)]
pub enum QueryError {
    /// Error reported by the server (bad SQL, permissions, ...)
    #[error("SQL error {code}: {message}")]
    Sql {
        /// SQL Server error number
        code: u32,
        /// Server-provided message
        message: String,
    },

    /// Protocol, conversion or I/O failure while running the statement
    #[error("driver error: {0}")]
    Driver(String),
}

impl QueryError {
    /// Short class name used in log lines
    pub fn class(&self) -> &'static str {
        match self {
            QueryError::Sql { .. } => "sql",
            QueryError::Driver(_) => "driver",
        }
    }
}

/// Sink errors: a destination failed to record or forward an outcome
#[derive(Error, Debug)]
pub enum SinkError {
    /// Filesystem failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Document could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP transport failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Endpoint answered with a non-2xx status
    #[error("HTTP status {status} from {url}")]
    HttpStatus {
        /// Response status code
        status: u16,
        /// Target URL
        url: String,
    },

    /// The callback routine failed
    #[error("Callback failed: {0}")]
    Callback(String),

    /// The destination could not be reached at all
    #[error("Destination unavailable: {0}")]
    Unavailable(String),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read
    #[error("cannot read {path}: {source}")]
    Io {
        /// Path that failed
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for the expected schema
    #[error("cannot parse {path}: {message}")]
    Parse {
        /// Path that failed
        path: String,
        /// Parser message
        message: String,
    },

    /// A value failed validation
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
