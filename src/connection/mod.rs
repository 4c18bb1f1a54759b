//! Connection Provider
//!
//! Opens one database connection per instance. There is no pooling across
//! instances and no retry: a failed open is reported once as a
//! [`ConnectError`] and the orchestrator turns it into per-query failures.
//!
//! # Architecture
//!
//! ```text
//! InstanceAddress ──▶ raw connection string ──▶ enrich() ──▶ driver config
//!                                                              │
//!                          Credentials (SQL login) ────────────┤
//!                                                              ▼
//!                                              ConnectionProvider::open()
//!                                                              │
//!                                   Box<dyn Connection> ◀──────┘
//!                                     │  execute(sql) -> RowSet
//!                                     └─ close()
//! ```

pub mod enrich;
pub mod tds;

pub use enrich::{default_application_name, enrich};
pub use tds::{TdsConnection, TdsConnectionProvider};

use async_trait::async_trait;

use crate::error::{ConnectError, QueryError};
use crate::types::{InstanceAddress, InstanceDescriptor, RowSet};

// ============================================================================
// Traits
// ============================================================================

/// An open connection to one instance
///
/// Statements run one at a time; implementations are never shared between
/// instance tasks.
#[async_trait]
pub trait Connection: Send {
    /// Run a statement and return its first result set
    async fn execute(&mut self, query_text: &str) -> Result<RowSet, QueryError>;

    /// Close the connection; errors are logged by the implementation
    async fn close(self: Box<Self>);
}

/// Factory for per-instance connections
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Open a connection to `instance`
    ///
    /// Error messages must not contain the instance password.
    async fn open(&self, instance: &InstanceDescriptor)
        -> Result<Box<dyn Connection>, ConnectError>;
}

// ============================================================================
// Connection strings
// ============================================================================

/// Build the driver address string for an instance, before enrichment
///
/// `server=tcp:host,port` when a port is known, `server=host\name` for named
/// instances.
pub fn raw_connection_string(address: &InstanceAddress) -> String {
    match (address.port, address.instance_name.as_deref()) {
        (None, Some(name)) if !name.trim().is_empty() => {
            format!("server={}", address)
        }
        _ => format!("server=tcp:{}", address),
    }
}

/// Build the enriched connection string for an instance
pub fn connection_string(address: &InstanceAddress) -> Result<String, ConnectError> {
    if address.host.trim().is_empty() {
        return Err(ConnectError::Address("host must not be empty".to_string()));
    }
    enrich(&raw_connection_string(address))
}

/// Replace every verbatim occurrence of `secret` with `***`
pub fn redact(text: &str, secret: &str) -> String {
    if secret.is_empty() {
        return text.to_string();
    }
    text.replace(secret, "***")
}

/// Mask `password=` / `pwd=` values of an ADO-style connection string
pub fn redact_connection_string(conn: &str) -> String {
    conn.split(';')
        .map(|part| match part.split_once('=') {
            Some((key, _)) if is_secret_key(key) => format!("{}=***", key),
            _ => part.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";")
}

fn is_secret_key(key: &str) -> bool {
    let key = key.trim().to_ascii_lowercase();
    key == "password" || key == "pwd"
}
