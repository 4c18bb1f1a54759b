//! SQL Server connections over TDS (tiberius)

use std::time::Duration;

use async_trait::async_trait;
use tiberius::error::Error as TdsError;
use tiberius::{AuthMethod, Client, ColumnData, Config, FromSql, SqlBrowser};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::debug;

use super::{connection_string, redact_connection_string, Connection, ConnectionProvider};
use crate::error::{ConnectError, QueryError};
use crate::types::{Credentials, InstanceDescriptor, Row, RowSet};

/// Default bound for TCP connect + login
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

pub(crate) type TdsClient = Client<Compat<TcpStream>>;

// ============================================================================
// Provider
// ============================================================================

/// Connection provider backed by the tiberius driver
#[derive(Debug, Clone)]
pub struct TdsConnectionProvider {
    /// Bound for TCP connect + login
    connect_timeout: Duration,
}

impl TdsConnectionProvider {
    /// Create a provider with a custom connect timeout
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TdsConnectionProvider {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl ConnectionProvider for TdsConnectionProvider {
    async fn open(
        &self,
        instance: &InstanceDescriptor,
    ) -> Result<Box<dyn Connection>, ConnectError> {
        let secret = instance.credentials.password.clone();
        let conn = connection_string(&instance.address).map_err(|e| e.redacted(&secret))?;

        debug!(
            ci = %instance.ci,
            connection = %redact_connection_string(&conn),
            user = %instance.credentials.username,
            "Connecting"
        );

        let client = connect_client(&conn, Some(&instance.credentials), self.connect_timeout)
            .await
            .map_err(|e| e.redacted(&secret))?;

        Ok(Box::new(TdsConnection { client }))
    }
}

/// Open a TDS client for an ADO-style connection string
///
/// `credentials` override any login embedded in the string. Named instances
/// are resolved through the SQL Browser service.
pub(crate) async fn connect_client(
    connection_string: &str,
    credentials: Option<&Credentials>,
    timeout: Duration,
) -> Result<TdsClient, ConnectError> {
    let mut config = Config::from_ado_string(connection_string)
        .map_err(|e| ConnectError::Address(e.to_string()))?;

    if let Some(creds) = credentials {
        config.authentication(AuthMethod::sql_server(&creds.username, &creds.password));
    }

    let attempt = async move {
        let tcp = TcpStream::connect_named(&config)
            .await
            .map_err(classify_connect_error)?;
        tcp.set_nodelay(true)
            .map_err(|e| ConnectError::Io(e.to_string()))?;
        Client::connect(config, tcp.compat_write())
            .await
            .map_err(classify_connect_error)
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(ConnectError::Timeout(timeout)),
    }
}

fn classify_connect_error(err: TdsError) -> ConnectError {
    match err {
        TdsError::Server(token) => ConnectError::Login {
            code: token.code(),
            message: token.message().to_string(),
        },
        io @ TdsError::Io { .. } => ConnectError::Io(io.to_string()),
        other => ConnectError::Driver(other.to_string()),
    }
}

fn classify_query_error(err: TdsError) -> QueryError {
    match err {
        TdsError::Server(token) => QueryError::Sql {
            code: token.code(),
            message: token.message().to_string(),
        },
        other => QueryError::Driver(other.to_string()),
    }
}

// ============================================================================
// Connection
// ============================================================================

/// One open TDS session
pub struct TdsConnection {
    client: TdsClient,
}

#[async_trait]
impl Connection for TdsConnection {
    async fn execute(&mut self, query_text: &str) -> Result<RowSet, QueryError> {
        let mut stream = self
            .client
            .simple_query(query_text)
            .await
            .map_err(classify_query_error)?;

        let columns: Vec<String> = stream
            .columns()
            .await
            .map_err(classify_query_error)?
            .map(|cols| cols.iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let rows: Vec<Row> = stream
            .into_first_result()
            .await
            .map_err(classify_query_error)?
            .into_iter()
            .map(|row| row.into_iter().map(cell_to_text).collect())
            .collect();

        Ok(RowSet::new(columns, rows))
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self.client.close().await {
            debug!(error = %e, "Connection close failed");
        }
    }
}

/// Render one cell as text; `None` for SQL NULL
fn cell_to_text(data: ColumnData<'static>) -> Option<String> {
    match data {
        ColumnData::U8(v) => v.map(|v| v.to_string()),
        ColumnData::I16(v) => v.map(|v| v.to_string()),
        ColumnData::I32(v) => v.map(|v| v.to_string()),
        ColumnData::I64(v) => v.map(|v| v.to_string()),
        ColumnData::F32(v) => v.map(|v| v.to_string()),
        ColumnData::F64(v) => v.map(|v| v.to_string()),
        ColumnData::Bit(v) => v.map(|b| if b { "1" } else { "0" }.to_string()),
        ColumnData::String(v) => v.map(|s| s.into_owned()),
        ColumnData::Guid(v) => v.map(|g| g.to_string()),
        ColumnData::Numeric(v) => v.map(|n| n.to_string()),
        ColumnData::Binary(v) => v.map(|bytes| {
            let mut hex = String::with_capacity(2 + bytes.len() * 2);
            hex.push_str("0x");
            for b in bytes.iter() {
                hex.push_str(&format!("{:02X}", b));
            }
            hex
        }),
        ColumnData::Xml(v) => v.map(|xml| xml.into_owned().into_string()),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            chrono::NaiveDateTime::from_sql(&data)
                .ok()
                .flatten()
                .map(|d| d.to_string())
        }
        ColumnData::Date(_) => chrono::NaiveDate::from_sql(&data)
            .ok()
            .flatten()
            .map(|d| d.to_string()),
        ColumnData::Time(_) => chrono::NaiveTime::from_sql(&data)
            .ok()
            .flatten()
            .map(|t| t.to_string()),
        ColumnData::DateTimeOffset(_) => {
            chrono::DateTime::<chrono::FixedOffset>::from_sql(&data)
                .ok()
                .flatten()
                .map(|d| d.to_rfc3339())
        }
        #[allow(unreachable_patterns)]
        other => Some(format!("{:?}", other)),
    }
}
