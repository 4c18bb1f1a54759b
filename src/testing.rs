//! Test doubles: a scripted connection provider, a recording sink and an
//! in-process HTTP capture server

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;

use crate::connection::{Connection, ConnectionProvider};
use crate::error::{ConnectError, QueryError};
use crate::sink::OutcomeSink;
use crate::types::{ExecutionOutcome, InstanceDescriptor, RowSet};

// ============================================================================
// Scripted provider
// ============================================================================

#[derive(Default)]
struct ProviderState {
    open_now: AtomicUsize,
    max_open: AtomicUsize,
    closed: AtomicUsize,
    executed: Mutex<HashMap<String, Vec<String>>>,
}

/// Provider with a fixed set of reachable instances
///
/// Unknown instances are unreachable, a wrong password is a login failure,
/// and statements listed with [`ScriptedProvider::fail_query`] fail with a
/// SQL error. Other statements return one row holding the instance's `ci`
/// and the statement, so every instance answers with its own data.
#[derive(Default)]
pub(crate) struct ScriptedProvider {
    passwords: HashMap<String, String>,
    failing: HashSet<String>,
    query_delay: Duration,
    state: Arc<ProviderState>,
}

impl ScriptedProvider {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make `ci` reachable with the given password
    pub(crate) fn serve(mut self, ci: &str, password: &str) -> Self {
        self.passwords.insert(ci.to_string(), password.to_string());
        self
    }

    /// Make `sql` fail on every instance
    pub(crate) fn fail_query(mut self, sql: &str) -> Self {
        self.failing.insert(sql.to_string());
        self
    }

    pub(crate) fn with_query_delay(mut self, delay: Duration) -> Self {
        self.query_delay = delay;
        self
    }

    /// Statements executed against `ci`, in order
    pub(crate) fn executed(&self, ci: &str) -> Vec<String> {
        self.state
            .executed
            .lock()
            .get(ci)
            .cloned()
            .unwrap_or_default()
    }

    /// Highest number of simultaneously open connections
    pub(crate) fn max_open(&self) -> usize {
        self.state.max_open.load(Ordering::SeqCst)
    }

    /// Connections currently open
    pub(crate) fn open_now(&self) -> usize {
        self.state.open_now.load(Ordering::SeqCst)
    }

    /// Connections closed so far
    pub(crate) fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionProvider for ScriptedProvider {
    async fn open(
        &self,
        instance: &InstanceDescriptor,
    ) -> Result<Box<dyn Connection>, ConnectError> {
        tokio::task::yield_now().await;

        let expected = self
            .passwords
            .get(&instance.ci)
            .ok_or_else(|| ConnectError::Io(format!("{}: no route to host", instance.address)))?;
        if *expected != instance.credentials.password {
            return Err(ConnectError::Login {
                code: 18456,
                message: format!(
                    "Login failed for user '{}'.",
                    instance.credentials.username
                ),
            });
        }

        let now = self.state.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_open.fetch_max(now, Ordering::SeqCst);

        Ok(Box::new(ScriptedConnection {
            ci: instance.ci.clone(),
            failing: self.failing.clone(),
            delay: self.query_delay,
            state: Arc::clone(&self.state),
        }))
    }
}

struct ScriptedConnection {
    ci: String,
    failing: HashSet<String>,
    delay: Duration,
    state: Arc<ProviderState>,
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn execute(&mut self, query_text: &str) -> Result<RowSet, QueryError> {
        self.state
            .executed
            .lock()
            .entry(self.ci.clone())
            .or_default()
            .push(query_text.to_string());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.failing.contains(query_text) {
            return Err(QueryError::Sql {
                code: 208,
                message: "Invalid object name 'nope'.".to_string(),
            });
        }
        Ok(RowSet::new(
            vec!["ci".to_string(), "statement".to_string()],
            vec![vec![Some(self.ci.clone()), Some(query_text.to_string())]],
        ))
    }

    async fn close(self: Box<Self>) {
        self.state.open_now.fetch_sub(1, Ordering::SeqCst);
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Recording sink
// ============================================================================

/// One outcome seen by [`RecordingSink`]
#[derive(Debug, Clone)]
pub(crate) struct Delivery {
    pub(crate) ci: String,
    pub(crate) request_id: String,
    pub(crate) outcome: ExecutionOutcome,
}

/// Sink that keeps every outcome in arrival order
#[derive(Default)]
pub(crate) struct RecordingSink {
    deliveries: Mutex<Vec<Delivery>>,
}

impl RecordingSink {
    pub(crate) fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }
}

#[async_trait]
impl OutcomeSink for RecordingSink {
    async fn handle(
        &self,
        instance: &InstanceDescriptor,
        request_id: &str,
        outcome: ExecutionOutcome,
    ) {
        self.deliveries.lock().push(Delivery {
            ci: instance.ci.clone(),
            request_id: request_id.to_string(),
            outcome,
        });
    }
}

/// Sink that panics on one request id and records everything else
pub(crate) struct PanickingSink {
    request_id: String,
    recorded: RecordingSink,
}

impl PanickingSink {
    pub(crate) fn on(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            recorded: RecordingSink::default(),
        }
    }

    pub(crate) fn recorded(&self) -> &RecordingSink {
        &self.recorded
    }
}

#[async_trait]
impl OutcomeSink for PanickingSink {
    async fn handle(
        &self,
        instance: &InstanceDescriptor,
        request_id: &str,
        outcome: ExecutionOutcome,
    ) {
        if request_id == self.request_id {
            panic!("sink failed on {}", request_id);
        }
        self.recorded.handle(instance, request_id, outcome).await;
    }
}

// ============================================================================
// HTTP capture server
// ============================================================================

type Captured = Arc<Mutex<Vec<(String, String)>>>;

/// axum server on an ephemeral port recording `(content-type, body)` of
/// every POST to `/import`
pub(crate) struct CaptureServer {
    addr: SocketAddr,
    requests: Captured,
}

impl CaptureServer {
    /// Start a server answering every request with `status`
    pub(crate) async fn start(status: u16) -> Self {
        let requests: Captured = Arc::new(Mutex::new(Vec::new()));
        let status = StatusCode::from_u16(status).unwrap();
        let app = Router::new()
            .route("/import", post(capture))
            .with_state((Arc::clone(&requests), status));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, requests }
    }

    pub(crate) fn url(&self) -> String {
        format!("http://{}/import", self.addr)
    }

    pub(crate) fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().clone()
    }
}

async fn capture(
    State((requests, status)): State<(Captured, StatusCode)>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    requests.lock().push((content_type, body));
    status
}
