//! Database callback sink
//!
//! Hands each outcome to a stored routine on a separate SQL Server as
//! `(ci, request_id, document, outcome)`.

use std::time::Duration;

use async_trait::async_trait;
use tiberius::Query;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::document::ResultDocument;
use crate::connection::enrich;
use crate::connection::tds::{connect_client, TdsClient};
use crate::error::SinkError;
use crate::types::{ExecutionOutcome, InstanceDescriptor};

/// Executes callback statements
#[async_trait]
pub trait CallbackTarget: Send + Sync {
    /// Run `statement` with four positional parameters `@P1..@P4`
    async fn call(&self, statement: &str, args: [&str; 4]) -> Result<(), SinkError>;
}

/// Statement text for a configured routine
///
/// A bare routine name (`dbo.save_result`, `[mon].[save]`) is wrapped in
/// `EXEC <name> @P1, @P2, @P3, @P4`. Anything else is a full statement; `?`
/// placeholders outside string literals are numbered `@P1`, `@P2`, ...
pub fn callback_statement(routine: &str) -> String {
    let routine = routine.trim();
    if is_bare_routine(routine) {
        format!("EXEC {} @P1, @P2, @P3, @P4", routine)
    } else {
        number_placeholders(routine)
    }
}

fn is_bare_routine(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    // Anything goes inside `[...]`, `]]` is an escaped bracket
    let mut quoted = false;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if quoted {
            if c == ']' {
                if chars.peek() == Some(&']') {
                    chars.next();
                } else {
                    quoted = false;
                }
            }
            continue;
        }
        match c {
            '[' => quoted = true,
            c if c.is_alphanumeric() || matches!(c, '_' | '.' | '#' | '$') => {}
            _ => return false,
        }
    }
    !quoted
}

fn number_placeholders(statement: &str) -> String {
    let mut out = String::with_capacity(statement.len() + 8);
    let mut in_literal = false;
    let mut next = 1;
    for c in statement.chars() {
        match c {
            '\'' => {
                in_literal = !in_literal;
                out.push(c);
            }
            '?' if !in_literal => {
                out.push_str("@P");
                out.push_str(&next.to_string());
                next += 1;
            }
            _ => out.push(c),
        }
    }
    out
}

/// Callback sink
pub struct DatabaseCallbackSink {
    target: Box<dyn CallbackTarget>,
    statement: String,
}

impl DatabaseCallbackSink {
    /// Sink calling `routine` over a lazily opened TDS connection
    pub fn new(
        connection_string: &str,
        routine: &str,
        connect_timeout: Duration,
    ) -> Result<Self, SinkError> {
        let connection_string =
            enrich(connection_string).map_err(|e| SinkError::Unavailable(e.to_string()))?;
        let target = TdsCallbackTarget {
            connection_string,
            connect_timeout,
            client: Mutex::new(None),
        };
        Ok(Self::with_target(routine, Box::new(target)))
    }

    /// Sink calling `routine` through a custom target
    pub fn with_target(routine: &str, target: Box<dyn CallbackTarget>) -> Self {
        Self {
            target,
            statement: callback_statement(routine),
        }
    }

    /// Statement sent for every outcome
    pub fn statement(&self) -> &str {
        &self.statement
    }

    /// Invoke the callback for one outcome
    pub async fn record(
        &self,
        instance: &InstanceDescriptor,
        request_id: &str,
        outcome: ExecutionOutcome,
    ) -> Result<(), SinkError> {
        let document = ResultDocument::from_outcome(&instance.ci, request_id, outcome);
        let payload = document.to_compact_json()?;
        let outcome_text = document.outcome.as_deref().unwrap_or_default();

        self.target
            .call(
                &self.statement,
                [instance.ci.as_str(), request_id, payload.as_str(), outcome_text],
            )
            .await?;

        debug!(
            ci = %instance.ci,
            request_id = %request_id,
            bytes = payload.len(),
            "Callback delivered"
        );
        Ok(())
    }
}

/// Callback target backed by one shared tiberius client
///
/// Calls are serialized on the client. A failed call drops the client; the
/// next call reconnects.
struct TdsCallbackTarget {
    connection_string: String,
    connect_timeout: Duration,
    client: Mutex<Option<TdsClient>>,
}

#[async_trait]
impl CallbackTarget for TdsCallbackTarget {
    async fn call(&self, statement: &str, args: [&str; 4]) -> Result<(), SinkError> {
        let mut guard = self.client.lock().await;

        if guard.is_none() {
            let client = connect_client(&self.connection_string, None, self.connect_timeout)
                .await
                .map_err(|e| SinkError::Unavailable(e.to_string()))?;
            info!("Opened callback connection");
            *guard = Some(client);
        }
        let Some(client) = guard.as_mut() else {
            return Err(SinkError::Unavailable(
                "callback connection not open".to_string(),
            ));
        };

        let mut query = Query::new(statement.to_string());
        for arg in args {
            query.bind(arg.to_string());
        }

        match query.execute(client).await {
            Ok(_) => Ok(()),
            Err(e) => {
                *guard = None;
                Err(SinkError::Callback(e.to_string()))
            }
        }
    }
}
