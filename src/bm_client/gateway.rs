//! Call gateway: one named tool call against a guaranteed-live session.
//!
//! Recoverable failures (dead process, broken pipe, timeout) discard the
//! session and re-issue the whole call on a fresh one, following the retry
//! policy. Application failures propagate on the first attempt.

use std::time::{Duration, Instant};

use serde_json::Value;

use super::errors::BmError;
use super::supervisor::SessionSupervisor;
use super::types::CallToolResult;

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct CallGateway {
    supervisor: SessionSupervisor,
    call_timeout: Duration,
}

impl CallGateway {
    pub fn new(supervisor: SessionSupervisor, call_timeout: Duration) -> Self {
        Self {
            supervisor,
            call_timeout,
        }
    }

    pub fn supervisor(&self) -> &SessionSupervisor {
        &self.supervisor
    }

    /// Call `name` and return the raw envelope.
    ///
    /// A response flagged `isError` becomes [`BmError::Tool`] carrying the
    /// remote's text verbatim.
    pub async fn call_tool_raw(&self, name: &str, args: Value) -> Result<CallToolResult, BmError> {
        let mut delays = self.supervisor.retry_policy().delays();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let err = match self.call_once(name, &args).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_recoverable() => e,
                Err(e) => return Err(e),
            };

            match delays.next() {
                Some(delay) => {
                    tracing::warn!(
                        tool = name,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "recoverable bm call failure, reconnecting"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    tracing::error!(tool = name, attempts, error = %err, "bm call retries exhausted");
                    return Err(BmError::ServiceUnavailable {
                        attempts,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    /// Call `name` and return its structured payload.
    ///
    /// A response with only human-readable text is rejected: nothing
    /// downstream can safely reshape it. A payload of the exact form
    /// `{"result": X}` is the remote's wrapping of a non-object return and is
    /// unwrapped to `X`.
    pub async fn call_tool(&self, name: &str, args: Value) -> Result<Value, BmError> {
        let result = self.call_tool_raw(name, args).await?;
        let structured = result.structured_content.ok_or_else(|| {
            BmError::invalid_response(name, "response has no structured content")
        })?;
        Ok(unwrap_result_envelope(structured))
    }

    async fn call_once(&self, name: &str, args: &Value) -> Result<CallToolResult, BmError> {
        let session = self.supervisor.ensure_connected().await?;
        let started = Instant::now();

        match session.call_tool(name, args.clone(), self.call_timeout).await {
            Ok(result) if result.is_error => {
                let message = result.text();
                tracing::debug!(tool = name, message = %message, "bm tool reported failure");
                Err(BmError::Tool {
                    tool: name.to_string(),
                    message: if message.is_empty() {
                        "tool reported an error without a message".to_string()
                    } else {
                        message
                    },
                })
            }
            Ok(result) => {
                tracing::debug!(
                    tool = name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "bm tool call completed"
                );
                Ok(result)
            }
            Err(e) => {
                if e.is_recoverable() {
                    self.supervisor
                        .invalidate(session.id(), &e.to_string())
                        .await;
                }
                Err(e)
            }
        }
    }
}

fn unwrap_result_envelope(payload: Value) -> Value {
    match payload {
        Value::Object(mut map) if map.len() == 1 && map.contains_key("result") => {
            map.remove("result").unwrap_or(Value::Null)
        }
        other => other,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
