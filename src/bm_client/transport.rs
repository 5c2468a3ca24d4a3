//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with the bm child process:
//! - Writing newline-delimited JSON-RPC requests to stdin
//! - A background reader that routes stdout responses to waiting requests by id
//! - Liveness tracking: EOF or a read error fails every pending request

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::errors::BmError;
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Response Router ─────────────────────────────────────────────────────────

type PendingMap = HashMap<u64, oneshot::Sender<Result<JsonRpcResponse, BmError>>>;

/// Pending requests keyed by id.
#[derive(Default)]
struct ResponseRouter {
    pending: Mutex<PendingMap>,
}

impl ResponseRouter {
    async fn register(&self, id: u64) -> oneshot::Receiver<Result<JsonRpcResponse, BmError>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        rx
    }

    async fn forget(&self, id: u64) {
        self.pending.lock().await.remove(&id);
    }

    /// Deliver a response; returns false when nobody waits for that id.
    async fn route(&self, response: JsonRpcResponse) -> bool {
        match self.pending.lock().await.remove(&response.id) {
            Some(tx) => tx.send(Ok(response)).is_ok(),
            None => false,
        }
    }

    async fn fail_all(&self, reason: &str) {
        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(BmError::transport(reason)));
        }
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    label: String,
    writer: Mutex<Option<BoxedWriter>>,
    router: Arc<ResponseRouter>,
    closed: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
}

impl StdioTransport {
    /// Wire a transport over the given streams and start the reader task.
    ///
    /// `on_close` runs once, from the reader task, when stdout reaches EOF or
    /// fails. It is not run when the transport is shut down locally.
    pub fn spawn<W, R>(
        label: &str,
        stdin: W,
        stdout: R,
        on_close: Box<dyn FnOnce(&str) + Send>,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let router = Arc::new(ResponseRouter::default());
        let closed = Arc::new(AtomicBool::new(false));
        let reader_task = tokio::spawn(read_loop(
            label.to_string(),
            BufReader::new(stdout),
            router.clone(),
            closed.clone(),
            on_close,
        ));

        Self {
            label: label.to_string(),
            writer: Mutex::new(Some(Box::new(stdin))),
            router,
            closed,
            reader_task,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send a request and wait for the response with the same id.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, BmError> {
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);
        let mut json = serde_json::to_string(&req)
            .map_err(|e| BmError::transport(format!("failed to serialize request: {e}")))?;
        json.push('\n');

        // Checked after registering: the reader marks the transport closed
        // before draining, so either the drain or this check sees the id.
        let rx = self.router.register(id).await;
        if self.is_closed() {
            self.router.forget(id).await;
            return Err(BmError::transport("not connected"));
        }
        if let Err(e) = self.write_line(&json).await {
            self.router.forget(id).await;
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BmError::transport("connection closed")),
            Err(_) => {
                self.router.forget(id).await;
                tracing::warn!(
                    session = %self.label,
                    method,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
                Err(BmError::Timeout {
                    operation: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), BmError> {
        let notification = JsonRpcNotification::new(method, params);
        let mut json = serde_json::to_string(&notification)
            .map_err(|e| BmError::transport(format!("failed to serialize notification: {e}")))?;
        json.push('\n');
        self.write_line(&json).await
    }

    async fn write_line(&self, line: &str) -> Result<(), BmError> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| BmError::transport("not connected"))?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| BmError::transport(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| BmError::transport(format!("failed to flush stdin: {e}")))
    }

    /// Close stdin, stop the reader, and fail anything still pending.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.reader_task.abort();
        self.router.fail_all("client is closed").await;
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn read_loop<R>(
    label: String,
    mut reader: BufReader<R>,
    router: Arc<ResponseRouter>,
    closed: Arc<AtomicBool>,
    on_close: Box<dyn FnOnce(&str) + Send>,
) where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    let reason = loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break "connection closed: stdout reached EOF".to_string(),
            Ok(_) => {}
            Err(e) => break format!("connection closed: read failed: {e}"),
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => {
                // Not JSON: stray diagnostic output on stdout.
                tracing::debug!(session = %label, line = %trimmed, "skipping non-JSON stdout line");
                continue;
            }
        };

        // Server-initiated requests and notifications carry a method.
        if value.get("method").is_some() {
            tracing::debug!(session = %label, message = %trimmed, "ignoring server message");
            continue;
        }

        match serde_json::from_value::<JsonRpcResponse>(value) {
            Ok(resp) => {
                let id = resp.id;
                if !router.route(resp).await {
                    tracing::debug!(session = %label, id, "response for unknown request id");
                }
            }
            Err(e) => {
                tracing::warn!(session = %label, error = %e, "malformed JSON-RPC response");
            }
        }
    };

    closed.store(true, Ordering::Release);
    tracing::debug!(session = %label, reason = %reason, "transport reader stopped");
    router.fail_all(&reason).await;
    on_close(&label);
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `BmError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<Value, BmError> {
    if let Some(err) = response.error {
        return Err(BmError::Rpc {
            code: err.code,
            message: err.message,
        });
    }

    response.result.ok_or(BmError::Rpc {
        code: -32603,
        message: "response missing both result and error".into(),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// Transport wired to in-memory pipes; returns the "server" ends.
    fn wired(
        closes: Arc<AtomicUsize>,
    ) -> (StdioTransport, BufReader<DuplexStream>, DuplexStream) {
        let (client_in, server_in) = duplex(64 * 1024);
        let (server_out, client_out) = duplex(64 * 1024);
        let transport = StdioTransport::spawn(
            "test",
            client_in,
            client_out,
            Box::new(move |_: &str| {
                closes.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (transport, BufReader::new(server_in), server_out)
    }

    async fn read_request(server_in: &mut BufReader<DuplexStream>) -> Value {
        let mut line = String::new();
        server_in.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[test]
    fn test_next_request_id_is_monotonic() {
        let id1 = next_request_id();
        let id2 = next_request_id();
        assert!(id2 > id1);
    }

    #[tokio::test]
    async fn test_request_roundtrip_skips_noise() {
        let (transport, mut server_in, mut server_out) = wired(Arc::new(AtomicUsize::new(0)));

        let server = tokio::spawn(async move {
            let req = read_request(&mut server_in).await;
            assert_eq!(req["method"], "tools/list");
            let id = req["id"].as_u64().unwrap();
            server_out.write_all(b"INFO starting up\n").await.unwrap();
            server_out
                .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\"}\n")
                .await
                .unwrap();
            let resp = format!("{{\"jsonrpc\":\"2.0\",\"id\":{id},\"result\":{{\"ok\":true}}}}\n");
            server_out.write_all(resp.as_bytes()).await.unwrap();
            server_out
        });

        let resp = transport
            .request("tools/list", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(extract_result(resp).unwrap()["ok"], true);
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_callers() {
        let (transport, mut server_in, mut server_out) = wired(Arc::new(AtomicUsize::new(0)));
        let transport = Arc::new(transport);

        let server = tokio::spawn(async move {
            let first = read_request(&mut server_in).await;
            let second = read_request(&mut server_in).await;
            for req in [second, first] {
                let id = req["id"].as_u64().unwrap();
                let method = req["method"].as_str().unwrap().to_string();
                let resp = serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {"method": method}});
                server_out
                    .write_all(format!("{resp}\n").as_bytes())
                    .await
                    .unwrap();
            }
            server_out
        });

        let a = {
            let t = transport.clone();
            tokio::spawn(async move { t.request("a", None, Duration::from_secs(5)).await })
        };
        let b = {
            let t = transport.clone();
            tokio::spawn(async move { t.request("b", None, Duration::from_secs(5)).await })
        };

        let a = extract_result(a.await.unwrap().unwrap()).unwrap();
        let b = extract_result(b.await.unwrap().unwrap()).unwrap();
        assert_eq!(a["method"], "a");
        assert_eq!(b["method"], "b");
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_eof_fails_pending_and_fires_close_hook() {
        let closes = Arc::new(AtomicUsize::new(0));
        let (transport, mut server_in, server_out) = wired(closes.clone());

        let server = tokio::spawn(async move {
            let _ = read_request(&mut server_in).await;
            drop(server_out);
            server_in
        });

        let err = transport
            .request("tools/call", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("connection closed"));
        drop(server.await.unwrap());

        tokio::task::yield_now().await;
        assert!(transport.is_closed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let err = transport
            .request("tools/call", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not connected"));
        assert!(transport.router.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_request_on_closed_transport_leaves_no_pending_entry() {
        let (transport, _server_in, _server_out) = wired(Arc::new(AtomicUsize::new(0)));
        transport.closed.store(true, Ordering::Release);

        let err = transport
            .request("tools/call", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not connected"));
        assert!(err.is_recoverable());
        assert!(transport.router.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_request_timeout_is_recoverable() {
        let (transport, _server_in, _server_out) = wired(Arc::new(AtomicUsize::new(0)));
        let err = transport
            .request("tools/call", None, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, BmError::Timeout { timeout_ms: 20, .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            id: 1,
            result: None,
            error: Some(super::super::types::JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        };
        match extract_result(resp).unwrap_err() {
            BmError::Rpc { code, message } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected Rpc, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            id: 1,
            result: None,
            error: None,
        };
        assert!(matches!(
            extract_result(resp).unwrap_err(),
            BmError::Rpc { code: -32603, .. }
        ));
    }
}
