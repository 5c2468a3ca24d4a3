//! bm process lifecycle management.
//!
//! Spawns the bm child process, performs the MCP handshake, forwards its
//! stderr into tracing, and shuts it down. The [`ToolSession`] and
//! [`SessionConnector`] traits are the seam the supervisor drives, so the
//! retry and concurrency logic can be exercised without real processes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::errors::BmError;
use super::transport::{extract_result, StdioTransport};
use super::types::{CallToolResult, InitializeResult, ToolsListPage, PROTOCOL_VERSION};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default timeout for the initialize handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for graceful shutdown before force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on `tools/list` pages; guards against a cursor that never ends.
const MAX_TOOL_PAGES: usize = 32;

/// Stderr lines containing any of these are logged at warn.
const STDERR_WARN_MARKERS: &[&str] = &["error", "warn", "traceback", "exception"];

// ─── Seams ───────────────────────────────────────────────────────────────────

/// Invoked with the session id when a session's channel dies on its own.
pub type ExitHook = Arc<dyn Fn(&str) + Send + Sync>;

/// One live connection to a bm process.
pub trait ToolSession: Send + Sync {
    /// Unique id for this session, used in logs and liveness bookkeeping.
    fn id(&self) -> &str;

    /// Tool names advertised during the handshake.
    fn tool_names(&self) -> &[String];

    fn is_alive(&self) -> bool;

    /// Issue `tools/call`. Application failures come back as
    /// `CallToolResult { is_error: true, .. }`, not as `Err`.
    fn call_tool<'a>(
        &'a self,
        name: &'a str,
        arguments: Value,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CallToolResult, BmError>>;

    /// Best-effort teardown. Never fails.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Opens new sessions. Each call to `open` is one spawn attempt.
pub trait SessionConnector: Send + Sync {
    fn open(&self, on_exit: ExitHook) -> BoxFuture<'_, Result<Arc<dyn ToolSession>, BmError>>;
}

// ─── Process Command ─────────────────────────────────────────────────────────

/// How to launch the bm process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl ServerCommand {
    /// `bm mcp --transport stdio --project <project>`.
    pub fn bm(program: &str, project: &str) -> Self {
        Self {
            program: program.to_string(),
            args: vec![
                "mcp".to_string(),
                "--transport".to_string(),
                "stdio".to_string(),
                "--project".to_string(),
                project.to_string(),
            ],
            cwd: None,
            env: HashMap::new(),
        }
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

// ─── StdioSession ────────────────────────────────────────────────────────────

/// A running bm process with its transport and advertised tools.
pub struct StdioSession {
    id: String,
    process: Mutex<Option<Child>>,
    transport: StdioTransport,
    tools: Vec<String>,
    stderr_task: Option<JoinHandle<()>>,
}

impl StdioSession {
    /// Spawn the process and perform the handshake.
    ///
    /// `on_exit` fires once if the process's stdout closes while the session
    /// is still open.
    pub async fn open(
        command: &ServerCommand,
        handshake_timeout: Duration,
        on_exit: ExitHook,
    ) -> Result<Self, BmError> {
        let id = uuid::Uuid::new_v4().to_string();

        let mut child = command
            .to_command()
            .spawn()
            .map_err(|e| BmError::SpawnFailed {
                command: command.program.clone(),
                reason: format!("{e}"),
            })?;

        let stdin = child.stdin.take().ok_or(BmError::SpawnFailed {
            command: command.program.clone(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(BmError::SpawnFailed {
            command: command.program.clone(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(forward_stderr(id.clone(), stderr)));

        tracing::debug!(
            session_id = %id,
            program = %command.program,
            args = ?command.args,
            pid = child.id(),
            "spawned bm process"
        );

        let transport = StdioTransport::spawn(
            &id,
            stdin,
            stdout,
            Box::new(move |session_id: &str| on_exit(session_id)),
        );

        let tools = match tokio::time::timeout(handshake_timeout, handshake(&transport)).await {
            Ok(Ok(tools)) => tools,
            Ok(Err(e)) => {
                transport.shutdown().await;
                let _ = child.kill().await;
                return Err(match e {
                    BmError::HandshakeFailed { .. } => e,
                    other => BmError::HandshakeFailed {
                        reason: other.to_string(),
                    },
                });
            }
            Err(_) => {
                transport.shutdown().await;
                let _ = child.kill().await;
                return Err(BmError::HandshakeFailed {
                    reason: format!(
                        "initialization timed out after {}ms",
                        handshake_timeout.as_millis()
                    ),
                });
            }
        };

        tracing::info!(session_id = %id, tools = tools.len(), "bm session established");

        Ok(Self {
            id,
            process: Mutex::new(Some(child)),
            transport,
            tools,
            stderr_task,
        })
    }

    async fn shutdown(&self) {
        self.transport.shutdown().await;

        let Some(mut child) = self.process.lock().await.take() else {
            return;
        };

        // Closing stdin asks the server to exit; kill if it lingers.
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(session_id = %self.id, %status, "bm process exited");
            }
            _ => {
                let _ = child.kill().await;
                tracing::debug!(session_id = %self.id, "bm process killed after shutdown timeout");
            }
        }
    }
}

impl Drop for StdioSession {
    fn drop(&mut self) {
        if let Some(task) = &self.stderr_task {
            task.abort();
        }
    }
}

impl ToolSession for StdioSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn tool_names(&self) -> &[String] {
        &self.tools
    }

    fn is_alive(&self) -> bool {
        !self.transport.is_closed()
    }

    fn call_tool<'a>(
        &'a self,
        name: &'a str,
        arguments: Value,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CallToolResult, BmError>> {
        async move {
            let params = json!({ "name": name, "arguments": arguments });
            let response = self
                .transport
                .request("tools/call", Some(params), timeout)
                .await?;
            let result = extract_result(response)?;
            serde_json::from_value(result)
                .map_err(|e| BmError::invalid_response(name, format!("malformed tools/call result: {e}")))
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        self.shutdown().boxed()
    }
}

/// MCP handshake: `initialize`, `notifications/initialized`, then every
/// page of `tools/list`. Returns the advertised tool names.
async fn handshake(transport: &StdioTransport) -> Result<Vec<String>, BmError> {
    let params = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    });
    let response = transport
        .request("initialize", Some(params), DEFAULT_HANDSHAKE_TIMEOUT)
        .await?;
    let init: InitializeResult = serde_json::from_value(extract_result(response)?).map_err(|e| {
        BmError::HandshakeFailed {
            reason: format!("failed to parse initialize response: {e}"),
        }
    })?;
    tracing::debug!(
        protocol = %init.protocol_version,
        server = ?init.server_info.as_ref().and_then(|s| s.name.clone()),
        version = ?init.server_info.as_ref().and_then(|s| s.version.clone()),
        "initialize accepted"
    );

    transport.notify("notifications/initialized", None).await?;

    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;
    for _ in 0..MAX_TOOL_PAGES {
        let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
        let response = transport
            .request("tools/list", params, DEFAULT_HANDSHAKE_TIMEOUT)
            .await?;
        let page: ToolsListPage =
            serde_json::from_value(extract_result(response)?).map_err(|e| {
                BmError::HandshakeFailed {
                    reason: format!("failed to parse tools/list response: {e}"),
                }
            })?;
        tools.extend(page.tools.into_iter().map(|t| t.name));
        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => return Ok(tools),
        }
    }

    Err(BmError::HandshakeFailed {
        reason: format!("tools/list exceeded {MAX_TOOL_PAGES} pages"),
    })
}

/// Forward the child's stderr into tracing until it closes.
async fn forward_stderr(session_id: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if is_warning_line(line) {
            tracing::warn!(session_id = %session_id, stderr = %line, "bm stderr");
        } else {
            tracing::debug!(session_id = %session_id, stderr = %line, "bm stderr");
        }
    }
}

fn is_warning_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    STDERR_WARN_MARKERS.iter().any(|m| lower.contains(m))
}

// ─── StdioConnector ──────────────────────────────────────────────────────────

/// Connector that launches a real bm process per session.
#[derive(Debug, Clone)]
pub struct StdioConnector {
    command: ServerCommand,
    handshake_timeout: Duration,
}

impl StdioConnector {
    pub fn new(command: ServerCommand, handshake_timeout: Duration) -> Self {
        Self {
            command,
            handshake_timeout,
        }
    }

    pub fn command(&self) -> &ServerCommand {
        &self.command
    }
}

impl SessionConnector for StdioConnector {
    fn open(&self, on_exit: ExitHook) -> BoxFuture<'_, Result<Arc<dyn ToolSession>, BmError>> {
        async move {
            let session = StdioSession::open(&self.command, self.handshake_timeout, on_exit).await?;
            Ok(Arc::new(session) as Arc<dyn ToolSession>)
        }
        .boxed()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bm_command_args() {
        let cmd = ServerCommand::bm("bm", "research");
        assert_eq!(cmd.program, "bm");
        assert_eq!(
            cmd.args,
            vec!["mcp", "--transport", "stdio", "--project", "research"]
        );
        assert!(cmd.cwd.is_none());
    }

    #[test]
    fn test_warning_line_detection() {
        assert!(is_warning_line("WARNING: sync lagging"));
        assert!(is_warning_line("Traceback (most recent call last):"));
        assert!(is_warning_line("2026-01-01 ERROR db locked"));
        assert!(!is_warning_line("INFO indexed 12 files"));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let cmd = ServerCommand::bm("/nonexistent/bm-binary-for-tests", "main");
        let hook: ExitHook = Arc::new(|_: &str| {});
        let err = StdioSession::open(&cmd, Duration::from_secs(1), hook)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BmError::SpawnFailed { .. }));
        assert!(err.is_recoverable());
    }
}
