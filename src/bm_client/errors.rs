//! bm client error types.
//!
//! Every failure surfaced by the bridge is a [`BmError`]. The enum is `Clone`
//! because a single connection attempt is awaited by many callers at once and
//! each of them observes the same outcome.

use thiserror::Error;

use super::classify;

/// Coarse error classes that callers and the retry machinery act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Spawn, handshake or I/O failure of the subprocess channel.
    Transport,
    /// The remote explicitly rejected the operation.
    Application,
    /// The remote answered with a payload the façade could not validate.
    InvalidResponse,
    /// Retry budget exhausted.
    ServiceUnavailable,
    /// The supervisor was stopped while the operation was in flight.
    Stopped,
    /// Configuration could not be loaded or is invalid.
    Config,
}

/// Errors that can occur while talking to the bm process.
#[derive(Debug, Clone, Error)]
pub enum BmError {
    /// The bm process could not be started.
    #[error("failed to spawn '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    /// The MCP initialization handshake failed.
    #[error("bm handshake failed: {reason}")]
    HandshakeFailed { reason: String },

    /// The handshake succeeded but required tools were not advertised.
    #[error("bm session is missing required tools: {}", missing.join(", "))]
    MissingTools { missing: Vec<String> },

    /// Channel-level failure (closed pipe, dead process, malformed frame).
    #[error("transport error: {reason}")]
    Transport { reason: String },

    /// A request did not complete within its deadline.
    #[error("'{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The remote returned a JSON-RPC error object.
    #[error("rpc error [{code}]: {message}")]
    Rpc { code: i32, message: String },

    /// The remote reported a tool-level failure (`isError: true`).
    #[error("{tool} failed: {message}")]
    Tool { tool: String, message: String },

    /// Arguments were rejected before the call was sent.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// The payload did not have the shape the operation requires.
    #[error("invalid response from {operation}: {reason}")]
    InvalidResponse { operation: String, reason: String },

    /// Terminal failure after the retry policy was exhausted.
    #[error("bm service unavailable after {attempts} attempts: {reason}")]
    ServiceUnavailable { attempts: u32, reason: String },

    /// The supervisor was stopped before the connection attempt finished.
    #[error("bm supervisor stopped")]
    Stopped,

    /// Configuration error (missing file, bad YAML, invalid values).
    #[error("config error: {reason}")]
    Config { reason: String },
}

impl BmError {
    pub(crate) fn transport(reason: impl Into<String>) -> Self {
        BmError::Transport {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_response(operation: &str, reason: impl Into<String>) -> Self {
        BmError::InvalidResponse {
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }

    /// Which class this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BmError::SpawnFailed { .. }
            | BmError::HandshakeFailed { .. }
            | BmError::MissingTools { .. }
            | BmError::Transport { .. }
            | BmError::Timeout { .. } => ErrorKind::Transport,
            BmError::Rpc { message, .. } if classify::is_recoverable_message(message) => {
                ErrorKind::Transport
            }
            BmError::Rpc { .. } | BmError::Tool { .. } | BmError::InvalidArguments { .. } => {
                ErrorKind::Application
            }
            BmError::InvalidResponse { .. } => ErrorKind::InvalidResponse,
            BmError::ServiceUnavailable { .. } => ErrorKind::ServiceUnavailable,
            BmError::Stopped => ErrorKind::Stopped,
            BmError::Config { .. } => ErrorKind::Config,
        }
    }

    /// Whether the session should be discarded and the call re-issued.
    ///
    /// Tool failures are never recoverable, even when their text matches a
    /// transport signature.
    pub fn is_recoverable(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    /// Text suitable for end users; internal detail stays in the logs.
    pub fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::Transport | ErrorKind::ServiceUnavailable | ErrorKind::Stopped => {
                "knowledge base is unavailable, try again shortly".to_string()
            }
            ErrorKind::Config => "knowledge base is not configured".to_string(),
            ErrorKind::Application | ErrorKind::InvalidResponse => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_variants_are_recoverable() {
        let errors = [
            BmError::transport("stdout closed"),
            BmError::Timeout {
                operation: "tools/call".into(),
                timeout_ms: 10,
            },
            BmError::HandshakeFailed {
                reason: "bad version".into(),
            },
            BmError::MissingTools {
                missing: vec!["schema_diff".into()],
            },
        ];
        for err in errors {
            assert!(err.is_recoverable(), "{err} should be recoverable");
        }
    }

    #[test]
    fn test_tool_error_never_recoverable() {
        let err = BmError::Tool {
            tool: "read_note".into(),
            message: "connection closed by database".into(),
        };
        assert!(!err.is_recoverable());
        assert_eq!(err.kind(), ErrorKind::Application);
    }

    #[test]
    fn test_rpc_error_uses_signature_table() {
        let dead = BmError::Rpc {
            code: -32000,
            message: "Client is closed".into(),
        };
        assert!(dead.is_recoverable());

        let bad_params = BmError::Rpc {
            code: -32602,
            message: "Invalid params".into(),
        };
        assert!(!bad_params.is_recoverable());
    }

    #[test]
    fn test_service_unavailable_not_recoverable() {
        let err = BmError::ServiceUnavailable {
            attempts: 4,
            reason: "broken pipe".into(),
        };
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("after 4 attempts"));
        assert!(err.to_string().contains("broken pipe"));
    }

    #[test]
    fn test_missing_tools_message_lists_names() {
        let err = BmError::MissingTools {
            missing: vec!["move_note".into(), "schema_diff".into()],
        };
        assert_eq!(
            err.to_string(),
            "bm session is missing required tools: move_note, schema_diff"
        );
    }

    #[test]
    fn test_user_message_hides_transport_detail() {
        let err = BmError::ServiceUnavailable {
            attempts: 2,
            reason: "EPIPE on fd 7".into(),
        };
        assert!(!err.user_message().contains("EPIPE"));

        let app = BmError::Tool {
            tool: "edit_note".into(),
            message: "Text to replace not found".into(),
        };
        assert!(app.user_message().contains("Text to replace not found"));
    }
}
