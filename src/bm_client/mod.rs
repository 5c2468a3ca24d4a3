//! bm client: JSON-RPC over stdio to the `bm` knowledge-graph service.
//!
//! This module handles:
//! - Spawning the `bm mcp` subprocess and the MCP handshake
//! - Request/response correlation over newline-delimited JSON-RPC 2.0
//! - A single supervised session with lazy connect and backoff retry
//! - Recoverable-failure detection and transparent call re-issue
//! - Typed note, search, context, project and schema operations
//!
//! Everything outside this module talks to bm through [`BmClient`].

pub mod classify;
pub mod client;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod lifecycle;
pub mod results;
pub mod retry;
pub mod supervisor;
pub mod tools;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::{BmClient, ContextOptions, NoteEdit, SearchOptions, SearchType, WriteNoteOptions};
pub use config::{find_config_path, load_config, BridgeConfig};
pub use errors::{BmError, ErrorKind};
pub use gateway::CallGateway;
pub use lifecycle::{ServerCommand, SessionConnector, StdioConnector, ToolSession};
pub use retry::RetryPolicy;
pub use supervisor::{ConnectionState, SessionStatus, SessionSupervisor};
