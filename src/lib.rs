//! bm-bridge: supervised stdio JSON-RPC access to the `bm` knowledge graph.
//!
//! [`BmClient`] is the entry point. Build one from a [`BridgeConfig`] (see
//! [`bm_client::config::find_config_path`]) or over a custom
//! [`bm_client::SessionConnector`], then call typed note operations; the
//! bridge launches `bm mcp`, reconnects after crashes and retries calls that
//! failed for transport reasons.

pub mod bm_client;
pub mod logging;

pub use bm_client::{BmClient, BmError, BridgeConfig};
