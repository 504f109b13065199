//! `tb-mcp` — MCP (Model Context Protocol) client for ToolBridge.
//!
//! This crate provides:
//! - JSON-RPC 2.0 protocol types for communicating with MCP servers.
//! - SSE and streamable-HTTP transports for remote servers.
//! - A per-server [`McpConnector`] owning one persistent session, the
//!   OAuth token lifecycle (expiry detection, refresh, persistence,
//!   re-auth escalation), and a layered retry policy that distinguishes
//!   auth faults from transient faults.
//! - MCP "Smart Auth" OAuth discovery plus the authorization-code + PKCE
//!   flow used to register protected servers.

pub mod auth;
pub mod connector;
pub mod protocol;
pub mod token;
pub mod transport;

// Re-exports for convenience.
pub use connector::{ConnectorParams, CredentialStore, McpConnector, ToolListCache};
pub use protocol::McpToolDef;
pub use transport::{McpTransport, TransportError};
