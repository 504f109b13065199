//! `tb-domain` — shared types for all ToolBridge crates.
//!
//! Contains the common error type, the provider-agnostic message and tool
//! types that flow through the agent graph, the LLM streaming event types,
//! OAuth credential blobs, and the gateway configuration.

pub mod config;
pub mod credentials;
pub mod error;
pub mod stream;
pub mod tool;

pub use error::{Error, Result};
