//! `tb-gateway` — the ToolBridge orchestration gateway.
//!
//! Mediates between an LLM reasoning loop and a fleet of user-registered
//! MCP tool servers: builds (or reuses) a tool-calling agent graph per
//! request, streams reasoning events to the caller, interrupts execution
//! when a tool needs human approval, and resumes from the checkpoint once
//! the user decides.

pub mod api;
pub mod cli;
pub mod runtime;
pub mod state;
