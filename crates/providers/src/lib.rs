//! `tb-providers` — the LLM client layer.
//!
//! The gateway binds tools to a model and consumes a token stream through
//! the [`LlmProvider`] trait. One concrete adapter ships here (the
//! OpenAI-compatible contract, which also reaches Gemini deployments);
//! further adapters register through [`ProviderRegistry`]. This crate
//! also owns the failure classification the event streamer relies on
//! (quota vs. unavailable vs. internal) and the normalization of
//! `finish_reason` values at the adapter boundary.

pub mod openai_compat;
pub mod registry;
pub(crate) mod sse;
pub mod traits;
pub mod util;

pub use registry::ProviderRegistry;
pub use traits::{ChatRequest, LlmProvider};
pub use util::{classify_stream_error, normalize_finish_reason, StreamFailure};
