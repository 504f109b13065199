//! Provider registry.
//!
//! Holds the instantiated LLM adapters, keyed by provider ID. Adapters
//! are constructed at bootstrap from environment configuration; a
//! provider whose key is missing is skipped, not fatal.

use std::collections::HashMap;
use std::sync::Arc;

use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::LlmProvider;

#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

/// `(provider id, env var for the key, base URL, default model)`.
///
/// Every entry speaks the OpenAI chat-completions contract; Gemini is
/// reached through its OpenAI-compatible endpoint.
const KNOWN_PROVIDERS: &[(&str, &str, &str, &str)] = &[
    (
        "openai",
        "OPENAI_API_KEY",
        "https://api.openai.com/v1",
        "gpt-4o",
    ),
    (
        "gemini",
        "GEMINI_API_KEY",
        "https://generativelanguage.googleapis.com/v1beta/openai",
        "gemini-2.5-flash",
    ),
];

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instantiate every known provider whose API key is present in the
    /// environment.
    pub fn from_env() -> Self {
        let mut registry = Self::new();
        for (id, key_env, base_url, default_model) in KNOWN_PROVIDERS {
            match std::env::var(key_env) {
                Ok(key) if !key.is_empty() => {
                    match OpenAiCompatProvider::new(*id, *base_url, key, *default_model) {
                        Ok(provider) => {
                            tracing::info!(provider = id, "LLM provider initialized");
                            registry.register(Arc::new(provider));
                        }
                        Err(e) => {
                            tracing::warn!(provider = id, error = %e, "provider init failed, skipping");
                        }
                    }
                }
                _ => {
                    tracing::debug!(provider = id, env = key_env, "no API key, provider skipped");
                }
            }
        }
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers
            .insert(provider.provider_id().to_string(), provider);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
