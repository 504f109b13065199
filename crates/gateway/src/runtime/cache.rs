//! Per-user agent cache keyed by a config fingerprint.
//!
//! Building an agent lists tools across every active server, which is
//! expensive under concurrency. One compiled agent is kept per user
//! (warm reuse for the interactive user); any config drift — adding a
//! server, toggling a tool, switching the model — changes the
//! fingerprint and forces a rebuild. Never shared across users.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use tb_store::McpServerRow;

use super::graph::AgentGraph;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fingerprint
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// SHA-256 over canonical JSON of
/// `{servers, provider, model, tool_permissions}`.
///
/// Canonical means sorted keys at every level, so the same configuration
/// always hashes identically.
pub fn config_fingerprint(
    servers: &HashMap<String, McpServerRow>,
    provider: &str,
    model: &str,
    tool_permissions: &BTreeMap<String, bool>,
) -> String {
    let servers_canonical: BTreeMap<&str, serde_json::Value> = servers
        .iter()
        .map(|(name, row)| {
            (
                name.as_str(),
                serde_json::json!({
                    "id": row.id,
                    "url": row.server_url,
                    "active": row.active,
                    "credentials": row.credentials,
                }),
            )
        })
        .collect();

    let canonical = serde_json::json!({
        "servers": servers_canonical,
        "provider": provider,
        "model": model,
        "tool_permissions": tool_permissions,
    });

    let digest = Sha256::digest(canonical.to_string().as_bytes());
    hex::encode(digest)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct CacheEntry {
    agent: Arc<AgentGraph>,
    fingerprint: String,
}

/// Process-wide, last-write-wins per user.
#[derive(Default)]
pub struct AgentCache {
    inner: RwLock<HashMap<String, CacheEntry>>,
}

impl AgentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached agent, only when its fingerprint still matches.
    pub fn get(&self, user_id: &str, fingerprint: &str) -> Option<Arc<AgentGraph>> {
        let inner = self.inner.read();
        let entry = inner.get(user_id)?;
        (entry.fingerprint == fingerprint && !fingerprint.is_empty())
            .then(|| entry.agent.clone())
    }

    pub fn insert(&self, user_id: &str, agent: Arc<AgentGraph>, fingerprint: String) {
        if fingerprint.is_empty() {
            return;
        }
        self.inner
            .write()
            .insert(user_id.to_string(), CacheEntry { agent, fingerprint });
    }

    /// Drop the entry for non-config changes that require a rebuild.
    pub fn invalidate(&self, user_id: &str) {
        if self.inner.write().remove(user_id).is_some() {
            tracing::info!(user_id, "agent cache invalidated");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
