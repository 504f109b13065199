//! MCP server configuration store.
//!
//! One row per registered server, unique on `(user_id, server_name)`.
//! Rows are created by OAuth finalize or manual registration, mutated by
//! token refresh (credentials + expiry) and manifest refresh
//! (`tools_manifest` + `last_synced_at`), and deleted by their owner.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use tb_domain::credentials::OAuthCredentials;
use tb_domain::error::{Error, Result};
use tb_mcp::connector::CredentialStore;

use crate::file::{load_json, save_json};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Row
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One registered MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerRow {
    pub id: String,
    pub user_id: String,
    pub server_name: String,
    pub server_url: String,
    #[serde(default = "d_true")]
    pub active: bool,
    /// Credentials blob (JSON). `oauth_config` embedded inside carries the
    /// minimum needed to refresh without any external lookup.
    #[serde(default)]
    pub credentials: Option<String>,
    /// Mirror of the blob's expiry for quick inspection.
    #[serde(default)]
    pub expires_at: Option<i64>,
    /// Cached tool manifest from the last `tools/list`.
    #[serde(default)]
    pub tools_manifest: Option<serde_json::Value>,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn d_true() -> bool {
    true
}

impl McpServerRow {
    pub fn parsed_credentials(&self) -> Option<OAuthCredentials> {
        self.credentials
            .as_deref()
            .and_then(OAuthCredentials::parse)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Server config store backed by `servers.json`.
pub struct ServerStore {
    path: PathBuf,
    rows: RwLock<HashMap<String, McpServerRow>>,
}

impl ServerStore {
    pub fn new(state_path: &Path) -> Result<Self> {
        let path = state_path.join("servers.json");
        let rows: HashMap<String, McpServerRow> = load_json(&path)?;
        tracing::info!(servers = rows.len(), path = %path.display(), "server store loaded");
        Ok(Self {
            path,
            rows: RwLock::new(rows),
        })
    }

    fn flush(&self, rows: &HashMap<String, McpServerRow>) -> Result<()> {
        save_json(&self.path, rows)
    }

    pub fn get(&self, id: &str) -> Option<McpServerRow> {
        self.rows.read().get(id).cloned()
    }

    /// Fetch a row, enforcing ownership.
    pub fn get_owned(&self, user_id: &str, id: &str) -> Result<McpServerRow> {
        let row = self
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("server {id}")))?;
        if row.user_id != user_id {
            return Err(Error::Forbidden("server belongs to another user".into()));
        }
        Ok(row)
    }

    /// All active servers for one user, keyed by server name.
    pub fn active_for_user(&self, user_id: &str) -> HashMap<String, McpServerRow> {
        self.rows
            .read()
            .values()
            .filter(|r| r.user_id == user_id && r.active)
            .map(|r| (r.server_name.clone(), r.clone()))
            .collect()
    }

    pub fn list_for_user(&self, user_id: &str) -> Vec<McpServerRow> {
        let mut rows: Vec<_> = self
            .rows
            .read()
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.server_name.cmp(&b.server_name));
        rows
    }

    /// Create or replace the row for `(user_id, server_name)`.
    pub fn upsert(
        &self,
        user_id: &str,
        server_name: &str,
        server_url: &str,
        credentials: Option<String>,
    ) -> Result<McpServerRow> {
        let mut rows = self.rows.write();

        let expires_at = credentials
            .as_deref()
            .and_then(OAuthCredentials::parse)
            .and_then(|c| c.expires_at);

        let existing_id = rows
            .values()
            .find(|r| r.user_id == user_id && r.server_name == server_name)
            .map(|r| r.id.clone());

        let row = match existing_id.and_then(|id| rows.get_mut(&id)) {
            Some(row) => {
                row.server_url = server_url.to_string();
                row.credentials = credentials;
                row.expires_at = expires_at;
                row.clone()
            }
            None => {
                let row = McpServerRow {
                    id: uuid::Uuid::new_v4().to_string(),
                    user_id: user_id.to_string(),
                    server_name: server_name.to_string(),
                    server_url: server_url.to_string(),
                    active: true,
                    credentials,
                    expires_at,
                    tools_manifest: None,
                    last_synced_at: None,
                    created_at: Utc::now(),
                };
                rows.insert(row.id.clone(), row.clone());
                row
            }
        };

        self.flush(&rows)?;
        Ok(row)
    }

    /// Store a freshly listed manifest. Idempotent: two consecutive
    /// refreshes with identical tools leave the manifest byte-identical
    /// and only bump `last_synced_at`.
    pub fn update_manifest(&self, id: &str, manifest: serde_json::Value) -> Result<()> {
        let mut rows = self.rows.write();
        let row = rows
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("server {id}")))?;
        row.tools_manifest = Some(manifest);
        row.last_synced_at = Some(Utc::now());
        self.flush(&rows)
    }

    pub fn set_active(&self, id: &str, active: bool) -> Result<()> {
        let mut rows = self.rows.write();
        let row = rows
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("server {id}")))?;
        row.active = active;
        self.flush(&rows)
    }

    pub fn delete(&self, user_id: &str, id: &str) -> Result<()> {
        let mut rows = self.rows.write();
        match rows.get(id) {
            Some(row) if row.user_id == user_id => {
                rows.remove(id);
                self.flush(&rows)
            }
            Some(_) => Err(Error::Forbidden("server belongs to another user".into())),
            None => Err(Error::NotFound(format!("server {id}"))),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Credential persistence (fresh-handle semantics)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The connector's persistence hooks.
///
/// Both sides re-read the file before acting so a refresh landing from
/// another session is always observed — the "fresh storage session"
/// discipline.
#[async_trait]
impl CredentialStore for ServerStore {
    async fn load_credentials(&self, server_id: &str) -> Result<Option<OAuthCredentials>> {
        let disk: HashMap<String, McpServerRow> = load_json(&self.path)?;
        if let Some(row) = disk.get(server_id) {
            // Adopt the on-disk view so later reads see it too.
            self.rows.write().insert(server_id.to_string(), row.clone());
            return Ok(row.parsed_credentials());
        }
        Ok(self.get(server_id).and_then(|r| r.parsed_credentials()))
    }

    async fn persist_credentials(
        &self,
        server_id: &str,
        credentials: &OAuthCredentials,
    ) -> Result<()> {
        let mut rows = self.rows.write();

        // Merge over the on-disk state rather than our cached view.
        let mut disk: HashMap<String, McpServerRow> = load_json(&self.path)?;
        for (id, row) in disk.drain() {
            rows.entry(id).or_insert(row);
        }

        let row = rows
            .get_mut(server_id)
            .ok_or_else(|| Error::NotFound(format!("server {server_id}")))?;
        row.credentials = Some(serde_json::to_string(credentials)?);
        row.expires_at = credentials.expires_at;
        self.flush(&rows)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ServerStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ServerStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn upsert_is_unique_per_user_and_name() {
        let (_dir, store) = store();
        let first = store
            .upsert("u1", "Weather", "https://one.example.com", None)
            .unwrap();
        let second = store
            .upsert("u1", "Weather", "https://two.example.com", None)
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.list_for_user("u1").len(), 1);
        assert_eq!(
            store.get(&first.id).unwrap().server_url,
            "https://two.example.com"
        );
    }

    #[test]
    fn same_name_different_users_are_separate() {
        let (_dir, store) = store();
        let a = store.upsert("u1", "Weather", "https://x", None).unwrap();
        let b = store.upsert("u2", "Weather", "https://x", None).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn active_for_user_skips_inactive() {
        let (_dir, store) = store();
        let row = store.upsert("u1", "Weather", "https://x", None).unwrap();
        store.upsert("u1", "Files", "https://y", None).unwrap();
        store.set_active(&row.id, false).unwrap();

        let active = store.active_for_user("u1");
        assert_eq!(active.len(), 1);
        assert!(active.contains_key("Files"));
    }

    #[test]
    fn ownership_enforced_on_delete() {
        let (_dir, store) = store();
        let row = store.upsert("u1", "Weather", "https://x", None).unwrap();
        assert!(matches!(
            store.delete("u2", &row.id),
            Err(Error::Forbidden(_))
        ));
        store.delete("u1", &row.id).unwrap();
        assert!(store.get(&row.id).is_none());
    }

    #[test]
    fn manifest_refresh_is_idempotent() {
        let (_dir, store) = store();
        let row = store.upsert("u1", "Weather", "https://x", None).unwrap();
        let manifest = serde_json::json!([{ "name": "get_weather" }]);

        store.update_manifest(&row.id, manifest.clone()).unwrap();
        let first_sync = store.get(&row.id).unwrap().last_synced_at.unwrap();

        store.update_manifest(&row.id, manifest.clone()).unwrap();
        let after = store.get(&row.id).unwrap();
        assert_eq!(after.tools_manifest, Some(manifest));
        assert!(after.last_synced_at.unwrap() >= first_sync);
    }

    #[tokio::test]
    async fn persist_credentials_writes_blob_and_expiry() {
        let (_dir, store) = store();
        let row = store.upsert("u1", "Weather", "https://x", None).unwrap();

        let creds = OAuthCredentials {
            access_token: Some("at".into()),
            refresh_token: Some("rt".into()),
            expires_at: Some(1_800_000_000),
            token_type: Some("Bearer".into()),
            oauth_config: None,
        };
        store.persist_credentials(&row.id, &creds).await.unwrap();

        let loaded = store.load_credentials(&row.id).await.unwrap().unwrap();
        assert_eq!(loaded.access_token.as_deref(), Some("at"));
        assert_eq!(store.get(&row.id).unwrap().expires_at, Some(1_800_000_000));
    }

    #[tokio::test]
    async fn load_credentials_sees_external_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store_a = ServerStore::new(dir.path()).unwrap();
        let row = store_a.upsert("u1", "Weather", "https://x", None).unwrap();

        // Another process refreshes and persists.
        let store_b = ServerStore::new(dir.path()).unwrap();
        let creds = OAuthCredentials {
            access_token: Some("fresh".into()),
            ..Default::default()
        };
        store_b.persist_credentials(&row.id, &creds).await.unwrap();

        let seen = store_a.load_credentials(&row.id).await.unwrap().unwrap();
        assert_eq!(seen.access_token.as_deref(), Some("fresh"));
    }
}
