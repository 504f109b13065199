//! Persisted tool permissions and approval policies.
//!
//! Two row families:
//! - **ToolPermission** `(user, server, tool, is_enabled)` — absence means
//!   enabled; toggled from the settings UI.
//! - **ToolApproval** `(user, tool, approval_type, server, expires_at?)` —
//!   at most one row per `(user, tool)`. `once` expires after an hour,
//!   `always` never expires, `never` always gates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use tb_domain::error::Result;

use crate::file::{load_json, save_json};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalType {
    Once,
    Always,
    Never,
}

impl ApprovalType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "once" => Some(Self::Once),
            "always" => Some(Self::Always),
            "never" => Some(Self::Never),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Always => "always",
            Self::Never => "never",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPermission {
    pub user_id: String,
    pub server_id: String,
    pub tool_name: String,
    pub is_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolApproval {
    pub user_id: String,
    pub tool_name: String,
    pub approval_type: ApprovalType,
    #[serde(default)]
    pub server_name: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PermissionState {
    /// Keyed `user:server:tool`.
    permissions: HashMap<String, ToolPermission>,
    /// Keyed `user:tool` — at most one row per pair.
    approvals: HashMap<String, ToolApproval>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Persisted permission/approval store backed by `permissions.json`.
pub struct PermissionStore {
    path: PathBuf,
    state: RwLock<PermissionState>,
    once_ttl: Duration,
}

fn perm_key(user_id: &str, server_id: &str, tool_name: &str) -> String {
    format!("{user_id}:{server_id}:{tool_name}")
}

fn approval_key(user_id: &str, tool_name: &str) -> String {
    format!("{user_id}:{tool_name}")
}

impl PermissionStore {
    pub fn new(state_path: &Path, once_ttl_secs: u64) -> Result<Self> {
        let path = state_path.join("permissions.json");
        let state: PermissionState = load_json(&path)?;
        Ok(Self {
            path,
            state: RwLock::new(state),
            once_ttl: Duration::seconds(once_ttl_secs as i64),
        })
    }

    fn flush(&self, state: &PermissionState) -> Result<()> {
        save_json(&self.path, state)
    }

    // ── Tool enablement ─────────────────────────────────────────────

    /// Absence of a row means enabled.
    pub fn is_tool_enabled(&self, user_id: &str, server_id: &str, tool_name: &str) -> bool {
        self.state
            .read()
            .permissions
            .get(&perm_key(user_id, server_id, tool_name))
            .map(|p| p.is_enabled)
            .unwrap_or(true)
    }

    /// All permission rows for one server, in one read — the tool factory
    /// and the agent-cache fingerprint both consume this.
    pub fn permissions_for_server(
        &self,
        user_id: &str,
        server_id: &str,
    ) -> HashMap<String, bool> {
        self.state
            .read()
            .permissions
            .values()
            .filter(|p| p.user_id == user_id && p.server_id == server_id)
            .map(|p| (p.tool_name.clone(), p.is_enabled))
            .collect()
    }

    pub fn set_tool_enabled(
        &self,
        user_id: &str,
        server_id: &str,
        tool_name: &str,
        is_enabled: bool,
    ) -> Result<()> {
        let mut state = self.state.write();
        state.permissions.insert(
            perm_key(user_id, server_id, tool_name),
            ToolPermission {
                user_id: user_id.to_string(),
                server_id: server_id.to_string(),
                tool_name: tool_name.to_string(),
                is_enabled,
            },
        );
        self.flush(&state)
    }

    // ── Approval policy ─────────────────────────────────────────────

    /// Does `tool_name` need a fresh user approval?
    ///
    /// Returns `(needs_approval, standing_type)`:
    /// - internal tools (leading `_`) never need approval;
    /// - `always` ⇒ `(false, Always)`;
    /// - `never` ⇒ `(true, Never)`;
    /// - expired `once` rows are deleted opportunistically and count as
    ///   absent; anything else ⇒ `(true, None)`.
    pub fn is_tool_approved(
        &self,
        user_id: &str,
        tool_name: &str,
    ) -> (bool, Option<ApprovalType>) {
        if tool_name.starts_with('_') {
            return (false, Some(ApprovalType::Always));
        }

        let key = approval_key(user_id, tool_name);
        let mut state = self.state.write();

        let Some(approval) = state.approvals.get(&key) else {
            return (true, None);
        };

        if let Some(expires_at) = approval.expires_at {
            if expires_at < Utc::now() {
                state.approvals.remove(&key);
                if let Err(e) = self.flush(&state) {
                    tracing::warn!(error = %e, "failed to persist expired-approval cleanup");
                }
                return (true, None);
            }
        }

        match approval.approval_type {
            ApprovalType::Always => (false, Some(ApprovalType::Always)),
            ApprovalType::Never => (true, Some(ApprovalType::Never)),
            ApprovalType::Once => (true, None),
        }
    }

    /// Standing approval lookup for a namespaced tool name. The
    /// namespaced row wins; the raw suffix after the first `_` is only
    /// consulted when no namespaced row exists (pre-namespacing rows).
    pub fn approval_status(
        &self,
        user_id: &str,
        namespaced_name: &str,
    ) -> (bool, Option<ApprovalType>) {
        let (needs, kind) = self.is_tool_approved(user_id, namespaced_name);
        // `is_tool_approved` already dropped an expired row, so presence
        // here means a live namespaced row — it wins even when it still
        // requires approval (a `once` row).
        let namespaced_exists = self
            .state
            .read()
            .approvals
            .contains_key(&approval_key(user_id, namespaced_name));
        if !needs || kind.is_some() || namespaced_exists {
            return (needs, kind);
        }
        if let Some((_, raw)) = namespaced_name.split_once('_') {
            if !raw.is_empty() && raw != namespaced_name {
                return self.is_tool_approved(user_id, raw);
            }
        }
        (needs, kind)
    }

    /// Upsert a standing approval. `once` gets a 1-hour expiry; `always`
    /// and `never` clear it.
    pub fn save_tool_approval(
        &self,
        user_id: &str,
        tool_name: &str,
        approval_type: ApprovalType,
        server_name: Option<&str>,
    ) -> Result<ToolApproval> {
        let now = Utc::now();
        let expires_at = match approval_type {
            ApprovalType::Once => Some(now + self.once_ttl),
            ApprovalType::Always | ApprovalType::Never => None,
        };
        let approval = ToolApproval {
            user_id: user_id.to_string(),
            tool_name: tool_name.to_string(),
            approval_type,
            server_name: server_name.map(String::from),
            created_at: now,
            expires_at,
        };

        let mut state = self.state.write();
        state
            .approvals
            .insert(approval_key(user_id, tool_name), approval.clone());
        self.flush(&state)?;
        Ok(approval)
    }

    pub fn list_approvals(&self, user_id: &str) -> Vec<ToolApproval> {
        let mut rows: Vec<_> = self
            .state
            .read()
            .approvals
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.tool_name.cmp(&b.tool_name));
        rows
    }

    pub fn delete_approval(&self, user_id: &str, tool_name: &str) -> Result<bool> {
        let mut state = self.state.write();
        let removed = state
            .approvals
            .remove(&approval_key(user_id, tool_name))
            .is_some();
        if removed {
            self.flush(&state)?;
        }
        Ok(removed)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
