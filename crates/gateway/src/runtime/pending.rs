//! In-memory pending-approval registry.
//!
//! A record is created when the graph gates a tool call, resolved by the
//! approval controller, and removed once the graph has consumed the
//! decision. Records with `approved == None` are deduplicated on
//! `(user_id, tool_name, tool_input)` so a re-entered graph never floods
//! the UI with duplicates. Approve/deny transitions run under the write
//! lock, so a decision cannot be spent twice.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use tb_store::ApprovalType;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One tool invocation waiting for (or carrying) a user decision.
#[derive(Debug, Clone, Serialize)]
pub struct PendingRecord {
    pub id: String,
    pub user_id: String,
    pub tool_name: String,
    pub server_name: String,
    pub tool_input: Value,
    /// `None` = pending, `Some(true)` = approved, `Some(false)` = denied.
    pub approved: Option<bool>,
    pub approval_type: Option<ApprovalType>,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Process-wide registry of pending approvals. Scans are O(n), but n is
/// bounded by the number of concurrently gated tool calls.
#[derive(Default)]
pub struct PendingApprovals {
    inner: RwLock<HashMap<String, PendingRecord>>,
}

impl PendingApprovals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or refresh) a pending record.
    ///
    /// If an undecided record already exists for the same
    /// `(user, tool, input)`, its `created_at` is refreshed and its ID
    /// returned instead of allocating a duplicate.
    pub fn create(
        &self,
        user_id: &str,
        tool_name: &str,
        server_name: &str,
        tool_input: Value,
    ) -> String {
        let mut inner = self.inner.write();

        for record in inner.values_mut() {
            if record.user_id == user_id
                && record.tool_name == tool_name
                && record.approved.is_none()
                && record.tool_input == tool_input
            {
                record.created_at = Utc::now();
                tracing::debug!(approval_id = %record.id, tool = tool_name, "deduplicated pending approval");
                return record.id.clone();
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        inner.insert(
            id.clone(),
            PendingRecord {
                id: id.clone(),
                user_id: user_id.to_string(),
                tool_name: tool_name.to_string(),
                server_name: server_name.to_string(),
                tool_input,
                approved: None,
                approval_type: None,
                created_at: Utc::now(),
            },
        );
        tracing::debug!(approval_id = %id, tool = tool_name, "created pending approval");
        id
    }

    pub fn get(&self, id: &str) -> Option<PendingRecord> {
        self.inner.read().get(id).cloned()
    }

    /// Mark a record approved. Returns `false` when the ID is unknown.
    pub fn approve(&self, id: &str, approval_type: ApprovalType) -> bool {
        let mut inner = self.inner.write();
        match inner.get_mut(id) {
            Some(record) => {
                record.approved = Some(true);
                record.approval_type = Some(approval_type);
                true
            }
            None => false,
        }
    }

    /// Mark a record denied. Returns `false` when the ID is unknown.
    pub fn deny(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        match inner.get_mut(id) {
            Some(record) => {
                record.approved = Some(false);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &str) {
        self.inner.write().remove(id);
    }

    /// The record (decided or not) matching one exact gated call.
    pub fn record_for_call(
        &self,
        user_id: &str,
        tool_name: &str,
        tool_input: &Value,
    ) -> Option<PendingRecord> {
        self.inner
            .read()
            .values()
            .find(|r| {
                r.user_id == user_id && r.tool_name == tool_name && &r.tool_input == tool_input
            })
            .cloned()
    }

    /// All undecided records for a user (the interrupt sweep's input).
    pub fn undecided_for_user(&self, user_id: &str) -> Vec<PendingRecord> {
        let mut records: Vec<_> = self
            .inner
            .read()
            .values()
            .filter(|r| r.user_id == user_id && r.approved.is_none())
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
