//! Approval controller — ingests user decisions and unblocks the graph.
//!
//! Approving or denying flips the in-memory pending record; the record
//! stays until the graph consumes it on the next `resume=true` request.
//! An `always` decision also persists a standing `ToolApproval`.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use tb_domain::error::Error;
use tb_store::ApprovalType;

use crate::state::AppState;

use super::auth::CurrentUser;
use super::error_response;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pending decisions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub approval_id: String,
    pub approved: bool,
    /// `once` (default) or `always`.
    #[serde(default)]
    pub approval_type: Option<String>,
}

/// `POST /v1/approvals/decide`
pub async fn decide(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(body): Json<DecisionRequest>,
) -> Response {
    let Some(record) = state.pending.get(&body.approval_id) else {
        return error_response(Error::NotFound("approval request".into()));
    };
    if record.user_id != user_id {
        return error_response(Error::Forbidden(
            "approval belongs to another user".into(),
        ));
    }

    if body.approved {
        let approval_type = body
            .approval_type
            .as_deref()
            .and_then(ApprovalType::parse)
            .unwrap_or(ApprovalType::Once);
        state.pending.approve(&body.approval_id, approval_type);

        if approval_type == ApprovalType::Always {
            if let Err(e) = state.permissions.save_tool_approval(
                &user_id,
                &record.tool_name,
                ApprovalType::Always,
                Some(&record.server_name),
            ) {
                return error_response(e);
            }
            // A standing approval changes the next route_tools outcome
            // only, not the agent fingerprint.
        }
        tracing::info!(approval_id = %body.approval_id, tool = %record.tool_name, "tool approved");
    } else {
        state.pending.deny(&body.approval_id);
        tracing::info!(approval_id = %body.approval_id, tool = %record.tool_name, "tool denied");
    }

    Json(serde_json::json!({
        "message": "approval processed",
        "approved": body.approved,
    }))
    .into_response()
}

/// `GET /v1/approvals/:id/status`
pub async fn status(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(approval_id): Path<String>,
) -> Response {
    let Some(record) = state.pending.get(&approval_id) else {
        return error_response(Error::NotFound("approval request".into()));
    };
    if record.user_id != user_id {
        return error_response(Error::Forbidden(
            "approval belongs to another user".into(),
        ));
    }

    let status = match record.approved {
        None => "pending",
        Some(true) => "approved",
        Some(false) => "denied",
    };
    Json(serde_json::json!({
        "approval_id": approval_id,
        "status": status,
        "approval_type": record.approval_type.map(|t| t.as_str()),
    }))
    .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Standing approvals
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `GET /v1/tool-approvals`
pub async fn list_tool_approvals(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Response {
    Json(state.permissions.list_approvals(&user_id)).into_response()
}

#[derive(Debug, Deserialize)]
pub struct SaveApprovalRequest {
    pub tool_name: String,
    #[serde(default)]
    pub server_name: Option<String>,
    pub approval_type: String,
}

/// `POST /v1/tool-approvals`
pub async fn save_tool_approval(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(body): Json<SaveApprovalRequest>,
) -> Response {
    let Some(approval_type) = ApprovalType::parse(&body.approval_type) else {
        return error_response(Error::Config(format!(
            "invalid approval_type '{}'",
            body.approval_type
        )));
    };
    match state.permissions.save_tool_approval(
        &user_id,
        &body.tool_name,
        approval_type,
        body.server_name.as_deref(),
    ) {
        Ok(approval) => Json(approval).into_response(),
        Err(e) => error_response(e),
    }
}

/// `DELETE /v1/tool-approvals/:tool_name`
pub async fn delete_tool_approval(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(tool_name): Path<String>,
) -> Response {
    match state.permissions.delete_approval(&user_id, &tool_name) {
        Ok(true) => Json(serde_json::json!({
            "message": format!("approval for {tool_name} removed")
        }))
        .into_response(),
        Ok(false) => error_response(Error::NotFound("approval".into())),
        Err(e) => error_response(e),
    }
}
