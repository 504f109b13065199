//! MCP server management: registration, manifest refresh, and per-tool
//! permission toggles. Credential blobs never leave the server.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use tb_domain::error::Error;
use tb_mcp::connector::{ConnectorParams, CredentialStore, McpConnector};
use tb_store::McpServerRow;

use crate::state::AppState;

use super::auth::CurrentUser;
use super::error_response;

fn row_summary(row: &McpServerRow) -> serde_json::Value {
    json!({
        "id": row.id,
        "server_name": row.server_name,
        "server_url": row.server_url,
        "active": row.active,
        "has_credentials": row.credentials.is_some(),
        "expires_at": row.expires_at,
        "last_synced_at": row.last_synced_at,
        "tool_count": row.tools_manifest.as_ref().and_then(|m| m.as_array().map(|a| a.len())),
    })
}

/// `GET /v1/servers`
pub async fn list_servers(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Response {
    let rows: Vec<_> = state
        .servers
        .list_for_user(&user_id)
        .iter()
        .map(row_summary)
        .collect();
    Json(rows).into_response()
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub server_name: String,
    pub server_url: String,
    /// Raw credentials blob for token-based servers (no OAuth flow).
    #[serde(default)]
    pub credentials: Option<String>,
}

/// `POST /v1/servers` — manual registration.
pub async fn register_server(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(body): Json<RegisterRequest>,
) -> Response {
    if body.server_name.trim().is_empty() || body.server_url.trim().is_empty() {
        return error_response(Error::Config("server_name and server_url are required".into()));
    }
    match state.servers.upsert(
        &user_id,
        body.server_name.trim(),
        body.server_url.trim(),
        body.credentials,
    ) {
        Ok(row) => {
            state.agents.cache.invalidate(&user_id);
            Json(row_summary(&row)).into_response()
        }
        Err(e) => error_response(e),
    }
}

/// `DELETE /v1/servers/:id`
pub async fn delete_server(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(id): Path<String>,
) -> Response {
    match state.servers.delete(&user_id, &id) {
        Ok(()) => {
            state.agents.cache.invalidate(&user_id);
            Json(json!({ "message": "server deleted" })).into_response()
        }
        Err(e) => error_response(e),
    }
}

/// `POST /v1/servers/:id/refresh` — re-list the server's tools and
/// persist the manifest. Idempotent when nothing changed.
pub async fn refresh_manifest(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(id): Path<String>,
) -> Response {
    let row = match state.servers.get_owned(&user_id, &id) {
        Ok(row) => row,
        Err(e) => return error_response(e),
    };

    let connector = McpConnector::new(ConnectorParams {
        server_url: row.server_url.clone(),
        server_name: row.server_name.clone(),
        server_id: Some(row.id.clone()),
        credentials: row.parsed_credentials(),
        store: Some(state.servers.clone() as Arc<dyn CredentialStore>),
        tool_cache: state.tool_cache.clone(),
        timeouts: state.config.mcp.clone(),
    });

    let tools = match connector.list_tools().await {
        Ok(tools) => tools,
        Err(e) => return error_response(e),
    };

    let manifest = match serde_json::to_value(&tools) {
        Ok(v) => v,
        Err(e) => return error_response(Error::Json(e)),
    };
    if let Err(e) = state.servers.update_manifest(&row.id, manifest) {
        return error_response(e);
    }
    state.agents.cache.invalidate(&user_id);

    let updated = state.servers.get(&row.id);
    Json(json!({
        "tool_count": tools.len(),
        "last_synced_at": updated.and_then(|r| r.last_synced_at),
    }))
    .into_response()
}

/// `GET /v1/servers/:id/tools` — cached manifest with enablement flags.
pub async fn list_server_tools(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(id): Path<String>,
) -> Response {
    let row = match state.servers.get_owned(&user_id, &id) {
        Ok(row) => row,
        Err(e) => return error_response(e),
    };

    let manifest = row
        .tools_manifest
        .as_ref()
        .and_then(|m| m.as_array())
        .cloned()
        .unwrap_or_default();
    let permissions = state.permissions.permissions_for_server(&user_id, &row.id);

    let tools: Vec<_> = manifest
        .iter()
        .filter_map(|tool| {
            let name = tool.get("name")?.as_str()?;
            Some(json!({
                "name": name,
                "description": tool.get("description").and_then(|d| d.as_str()).unwrap_or(""),
                "is_enabled": permissions.get(name).copied().unwrap_or(true),
            }))
        })
        .collect();
    Json(tools).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub is_enabled: bool,
}

/// `PATCH /v1/servers/:id/tools/:tool_name`
pub async fn toggle_tool(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path((id, tool_name)): Path<(String, String)>,
    Json(body): Json<ToggleRequest>,
) -> Response {
    if let Err(e) = state.servers.get_owned(&user_id, &id) {
        return error_response(e);
    }
    if let Err(e) = state
        .permissions
        .set_tool_enabled(&user_id, &id, &tool_name, body.is_enabled)
    {
        return error_response(e);
    }
    // Permission drift changes the agent fingerprint; drop the warm agent.
    state.agents.cache.invalidate(&user_id);

    Json(json!({
        "message": format!(
            "tool {tool_name} {}",
            if body.is_enabled { "enabled" } else { "disabled" }
        ),
        "is_enabled": body.is_enabled,
    }))
    .into_response()
}
