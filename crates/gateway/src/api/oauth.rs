//! OAuth endpoints for connecting protected MCP servers.

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use tb_domain::error::Error;
use tb_mcp::auth::{self, InitFlowRequest};

use crate::state::AppState;

use super::auth::CurrentUser;
use super::error_response;

#[derive(Debug, Deserialize)]
pub struct InitRequest {
    pub server_name: String,
    pub server_url: String,
    pub redirect_uri: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    /// Manual endpoint overrides (Advanced Options); discovery otherwise.
    #[serde(default)]
    pub authorization_url: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
    /// Present when re-authenticating an existing server row.
    #[serde(default)]
    pub setting_id: Option<String>,
}

/// `POST /v1/oauth/init` — discover endpoints, mint PKCE + state, and
/// return the authorization URL to redirect the user to.
pub async fn init(
    State(state): State<AppState>,
    CurrentUser(_user_id): CurrentUser,
    Json(body): Json<InitRequest>,
) -> Response {
    let request = InitFlowRequest {
        server_name: body.server_name,
        server_url: body.server_url,
        redirect_uri: body.redirect_uri,
        client_id: body.client_id,
        client_secret: body.client_secret,
        scope: body.scope,
        authorization_url: body.authorization_url,
        token_url: body.token_url,
        setting_id: body.setting_id,
    };
    match auth::init_flow(&state.http, &state.oauth_states, request).await {
        Ok(authorization_url) => {
            Json(json!({ "authorization_url": authorization_url })).into_response()
        }
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct FinalizeRequest {
    pub code: String,
    pub state: String,
}

/// `POST /v1/oauth/finalize` — single-use state, code exchange, server
/// row creation (or credential update on re-auth).
pub async fn finalize(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(body): Json<FinalizeRequest>,
) -> Response {
    // States are read-and-delete: a replayed `state` fails here without
    // touching storage.
    let Some(flow_state) = state.oauth_states.take(&body.state) else {
        return error_response(Error::Config("invalid or expired state".into()));
    };

    let finalized = match auth::finalize_flow(&state.http, flow_state, &body.code).await {
        Ok(f) => f,
        Err(e) => return error_response(e),
    };

    let credentials = match serde_json::to_string(&finalized.credentials) {
        Ok(c) => c,
        Err(e) => return error_response(Error::Json(e)),
    };
    let row = match state.servers.upsert(
        &user_id,
        &finalized.server_name,
        &finalized.server_url,
        Some(credentials),
    ) {
        Ok(row) => row,
        Err(e) => return error_response(e),
    };
    state.agents.cache.invalidate(&user_id);

    Json(json!({
        "id": row.id,
        "server_name": row.server_name,
        "server_url": row.server_url,
        "expires_at": row.expires_at,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct InspectQuery {
    pub server_url: String,
}

/// `GET /v1/oauth/inspect?server_url=…` — diagnostic probe for the
/// settings UI.
pub async fn inspect(
    State(state): State<AppState>,
    CurrentUser(_user_id): CurrentUser,
    Query(query): Query<InspectQuery>,
) -> Response {
    let report = auth::inspect_server(&state.http, &query.server_url).await;
    Json(report).into_response()
}
