//! HTTP API surface.
//!
//! Routes split into **public** (health) and **protected** (everything
//! else, gated behind the `TB_API_TOKEN` bearer middleware).

pub mod agent;
pub mod approvals;
pub mod auth;
pub mod chats;
pub mod oauth;
pub mod servers;

use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, patch, post};
use axum::Router;

use tb_domain::error::Error;

use crate::state::AppState;

/// Build the full API router.
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new().route("/v1/health", get(health));

    let protected = Router::new()
        // Agent streaming (core runtime)
        .route("/v1/agent/stream", post(agent::agent_stream))
        // Approvals (human-in-the-loop decisions)
        .route("/v1/approvals/decide", post(approvals::decide))
        .route("/v1/approvals/:id/status", get(approvals::status))
        .route("/v1/tool-approvals", get(approvals::list_tool_approvals))
        .route("/v1/tool-approvals", post(approvals::save_tool_approval))
        .route(
            "/v1/tool-approvals/:tool_name",
            delete(approvals::delete_tool_approval),
        )
        // MCP servers
        .route("/v1/servers", get(servers::list_servers))
        .route("/v1/servers", post(servers::register_server))
        .route("/v1/servers/:id", delete(servers::delete_server))
        .route("/v1/servers/:id/refresh", post(servers::refresh_manifest))
        .route("/v1/servers/:id/tools", get(servers::list_server_tools))
        .route(
            "/v1/servers/:id/tools/:tool_name",
            patch(servers::toggle_tool),
        )
        // OAuth (Smart Auth)
        .route("/v1/oauth/init", post(oauth::init))
        .route("/v1/oauth/finalize", post(oauth::finalize))
        .route("/v1/oauth/inspect", get(oauth::inspect))
        // Conversations
        .route("/v1/chats", get(chats::list_chats))
        .route("/v1/chats/latest", get(chats::latest_chat))
        .route("/v1/chats/:id", get(chats::get_chat))
        .route("/v1/chats/:id", delete(chats::delete_chat))
        .layer(middleware::from_fn_with_state(
            state,
            auth::require_api_token,
        ));

    public.merge(protected)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Map a domain error onto an HTTP response.
pub(crate) fn error_response(err: Error) -> Response {
    let status = match &err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Forbidden(_) => StatusCode::FORBIDDEN,
        Error::Config(_) => StatusCode::BAD_REQUEST,
        Error::Auth(_) | Error::RequiresAuthentication(_) => StatusCode::UNAUTHORIZED,
        Error::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        Error::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}
