//! Conversation management endpoints.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use tb_domain::error::Error;

use crate::state::AppState;

use super::auth::CurrentUser;
use super::error_response;

/// `GET /v1/chats`
pub async fn list_chats(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Response {
    Json(state.conversations.list_for_user(&user_id)).into_response()
}

/// `GET /v1/chats/latest`
pub async fn latest_chat(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Response {
    Json(json!({
        "latest_session_id": state.conversations.latest_for_user(&user_id),
    }))
    .into_response()
}

/// `GET /v1/chats/:id`
pub async fn get_chat(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(chat_id): Path<String>,
) -> Response {
    let Some(meta) = state.conversations.get_meta(&chat_id) else {
        return error_response(Error::NotFound("conversation".into()));
    };
    if meta.owner_id != user_id {
        return error_response(Error::Forbidden(
            "conversation belongs to another user".into(),
        ));
    }
    Json(json!({
        "id": meta.id,
        "title": meta.title,
        "created_at": meta.created_at,
        "messages": state.conversations.messages(&chat_id),
    }))
    .into_response()
}

/// `DELETE /v1/chats/:id` — removes the conversation and its
/// checkpointed thread.
pub async fn delete_chat(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(chat_id): Path<String>,
) -> Response {
    match state.conversations.delete(&user_id, &chat_id) {
        Ok(()) => {
            state.checkpoints.delete_thread(&user_id, &chat_id);
            Json(json!({ "ok": true, "detail": "conversation deleted" })).into_response()
        }
        Err(e) => error_response(e),
    }
}
