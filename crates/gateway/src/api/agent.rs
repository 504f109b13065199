//! The agent streaming endpoint.
//!
//! `POST /v1/agent/stream` — start a new turn (`resume: false`) or
//! re-enter an interrupted one (`resume: true`) on the same session.
//! The response is an SSE stream of the client event types.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use serde::Deserialize;

use tb_domain::error::Error;
use tb_domain::tool::Message;
use tb_store::conversations::title_from_prompt;

use crate::runtime::stream::{stream_agent_events, SseItem, StreamParams};
use crate::runtime::GraphInput;
use crate::state::AppState;

use super::auth::CurrentUser;
use super::error_response;

#[derive(Debug, Deserialize)]
pub struct StreamRequest {
    /// Absent = start a fresh session.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "d_provider")]
    pub model_provider: String,
    /// Absent = the provider's default model.
    #[serde(default)]
    pub model: Option<String>,
    /// Re-enter the graph at its checkpoint instead of sending `prompt`.
    #[serde(default)]
    pub resume: bool,
}

fn d_provider() -> String {
    "gemini".into()
}

pub async fn agent_stream(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(body): Json<StreamRequest>,
) -> Response {
    if !body.resume && body.prompt.trim().is_empty() {
        return error_response(Error::Config("prompt must not be empty".into()));
    }

    let session_id = body
        .session_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    // Resolve conversation ownership before anything streams.
    match state.conversations.owner_of(&session_id) {
        Some(owner) if owner != user_id => {
            return error_response(Error::Forbidden(
                "conversation belongs to another user".into(),
            ));
        }
        Some(_) => {}
        None => {
            if let Err(e) = state.conversations.create(
                &user_id,
                &session_id,
                &title_from_prompt(&body.prompt),
            ) {
                return error_response(e);
            }
        }
    }

    // History is read before the new user turn is appended, so the graph
    // input never duplicates the prompt.
    let chat_history: Vec<Message> = state
        .conversations
        .messages(&session_id)
        .into_iter()
        .filter_map(|m| match m.role.as_str() {
            "user" => Some(Message::user(m.content)),
            "assistant" => Some(Message::assistant(m.content)),
            _ => None,
        })
        .collect();

    if !body.resume {
        if let Err(e) =
            state
                .conversations
                .append_message(&session_id, "user", &body.prompt, Vec::new())
        {
            return error_response(e);
        }
    }

    let model = match body.model.clone() {
        Some(model) => model,
        None => match state.providers.get(&body.model_provider) {
            Some(p) => p.default_model().to_string(),
            None => {
                return error_response(Error::Config(format!(
                    "unknown model provider '{}'",
                    body.model_provider
                )));
            }
        },
    };

    let agent = match state
        .agents
        .get_or_create(&user_id, &body.model_provider, &model)
        .await
    {
        Ok((agent, cache_hit)) => {
            tracing::debug!(session_id = %session_id, cache_hit, "agent resolved");
            agent
        }
        // Auth escalation surfaces on the stream so the UI can prompt
        // for re-consent; everything else fails before the stream opens.
        Err(Error::RequiresAuthentication(server)) => {
            return sse_error_stream(session_id, user_id, server);
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to build agent");
            return error_response(e);
        }
    };

    let input = if body.resume {
        None
    } else {
        Some(GraphInput {
            input: body.prompt.clone(),
            chat_history,
        })
    };

    let stream = stream_agent_events(
        StreamParams {
            agent,
            input,
            session_id,
            user_id,
            resume: body.resume,
        },
        state.conversations.clone(),
        state.pending.clone(),
        state.config.approvals.pending_max_age_secs,
    );

    Sse::new(stream.map(|item| Ok::<Event, Infallible>(to_sse_event(item))))
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn to_sse_event(item: SseItem) -> Event {
    Event::default().event(item.event).data(item.data.to_string())
}

/// A degenerate stream carrying one `server_error` then `stream_end`.
fn sse_error_stream(session_id: String, user_id: String, server: String) -> Response {
    let stream = async_stream::stream! {
        yield Ok::<Event, Infallible>(to_sse_event(SseItem {
            event: "server_error",
            data: serde_json::json!({
                "type": "error",
                "message": format!(
                    "Server '{server}' requires re-authentication. Please reconnect it in settings."
                ),
            }),
        }));
        yield Ok(to_sse_event(SseItem {
            event: "stream_end",
            data: serde_json::json!({
                "type": "stream_end",
                "session_id": session_id,
                "user_id": user_id,
            }),
        }));
    };
    Sse::new(stream).into_response()
}
