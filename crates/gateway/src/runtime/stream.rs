//! Event streamer — turns graph events into the client event stream.
//!
//! Client event types: `scratchpad` (tool trace), `llm_token`,
//! `plain_text_answer`, `tool_approval_required`, `server_error`, and a
//! final `stream_end`. Because the graph may interrupt *before* any tool
//! starts, a post-loop sweep over the pending-approval registry emits the
//! `tool_approval_required` the UI is waiting for.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_core::Stream;
use serde_json::{json, Value};

use tb_domain::error::Error;
use tb_providers::{classify_stream_error, StreamFailure};
use tb_store::ConversationStore;

use super::graph::{AgentGraph, GraphEvent, GraphInput, GraphRunConfig};
use super::pending::{PendingApprovals, PendingRecord};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire item
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One `(event, JSON payload)` pair on the client stream.
#[derive(Debug, Clone)]
pub struct SseItem {
    pub event: &'static str,
    pub data: Value,
}

impl SseItem {
    fn scratchpad(data: Value) -> Self {
        Self {
            event: "scratchpad",
            data,
        }
    }

    fn llm_token(content: &str) -> Self {
        Self {
            event: "llm_token",
            data: json!({ "type": "llm_token", "content": content }),
        }
    }

    fn plain_text_answer(content: &str) -> Self {
        Self {
            event: "plain_text_answer",
            data: json!({ "type": "plain_text_answer", "content": content }),
        }
    }

    fn approval_required(record: &PendingRecord) -> Self {
        Self {
            event: "tool_approval_required",
            data: json!({
                "type": "tool_approval_required",
                "approval_id": record.id,
                "tool_name": record.tool_name,
                "server_name": record.server_name,
                "payload": record.tool_input,
            }),
        }
    }

    fn server_error(message: &str) -> Self {
        Self {
            event: "server_error",
            data: json!({ "type": "error", "message": message }),
        }
    }

    fn stream_end(session_id: &str, user_id: &str) -> Self {
        Self {
            event: "stream_end",
            data: json!({
                "type": "stream_end",
                "session_id": session_id,
                "user_id": user_id,
            }),
        }
    }
}

/// The user-visible message for a terminal stream failure.
fn failure_message(error: &Error) -> String {
    if let Error::RequiresAuthentication(server) = error {
        return format!(
            "Server '{server}' requires re-authentication. Please reconnect it in settings."
        );
    }
    match classify_stream_error(error) {
        StreamFailure::QuotaExceeded => {
            "The model's quota is exhausted. Please give it a moment to rest and try again."
                .to_string()
        }
        StreamFailure::ServiceUnavailable => {
            "The AI service is momentarily unavailable. Please try again shortly.".to_string()
        }
        StreamFailure::Internal => "An internal error occurred.".to_string(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Interrupt sweep
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pick the pending approval to surface after the graph's event loop
/// exits, or `None`.
///
/// On a fresh stream, records created before the stream started are
/// stale echoes of earlier runs and are skipped. On resume the approval
/// was created by a *prior* stream, so timestamps are accepted — but
/// never past `max_age`, which bounds replay.
pub(crate) fn sweep_candidate(
    pending: &PendingApprovals,
    user_id: &str,
    stream_start: DateTime<Utc>,
    resume: bool,
    max_age: Duration,
) -> Option<PendingRecord> {
    let now = Utc::now();
    pending
        .undecided_for_user(user_id)
        .into_iter()
        .find(|record| {
            if !resume && record.created_at < stream_start {
                return false;
            }
            now - record.created_at <= max_age
        })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct StreamParams {
    pub agent: Arc<AgentGraph>,
    pub input: Option<GraphInput>,
    pub session_id: String,
    pub user_id: String,
    pub resume: bool,
}

/// Drive the compiled agent and yield client events, always terminated
/// by `stream_end`. Dropping the returned stream cancels the run at the
/// graph's next emission.
pub fn stream_agent_events(
    params: StreamParams,
    conversations: Arc<ConversationStore>,
    pending: Arc<PendingApprovals>,
    pending_max_age_secs: u64,
) -> impl Stream<Item = SseItem> {
    async_stream::stream! {
        let StreamParams { agent, input, session_id, user_id, resume } = params;
        let stream_start = Utc::now();
        let mut scratchpad: Vec<String> = Vec::new();

        tracing::info!(session_id = %session_id, resume, "stream started");

        let config = GraphRunConfig {
            user_id: user_id.clone(),
            thread_id: session_id.clone(),
        };
        let mut rx = agent.stream(input, config);

        while let Some(event) = rx.recv().await {
            match event {
                GraphEvent::Token { text } => {
                    yield SseItem::llm_token(&text);
                }
                GraphEvent::ToolStart { tool_name, tool_input } => {
                    scratchpad.push(format!("Tool Used: {tool_name} with input {tool_input}"));
                    yield SseItem::scratchpad(json!({
                        "type": "tool_start",
                        "tool_name": tool_name,
                        "tool_input": tool_input,
                    }));
                }
                GraphEvent::ToolEnd { tool_name, observation } => {
                    scratchpad.push(format!("Tool Output: {observation}"));
                    yield SseItem::scratchpad(json!({
                        "type": "tool_end",
                        "tool_name": tool_name,
                        "observation": observation,
                    }));
                }
                GraphEvent::Final { content } => {
                    if !content.trim().is_empty() {
                        if let Err(e) = conversations.append_message(
                            &session_id,
                            "assistant",
                            &content,
                            std::mem::take(&mut scratchpad),
                        ) {
                            tracing::warn!(error = %e, "failed to persist assistant message");
                        }
                        yield SseItem::plain_text_answer(&content);
                    }
                }
                GraphEvent::Interrupted => {
                    yield SseItem::scratchpad(json!({
                        "type": "agent_status",
                        "status": "awaiting_approval",
                    }));
                }
                GraphEvent::Failed { error } => {
                    tracing::error!(session_id = %session_id, error = %error, "stream failed");
                    yield SseItem::server_error(&failure_message(&error));
                }
            }
        }

        // The graph may have interrupted before any tool_start fired;
        // surface the pending approval the UI must answer. At most one
        // per sweep to avoid flicker, with short delays so delivery
        // stays ordered relative to prior events.
        let max_age = Duration::seconds(pending_max_age_secs as i64);
        if let Some(record) = sweep_candidate(&pending, &user_id, stream_start, resume, max_age) {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            yield SseItem::approval_required(&record);
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        yield SseItem::stream_end(&session_id, &user_id);
        tracing::info!(session_id = %session_id, "stream ended");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // Records cannot be backdated through the public API, so staleness
    // tests shift the stream-start baseline instead.
    fn registry_with(user: &str, tool: &str) -> (Arc<PendingApprovals>, String) {
        let pending = Arc::new(PendingApprovals::new());
        let id = pending.create(user, tool, "Weather", json!({"city": "Paris"}));
        (pending, id)
    }

    #[test]
    fn fresh_stream_skips_records_from_before_it_started() {
        let (pending, _id) = registry_with("u1", "Weather_get_weather");
        // Stream "started" well after the record was created.
        let stream_start = Utc::now() + Duration::seconds(60);
        let hit = sweep_candidate(&pending, "u1", stream_start, false, Duration::hours(1));
        assert!(hit.is_none());
    }

    #[test]
    fn fresh_stream_emits_records_created_during_it() {
        let (pending, id) = registry_with("u1", "Weather_get_weather");
        let stream_start = Utc::now() - Duration::seconds(60);
        let hit = sweep_candidate(&pending, "u1", stream_start, false, Duration::hours(1));
        assert_eq!(hit.unwrap().id, id);
    }

    #[test]
    fn resume_ignores_stream_start() {
        let (pending, id) = registry_with("u1", "Weather_get_weather");
        // Even a stream that "started" later accepts the old record.
        let stream_start = Utc::now() + Duration::seconds(60);
        let hit = sweep_candidate(&pending, "u1", stream_start, true, Duration::hours(1));
        assert_eq!(hit.unwrap().id, id);
    }

    #[test]
    fn resume_is_bounded_by_max_age() {
        let (pending, _id) = registry_with("u1", "Weather_get_weather");
        // A zero max-age excludes even a freshly created record by the
        // time the sweep runs.
        let hit = sweep_candidate(
            &pending,
            "u1",
            Utc::now(),
            true,
            Duration::milliseconds(-1),
        );
        assert!(hit.is_none());
    }

    #[test]
    fn sweep_is_scoped_to_user() {
        let (pending, _id) = registry_with("u2", "Weather_get_weather");
        let stream_start = Utc::now() - Duration::seconds(60);
        assert!(sweep_candidate(&pending, "u1", stream_start, false, Duration::hours(1)).is_none());
    }

    #[test]
    fn decided_records_are_not_swept() {
        let (pending, id) = registry_with("u1", "Weather_get_weather");
        pending.deny(&id);
        let stream_start = Utc::now() - Duration::seconds(60);
        assert!(sweep_candidate(&pending, "u1", stream_start, false, Duration::hours(1)).is_none());
    }

    #[test]
    fn failure_messages_by_class() {
        assert!(failure_message(&Error::QuotaExceeded("cap".into())).contains("quota"));
        assert!(failure_message(&Error::ServiceUnavailable("down".into()))
            .contains("momentarily unavailable"));
        assert_eq!(
            failure_message(&Error::Other("boom".into())),
            "An internal error occurred."
        );
        let msg = failure_message(&Error::RequiresAuthentication("GitHub".into()));
        assert!(msg.contains("GitHub"));
        assert!(msg.contains("re-authentication"));
    }
}
