//! OpenAI-compatible adapter.
//!
//! Works with OpenAI, Ollama, vLLM, Together, and any other endpoint
//! following the OpenAI chat completions contract. Gemini and Bedrock
//! deployments are reached through their OpenAI-compatible endpoints.

use serde_json::Value;

use tb_domain::error::{Error, Result};
use tb_domain::stream::{BoxStream, StreamEvent, Usage};
use tb_domain::tool::{ContentPart, Message, MessageContent, Role, ToolDefinition};

use crate::traits::{ChatRequest, LlmProvider};
use crate::util::{from_reqwest, normalize_finish_reason};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An LLM adapter for any OpenAI-compatible API endpoint.
pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        default_model: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(from_reqwest)?;
        Ok(Self {
            id: id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            default_model: default_model.into(),
            client,
        })
    }

    fn build_chat_body(&self, req: &ChatRequest) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_openai).collect();
        let model = req
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());

        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_openai).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        body
    }

    /// Map an HTTP failure onto the error taxonomy the event streamer
    /// distinguishes (quota, unavailable, everything else).
    fn status_error(&self, status: u16, body: String) -> Error {
        match status {
            429 => Error::QuotaExceeded(body),
            502 | 503 | 529 => Error::ServiceUnavailable(body),
            _ => Error::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {status} - {body}"),
            },
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn msg_to_openai(msg: &Message) -> Value {
    match msg.role {
        Role::Tool => tool_result_to_openai(msg),
        Role::Assistant => assistant_to_openai(msg),
        _ => serde_json::json!({
            "role": role_to_str(msg.role),
            "content": msg.content.extract_all_text(),
        }),
    }
}

fn assistant_to_openai(msg: &Message) -> Value {
    let mut obj = serde_json::json!({ "role": "assistant" });
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    match &msg.content {
        MessageContent::Text(t) => text_parts.push(t.clone()),
        MessageContent::Parts(parts) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => text_parts.push(text.clone()),
                    ContentPart::ToolUse { id, name, input } => {
                        tool_calls.push(serde_json::json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": input.to_string(),
                            }
                        }));
                    }
                    ContentPart::ToolResult { .. } => {}
                }
            }
        }
    }

    obj["content"] = if text_parts.is_empty() {
        Value::Null
    } else {
        Value::String(text_parts.join("\n"))
    };
    if !tool_calls.is_empty() {
        obj["tool_calls"] = Value::Array(tool_calls);
    }
    obj
}

fn tool_result_to_openai(msg: &Message) -> Value {
    if let MessageContent::Parts(parts) = &msg.content {
        for part in parts {
            if let ContentPart::ToolResult {
                tool_use_id,
                content,
                ..
            } = part
            {
                return serde_json::json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": content,
                });
            }
        }
    }
    serde_json::json!({
        "role": "tool",
        "tool_call_id": "",
        "content": msg.content.extract_all_text(),
    })
}

fn tool_to_openai(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_openai_usage(v: &Value) -> Option<Usage> {
    Some(Usage {
        prompt_tokens: v.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: v.get("completion_tokens")?.as_u64()? as u32,
        total_tokens: v.get("total_tokens")?.as_u64()? as u32,
    })
}

/// Parse one SSE payload into stream events.
///
/// Tool-call chunks are bucketed by the chunk's `index`: the wire format
/// sends the tool-call `id` only on the first chunk and omits it from
/// every argument-delta chunk that follows. `call_ids` maps `index` to
/// that `id` across chunks (`FnMut` state, kept per stream) so every
/// Started/Delta event for one tool call shares a single `call_id`.
fn parse_sse_data(
    data: &str,
    call_ids: &mut std::collections::HashMap<String, String>,
) -> Vec<Result<StreamEvent>> {
    if data.trim() == "[DONE]" {
        return vec![Ok(StreamEvent::Done {
            usage: None,
            finish_reason: Some("stop".into()),
        })];
    }

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(Error::Json(e))],
    };

    let choice = v
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first());

    let Some(choice) = choice else {
        // Usage-only chunk (stream_options.include_usage).
        if let Some(usage) = v.get("usage").and_then(parse_openai_usage) {
            return vec![Ok(StreamEvent::Done {
                usage: Some(usage),
                finish_reason: None,
            })];
        }
        return Vec::new();
    };

    if let Some(fr) = choice.get("finish_reason").filter(|f| !f.is_null()) {
        let usage = v.get("usage").and_then(parse_openai_usage);
        return vec![Ok(StreamEvent::Done {
            usage,
            finish_reason: normalize_finish_reason(fr),
        })];
    }

    let delta = choice.get("delta").unwrap_or(&Value::Null);
    let mut events = Vec::new();

    if let Some(tc_arr) = delta.get("tool_calls").and_then(|v| v.as_array()) {
        for tc in tc_arr {
            let idx = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0).to_string();
            if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                let name = tc
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                call_ids.insert(idx.clone(), id.to_string());
                events.push(Ok(StreamEvent::ToolCallStarted {
                    call_id: id.to_string(),
                    tool_name: name.to_string(),
                }));
            }
            if let Some(args) = tc
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(|v| v.as_str())
            {
                if !args.is_empty() {
                    // Delta chunks carry no `id`; resolve it through the
                    // index mapping so the consumer's assembly keys line up.
                    let call_id = call_ids.get(&idx).cloned().unwrap_or(idx);
                    events.push(Ok(StreamEvent::ToolCallDelta {
                        call_id,
                        delta: args.to_string(),
                    }));
                }
            }
        }
    }

    if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            events.push(Ok(StreamEvent::Token {
                text: text.to_string(),
            }));
        }
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_chat_body(&req);

        tracing::debug!(provider = %self.id, url = %url, "chat stream request");

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(self.status_error(status.as_u16(), err_text));
        }

        // index -> tool-call id, accumulated across this stream's chunks.
        let mut call_ids = std::collections::HashMap::new();
        Ok(crate::sse::sse_response_stream(resp, move |data| {
            parse_sse_data(data, &mut call_ids)
        }))
    }

    fn provider_id(&self) -> &str {
        &self.id
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use tb_domain::tool::ToolCall;

    #[test]
    fn assistant_with_tool_calls_serializes() {
        let calls = vec![ToolCall {
            call_id: "c1".into(),
            tool_name: "Weather_get_weather".into(),
            arguments: serde_json::json!({"city": "Paris"}),
        }];
        let msg = Message::assistant_with_tools("", &calls);
        let wire = msg_to_openai(&msg);
        assert_eq!(wire["role"], "assistant");
        assert!(wire["content"].is_null());
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "Weather_get_weather");
    }

    #[test]
    fn tool_result_carries_call_id() {
        let msg = Message::tool_result("c1", "sunny");
        let wire = msg_to_openai(&msg);
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "c1");
        assert_eq!(wire["content"], "sunny");
    }

    fn parse(data: &str, call_ids: &mut std::collections::HashMap<String, String>) -> Vec<StreamEvent> {
        parse_sse_data(data, call_ids)
            .into_iter()
            .map(|e| e.unwrap())
            .collect()
    }

    #[test]
    fn parse_token_delta() {
        let mut call_ids = std::collections::HashMap::new();
        let events = parse(
            r#"{"choices":[{"delta":{"content":"Hel"},"index":0}]}"#,
            &mut call_ids,
        );
        assert!(matches!(&events[0], StreamEvent::Token { text } if text == "Hel"));
    }

    #[test]
    fn delta_chunks_share_the_started_call_id() {
        // The wire format sends the tool-call id only on the first chunk;
        // argument deltas carry just the index.
        let mut call_ids = std::collections::HashMap::new();

        let start = parse(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_abc123","function":{"name":"t","arguments":""}}]}}]}"#,
            &mut call_ids,
        );
        let started_id = match &start[0] {
            StreamEvent::ToolCallStarted { call_id, tool_name } => {
                assert_eq!(tool_name, "t");
                call_id.clone()
            }
            other => panic!("expected ToolCallStarted, got {other:?}"),
        };
        assert_eq!(started_id, "call_abc123");

        for chunk in [
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"city\":"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"Paris\"}"}}]}}]}"#,
        ] {
            let events = parse(chunk, &mut call_ids);
            match &events[0] {
                StreamEvent::ToolCallDelta { call_id, .. } => {
                    assert_eq!(call_id, &started_id, "delta must key to the started call");
                }
                other => panic!("expected ToolCallDelta, got {other:?}"),
            }
        }
    }

    #[test]
    fn parallel_tool_calls_keep_separate_ids() {
        let mut call_ids = std::collections::HashMap::new();
        parse(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"x","arguments":""}}]}}]}"#,
            &mut call_ids,
        );
        parse(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_b","function":{"name":"y","arguments":""}}]}}]}"#,
            &mut call_ids,
        );

        let events = parse(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"function":{"arguments":"{}"}}]}}]}"#,
            &mut call_ids,
        );
        assert!(matches!(
            &events[0],
            StreamEvent::ToolCallDelta { call_id, .. } if call_id == "call_b"
        ));
    }

    #[test]
    fn parse_finish_reason_is_normalized() {
        let mut call_ids = std::collections::HashMap::new();
        let events = parse(
            r#"{"choices":[{"delta":{},"finish_reason":"STOP"}]}"#,
            &mut call_ids,
        );
        assert!(matches!(
            &events[0],
            StreamEvent::Done { finish_reason: Some(fr), .. } if fr == "stop"
        ));
    }

    #[test]
    fn parse_done_sentinel() {
        let mut call_ids = std::collections::HashMap::new();
        let events = parse("[DONE]", &mut call_ids);
        assert!(matches!(&events[0], StreamEvent::Done { .. }));
    }

    #[test]
    fn status_taxonomy() {
        let provider =
            OpenAiCompatProvider::new("test", "https://api.example.com/v1", "k", "m").unwrap();
        assert!(matches!(
            provider.status_error(429, "quota".into()),
            Error::QuotaExceeded(_)
        ));
        assert!(matches!(
            provider.status_error(503, "down".into()),
            Error::ServiceUnavailable(_)
        ));
        assert!(matches!(
            provider.status_error(400, "bad".into()),
            Error::Provider { .. }
        ));
    }
}
