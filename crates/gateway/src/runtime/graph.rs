//! The agent graph — an interrupt-capable state machine that alternates
//! LLM reasoning with tool execution.
//!
//! Nodes and edges:
//!
//! ```text
//!            ┌────────┐   no tool calls   ┌─────┐
//!   entry ──▶│ agent  │──────────────────▶│ END │
//!            └────────┘                   └─────┘
//!                │  tool calls
//!                ▼
//!          route_tools ── any gated ──▶ human_review ──▶ tools
//!                │                          ▲              │
//!                └────── none gated ────────┼──────────────┘
//!                                           │   (loop back to agent)
//! ```
//!
//! The graph compiles with an interrupt before `human_review`: when
//! `route_tools` gates a call it registers a pending approval, writes a
//! checkpoint at the pause point, and yields. Resuming with empty input
//! on the same `(user_id, thread_id)` re-enters at `human_review`, reads
//! the now-decided records, and proceeds through the filtered tool node.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use tb_domain::error::{Error, Result};
use tb_domain::stream::StreamEvent;
use tb_domain::tool::{Message, Role, ToolCall, ToolDefinition};
use tb_providers::{ChatRequest, LlmProvider};
use tb_store::{ApprovalType, CheckpointConfig, CheckpointStore, PermissionStore};

use super::pending::PendingApprovals;
use super::registry::ToolRegistry;
use super::tools::{AgentTool, SEARCH_TOOLS_NAME};

/// Ceiling on reason→act cycles before the graph force-stops.
const MAX_TOOL_LOOPS: usize = 25;

const SYSTEM_PROMPT: &str = "You are an expert assistant. Answer the user's question accurately \
and concisely, using the tools bound to this conversation when a task calls for them. When the \
bound tools do not cover a task, call `search_tools` to discover more from the full catalog; \
matching tools become callable on your next step. After using tools, give the answer in plain \
text.";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inputs & events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fresh input for a run. `None` at the stream level means resume.
#[derive(Debug, Clone)]
pub struct GraphInput {
    pub input: String,
    pub chat_history: Vec<Message>,
}

/// Per-run addressing; `thread_id == session_id`.
#[derive(Debug, Clone)]
pub struct GraphRunConfig {
    pub user_id: String,
    pub thread_id: String,
}

/// Events observed while the graph runs.
#[derive(Debug)]
pub enum GraphEvent {
    Token { text: String },
    ToolStart { tool_name: String, tool_input: Value },
    ToolEnd { tool_name: String, observation: String },
    /// Terminal: the assistant answered without further tool calls.
    Final { content: String },
    /// Terminal for this stream: paused before `human_review` with at
    /// least one pending approval registered.
    Interrupted,
    /// Terminal failure (LLM stream failure, auth escalation, …).
    Failed { error: Error },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Graph
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A compiled agent: LLM binding, tool set, and the stores the nodes
/// consult. Cached per user by the agent cache.
pub struct AgentGraph {
    pub llm: Arc<dyn LlmProvider>,
    pub model: Option<String>,
    /// Initially bound tools, keyed by exposed name.
    pub tools: HashMap<String, Arc<AgentTool>>,
    /// Full catalog behind `search_tools`.
    pub registry: Arc<ToolRegistry>,
    pub permissions: Arc<PermissionStore>,
    pub pending: Arc<PendingApprovals>,
    pub checkpoints: Arc<CheckpointStore>,
}

impl std::fmt::Debug for AgentGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentGraph").finish_non_exhaustive()
    }
}

impl AgentGraph {
    /// Drive the graph, emitting events on the returned channel. The
    /// final event is always `Final`, `Interrupted`, or `Failed` unless
    /// the receiver is dropped first (client disconnect), which stops
    /// the run at the next emission.
    pub fn stream(
        self: &Arc<Self>,
        input: Option<GraphInput>,
        config: GraphRunConfig,
    ) -> mpsc::Receiver<GraphEvent> {
        let (tx, rx) = mpsc::channel(64);
        let graph = self.clone();
        tokio::spawn(async move {
            if let Err(error) = graph.run(input, &config, &tx).await {
                let _ = tx.send(GraphEvent::Failed { error }).await;
            }
        });
        rx
    }

    async fn run(
        &self,
        input: Option<GraphInput>,
        config: &GraphRunConfig,
        tx: &mpsc::Sender<GraphEvent>,
    ) -> Result<()> {
        let cp_config = CheckpointConfig::latest(&config.user_id, &config.thread_id);
        let resuming = input.is_none();

        let mut messages = match input {
            Some(input) => {
                let mut messages = input.chat_history;
                messages.push(Message::user(input.input));
                messages
            }
            None => self.restore(&cp_config)?,
        };

        if resuming {
            tracing::info!(
                user_id = %config.user_id,
                thread_id = %config.thread_id,
                "resuming at human_review"
            );
            self.human_review(config, &mut messages);
            let stored = self.save_checkpoint(&cp_config, &messages, 0)?;
            self.tools_node(config, &mut messages, &stored, tx).await?;
            self.save_checkpoint(&cp_config, &messages, 0)?;
        }

        for step in 1..=MAX_TOOL_LOOPS {
            // ── agent ───────────────────────────────────────────────
            let (text, calls) = self.agent_node(&messages, tx).await?;
            let assistant = if calls.is_empty() {
                Message::assistant(text.clone())
            } else {
                Message::assistant_with_tools(text.clone(), &calls)
            };
            messages.push(assistant);
            let stored = self.save_checkpoint(&cp_config, &messages, step)?;

            if calls.is_empty() {
                emit(tx, GraphEvent::Final { content: text }).await?;
                return Ok(());
            }

            // ── route_tools ─────────────────────────────────────────
            if self.route_tools(config, &calls) {
                // Interrupt before human_review; the checkpoint above is
                // the pause point.
                tracing::info!(
                    user_id = %config.user_id,
                    thread_id = %config.thread_id,
                    "interrupting for tool approval"
                );
                emit(tx, GraphEvent::Interrupted).await?;
                return Ok(());
            }

            // ── tools ───────────────────────────────────────────────
            self.tools_node(config, &mut messages, &stored, tx).await?;
            self.save_checkpoint(&cp_config, &messages, step)?;
        }

        Err(Error::Other(format!(
            "tool loop limit reached ({MAX_TOOL_LOOPS} iterations)"
        )))
    }

    // ── Checkpointing ───────────────────────────────────────────────

    fn restore(&self, cp_config: &CheckpointConfig) -> Result<Vec<Message>> {
        let tuple = self
            .checkpoints
            .get_tuple(cp_config)
            .ok_or_else(|| Error::Other("nothing to resume on this thread".into()))?;

        let raw = tuple
            .checkpoint
            .get("messages")
            .cloned()
            .unwrap_or(Value::Null);
        let mut messages: Vec<Message> = match serde_json::from_value(raw) {
            Ok(messages) => messages,
            Err(e) => {
                // Corrupt state is treated as absence.
                tracing::error!(error = %e, "checkpoint state unreadable");
                return Err(Error::Other("checkpoint state unreadable".into()));
            }
        };

        // Materialize partial writes from an execution that died mid-node,
        // so the filtered tool node never re-runs finished calls.
        for (_task_id, channel, value) in tuple.pending_writes {
            if channel == "messages" {
                match serde_json::from_value::<Message>(value) {
                    Ok(message) => messages.push(message),
                    Err(e) => tracing::warn!(error = %e, "skipping unreadable pending write"),
                }
            }
        }
        Ok(messages)
    }

    fn save_checkpoint(
        &self,
        cp_config: &CheckpointConfig,
        messages: &[Message],
        step: usize,
    ) -> Result<CheckpointConfig> {
        let checkpoint_id = uuid::Uuid::new_v4().to_string();
        let state = serde_json::json!({ "messages": serde_json::to_value(messages)? });
        let metadata = serde_json::json!({ "step": step });
        let parent = serde_json::json!({
            "user_id": cp_config.user_id,
            "thread_id": cp_config.thread_id,
        });
        Ok(self
            .checkpoints
            .put(cp_config, &checkpoint_id, state, metadata, Some(parent)))
    }

    // ── agent node ──────────────────────────────────────────────────

    /// Bind the current tool set (plus any tools revealed by a prior
    /// `search_tools` result), run one LLM step, and assemble the
    /// assistant message.
    async fn agent_node(
        &self,
        messages: &[Message],
        tx: &mpsc::Sender<GraphEvent>,
    ) -> Result<(String, Vec<ToolCall>)> {
        let mut definitions: Vec<ToolDefinition> = Vec::new();
        let mut bound: HashSet<String> = HashSet::new();
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        for name in names {
            definitions.push(self.tools[name].definition.clone());
            bound.insert(name.clone());
        }
        for tool in self.dynamic_tools(messages) {
            if bound.insert(tool.name().to_string()) {
                definitions.push(tool.definition.clone());
            }
        }

        let mut request_messages = Vec::with_capacity(messages.len() + 1);
        request_messages.push(Message::system(SYSTEM_PROMPT));
        request_messages.extend_from_slice(messages);

        let request = ChatRequest {
            messages: request_messages,
            tools: definitions,
            temperature: Some(0.2),
            max_tokens: None,
            model: self.model.clone(),
        };

        let mut stream = self.llm.chat_stream(request).await?;

        let mut text_buf = String::new();
        let mut calls: Vec<ToolCall> = Vec::new();
        // call_id -> (name, partial args json)
        let mut assembly: HashMap<String, (String, String)> = HashMap::new();

        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::Token { text } => {
                    emit(tx, GraphEvent::Token { text: text.clone() }).await?;
                    text_buf.push_str(&text);
                }
                StreamEvent::ToolCallStarted { call_id, tool_name } => {
                    assembly.insert(call_id, (tool_name, String::new()));
                }
                StreamEvent::ToolCallDelta { call_id, delta } => {
                    if let Some((_, args)) = assembly.get_mut(&call_id) {
                        args.push_str(&delta);
                    }
                }
                StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                } => {
                    calls.push(ToolCall {
                        call_id: call_id.clone(),
                        tool_name,
                        arguments,
                    });
                    assembly.remove(&call_id);
                }
                StreamEvent::Done { .. } => {}
                StreamEvent::Error { message } => {
                    return Err(Error::Provider {
                        provider: self.llm.provider_id().to_string(),
                        message,
                    });
                }
            }
        }

        // Providers that only emit start+delta never send Finished.
        for (call_id, (tool_name, raw_args)) in assembly.drain() {
            let arguments = if raw_args.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&raw_args).unwrap_or_else(|e| {
                    tracing::warn!(
                        call_id = %call_id,
                        tool = %tool_name,
                        error = %e,
                        "tool call arguments are not valid JSON, defaulting to empty object"
                    );
                    Value::Object(Default::default())
                })
            };
            calls.push(ToolCall {
                call_id,
                tool_name,
                arguments,
            });
        }

        Ok((text_buf, calls))
    }

    /// Tools revealed by the immediately preceding `search_tools` result,
    /// resolved through the registry. Parse failures are logged and
    /// ignored.
    fn dynamic_tools(&self, messages: &[Message]) -> Vec<Arc<AgentTool>> {
        let Some(last) = messages.last() else {
            return Vec::new();
        };
        if last.role != Role::Tool {
            return Vec::new();
        }

        let search_call_ids: HashSet<String> = messages
            .iter()
            .flat_map(|m| m.tool_calls())
            .filter(|c| c.tool_name == SEARCH_TOOLS_NAME)
            .map(|c| c.call_id)
            .collect();
        if search_call_ids.is_empty() {
            return Vec::new();
        }

        let mut revealed = Vec::new();
        if let tb_domain::tool::MessageContent::Parts(parts) = &last.content {
            for part in parts {
                let tb_domain::tool::ContentPart::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } = part
                else {
                    continue;
                };
                if !search_call_ids.contains(tool_use_id) {
                    continue;
                }
                match serde_json::from_str::<Vec<Value>>(content) {
                    Ok(entries) => {
                        for entry in entries {
                            let Some(name) = entry.get("name").and_then(|n| n.as_str()) else {
                                continue;
                            };
                            match self.registry.get(name) {
                                Some(tool) => revealed.push(tool),
                                None => {
                                    tracing::debug!(tool = name, "search result names unknown tool")
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "unparseable search_tools result, ignoring");
                    }
                }
            }
        }
        revealed
    }

    // ── route_tools ─────────────────────────────────────────────────

    /// Decide whether any of the step's tool calls require approval,
    /// registering a pending record for each gated call. Returns `true`
    /// when the graph must pause at `human_review`.
    fn route_tools(&self, config: &GraphRunConfig, calls: &[ToolCall]) -> bool {
        let mut gated = false;
        for call in calls {
            // Tool discovery and internal tools are never gated.
            if call.tool_name == SEARCH_TOOLS_NAME || call.tool_name.starts_with('_') {
                continue;
            }

            let (needs_approval, standing) = self
                .permissions
                .approval_status(&config.user_id, &call.tool_name);
            if !needs_approval || standing == Some(ApprovalType::Always) {
                continue;
            }

            let server_name = self
                .lookup_tool(&call.tool_name)
                .map(|t| t.server_name.clone())
                .unwrap_or_else(|| "unknown".into());

            // The record captures the graph's exact tool-call name so the
            // UI-visible name matches what the graph will execute.
            let approval_id = self.pending.create(
                &config.user_id,
                &call.tool_name,
                &server_name,
                call.arguments.clone(),
            );
            tracing::info!(
                tool = %call.tool_name,
                approval_id = %approval_id,
                "tool gated for approval"
            );
            gated = true;
        }
        gated
    }

    // ── human_review node ───────────────────────────────────────────

    /// Fail-safe gate, run on resume. Approved calls pass through (their
    /// records are cleaned up after execution); denied and undecided
    /// calls get synthetic tool results; a call with *no* record is
    /// treated as denied.
    fn human_review(&self, config: &GraphRunConfig, messages: &mut Vec<Message>) {
        let Some((calls, answered)) = last_assistant_calls(messages) else {
            return;
        };

        for call in calls {
            if answered.contains(call.call_id.as_str()) {
                continue;
            }
            let record =
                self.pending
                    .record_for_call(&config.user_id, &call.tool_name, &call.arguments);
            match record {
                Some(record) if record.approved == Some(true) => {
                    tracing::info!(tool = %call.tool_name, "tool approved by user");
                }
                Some(record) if record.approved == Some(false) => {
                    tracing::info!(tool = %call.tool_name, "tool denied by user");
                    messages.push(Message::tool_error(
                        &call.call_id,
                        format!(
                            "Error: User explicitly denied execution of tool '{}'.",
                            call.tool_name
                        ),
                    ));
                    self.pending.remove(&record.id);
                }
                Some(_) => {
                    // Still undecided: answer the call so the agent can
                    // explain, but keep the record for the next resume.
                    messages.push(Message::tool_error(
                        &call.call_id,
                        format!("Error: Tool '{}' is awaiting user approval.", call.tool_name),
                    ));
                }
                None => {
                    tracing::warn!(
                        tool = %call.tool_name,
                        "no pending record found, treating as denied"
                    );
                    messages.push(Message::tool_error(
                        &call.call_id,
                        format!(
                            "Error: User explicitly denied execution of tool '{}'.",
                            call.tool_name
                        ),
                    ));
                }
            }
        }
    }

    // ── tools node (filtered) ───────────────────────────────────────

    /// Execute only the tool calls lacking an upstream result, in
    /// declaration order. Unknown tools and execution failures become
    /// synthetic error results; partial progress is recorded as pending
    /// writes against the current checkpoint.
    async fn tools_node(
        &self,
        config: &GraphRunConfig,
        messages: &mut Vec<Message>,
        stored: &CheckpointConfig,
        tx: &mpsc::Sender<GraphEvent>,
    ) -> Result<()> {
        let Some((calls, answered)) = last_assistant_calls(messages) else {
            return Ok(());
        };

        for call in calls {
            if answered.contains(call.call_id.as_str()) {
                continue;
            }

            let result = match self.lookup_tool(&call.tool_name) {
                None => Message::tool_error(
                    &call.call_id,
                    format!("Error: Tool '{}' not found", call.tool_name),
                ),
                Some(tool) => {
                    emit(
                        tx,
                        GraphEvent::ToolStart {
                            tool_name: call.tool_name.clone(),
                            tool_input: call.arguments.clone(),
                        },
                    )
                    .await?;

                    match tool.invoke(call.arguments.clone()).await {
                        Ok(observation) => {
                            emit(
                                tx,
                                GraphEvent::ToolEnd {
                                    tool_name: call.tool_name.clone(),
                                    observation: observation.clone(),
                                },
                            )
                            .await?;
                            Message::tool_result(&call.call_id, observation)
                        }
                        Err(Error::RequiresAuthentication(server)) => {
                            return Err(Error::RequiresAuthentication(server));
                        }
                        Err(e) => {
                            let observation = format!("Error: {e}");
                            emit(
                                tx,
                                GraphEvent::ToolEnd {
                                    tool_name: call.tool_name.clone(),
                                    observation: observation.clone(),
                                },
                            )
                            .await?;
                            Message::tool_error(&call.call_id, observation)
                        }
                    }
                }
            };

            self.checkpoints.put_writes(
                stored,
                &[("messages".into(), serde_json::to_value(&result)?)],
                "tools",
                "",
            );
            messages.push(result);

            // An approved pending record is spent exactly once.
            if let Some(record) =
                self.pending
                    .record_for_call(&config.user_id, &call.tool_name, &call.arguments)
            {
                if record.approved == Some(true) {
                    self.pending.remove(&record.id);
                }
            }
        }
        Ok(())
    }

    fn lookup_tool(&self, name: &str) -> Option<Arc<AgentTool>> {
        self.tools
            .get(name)
            .cloned()
            .or_else(|| self.registry.get(name))
    }
}

/// The last assistant message's tool calls, plus the set of call IDs
/// already answered by later tool messages.
fn last_assistant_calls(messages: &[Message]) -> Option<(Vec<ToolCall>, HashSet<String>)> {
    let assistant_idx = messages.iter().rposition(|m| m.role == Role::Assistant)?;
    let calls = messages[assistant_idx].tool_calls();
    if calls.is_empty() {
        return None;
    }
    let answered: HashSet<String> = messages[assistant_idx + 1..]
        .iter()
        .flat_map(|m| m.tool_result_ids())
        .map(String::from)
        .collect();
    Some((calls, answered))
}

async fn emit(tx: &mpsc::Sender<GraphEvent>, event: GraphEvent) -> Result<()> {
    tx.send(event)
        .await
        .map_err(|_| Error::Other("client disconnected".into()))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tb_domain::stream::BoxStream;

    // ── Scripted LLM provider ───────────────────────────────────────

    struct ScriptedProvider {
        scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
    }

    impl ScriptedProvider {
        fn new(scripts: Vec<Vec<StreamEvent>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
            })
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn chat_stream(
            &self,
            _req: ChatRequest,
        ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
            let events = self
                .scripts
                .lock()
                .pop_front()
                .expect("scripted provider ran out of turns");
            Ok(Box::pin(futures_util::stream::iter(
                events.into_iter().map(Ok),
            )))
        }

        fn provider_id(&self) -> &str {
            "scripted"
        }

        fn default_model(&self) -> &str {
            "scripted-1"
        }
    }

    fn token(text: &str) -> StreamEvent {
        StreamEvent::Token { text: text.into() }
    }

    fn call(id: &str, name: &str, args: Value) -> StreamEvent {
        StreamEvent::ToolCallFinished {
            call_id: id.into(),
            tool_name: name.into(),
            arguments: args,
        }
    }

    fn done() -> StreamEvent {
        StreamEvent::Done {
            usage: None,
            finish_reason: Some("stop".into()),
        }
    }

    // ── Fixture ─────────────────────────────────────────────────────

    struct Fixture {
        _dir: tempfile::TempDir,
        graph: Arc<AgentGraph>,
    }

    fn fixture(scripts: Vec<Vec<StreamEvent>>, tools: Vec<Arc<AgentTool>>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let permissions = Arc::new(PermissionStore::new(dir.path(), 3600).unwrap());
        let checkpoints = Arc::new(CheckpointStore::new(dir.path()).unwrap());
        let pending = Arc::new(PendingApprovals::new());
        let registry = Arc::new(ToolRegistry::new());
        registry.register(&tools);

        let graph = Arc::new(AgentGraph {
            llm: ScriptedProvider::new(scripts),
            model: None,
            tools: tools
                .iter()
                .map(|t| (t.name().to_string(), t.clone()))
                .collect(),
            registry,
            permissions,
            pending,
            checkpoints,
        });
        Fixture { _dir: dir, graph }
    }

    fn weather_tool() -> Arc<AgentTool> {
        let invoke: Arc<dyn Fn(Value) -> BoxFuture<'static, Result<String>> + Send + Sync> =
            Arc::new(|_| Box::pin(async { Ok("22 degrees and sunny".to_string()) }));
        Arc::new(AgentTool::new(
            ToolDefinition {
                name: "Weather_get_weather".into(),
                description: "Get the weather for a city".into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": { "city": { "type": "string" } },
                    "required": ["city"]
                }),
            },
            "Weather",
            "get_weather",
            invoke,
        ))
    }

    fn run_config() -> GraphRunConfig {
        GraphRunConfig {
            user_id: "u1".into(),
            thread_id: "t1".into(),
        }
    }

    async fn collect(mut rx: mpsc::Receiver<GraphEvent>) -> Vec<GraphEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn fresh_input(prompt: &str) -> Option<GraphInput> {
        Some(GraphInput {
            input: prompt.into(),
            chat_history: Vec::new(),
        })
    }

    // ── Scenarios ───────────────────────────────────────────────────

    #[tokio::test]
    async fn fresh_session_no_tools_yields_final() {
        let fx = fixture(
            vec![vec![token("Hello"), token(" there"), done()]],
            Vec::new(),
        );
        let events = collect(fx.graph.stream(fresh_input("hello"), run_config())).await;

        let tokens: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, GraphEvent::Token { .. }))
            .collect();
        assert_eq!(tokens.len(), 2);
        match events.last().unwrap() {
            GraphEvent::Final { content } => assert_eq!(content, "Hello there"),
            other => panic!("expected Final, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ungated_tool_call_executes_and_loops() {
        let fx = fixture(
            vec![
                vec![
                    call("c1", "Weather_get_weather", serde_json::json!({"city": "Paris"})),
                    done(),
                ],
                vec![token("It is sunny in Paris."), done()],
            ],
            vec![weather_tool()],
        );
        // Standing approval so route_tools does not gate.
        fx.graph
            .permissions
            .save_tool_approval("u1", "Weather_get_weather", ApprovalType::Always, None)
            .unwrap();

        let events = collect(fx.graph.stream(fresh_input("weather in Paris"), run_config())).await;

        assert!(events
            .iter()
            .any(|e| matches!(e, GraphEvent::ToolStart { tool_name, .. } if tool_name == "Weather_get_weather")));
        assert!(events.iter().any(
            |e| matches!(e, GraphEvent::ToolEnd { observation, .. } if observation == "22 degrees and sunny")
        ));
        assert!(matches!(events.last().unwrap(), GraphEvent::Final { .. }));
    }

    #[tokio::test]
    async fn unapproved_tool_interrupts_and_registers_pending() {
        let fx = fixture(
            vec![vec![
                call("c1", "Weather_get_weather", serde_json::json!({"city": "Paris"})),
                done(),
            ]],
            vec![weather_tool()],
        );

        let events = collect(fx.graph.stream(fresh_input("weather in Paris"), run_config())).await;

        assert!(matches!(events.last().unwrap(), GraphEvent::Interrupted));
        // No tool ran.
        assert!(!events.iter().any(|e| matches!(e, GraphEvent::ToolStart { .. })));

        let pending = fx.graph.pending.undecided_for_user("u1");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].tool_name, "Weather_get_weather");
        assert_eq!(pending[0].server_name, "Weather");
        assert_eq!(pending[0].tool_input, serde_json::json!({"city": "Paris"}));
    }

    #[tokio::test]
    async fn approve_then_resume_executes_the_tool() {
        let fx = fixture(
            vec![
                vec![
                    call("c1", "Weather_get_weather", serde_json::json!({"city": "Paris"})),
                    done(),
                ],
                vec![token("22 degrees in Paris."), done()],
            ],
            vec![weather_tool()],
        );

        let events = collect(fx.graph.stream(fresh_input("weather in Paris"), run_config())).await;
        assert!(matches!(events.last().unwrap(), GraphEvent::Interrupted));

        let approval_id = fx.graph.pending.undecided_for_user("u1")[0].id.clone();
        fx.graph.pending.approve(&approval_id, ApprovalType::Once);

        // Resume: empty input on the same thread.
        let events = collect(fx.graph.stream(None, run_config())).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, GraphEvent::ToolStart { .. })));
        match events.last().unwrap() {
            GraphEvent::Final { content } => assert_eq!(content, "22 degrees in Paris."),
            other => panic!("expected Final, got {other:?}"),
        }
        // The spent approval is gone.
        assert!(fx.graph.pending.get(&approval_id).is_none());
    }

    #[tokio::test]
    async fn deny_then_resume_synthesizes_denial_without_executing() {
        let fx = fixture(
            vec![
                vec![
                    call("c1", "Weather_get_weather", serde_json::json!({"city": "Paris"})),
                    done(),
                ],
                vec![token("Understood, I won't check the weather."), done()],
            ],
            vec![weather_tool()],
        );

        collect(fx.graph.stream(fresh_input("weather in Paris"), run_config())).await;
        let approval_id = fx.graph.pending.undecided_for_user("u1")[0].id.clone();
        fx.graph.pending.deny(&approval_id);

        let events = collect(fx.graph.stream(None, run_config())).await;
        // The denied tool never ran.
        assert!(!events.iter().any(|e| matches!(e, GraphEvent::ToolStart { .. })));
        assert!(matches!(events.last().unwrap(), GraphEvent::Final { .. }));
        assert!(fx.graph.pending.get(&approval_id).is_none());

        // The denial landed in the checkpointed log as a tool result.
        let tuple = fx
            .graph
            .checkpoints
            .get_tuple(&CheckpointConfig::latest("u1", "t1"))
            .unwrap();
        let state = tuple.checkpoint["messages"].to_string();
        assert!(state.contains("explicitly denied execution of tool 'Weather_get_weather'"));
    }

    #[tokio::test]
    async fn partial_denial_executes_only_approved_calls() {
        let files_tool: Arc<AgentTool> = {
            let invoke: Arc<dyn Fn(Value) -> BoxFuture<'static, Result<String>> + Send + Sync> =
                Arc::new(|_| Box::pin(async { Ok("file contents".to_string()) }));
            Arc::new(AgentTool::new(
                ToolDefinition {
                    name: "Files_read_file".into(),
                    description: "Read a file".into(),
                    parameters: serde_json::json!({ "type": "object", "properties": {} }),
                },
                "Files",
                "read_file",
                invoke,
            ))
        };

        let fx = fixture(
            vec![
                vec![
                    call("c1", "Weather_get_weather", serde_json::json!({"city": "Paris"})),
                    call("c2", "Files_read_file", serde_json::json!({"path": "/tmp/x"})),
                    done(),
                ],
                vec![token("done"), done()],
            ],
            vec![weather_tool(), files_tool],
        );

        collect(fx.graph.stream(fresh_input("do both"), run_config())).await;
        let pending = fx.graph.pending.undecided_for_user("u1");
        assert_eq!(pending.len(), 2);

        for record in &pending {
            if record.tool_name == "Weather_get_weather" {
                fx.graph.pending.approve(&record.id, ApprovalType::Once);
            } else {
                fx.graph.pending.deny(&record.id);
            }
        }

        let events = collect(fx.graph.stream(None, run_config())).await;
        let started: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                GraphEvent::ToolStart { tool_name, .. } => Some(tool_name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec!["Weather_get_weather".to_string()]);

        // Exactly one result per call id, never duplicated.
        let tuple = fx
            .graph
            .checkpoints
            .get_tuple(&CheckpointConfig::latest("u1", "t1"))
            .unwrap();
        let messages: Vec<Message> =
            serde_json::from_value(tuple.checkpoint["messages"].clone()).unwrap();
        let result_ids: Vec<&str> = messages.iter().flat_map(|m| m.tool_result_ids()).collect();
        assert_eq!(
            result_ids.iter().filter(|id| **id == "c1").count(),
            1,
            "approved call answered exactly once"
        );
        assert_eq!(
            result_ids.iter().filter(|id| **id == "c2").count(),
            1,
            "denied call answered exactly once"
        );
    }

    #[tokio::test]
    async fn missing_pending_record_is_treated_as_denied() {
        let fx = fixture(
            vec![
                vec![
                    call("c1", "Weather_get_weather", serde_json::json!({"city": "Paris"})),
                    done(),
                ],
                vec![token("ok"), done()],
            ],
            vec![weather_tool()],
        );

        collect(fx.graph.stream(fresh_input("weather"), run_config())).await;
        // Drop the record outright instead of deciding it.
        let approval_id = fx.graph.pending.undecided_for_user("u1")[0].id.clone();
        fx.graph.pending.remove(&approval_id);

        let events = collect(fx.graph.stream(None, run_config())).await;
        assert!(!events.iter().any(|e| matches!(e, GraphEvent::ToolStart { .. })));
        assert!(matches!(events.last().unwrap(), GraphEvent::Final { .. }));
    }

    #[tokio::test]
    async fn search_tools_is_not_gated_and_reveals_tools() {
        let search = super::super::tools::build_search_tool({
            let registry = Arc::new(ToolRegistry::new());
            registry.register(&[weather_tool()]);
            registry
        });

        // The graph's own registry also knows the weather tool so the
        // dynamic binding can resolve it; the bound set starts with only
        // search_tools.
        let dir = tempfile::tempdir().unwrap();
        let permissions = Arc::new(PermissionStore::new(dir.path(), 3600).unwrap());
        let checkpoints = Arc::new(CheckpointStore::new(dir.path()).unwrap());
        let registry = Arc::new(ToolRegistry::new());
        registry.register(&[weather_tool(), search.clone()]);

        let scripts = vec![
            vec![
                call("c1", SEARCH_TOOLS_NAME, serde_json::json!({"query": "weather"})),
                done(),
            ],
            vec![token("Found a weather tool."), done()],
        ];
        let graph = Arc::new(AgentGraph {
            llm: ScriptedProvider::new(scripts),
            model: None,
            tools: HashMap::from([(SEARCH_TOOLS_NAME.to_string(), search)]),
            registry,
            permissions,
            pending: Arc::new(PendingApprovals::new()),
            checkpoints,
        });

        let events = collect(graph.stream(fresh_input("find me a weather tool"), run_config())).await;

        // search_tools executed without any interrupt.
        assert!(!events.iter().any(|e| matches!(e, GraphEvent::Interrupted)));
        assert!(events
            .iter()
            .any(|e| matches!(e, GraphEvent::ToolStart { tool_name, .. } if tool_name == SEARCH_TOOLS_NAME)));
        assert!(matches!(events.last().unwrap(), GraphEvent::Final { .. }));
        assert!(graph.pending.undecided_for_user("u1").is_empty());
    }

    #[tokio::test]
    async fn unknown_tool_produces_error_result() {
        let fx = fixture(
            vec![
                vec![call("c1", "Ghost_tool", serde_json::json!({})), done()],
                vec![token("that tool does not exist"), done()],
            ],
            Vec::new(),
        );
        fx.graph
            .permissions
            .save_tool_approval("u1", "Ghost_tool", ApprovalType::Always, None)
            .unwrap();

        let events = collect(fx.graph.stream(fresh_input("use ghost"), run_config())).await;
        assert!(matches!(events.last().unwrap(), GraphEvent::Final { .. }));

        let tuple = fx
            .graph
            .checkpoints
            .get_tuple(&CheckpointConfig::latest("u1", "t1"))
            .unwrap();
        assert!(tuple.checkpoint["messages"]
            .to_string()
            .contains("Tool 'Ghost_tool' not found"));
    }

    #[tokio::test]
    async fn llm_stream_error_is_terminal() {
        let fx = fixture(
            vec![vec![StreamEvent::Error {
                message: "429 resource exhausted".into(),
            }]],
            Vec::new(),
        );
        let events = collect(fx.graph.stream(fresh_input("hi"), run_config())).await;
        assert!(matches!(events.last().unwrap(), GraphEvent::Failed { .. }));
    }

    #[tokio::test]
    async fn resume_without_checkpoint_fails() {
        let fx = fixture(Vec::new(), Vec::new());
        let events = collect(fx.graph.stream(None, run_config())).await;
        assert!(matches!(events.last().unwrap(), GraphEvent::Failed { .. }));
    }
}
