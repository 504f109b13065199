//! Tool factory — turns MCP tool manifests into typed, permission-aware
//! tool handles the agent graph can bind.
//!
//! Per server: prefer the cached manifest, otherwise list via the
//! connector; drop tools the user disabled (absence of a permission row
//! means enabled); sanitize each JSON schema for strict tool-calling
//! providers; wrap invocation through the connector. Exposed names are
//! namespaced `Server_tool` with a global uniqueness pass.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use tb_domain::config::{ApprovalConfig, McpConfig};
use tb_domain::error::{Error, Result};
use tb_domain::tool::ToolDefinition;
use tb_mcp::connector::{ConnectorParams, CredentialStore, McpConnector, ToolListCache};
use tb_mcp::protocol::McpToolDef;
use tb_store::{McpServerRow, PermissionStore};

use super::pending::PendingApprovals;
use super::registry::ToolRegistry;

/// Name of the built-in tool-search tool. Excluded from approval gating.
pub const SEARCH_TOOLS_NAME: &str = "search_tools";

const SEARCH_TOOLS_LIMIT: usize = 5;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Async invoke closure carried by every tool handle.
pub type InvokeFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// A bindable tool: definition plus an async invoke closure.
///
/// Tools are plain values, not a class hierarchy; the graph binds a
/// subset per step and the registry searches over them.
#[derive(Clone)]
pub struct AgentTool {
    pub definition: ToolDefinition,
    pub server_name: String,
    pub raw_name: String,
    invoke: InvokeFn,
}

impl AgentTool {
    pub fn new(
        definition: ToolDefinition,
        server_name: impl Into<String>,
        raw_name: impl Into<String>,
        invoke: InvokeFn,
    ) -> Self {
        Self {
            definition,
            server_name: server_name.into(),
            raw_name: raw_name.into(),
            invoke,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Validate required fields against the schema, then dispatch.
    pub async fn invoke(&self, arguments: Value) -> Result<String> {
        if let Some(required) = self.definition.parameters.get("required").and_then(|r| r.as_array())
        {
            let args_obj = arguments.as_object();
            for field in required.iter().filter_map(|f| f.as_str()) {
                let present = args_obj.map(|o| o.contains_key(field)).unwrap_or(false);
                if !present {
                    return Err(Error::Other(format!(
                        "invalid input arguments: missing required field '{field}'"
                    )));
                }
            }
        }
        (self.invoke)(arguments).await
    }
}

impl std::fmt::Debug for AgentTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentTool")
            .field("name", &self.definition.name)
            .field("server_name", &self.server_name)
            .field("raw_name", &self.raw_name)
            .finish()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schema sanitation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const STRIPPED_KEYS: &[&str] = &["title", "default", "additionalProperties", "example", "examples"];

/// Recursively strip schema keys strict tool-calling providers reject,
/// and synthesize `items` for untyped arrays (models reject those).
pub fn sanitize_schema(schema: Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            let is_untyped_array = map.get("type").and_then(|t| t.as_str()) == Some("array")
                && !map.contains_key("items");

            for (key, value) in map {
                if STRIPPED_KEYS.contains(&key.as_str()) {
                    continue;
                }
                out.insert(key, sanitize_schema(value));
            }
            if is_untyped_array {
                out.insert("items".into(), serde_json::json!({ "type": "string" }));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_schema).collect()),
        other => other,
    }
}

/// Server names become name prefixes; whitespace would break tool-name
/// grammars.
pub fn sanitize_server_name(name: &str) -> String {
    name.split_whitespace().collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Factory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Dependencies the factory needs beyond the server rows themselves.
pub struct ToolFactory {
    pub user_id: String,
    /// Legacy loop: the wrapper itself gates on approval and blocks.
    /// Graph mode: gating lives in the graph, wrappers never block.
    pub blocking: bool,
    pub permissions: Arc<PermissionStore>,
    pub pending: Arc<PendingApprovals>,
    pub credential_store: Arc<dyn CredentialStore>,
    pub tool_cache: Arc<ToolListCache>,
    pub mcp_config: McpConfig,
    pub approval_config: ApprovalConfig,
}

impl ToolFactory {
    /// Build the user's tool set across all active servers.
    ///
    /// A server that cannot be reached contributes no tools (logged and
    /// skipped); auth escalations propagate so the caller can demand
    /// re-consent.
    pub async fn build(
        &self,
        servers: &HashMap<String, McpServerRow>,
    ) -> Result<Vec<Arc<AgentTool>>> {
        let mut tools: Vec<AgentTool> = Vec::new();

        for (server_name, row) in servers {
            let connector = Arc::new(McpConnector::new(ConnectorParams {
                server_url: row.server_url.clone(),
                server_name: server_name.clone(),
                server_id: Some(row.id.clone()),
                credentials: row.parsed_credentials(),
                store: Some(self.credential_store.clone()),
                tool_cache: self.tool_cache.clone(),
                timeouts: self.mcp_config.clone(),
            }));

            let manifest = match self.manifest_for(row, &connector).await {
                Ok(manifest) => manifest,
                Err(Error::RequiresAuthentication(server)) => {
                    return Err(Error::RequiresAuthentication(server));
                }
                Err(e) => {
                    tracing::error!(
                        server = %server_name,
                        error = %e,
                        "skipping server, tool listing failed"
                    );
                    continue;
                }
            };

            // One permission read per server.
            let permission_rows = self
                .permissions
                .permissions_for_server(&self.user_id, &row.id);

            for def in manifest {
                if !permission_rows.get(&def.name).copied().unwrap_or(true) {
                    tracing::debug!(server = %server_name, tool = %def.name, "tool disabled by user");
                    continue;
                }
                tools.push(self.build_tool(server_name, def, connector.clone()));
            }
        }

        dedupe_tool_names(&mut tools);
        Ok(tools.into_iter().map(Arc::new).collect())
    }

    /// Cached manifest first; a live listing only on miss.
    async fn manifest_for(
        &self,
        row: &McpServerRow,
        connector: &Arc<McpConnector>,
    ) -> Result<Vec<McpToolDef>> {
        if let Some(manifest) = &row.tools_manifest {
            if let Ok(tools) = serde_json::from_value::<Vec<McpToolDef>>(manifest.clone()) {
                if !tools.is_empty() {
                    return Ok(tools.into_iter().map(McpToolDef::normalize).collect());
                }
            }
            tracing::warn!(server = %row.server_name, "cached manifest unreadable, re-listing");
        }
        connector.list_tools().await
    }

    fn build_tool(
        &self,
        server_name: &str,
        def: McpToolDef,
        connector: Arc<McpConnector>,
    ) -> AgentTool {
        let exposed_name = format!("{}_{}", sanitize_server_name(server_name), def.name);
        let description = if def.description.is_empty() {
            format!("This tool is from the '{server_name}' server.")
        } else {
            format!("{} This tool is from the '{server_name}' server.", def.description)
        };
        let parameters = sanitize_schema(def.input_schema.clone());

        let raw_name = def.name.clone();
        let invoke: InvokeFn = if self.blocking {
            let permissions = self.permissions.clone();
            let pending = self.pending.clone();
            let user_id = self.user_id.clone();
            let unique_name = exposed_name.clone();
            let server = server_name.to_string();
            let tool_name = raw_name.clone();
            let wait_secs = self.approval_config.blocking_wait_secs;
            Arc::new(move |args: Value| {
                let connector = connector.clone();
                let permissions = permissions.clone();
                let pending = pending.clone();
                let user_id = user_id.clone();
                let unique_name = unique_name.clone();
                let server = server.clone();
                let tool_name = tool_name.clone();
                Box::pin(async move {
                    gate_blocking(
                        &permissions,
                        &pending,
                        &user_id,
                        &unique_name,
                        &server,
                        &args,
                        wait_secs,
                    )
                    .await?;
                    connector.run_tool(&tool_name, args).await
                })
            })
        } else {
            let tool_name = raw_name.clone();
            Arc::new(move |args: Value| {
                let connector = connector.clone();
                let tool_name = tool_name.clone();
                Box::pin(async move { connector.run_tool(&tool_name, args).await })
            })
        };

        AgentTool::new(
            ToolDefinition {
                name: exposed_name,
                description,
                parameters,
            },
            server_name,
            raw_name,
            invoke,
        )
    }
}

/// Blocking-mode gate: register a pending approval and poll for the
/// decision, once per second, up to the configured ceiling.
async fn gate_blocking(
    permissions: &PermissionStore,
    pending: &PendingApprovals,
    user_id: &str,
    tool_name: &str,
    server_name: &str,
    args: &Value,
    wait_secs: u64,
) -> Result<()> {
    let (needs_approval, standing) = permissions.approval_status(user_id, tool_name);
    if !needs_approval || standing == Some(tb_store::ApprovalType::Always) {
        return Ok(());
    }

    let approval_id = pending.create(user_id, tool_name, server_name, args.clone());
    tracing::info!(tool = tool_name, approval_id = %approval_id, "blocking on tool approval");

    let mut approved = false;
    for _ in 0..wait_secs {
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        if let Some(record) = pending.get(&approval_id) {
            if let Some(decision) = record.approved {
                approved = decision;
                break;
            }
        }
    }
    pending.remove(&approval_id);

    if approved {
        Ok(())
    } else {
        Err(Error::Forbidden(format!(
            "tool execution denied for {tool_name}"
        )))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Name uniqueness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Global uniqueness pass over the assembled set. The first occurrence
/// keeps its name; collisions become `name_2`, `name_3`, … with a
/// variant marker on the description.
fn dedupe_tool_names(tools: &mut [AgentTool]) {
    let mut taken: HashMap<String, u32> = HashMap::new();

    for tool in tools.iter_mut() {
        let base = tool.definition.name.clone();
        match taken.get(&base) {
            None => {
                taken.insert(base, 1);
            }
            Some(_) => {
                let mut n = 2;
                let mut candidate = format!("{base}_{n}");
                while taken.contains_key(&candidate) {
                    n += 1;
                    candidate = format!("{base}_{n}");
                }
                tracing::warn!(original = %base, renamed = %candidate, "tool name collision");
                tool.definition.name = candidate.clone();
                tool.definition.description =
                    format!("{} (Variant {n})", tool.definition.description);
                taken.insert(candidate, 1);
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// search_tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build the first-class `search_tools` tool over the registry.
///
/// Returns `[{name, description}]` as JSON; the agent node parses this to
/// reveal matching tools for its next step.
pub fn build_search_tool(registry: Arc<ToolRegistry>) -> Arc<AgentTool> {
    let definition = ToolDefinition {
        name: SEARCH_TOOLS_NAME.into(),
        description: "Search the full catalog of available tools by keyword. \
                      Returns matching tool names and descriptions; matching \
                      tools become callable on your next step."
            .into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Keywords describing the capability you need." }
            },
            "required": ["query"]
        }),
    };

    let invoke: InvokeFn = Arc::new(move |args: Value| {
        let registry = registry.clone();
        Box::pin(async move {
            let query = args
                .get("query")
                .and_then(|q| q.as_str())
                .unwrap_or_default()
                .to_string();
            if query.trim().is_empty() {
                return Err(Error::Other("query must not be empty".into()));
            }
            let matches: Vec<Value> = registry
                .search(&query, SEARCH_TOOLS_LIMIT)
                .into_iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.definition.name,
                        "description": t.definition.description,
                    })
                })
                .collect();
            Ok(serde_json::to_string(&matches)?)
        })
    });

    Arc::new(AgentTool::new(definition, "", SEARCH_TOOLS_NAME, invoke))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fake_tool(name: &str, description: &str, result: &'static str) -> AgentTool {
        let invoke: InvokeFn =
            Arc::new(move |_args| Box::pin(async move { Ok(result.to_string()) }));
        AgentTool::new(
            ToolDefinition {
                name: name.into(),
                description: description.into(),
                parameters: json!({ "type": "object", "properties": {} }),
            },
            "Test",
            name,
            invoke,
        )
    }

    #[test]
    fn sanitize_strips_forbidden_keys_recursively() {
        let schema = json!({
            "type": "object",
            "title": "WeatherArgs",
            "additionalProperties": false,
            "properties": {
                "city": { "type": "string", "default": "Paris", "example": "Berlin" },
                "nested": {
                    "type": "object",
                    "properties": {
                        "deep": { "type": "integer", "examples": [1, 2] }
                    }
                }
            }
        });
        let out = sanitize_schema(schema);
        assert!(out.get("title").is_none());
        assert!(out.get("additionalProperties").is_none());
        assert!(out["properties"]["city"].get("default").is_none());
        assert!(out["properties"]["city"].get("example").is_none());
        assert!(out["properties"]["nested"]["properties"]["deep"]
            .get("examples")
            .is_none());
        assert_eq!(out["properties"]["city"]["type"], "string");
    }

    #[test]
    fn sanitize_synthesizes_items_for_untyped_arrays() {
        let schema = json!({
            "type": "object",
            "properties": {
                "tags": { "type": "array" },
                "typed": { "type": "array", "items": { "type": "integer" } }
            }
        });
        let out = sanitize_schema(schema);
        assert_eq!(out["properties"]["tags"]["items"], json!({ "type": "string" }));
        assert_eq!(out["properties"]["typed"]["items"], json!({ "type": "integer" }));
    }

    #[test]
    fn server_name_sanitation_removes_whitespace() {
        assert_eq!(sanitize_server_name("My Weather Server"), "MyWeatherServer");
        assert_eq!(sanitize_server_name("Plain"), "Plain");
    }

    #[test]
    fn collision_renaming_appends_suffixes() {
        let mut tools = vec![
            fake_tool("S_search", "first", "a"),
            fake_tool("S_search", "second", "b"),
            fake_tool("S_search", "third", "c"),
        ];
        dedupe_tool_names(&mut tools);

        assert_eq!(tools[0].definition.name, "S_search");
        assert_eq!(tools[1].definition.name, "S_search_2");
        assert_eq!(tools[2].definition.name, "S_search_3");
        assert!(tools[1].definition.description.ends_with("(Variant 2)"));
        assert!(tools[2].definition.description.ends_with("(Variant 3)"));
    }

    #[test]
    fn distinct_names_untouched() {
        let mut tools = vec![
            fake_tool("Weather_search", "w", "a"),
            fake_tool("Notion_search", "n", "b"),
        ];
        dedupe_tool_names(&mut tools);
        assert_eq!(tools[0].definition.name, "Weather_search");
        assert_eq!(tools[1].definition.name, "Notion_search");
    }

    #[tokio::test]
    async fn invoke_validates_required_fields() {
        let invoke: InvokeFn = Arc::new(|_| Box::pin(async { Ok("ok".to_string()) }));
        let tool = AgentTool::new(
            ToolDefinition {
                name: "t".into(),
                description: String::new(),
                parameters: json!({
                    "type": "object",
                    "properties": { "city": { "type": "string" } },
                    "required": ["city"]
                }),
            },
            "S",
            "t",
            invoke,
        );

        assert!(tool.invoke(json!({})).await.is_err());
        assert_eq!(tool.invoke(json!({"city": "Paris"})).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn search_tool_returns_ranked_matches() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(&[
            Arc::new(fake_tool(
                "Weather_get_weather",
                "Get the current weather for a city",
                "",
            )),
            Arc::new(fake_tool(
                "Notion_search_pages",
                "Search pages in a Notion workspace",
                "",
            )),
        ]);

        let search = build_search_tool(registry);
        let out = search
            .invoke(json!({"query": "weather city"}))
            .await
            .unwrap();
        let matches: Vec<Value> = serde_json::from_str(&out).unwrap();
        assert!(!matches.is_empty());
        assert_eq!(matches[0]["name"], "Weather_get_weather");
    }

    #[tokio::test]
    async fn search_tool_rejects_empty_query() {
        let registry = Arc::new(ToolRegistry::new());
        let search = build_search_tool(registry);
        assert!(search.invoke(json!({"query": "  "})).await.is_err());
    }
}
