//! Agent manager — resolves a compiled agent for a request.
//!
//! Computes the config fingerprint (server set + tool permissions +
//! provider + model), consults the per-user cache, and rebuilds on any
//! drift: realize tools through the factory, index them in a registry,
//! add `search_tools`, and compose the graph bound to the LLM and the
//! checkpointer.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tb_domain::config::Config;
use tb_domain::error::{Error, Result};
use tb_mcp::connector::{CredentialStore, ToolListCache};
use tb_providers::ProviderRegistry;
use tb_store::{CheckpointStore, PermissionStore, ServerStore};

use super::cache::{config_fingerprint, AgentCache};
use super::graph::AgentGraph;
use super::pending::PendingApprovals;
use super::registry::ToolRegistry;
use super::tools::{build_search_tool, AgentTool, ToolFactory};

pub struct AgentManager {
    pub providers: Arc<ProviderRegistry>,
    pub cache: Arc<AgentCache>,
    pub servers: Arc<ServerStore>,
    pub permissions: Arc<PermissionStore>,
    pub pending: Arc<PendingApprovals>,
    pub checkpoints: Arc<CheckpointStore>,
    pub tool_cache: Arc<ToolListCache>,
    pub config: Arc<Config>,
}

impl AgentManager {
    /// Return `(agent, cache_hit)` for the user's current configuration.
    pub async fn get_or_create(
        &self,
        user_id: &str,
        provider_id: &str,
        model: &str,
    ) -> Result<(Arc<AgentGraph>, bool)> {
        let provider = self
            .providers
            .get(provider_id)
            .ok_or_else(|| Error::Config(format!("unknown model provider '{provider_id}'")))?;

        let servers = self.servers.active_for_user(user_id);

        // Tool permissions feed the fingerprint so a toggle forces rebuild.
        let mut tool_permissions: BTreeMap<String, bool> = BTreeMap::new();
        for row in servers.values() {
            for (tool, enabled) in self.permissions.permissions_for_server(user_id, &row.id) {
                tool_permissions.insert(format!("{}:{tool}", row.id), enabled);
            }
        }

        let fingerprint = config_fingerprint(&servers, provider_id, model, &tool_permissions);
        if let Some(agent) = self.cache.get(user_id, &fingerprint) {
            tracing::debug!(user_id, "agent cache hit");
            return Ok((agent, true));
        }

        tracing::info!(
            user_id,
            provider = provider_id,
            model,
            servers = servers.len(),
            "building agent"
        );

        let factory = ToolFactory {
            user_id: user_id.to_string(),
            blocking: false,
            permissions: self.permissions.clone(),
            pending: self.pending.clone(),
            credential_store: self.servers.clone() as Arc<dyn CredentialStore>,
            tool_cache: self.tool_cache.clone(),
            mcp_config: self.config.mcp.clone(),
            approval_config: self.config.approvals.clone(),
        };
        let tools = factory.build(&servers).await?;

        let registry = Arc::new(ToolRegistry::new());
        registry.register(&tools);
        let search_tool = build_search_tool(registry.clone());
        registry.register(&[search_tool.clone()]);

        let mut bound: HashMap<String, Arc<AgentTool>> = tools
            .iter()
            .map(|t| (t.name().to_string(), t.clone()))
            .collect();
        bound.insert(search_tool.name().to_string(), search_tool);

        let agent = Arc::new(AgentGraph {
            llm: provider,
            model: Some(model.to_string()),
            tools: bound,
            registry,
            permissions: self.permissions.clone(),
            pending: self.pending.clone(),
            checkpoints: self.checkpoints.clone(),
        });

        self.cache.insert(user_id, agent.clone(), fingerprint);
        Ok((agent, false))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use tb_domain::stream::{BoxStream, StreamEvent};
    use tb_providers::{ChatRequest, LlmProvider};

    struct StubProvider(&'static str);

    #[async_trait::async_trait]
    impl LlmProvider for StubProvider {
        async fn chat_stream(
            &self,
            _req: ChatRequest,
        ) -> tb_domain::error::Result<BoxStream<'static, tb_domain::error::Result<StreamEvent>>>
        {
            Ok(Box::pin(futures_util::stream::empty()))
        }

        fn provider_id(&self) -> &str {
            self.0
        }

        fn default_model(&self) -> &str {
            "stub-1"
        }
    }

    fn manager(dir: &tempfile::TempDir) -> AgentManager {
        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(StubProvider("gemini")));

        AgentManager {
            providers: Arc::new(providers),
            cache: Arc::new(AgentCache::new()),
            servers: Arc::new(ServerStore::new(dir.path()).unwrap()),
            permissions: Arc::new(PermissionStore::new(dir.path(), 3600).unwrap()),
            pending: Arc::new(PendingApprovals::new()),
            checkpoints: Arc::new(CheckpointStore::new(dir.path()).unwrap()),
            tool_cache: Arc::new(ToolListCache::new()),
            config: Arc::new(Config::default()),
        }
    }

    #[tokio::test]
    async fn second_identical_request_is_a_cache_hit() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);

        let (first, hit1) = manager.get_or_create("u1", "gemini", "m1").await.unwrap();
        assert!(!hit1);
        let (second, hit2) = manager.get_or_create("u1", "gemini", "m1").await.unwrap();
        assert!(hit2);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn model_switch_forces_rebuild_then_caches() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);

        manager.get_or_create("u1", "gemini", "m1").await.unwrap();
        let (_, hit) = manager.get_or_create("u1", "gemini", "m2").await.unwrap();
        assert!(!hit, "model drift must force a rebuild");
        let (_, hit) = manager.get_or_create("u1", "gemini", "m2").await.unwrap();
        assert!(hit, "cache hit only on the second call with the new model");
    }

    #[tokio::test]
    async fn unknown_provider_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let err = manager
            .get_or_create("u1", "nope", "m1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn built_agent_always_carries_search_tools() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let (agent, _) = manager.get_or_create("u1", "gemini", "m1").await.unwrap();
        assert!(agent.tools.contains_key("search_tools"));
    }
}
