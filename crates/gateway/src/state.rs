//! Shared application state passed to all API handlers.

use std::sync::Arc;

use tb_domain::config::Config;
use tb_mcp::auth::OAuthStateStore;
use tb_mcp::connector::ToolListCache;
use tb_providers::ProviderRegistry;
use tb_store::{CheckpointStore, ConversationStore, PermissionStore, ServerStore, UserStore};

use crate::runtime::{AgentCache, AgentManager, PendingApprovals};

/// Everything a request handler can reach.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,

    // ── Stores ────────────────────────────────────────────────────────
    pub users: Arc<UserStore>,
    pub servers: Arc<ServerStore>,
    pub permissions: Arc<PermissionStore>,
    pub conversations: Arc<ConversationStore>,
    pub checkpoints: Arc<CheckpointStore>,

    // ── Runtime ───────────────────────────────────────────────────────
    pub providers: Arc<ProviderRegistry>,
    pub agents: Arc<AgentManager>,
    pub pending: Arc<PendingApprovals>,
    pub tool_cache: Arc<ToolListCache>,
    pub oauth_states: Arc<OAuthStateStore>,
    /// Shared HTTP client for OAuth discovery and exchanges.
    pub http: reqwest::Client,

    // ── Security (startup-computed) ───────────────────────────────────
    /// SHA-256 hash of the API bearer token. `None` = dev mode.
    pub api_token_hash: Option<Vec<u8>>,
}

impl AppState {
    /// Construct the full state tree from config. Stores load their JSON
    /// files eagerly so startup fails fast on corrupt state.
    pub fn build(config: Config, providers: ProviderRegistry) -> tb_domain::Result<Self> {
        let config = Arc::new(config);
        let state_path = std::path::Path::new(&config.storage.state_path);

        let users = Arc::new(UserStore::new(state_path)?);
        let servers = Arc::new(ServerStore::new(state_path)?);
        let permissions = Arc::new(PermissionStore::new(
            state_path,
            config.approvals.once_ttl_secs,
        )?);
        let conversations = Arc::new(ConversationStore::new(state_path)?);
        let checkpoints = Arc::new(CheckpointStore::new(state_path)?);

        let providers = Arc::new(providers);
        let pending = Arc::new(PendingApprovals::new());
        let tool_cache = Arc::new(ToolListCache::new());
        let oauth_states = Arc::new(OAuthStateStore::new(config.oauth.state_ttl_secs));

        let agents = Arc::new(AgentManager {
            providers: providers.clone(),
            cache: Arc::new(AgentCache::new()),
            servers: servers.clone(),
            permissions: permissions.clone(),
            pending: pending.clone(),
            checkpoints: checkpoints.clone(),
            tool_cache: tool_cache.clone(),
            config: config.clone(),
        });

        let api_token_hash = read_token_hash(&config.server.api_token_env);

        Ok(Self {
            config,
            users,
            servers,
            permissions,
            conversations,
            checkpoints,
            providers,
            agents,
            pending,
            tool_cache,
            oauth_states,
            http: reqwest::Client::new(),
            api_token_hash,
        })
    }
}

/// Read the API token env var once at startup and keep only its digest.
fn read_token_hash(env_name: &str) -> Option<Vec<u8>> {
    use sha2::{Digest, Sha256};
    match std::env::var(env_name) {
        Ok(token) if !token.trim().is_empty() => {
            Some(Sha256::digest(token.trim().as_bytes()).to_vec())
        }
        _ => {
            tracing::warn!(
                env = env_name,
                "no API token configured — running without authentication (dev mode)"
            );
            None
        }
    }
}
