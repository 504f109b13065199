//! Gateway configuration, loaded from a TOML file with env overrides.

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub approvals: ApprovalConfig,
    #[serde(default)]
    pub oauth: OAuthFlowConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    /// Env var holding the API bearer token. Unset / empty = dev mode.
    #[serde(default = "d_token_env")]
    pub api_token_env: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_port(),
            host: d_host(),
            api_token_env: d_token_env(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding all JSON state files.
    #[serde(default = "d_state_path")]
    pub state_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_path: d_state_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    /// Per-call ceiling for `tools/call`.
    #[serde(default = "d_60")]
    pub tool_call_timeout_secs: u64,
    /// Ceiling for a refresh-grant exchange.
    #[serde(default = "d_30")]
    pub refresh_timeout_secs: u64,
    /// Ceiling for session initialization (per transport attempt).
    #[serde(default = "d_10")]
    pub session_init_timeout_secs: u64,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            tool_call_timeout_secs: 60,
            refresh_timeout_secs: 30,
            session_init_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// TTL for a persisted `once` approval.
    #[serde(default = "d_3600")]
    pub once_ttl_secs: u64,
    /// Maximum age of a pending approval accepted on resume.
    #[serde(default = "d_3600")]
    pub pending_max_age_secs: u64,
    /// How long a blocking tool wrapper waits for a decision.
    #[serde(default = "d_60")]
    pub blocking_wait_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            once_ttl_secs: 3600,
            pending_max_age_secs: 3600,
            blocking_wait_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthFlowConfig {
    /// TTL for the opaque state minted at flow init.
    #[serde(default = "d_600")]
    pub state_ttl_secs: u64,
}

impl Default for OAuthFlowConfig {
    fn default() -> Self {
        Self { state_ttl_secs: 600 }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_port() -> u16 {
    3210
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_token_env() -> String {
    "TB_API_TOKEN".into()
}
/// Default state directory: `~/.toolbridge/data`, falling back to a
/// relative path when no home directory can be resolved (containers).
fn d_state_path() -> String {
    dirs::home_dir()
        .map(|home| home.join(".toolbridge").join("data").display().to_string())
        .unwrap_or_else(|| "./data".into())
}
fn d_10() -> u64 {
    10
}
fn d_30() -> u64 {
    30
}
fn d_60() -> u64 {
    60
}
fn d_600() -> u64 {
    600
}
fn d_3600() -> u64 {
    3600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_has_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.server.port, 3210);
        assert_eq!(cfg.mcp.tool_call_timeout_secs, 60);
        assert_eq!(cfg.mcp.refresh_timeout_secs, 30);
        assert_eq!(cfg.approvals.once_ttl_secs, 3600);
        assert_eq!(cfg.oauth.state_ttl_secs, 600);
    }

    #[test]
    fn partial_override() {
        let cfg: Config =
            serde_json::from_str(r#"{ "server": { "port": 9999 } }"#).unwrap();
        assert_eq!(cfg.server.port, 9999);
        assert_eq!(cfg.server.host, "127.0.0.1");
    }

    #[test]
    fn default_state_path_is_resolved() {
        // Home-anchored when a home directory exists, "./data" otherwise;
        // either way the leaf is the data directory.
        let cfg = StorageConfig::default();
        assert!(!cfg.state_path.is_empty());
        assert!(cfg.state_path.ends_with("data"));
    }
}
