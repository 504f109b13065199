//! MCP "Smart Auth" — OAuth discovery and the authorization-code flow.
//!
//! Discovery: POST a dummy JSON-RPC `initialize`; a protected server
//! answers `401` with a `WWW-Authenticate` header naming a resource
//! metadata URL. Fetch it, pull the OAuth endpoints, and fall back to the
//! `.well-known` documents (including the `authorization_servers`
//! indirection) when the header is missing.
//!
//! The flow itself is OAuth 2.1: PKCE S256 is always sent, the opaque
//! `state` is single-use with a 10-minute TTL, and the finalized
//! credentials embed the `oauth_config` so refreshes never re-discover.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};

use tb_domain::credentials::{OAuthConfig, OAuthCredentials, TokenResponse};
use tb_domain::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Discovery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// OAuth endpoints discovered from a server.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveredOAuth {
    pub authorization_url: Option<String>,
    pub token_url: Option<String>,
}

impl DiscoveredOAuth {
    fn is_complete(&self) -> bool {
        self.authorization_url.is_some() && self.token_url.is_some()
    }
}

/// Extract the `resource_metadata` URL from a `WWW-Authenticate` header:
/// `Bearer resource_metadata="https://…"`.
pub(crate) fn parse_resource_metadata(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let rest = part.split("resource_metadata=\"").nth(1)?;
        let url = rest.split('"').next()?;
        (!url.is_empty()).then(|| url.to_string())
    })
}

fn origin_of(server_url: &str) -> Option<String> {
    let parsed = url::Url::parse(server_url).ok()?;
    let host = parsed.host_str()?;
    let mut origin = format!("{}://{host}", parsed.scheme());
    if let Some(port) = parsed.port() {
        origin.push_str(&format!(":{port}"));
    }
    Some(origin)
}

fn endpoints_from_metadata(metadata: &serde_json::Value) -> DiscoveredOAuth {
    DiscoveredOAuth {
        authorization_url: metadata
            .get("authorization_endpoint")
            .and_then(|v| v.as_str())
            .map(String::from),
        token_url: metadata
            .get("token_endpoint")
            .and_then(|v| v.as_str())
            .map(String::from),
    }
}

/// Probe a server for its OAuth configuration.
///
/// Returns `None` when the server is unprotected or exposes no usable
/// metadata; the caller then requires manual endpoint entry.
pub async fn discover_oauth_config(
    client: &reqwest::Client,
    server_url: &str,
) -> Option<DiscoveredOAuth> {
    tracing::info!(server_url, "discovering OAuth configuration");

    let dummy = serde_json::json!({
        "jsonrpc": "2.0",
        "method": "initialize",
        "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": { "name": "discovery", "version": "1.0" }
        },
        "id": 1
    });

    let mut metadata_urls: Vec<String> = Vec::new();

    match client
        .post(server_url)
        .json(&dummy)
        .timeout(Duration::from_secs(10))
        .send()
        .await
    {
        Ok(resp) if resp.status() == reqwest::StatusCode::UNAUTHORIZED => {
            if let Some(header) = resp
                .headers()
                .get("www-authenticate")
                .and_then(|v| v.to_str().ok())
            {
                if let Some(url) = parse_resource_metadata(header) {
                    metadata_urls.push(url);
                }
            }
        }
        Ok(resp) => {
            tracing::debug!(status = resp.status().as_u16(), "no auth challenge from server");
        }
        Err(e) => {
            tracing::debug!(error = %e, "discovery probe failed");
        }
    }

    // Fallback: the well-known documents at the server origin.
    if metadata_urls.is_empty() {
        let origin = origin_of(server_url)?;
        let path = url::Url::parse(server_url)
            .ok()
            .map(|u| u.path().trim_end_matches('/').to_string())
            .unwrap_or_default();
        metadata_urls.push(format!("{origin}/.well-known/oauth-authorization-server"));
        if !path.is_empty() {
            metadata_urls.push(format!(
                "{origin}{path}/.well-known/oauth-authorization-server"
            ));
        }
        metadata_urls.push(format!("{origin}/.well-known/openid-configuration"));
    }

    for metadata_url in metadata_urls {
        tracing::debug!(metadata_url = %metadata_url, "fetching OAuth metadata");
        let Ok(resp) = client
            .get(&metadata_url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        else {
            continue;
        };
        if resp.status() != reqwest::StatusCode::OK {
            continue;
        }
        let Ok(metadata) = resp.json::<serde_json::Value>().await else {
            continue;
        };

        let mut discovered = endpoints_from_metadata(&metadata);
        if discovered.is_complete() {
            return Some(discovered);
        }

        // RFC 8414 indirection: the resource names its authorization servers.
        if let Some(servers) = metadata
            .get("authorization_servers")
            .and_then(|v| v.as_array())
        {
            for server in servers.iter().filter_map(|v| v.as_str()) {
                let well_known =
                    format!("{}/.well-known/openid-configuration", server.trim_end_matches('/'));
                let Ok(resp) = client
                    .get(&well_known)
                    .timeout(Duration::from_secs(10))
                    .send()
                    .await
                else {
                    continue;
                };
                if resp.status() != reqwest::StatusCode::OK {
                    continue;
                }
                if let Ok(indirect) = resp.json::<serde_json::Value>().await {
                    let found = endpoints_from_metadata(&indirect);
                    if discovered.authorization_url.is_none() {
                        discovered.authorization_url = found.authorization_url;
                    }
                    if discovered.token_url.is_none() {
                        discovered.token_url = found.token_url;
                    }
                }
                if discovered.is_complete() {
                    break;
                }
            }
        }

        if discovered.authorization_url.is_some() {
            return Some(discovered);
        }
    }

    tracing::warn!(server_url, "OAuth discovery found no endpoints");
    None
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Flow state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything captured at flow init, replayed at finalize.
#[derive(Debug, Clone)]
pub struct OAuthState {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    pub authorization_url: String,
    pub token_url: Option<String>,
    pub server_url: String,
    pub server_name: String,
    pub scope: String,
    pub code_verifier: String,
    /// Server config row being re-authenticated, if any.
    pub setting_id: Option<String>,
}

/// Ephemeral store for in-flight OAuth states. Single-use: `take` removes
/// the entry, so a replayed `state` fails cleanly.
pub struct OAuthStateStore {
    ttl: chrono::Duration,
    inner: RwLock<HashMap<String, (OAuthState, DateTime<Utc>)>>,
}

impl OAuthStateStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl: chrono::Duration::seconds(ttl_secs as i64),
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, key: String, state: OAuthState) {
        let mut inner = self.inner.write();
        let now = Utc::now();
        // Opportunistic sweep of abandoned flows.
        inner.retain(|_, (_, created)| now - *created < self.ttl);
        inner.insert(key, (state, now));
    }

    /// Read-and-delete. Expired or unknown keys return `None`.
    pub fn take(&self, key: &str) -> Option<OAuthState> {
        let (state, created) = self.inner.write().remove(key)?;
        if Utc::now() - created >= self.ttl {
            return None;
        }
        Some(state)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Init flow
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Inputs to start an authorization-code flow.
#[derive(Debug, Clone, Default)]
pub struct InitFlowRequest {
    pub server_name: String,
    pub server_url: String,
    pub redirect_uri: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub scope: Option<String>,
    /// Manual overrides win over discovery.
    pub authorization_url: Option<String>,
    pub token_url: Option<String>,
    pub setting_id: Option<String>,
}

fn pkce_pair() -> (String, String) {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let verifier = engine.encode(bytes);
    let challenge = engine.encode(Sha256::digest(verifier.as_bytes()));
    (verifier, challenge)
}

/// Start the flow: discover endpoints, mint PKCE + state, store the state
/// record, and return the authorization URL to redirect the user to.
pub async fn init_flow(
    client: &reqwest::Client,
    states: &OAuthStateStore,
    req: InitFlowRequest,
) -> Result<String> {
    if req.server_url.is_empty() {
        return Err(Error::Config("server URL is required".into()));
    }
    if req.client_id.is_empty() {
        return Err(Error::Config(
            "client ID missing; register the app with the provider first".into(),
        ));
    }

    // Manual override > discovered.
    let discovered = if req.authorization_url.is_some() && req.token_url.is_some() {
        DiscoveredOAuth::default()
    } else {
        discover_oauth_config(client, &req.server_url)
            .await
            .unwrap_or_default()
    };
    let authorization_url = req
        .authorization_url
        .clone()
        .or(discovered.authorization_url)
        .ok_or_else(|| {
            Error::Config(
                "could not determine the authorization URL; provide it manually".into(),
            )
        })?;
    let token_url = req.token_url.clone().or(discovered.token_url);

    let (code_verifier, code_challenge) = pkce_pair();
    let state_key = uuid::Uuid::new_v4().to_string();
    let scope = req.scope.clone().unwrap_or_default();

    states.insert(
        state_key.clone(),
        OAuthState {
            client_id: req.client_id.clone(),
            client_secret: req.client_secret.clone(),
            redirect_uri: req.redirect_uri.clone(),
            authorization_url: authorization_url.clone(),
            token_url,
            server_url: req.server_url.clone(),
            server_name: req.server_name.clone(),
            scope: scope.clone(),
            code_verifier,
            setting_id: req.setting_id.clone(),
        },
    );

    let mut auth_url = url::Url::parse(&authorization_url)
        .map_err(|e| Error::Config(format!("invalid authorization URL: {e}")))?;
    {
        let mut query = auth_url.query_pairs_mut();
        query
            .append_pair("client_id", &req.client_id)
            .append_pair("redirect_uri", &req.redirect_uri)
            .append_pair("state", &state_key)
            .append_pair("response_type", "code")
            .append_pair("code_challenge", &code_challenge)
            .append_pair("code_challenge_method", "S256");
        if !scope.is_empty() {
            query.append_pair("scope", &scope);
        }
        // Notion insists on knowing the authorizing principal.
        if req.server_url.to_lowercase().contains("notion")
            || req.server_name.to_lowercase().contains("notion")
        {
            query.append_pair("owner", "user");
        }
    }

    Ok(auth_url.to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Finalize flow
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outcome of a completed code exchange, ready to persist.
#[derive(Debug, Clone)]
pub struct FinalizedAuth {
    pub server_name: String,
    pub server_url: String,
    pub setting_id: Option<String>,
    pub credentials: OAuthCredentials,
}

/// Exchange the authorization code and assemble the credentials blob.
///
/// The caller must have obtained `state` via [`OAuthStateStore::take`] —
/// states are single-use by construction.
pub async fn finalize_flow(
    client: &reqwest::Client,
    state: OAuthState,
    code: &str,
) -> Result<FinalizedAuth> {
    let token_url = state
        .token_url
        .as_deref()
        .ok_or_else(|| Error::Config("no token URL captured at flow init".into()))?;

    let mut form: Vec<(&str, &str)> = vec![
        ("redirect_uri", state.redirect_uri.as_str()),
        ("code", code),
        ("grant_type", "authorization_code"),
        ("code_verifier", state.code_verifier.as_str()),
    ];

    let mut request = client
        .post(token_url)
        .header("Accept", "application/json")
        .timeout(Duration::from_secs(30));

    match state.client_secret.as_deref() {
        Some(secret) => {
            request = request.basic_auth(&state.client_id, Some(secret));
        }
        None => {
            // Public clients carry the id in the body.
            form.push(("client_id", state.client_id.as_str()));
        }
    }

    let response = request
        .form(&form)
        .send()
        .await
        .map_err(|e| Error::Auth(format!("token exchange request failed: {e}")))?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Auth(format!(
            "token exchange failed (HTTP {}): {body}",
            status.as_u16()
        )));
    }

    let token: TokenResponse = response
        .json()
        .await
        .map_err(|e| Error::Auth(format!("token exchange response invalid: {e}")))?;

    let expires_in = token.expires_in.unwrap_or(3600);
    let expires_at = Utc::now().timestamp() + expires_in as i64;

    let credentials = OAuthCredentials {
        access_token: Some(token.access_token),
        refresh_token: token.refresh_token,
        expires_at: Some(expires_at),
        token_type: token.token_type.or(Some("Bearer".into())),
        oauth_config: Some(OAuthConfig {
            client_id: state.client_id.clone(),
            client_secret: state.client_secret.clone(),
            authorization_url: Some(state.authorization_url.clone()),
            token_url: state.token_url.clone(),
            scope: (!state.scope.is_empty()).then(|| state.scope.clone()),
        }),
    };

    tracing::info!(
        server = %state.server_name,
        expires_at,
        "OAuth flow finalized"
    );

    Ok(FinalizedAuth {
        server_name: state.server_name,
        server_url: state.server_url,
        setting_id: state.setting_id,
        credentials,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server inspection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Diagnostic report for the settings UI's "inspect server" action.
#[derive(Debug, Clone, Serialize)]
pub struct InspectionReport {
    pub server_url: String,
    pub probe_status: Option<u16>,
    pub www_authenticate: Option<String>,
    pub resource_metadata_url: Option<String>,
    pub well_known_hits: Vec<String>,
    pub discovered: Option<DiscoveredOAuth>,
}

/// Probe a server for MCP authentication metadata without starting a flow.
pub async fn inspect_server(client: &reqwest::Client, server_url: &str) -> InspectionReport {
    let mut report = InspectionReport {
        server_url: server_url.to_string(),
        probe_status: None,
        www_authenticate: None,
        resource_metadata_url: None,
        well_known_hits: Vec::new(),
        discovered: None,
    };

    let dummy = serde_json::json!({
        "jsonrpc": "2.0",
        "method": "initialize",
        "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": { "name": "inspector", "version": "1.0" }
        },
        "id": 1
    });

    if let Ok(resp) = client
        .post(server_url)
        .json(&dummy)
        .timeout(Duration::from_secs(10))
        .send()
        .await
    {
        report.probe_status = Some(resp.status().as_u16());
        report.www_authenticate = resp
            .headers()
            .get("www-authenticate")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        report.resource_metadata_url = report
            .www_authenticate
            .as_deref()
            .and_then(parse_resource_metadata);
    }

    if let Some(origin) = origin_of(server_url) {
        for path in [
            "/.well-known/oauth-authorization-server",
            "/.well-known/openid-configuration",
        ] {
            let probe_url = format!("{origin}{path}");
            if let Ok(resp) = client
                .get(&probe_url)
                .timeout(Duration::from_secs(10))
                .send()
                .await
            {
                if resp.status() == reqwest::StatusCode::OK {
                    report.well_known_hits.push(probe_url);
                }
            }
        }
    }

    report.discovered = discover_oauth_config(client, server_url).await;
    report
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_www_authenticate_header() {
        let header = r#"Bearer resource_metadata="https://mcp.example.com/.well-known/oauth-protected-resource", error="unauthorized""#;
        assert_eq!(
            parse_resource_metadata(header).as_deref(),
            Some("https://mcp.example.com/.well-known/oauth-protected-resource")
        );
    }

    #[test]
    fn parse_header_without_metadata() {
        assert!(parse_resource_metadata("Bearer realm=\"mcp\"").is_none());
    }

    #[test]
    fn origin_extraction() {
        assert_eq!(
            origin_of("https://mcp.example.com/sse/path?x=1").as_deref(),
            Some("https://mcp.example.com")
        );
        assert_eq!(
            origin_of("http://localhost:8080/mcp").as_deref(),
            Some("http://localhost:8080")
        );
    }

    #[test]
    fn pkce_challenge_is_s256_of_verifier() {
        let (verifier, challenge) = pkce_pair();
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let expected = engine.encode(Sha256::digest(verifier.as_bytes()));
        assert_eq!(challenge, expected);
        assert!(!verifier.contains('='));
    }

    #[test]
    fn state_store_is_single_use() {
        let store = OAuthStateStore::new(600);
        let state = OAuthState {
            client_id: "cid".into(),
            client_secret: None,
            redirect_uri: "http://localhost/cb".into(),
            authorization_url: "https://auth.example.com/authorize".into(),
            token_url: Some("https://auth.example.com/token".into()),
            server_url: "https://mcp.example.com".into(),
            server_name: "Example".into(),
            scope: String::new(),
            code_verifier: "v".into(),
            setting_id: None,
        };
        store.insert("abc".into(), state);

        assert!(store.take("abc").is_some());
        // Replay fails.
        assert!(store.take("abc").is_none());
    }

    #[test]
    fn state_store_expires() {
        let store = OAuthStateStore::new(0);
        let state = OAuthState {
            client_id: "cid".into(),
            client_secret: None,
            redirect_uri: String::new(),
            authorization_url: String::new(),
            token_url: None,
            server_url: String::new(),
            server_name: String::new(),
            scope: String::new(),
            code_verifier: String::new(),
            setting_id: None,
        };
        store.insert("gone".into(), state);
        assert!(store.take("gone").is_none());
    }

    #[tokio::test]
    async fn init_flow_requires_client_id() {
        let client = reqwest::Client::new();
        let states = OAuthStateStore::new(600);
        let err = init_flow(
            &client,
            &states,
            InitFlowRequest {
                server_name: "X".into(),
                server_url: "https://mcp.example.com".into(),
                redirect_uri: "http://localhost/cb".into(),
                authorization_url: Some("https://auth.example.com/authorize".into()),
                token_url: Some("https://auth.example.com/token".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn init_flow_builds_authorization_url() {
        let client = reqwest::Client::new();
        let states = OAuthStateStore::new(600);
        let url = init_flow(
            &client,
            &states,
            InitFlowRequest {
                server_name: "Example".into(),
                server_url: "https://mcp.example.com".into(),
                redirect_uri: "http://localhost/cb".into(),
                client_id: "cid".into(),
                scope: Some("read write".into()),
                authorization_url: Some("https://auth.example.com/authorize".into()),
                token_url: Some("https://auth.example.com/token".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(url.starts_with("https://auth.example.com/authorize?"));
        assert!(url.contains("client_id=cid"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("scope=read+write"));
    }

    #[tokio::test]
    async fn init_flow_notion_gets_owner_param() {
        let client = reqwest::Client::new();
        let states = OAuthStateStore::new(600);
        let url = init_flow(
            &client,
            &states,
            InitFlowRequest {
                server_name: "Notion".into(),
                server_url: "https://mcp.notion.com/mcp".into(),
                redirect_uri: "http://localhost/cb".into(),
                client_id: "cid".into(),
                authorization_url: Some("https://api.notion.com/v1/oauth/authorize".into()),
                token_url: Some("https://api.notion.com/v1/oauth/token".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(url.contains("owner=user"));
    }
}
