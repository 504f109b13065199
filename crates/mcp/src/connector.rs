//! MCP connector — owns one persistent session to one MCP server.
//!
//! Responsibilities:
//! - Transport negotiation (SSE first, streamable HTTP fallback) and the
//!   initialize handshake, cached behind a per-connector lock.
//! - OAuth token lifecycle: proactive refresh, adoption of credentials
//!   persisted by another session, re-auth escalation, and write-back
//!   through a fresh store handle.
//! - A layered retry policy distinguishing auth faults (force-refresh,
//!   retry once) from transient network faults (reset session, retry once).
//! - Tool listing with a process-wide manifest cache keyed by
//!   `(server_url, hash(token))` so token rotation invalidates it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use sha2::{Digest, Sha256};

use tb_domain::config::McpConfig;
use tb_domain::credentials::OAuthCredentials;
use tb_domain::error::{Error, Result};

use crate::protocol::{self, McpToolDef, ToolCallResult, ToolsListResult};
use crate::token::{is_token_expired, refresh_oauth_token};
use crate::transport::{McpTransport, SseTransport, StreamableHttpTransport, TransportError};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Credential persistence
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Persistence hooks for server credentials.
///
/// Implementations must use a fresh storage handle per call so a refresh
/// landing mid-request never entangles with the request's own storage
/// state. The load side also serves as the fallback when a refresh fails
/// but another session already persisted newer credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load_credentials(&self, server_id: &str) -> Result<Option<OAuthCredentials>>;
    async fn persist_credentials(
        &self,
        server_id: &str,
        credentials: &OAuthCredentials,
    ) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool-list cache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Process-wide cache of normalized tool manifests.
///
/// Keyed by `(server_url, sha256(token))` so a rotated token naturally
/// invalidates the entry.
#[derive(Default)]
pub struct ToolListCache {
    inner: RwLock<HashMap<String, Vec<McpToolDef>>>,
}

impl ToolListCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(server_url: &str, token: Option<&str>) -> String {
        let digest = Sha256::digest(token.unwrap_or_default().as_bytes());
        format!("{server_url}:{}", hex::encode(digest))
    }

    fn get(&self, key: &str) -> Option<Vec<McpToolDef>> {
        self.inner.read().get(key).cloned()
    }

    fn insert(&self, key: String, tools: Vec<McpToolDef>) {
        self.inner.write().insert(key, tools);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connector
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Construction parameters for [`McpConnector`].
pub struct ConnectorParams {
    pub server_url: String,
    pub server_name: String,
    /// Server config row ID, used for credential write-back.
    pub server_id: Option<String>,
    pub credentials: Option<OAuthCredentials>,
    pub store: Option<Arc<dyn CredentialStore>>,
    pub tool_cache: Arc<ToolListCache>,
    pub timeouts: McpConfig,
}

/// Mutable auth state, rebuilt together on every token change.
struct AuthState {
    credentials: Option<OAuthCredentials>,
    token: Option<String>,
    headers: HeaderMap,
}

/// A connection to one MCP server (one per configured server).
pub struct McpConnector {
    server_url: String,
    server_name: String,
    server_id: Option<String>,
    store: Option<Arc<dyn CredentialStore>>,
    tool_cache: Arc<ToolListCache>,
    timeouts: McpConfig,
    client: reqwest::Client,
    auth: RwLock<AuthState>,
    /// Serializes session creation; both transport probes cannot run
    /// concurrently.
    session: tokio::sync::Mutex<Option<Arc<dyn McpTransport>>>,
}

impl McpConnector {
    pub fn new(params: ConnectorParams) -> Self {
        let token = extract_token(&params.server_url, params.credentials.as_ref());
        let headers = build_headers(&params.server_url, token.as_deref());
        Self {
            server_url: params.server_url,
            server_name: params.server_name,
            server_id: params.server_id,
            store: params.store,
            tool_cache: params.tool_cache,
            timeouts: params.timeouts,
            client: reqwest::Client::new(),
            auth: RwLock::new(AuthState {
                credentials: params.credentials,
                token,
                headers,
            }),
            session: tokio::sync::Mutex::new(None),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    // ── Token lifecycle ─────────────────────────────────────────────

    /// Make sure the in-memory token is usable before a network op.
    ///
    /// 1. No credentials / no oauth_config ⇒ proceed as-is.
    /// 2. Expired (or `force`) ⇒ refresh; if refresh fails, adopt the
    ///    persisted credentials when another session already refreshed;
    ///    otherwise escalate with `RequiresAuthentication`.
    /// 3. On success, swap auth state and persist through a fresh handle.
    async fn ensure_valid_token(&self, force: bool) -> Result<()> {
        let (credentials, oauth_config) = {
            let auth = self.auth.read();
            let creds = auth.credentials.clone();
            let cfg = creds.as_ref().and_then(|c| c.oauth_config.clone());
            (creds, cfg)
        };

        let (Some(credentials), Some(oauth_config)) = (credentials, oauth_config) else {
            return Ok(());
        };

        if !force && !is_token_expired(&credentials) {
            return Ok(());
        }

        tracing::info!(
            server = %self.server_name,
            force,
            "token expired, attempting refresh"
        );

        let refreshed = refresh_oauth_token(
            &self.client,
            &self.server_name,
            &credentials,
            &oauth_config,
            Duration::from_secs(self.timeouts.refresh_timeout_secs),
        )
        .await;

        let new_credentials = match refreshed {
            Some(creds) => creds,
            None => {
                // Another session may have refreshed and persisted already.
                if let Some(adopted) = self.load_persisted_fallback().await {
                    self.adopt_credentials(adopted);
                    return Ok(());
                }
                tracing::error!(
                    server = %self.server_name,
                    "token refresh and persisted-credential fallback both failed"
                );
                return Err(Error::RequiresAuthentication(self.server_name.clone()));
            }
        };

        self.adopt_credentials(new_credentials.clone());
        self.persist_credentials(&new_credentials).await;
        Ok(())
    }

    /// Read back whatever the store holds; usable only when not expired.
    async fn load_persisted_fallback(&self) -> Option<OAuthCredentials> {
        let store = self.store.as_ref()?;
        let server_id = self.server_id.as_deref()?;
        match store.load_credentials(server_id).await {
            Ok(Some(creds)) if !is_token_expired(&creds) => {
                tracing::info!(
                    server = %self.server_name,
                    "adopting credentials persisted by another session"
                );
                Some(creds)
            }
            Ok(Some(_)) => {
                tracing::warn!(server = %self.server_name, "persisted credentials are also expired");
                None
            }
            Ok(None) => None,
            Err(e) => {
                tracing::error!(server = %self.server_name, error = %e, "persisted-credential lookup failed");
                None
            }
        }
    }

    fn adopt_credentials(&self, credentials: OAuthCredentials) {
        let token = credentials.access_token.clone();
        let headers = build_headers(&self.server_url, token.as_deref());
        let mut auth = self.auth.write();
        auth.credentials = Some(credentials);
        auth.token = token;
        auth.headers = headers;
    }

    async fn persist_credentials(&self, credentials: &OAuthCredentials) {
        let (Some(store), Some(server_id)) = (self.store.as_ref(), self.server_id.as_deref())
        else {
            return;
        };
        if let Err(e) = store.persist_credentials(server_id, credentials).await {
            tracing::error!(
                server = %self.server_name,
                error = %e,
                "failed to persist refreshed credentials"
            );
        }
    }

    // ── Session management ──────────────────────────────────────────

    /// Return the cached session, creating it if necessary.
    ///
    /// SSE is probed first; streamable HTTP is the fallback. The session
    /// lock serializes construction so the two probes never interleave.
    async fn get_session(&self) -> Result<Arc<dyn McpTransport>> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }

        tracing::info!(server = %self.server_name, "initializing persistent MCP session");
        let headers = self.auth.read().headers.clone();
        let init_timeout = Duration::from_secs(self.timeouts.session_init_timeout_secs);
        let request_timeout = Duration::from_secs(self.timeouts.tool_call_timeout_secs);

        let transport: Arc<dyn McpTransport> = match SseTransport::connect(
            self.client.clone(),
            &self.server_url,
            headers.clone(),
            init_timeout,
            request_timeout,
        )
        .await
        {
            Ok(sse) => Arc::new(sse),
            Err(e) => {
                tracing::warn!(
                    server = %self.server_name,
                    error = %e,
                    "SSE transport failed, trying streamable HTTP"
                );
                Arc::new(StreamableHttpTransport::new(
                    self.client.clone(),
                    self.server_url.clone(),
                    headers,
                    request_timeout,
                ))
            }
        };

        let init_params = serde_json::to_value(protocol::initialize_params())?;
        let resp = transport
            .send_request("initialize", Some(init_params))
            .await
            .map_err(mcp_error)?;
        if let Err(err) = resp.into_result() {
            transport.shutdown().await;
            return Err(Error::Http(format!("initialize failed: {err}")));
        }
        transport
            .send_notification("notifications/initialized")
            .await
            .map_err(mcp_error)?;

        *guard = Some(transport.clone());
        Ok(transport)
    }

    /// Tear down the persistent session so the next call reconnects.
    pub async fn close(&self) {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.take() {
            session.shutdown().await;
        }
    }

    // ── Tool listing ────────────────────────────────────────────────

    /// List the server's tools, consulting the process-wide manifest cache.
    ///
    /// The token is validated *before* the cache lookup so an expired
    /// session never serves stale entries.
    pub async fn list_tools(&self) -> Result<Vec<McpToolDef>> {
        self.ensure_valid_token(false).await?;

        let key = {
            let auth = self.auth.read();
            ToolListCache::key(&self.server_url, auth.token.as_deref())
        };
        if let Some(tools) = self.tool_cache.get(&key) {
            tracing::debug!(server = %self.server_name, "returning cached tool manifest");
            return Ok(tools);
        }

        let tools = self
            .execute_with_retry(|| Box::pin(self.list_tools_internal()))
            .await?;
        self.tool_cache.insert(key, tools.clone());
        Ok(tools)
    }

    async fn list_tools_internal(&self) -> Result<Vec<McpToolDef>> {
        let session = self.get_session().await?;
        let resp = session
            .send_request("tools/list", None)
            .await
            .map_err(mcp_error)?;
        let value = resp
            .into_result()
            .map_err(|e| Error::Http(format!("tools/list failed: {e}")))?;
        let result: ToolsListResult = serde_json::from_value(value)?;
        Ok(result
            .tools
            .into_iter()
            .map(McpToolDef::normalize)
            .collect())
    }

    // ── Tool invocation ─────────────────────────────────────────────

    /// Execute a tool. Unrecoverable failures come back as an error
    /// *string* so the agent can observe them and recover; auth
    /// escalations stay exceptional.
    pub async fn run_tool(&self, tool_name: &str, parameters: Value) -> Result<String> {
        let outcome = self
            .execute_with_retry(|| Box::pin(self.call_tool_internal(tool_name, parameters.clone())))
            .await;

        match outcome {
            Ok(text) => Ok(text),
            Err(Error::RequiresAuthentication(server)) => {
                Err(Error::RequiresAuthentication(server))
            }
            Err(e) => Ok(format!(
                "Error: Tool execution failed for {}. {e}",
                self.server_name
            )),
        }
    }

    async fn call_tool_internal(&self, tool_name: &str, parameters: Value) -> Result<String> {
        let session = self.get_session().await?;
        let params = serde_json::json!({
            "name": tool_name,
            "arguments": parameters,
        });

        let call = session.send_request("tools/call", Some(params));
        let timeout = Duration::from_secs(self.timeouts.tool_call_timeout_secs);
        let resp = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                // The session may be dead; drop it so the retry reconnects.
                tracing::warn!(tool = tool_name, error = %e, "tool call failed, clearing session");
                self.close().await;
                return Err(mcp_error(e));
            }
            Err(_) => {
                self.close().await;
                return Err(Error::Timeout(format!(
                    "tool {tool_name} timed out after {}s",
                    self.timeouts.tool_call_timeout_secs
                )));
            }
        };

        let value = resp
            .into_result()
            .map_err(|e| Error::Http(format!("tools/call failed: {e}")))?;
        let result: ToolCallResult = serde_json::from_value(value)?;
        let text = result.joined_text();
        if result.is_error {
            Ok(format!("Error: {text}"))
        } else {
            Ok(text)
        }
    }

    // ── Retry policy ────────────────────────────────────────────────

    /// Run `op` with exactly one retry per failure class.
    ///
    /// Auth failures force a token refresh and session reset before the
    /// retry; a second auth failure escalates to `RequiresAuthentication`.
    /// Transient failures reset the session and retry once. Everything
    /// else propagates untouched.
    async fn execute_with_retry<'a, T, F>(&'a self, op: F) -> Result<T>
    where
        F: Fn() -> BoxFuture<'a, Result<T>>,
    {
        self.ensure_valid_token(false).await?;

        match op().await {
            Ok(value) => Ok(value),
            Err(e) if is_auth_error(&e) => {
                tracing::warn!(
                    server = %self.server_name,
                    error = %e,
                    "authentication failed, forcing token refresh and retrying"
                );
                self.ensure_valid_token(true).await?;
                self.close().await;
                match op().await {
                    Ok(value) => Ok(value),
                    Err(retry_e) if is_auth_error(&retry_e) => {
                        tracing::error!(
                            server = %self.server_name,
                            error = %retry_e,
                            "still unauthorized after forced refresh"
                        );
                        Err(Error::RequiresAuthentication(self.server_name.clone()))
                    }
                    Err(retry_e) => Err(retry_e),
                }
            }
            Err(e) if is_transient_error(&e) => {
                tracing::warn!(
                    server = %self.server_name,
                    error = %e,
                    "transient error, clearing session and retrying"
                );
                self.close().await;
                op().await
            }
            Err(e) => Err(e),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Header shaping & token extraction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-host header shaping. Figma wants its own token header; Notion wants
/// a pinned API version next to the bearer token.
fn build_headers(server_url: &str, token: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let Some(token) = token else {
        return headers;
    };

    let insert = |headers: &mut HeaderMap, name: &str, value: String| {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    };

    if server_url.contains("figma.com") {
        insert(&mut headers, "X-Figma-Token", token.to_string());
    } else if server_url.contains("notion.com") {
        insert(&mut headers, "Authorization", format!("Bearer {token}"));
        insert(&mut headers, "Notion-Version", "2022-06-28".to_string());
    } else {
        insert(&mut headers, "Authorization", format!("Bearer {token}"));
    }
    headers
}

/// Token precedence: credentials blob first, then a legacy `token` query
/// parameter on the server URL.
fn extract_token(server_url: &str, credentials: Option<&OAuthCredentials>) -> Option<String> {
    if let Some(token) = credentials.and_then(|c| c.access_token.clone()) {
        return Some(token);
    }
    let query = server_url.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "token" && !value.is_empty()).then(|| value.to_string())
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn mcp_error(e: TransportError) -> Error {
    match e {
        TransportError::Timeout => Error::Timeout("MCP request timed out".into()),
        TransportError::Json(e) => Error::Json(e),
        other => Error::Http(other.to_string()),
    }
}

const TRANSIENT_PATTERNS: &[&str] = &[
    "connection reset",
    "refused",
    "closed",
    "timed out",
    "broken pipe",
    "eof",
    "temporarily unavailable",
    "network unreachable",
];

/// Walk the error and its `source()` chain, testing each rendered message.
fn error_chain_matches<F>(err: &(dyn std::error::Error + 'static), pred: F) -> bool
where
    F: Fn(&str) -> bool,
{
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if pred(&e.to_string().to_lowercase()) {
            return true;
        }
        current = e.source();
    }
    false
}

fn is_auth_error(err: &Error) -> bool {
    error_chain_matches(err, |msg| {
        msg.contains("401") || msg.contains("unauthorized") || msg.contains("authentication failed")
    })
}

fn is_transient_error(err: &Error) -> bool {
    if matches!(err, Error::Timeout(_) | Error::Io(_)) {
        return true;
    }
    error_chain_matches(err, |msg| {
        TRANSIENT_PATTERNS.iter().any(|p| msg.contains(p))
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
