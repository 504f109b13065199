//! MCP transport layer.
//!
//! Remote MCP servers speak JSON-RPC over one of two transports:
//! - **SSE**: open an event stream, receive an `endpoint` event naming a
//!   message channel, then POST requests to that channel; responses arrive
//!   back on the event stream.
//! - **Streamable HTTP**: a single POST per message; the response body is
//!   either plain JSON or a short event stream.
//!
//! The connector tries SSE first and falls back to streamable HTTP.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Trait for MCP server transports.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a JSON-RPC request and wait for the corresponding response.
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError>;

    /// Send a JSON-RPC notification (no response expected).
    async fn send_notification(&self, method: &str) -> Result<(), TransportError>;

    /// Check if the transport is still alive.
    fn is_alive(&self) -> bool;

    /// Shut down the transport.
    async fn shutdown(&self);
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Non-success HTTP status. The status code stays in the message so
    /// the retry layer can recognize auth failures ("401").
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timed out waiting for response")]
    Timeout,

    #[error("transport closed: {0}")]
    Closed(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Convert a [`reqwest::Error`] into a [`TransportError`].
pub(crate) fn from_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Connect(format!("connection refused or unreachable: {e}"))
    } else {
        TransportError::Connect(e.to_string())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE framing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One parsed SSE event block.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SseFrame {
    /// The `event:` name; `"message"` when absent.
    pub event: String,
    /// Concatenated `data:` payload lines.
    pub data: String,
}

/// Extract complete SSE frames from a buffer.
///
/// Frames are delimited by `\n\n`. The buffer is drained in place;
/// a trailing partial frame stays for the next call.
pub(crate) fn drain_frames(buffer: &mut String) -> Vec<SseFrame> {
    let mut frames = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);

        let mut event = String::from("message");
        let mut data_lines: Vec<String> = Vec::new();
        for line in block.lines() {
            let line = line.trim_end();
            if let Some(name) = line.strip_prefix("event:") {
                event = name.trim().to_string();
            } else if let Some(data) = line.strip_prefix("data:") {
                data_lines.push(data.trim().to_string());
            }
        }

        let data = data_lines.join("\n");
        if !data.is_empty() || event != "message" {
            frames.push(SseFrame { event, data });
        }
    }

    frames
}

/// Resolve the message-channel endpoint announced by the server against
/// the SSE URL's origin. Endpoints may be absolute or server-relative.
pub(crate) fn resolve_endpoint(server_url: &str, endpoint: &str) -> Result<String, TransportError> {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return Ok(endpoint.to_string());
    }

    let scheme_end = server_url
        .find("://")
        .ok_or_else(|| TransportError::Protocol(format!("invalid server URL: {server_url}")))?;
    let host_start = scheme_end + 3;
    let origin_end = server_url[host_start..]
        .find('/')
        .map(|i| host_start + i)
        .unwrap_or(server_url.len());
    let origin = &server_url[..origin_end];

    if endpoint.starts_with('/') {
        Ok(format!("{origin}{endpoint}"))
    } else {
        Ok(format!("{origin}/{endpoint}"))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// SSE transport: requests go to the announced message channel, responses
/// come back on the long-lived event stream.
pub struct SseTransport {
    client: reqwest::Client,
    endpoint: String,
    headers: HeaderMap,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
    request_timeout: Duration,
}

impl SseTransport {
    /// Open the event stream, wait for the `endpoint` event, and spawn the
    /// background reader that routes responses to waiting callers.
    pub async fn connect(
        client: reqwest::Client,
        server_url: &str,
        headers: HeaderMap,
        init_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let resp = client
            .get(server_url)
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
                message: format!("SSE connect to {server_url} rejected"),
            });
        }

        let mut resp = resp;
        let mut buffer = String::new();
        let mut early_responses: Vec<JsonRpcResponse> = Vec::new();

        // The server announces the message channel before anything else.
        let endpoint_data = tokio::time::timeout(init_timeout, async {
            loop {
                match resp.chunk().await {
                    Ok(Some(bytes)) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        for frame in drain_frames(&mut buffer) {
                            if frame.event == "endpoint" {
                                return Ok(frame.data);
                            }
                            if let Ok(r) = serde_json::from_str::<JsonRpcResponse>(&frame.data) {
                                early_responses.push(r);
                            }
                        }
                    }
                    Ok(None) => {
                        return Err(TransportError::Closed(
                            "SSE stream ended before endpoint event".into(),
                        ))
                    }
                    Err(e) => return Err(from_reqwest(e)),
                }
            }
        })
        .await
        .map_err(|_| TransportError::Timeout)??;

        let endpoint = resolve_endpoint(server_url, &endpoint_data)?;
        tracing::debug!(server_url, endpoint = %endpoint, "SSE message channel established");

        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let reader = {
            let pending = pending.clone();
            let alive = alive.clone();
            tokio::spawn(async move {
                for r in early_responses {
                    route_response(&pending, r);
                }
                loop {
                    match resp.chunk().await {
                        Ok(Some(bytes)) => {
                            buffer.push_str(&String::from_utf8_lossy(&bytes));
                            for frame in drain_frames(&mut buffer) {
                                if frame.event == "endpoint" {
                                    continue;
                                }
                                match serde_json::from_str::<JsonRpcResponse>(&frame.data) {
                                    Ok(r) => route_response(&pending, r),
                                    // Server-initiated notifications have no id; skip.
                                    Err(_) => {
                                        tracing::debug!(data = %frame.data, "skipping non-response SSE frame");
                                    }
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::debug!(error = %e, "SSE stream read failed");
                            break;
                        }
                    }
                }
                alive.store(false, Ordering::SeqCst);
                // Dropping the senders wakes every waiting caller.
                pending.lock().clear();
            })
        };

        Ok(Self {
            client,
            endpoint,
            headers,
            pending,
            next_id: AtomicU64::new(1),
            alive,
            reader: Mutex::new(Some(reader)),
            request_timeout,
        })
    }
}

fn route_response(
    pending: &Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
    resp: JsonRpcResponse,
) {
    if let Some(tx) = pending.lock().remove(&resp.id) {
        let _ = tx.send(resp);
    } else {
        tracing::debug!(id = resp.id, "received response with no waiting caller");
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("SSE stream is gone".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        tracing::debug!(id, method, "sending MCP request over SSE channel");
        let resp = self
            .client
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .json(&req)
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                self.pending.lock().remove(&id);
                return Err(from_reqwest(e));
            }
        };
        let status = resp.status();
        if !status.is_success() {
            self.pending.lock().remove(&id);
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                message: body,
            });
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::Closed(
                "SSE stream closed while waiting for response".into(),
            )),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(TransportError::Timeout)
            }
        }
    }

    async fn send_notification(&self, method: &str) -> Result<(), TransportError> {
        let notif = JsonRpcNotification::new(method);
        let resp = self
            .client
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .json(&notif)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
                message: format!("notification {method} rejected"),
            });
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        self.pending.lock().clear();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streamable HTTP transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Streamable-HTTP transport: each request is a single POST; the server
/// answers with JSON or a short event stream carrying the response.
pub struct StreamableHttpTransport {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
    /// `Mcp-Session-Id` issued on initialize, echoed on later calls.
    session_id: Mutex<Option<String>>,
    next_id: AtomicU64,
    alive: AtomicBool,
    request_timeout: Duration,
}

impl StreamableHttpTransport {
    pub fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        headers: HeaderMap,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            headers,
            session_id: Mutex::new(None),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
            request_timeout,
        }
    }

    fn request_builder(&self) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .header(CONTENT_TYPE, "application/json");
        if let Some(sid) = self.session_id.lock().as_deref() {
            builder = builder.header("Mcp-Session-Id", sid.to_string());
        }
        builder
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("transport was shut down".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);

        tracing::debug!(id, method, url = %self.url, "sending MCP request over streamable HTTP");
        let fut = async {
            let resp = self
                .request_builder()
                .json(&req)
                .send()
                .await
                .map_err(from_reqwest)?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(TransportError::Http {
                    status: status.as_u16(),
                    message: body,
                });
            }

            if let Some(sid) = resp
                .headers()
                .get("mcp-session-id")
                .and_then(|v| v.to_str().ok())
            {
                *self.session_id.lock() = Some(sid.to_string());
            }

            let is_event_stream = resp
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|ct| ct.contains("text/event-stream"))
                .unwrap_or(false);

            if !is_event_stream {
                let body = resp.text().await.map_err(from_reqwest)?;
                return serde_json::from_str::<JsonRpcResponse>(&body).map_err(Into::into);
            }

            // Drain the short event stream until our response shows up.
            let mut resp = resp;
            let mut buffer = String::new();
            loop {
                match resp.chunk().await {
                    Ok(Some(bytes)) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        for frame in drain_frames(&mut buffer) {
                            if let Ok(r) = serde_json::from_str::<JsonRpcResponse>(&frame.data) {
                                if r.id == id {
                                    return Ok(r);
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        return Err(TransportError::Closed(
                            "response stream ended without a matching response".into(),
                        ))
                    }
                    Err(e) => return Err(from_reqwest(e)),
                }
            }
        };

        tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    async fn send_notification(&self, method: &str) -> Result<(), TransportError> {
        let notif = JsonRpcNotification::new(method);
        let resp = self
            .request_builder()
            .json(&notif)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        // 202 Accepted is the expected answer; any success is fine.
        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
                message: format!("notification {method} rejected"),
            });
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        *self.session_id.lock() = None;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
