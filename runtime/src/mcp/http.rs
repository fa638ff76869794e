//! Remote transports
//!
//! Both flavours speak JSON-RPC over HTTP POST and differ only in where
//! responses come back:
//!
//! - **Streamable HTTP**: the POST response carries the reply, either as
//!   `application/json` or as a short `text/event-stream`.
//! - **SSE (legacy)**: a long-lived GET stream announces a POST endpoint via
//!   an `endpoint` event; replies arrive on the stream and are matched to
//!   requests by id.
//!
//! Non-2xx statuses surface as [`McpClientError::Http`] so the orchestrator
//! can tell an authorization failure from anything else.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use eventsource_stream::EventStreamError;
use futures_util::StreamExt;
use mcp_common::McpClientError;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use url::Url;

use super::connection::McpConnection;
use super::sse::{self, SseFrame};
use super::types::ToolPage;
use crate::config::expand_env;
use crate::definition::{CommandSpec, ServerDefinition};
use crate::oauth::AuthSession;

pub const SESSION_HEADER: &str = "mcp-session-id";

/// Connect plus `initialize`
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound for non-tool requests
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

fn protocol_version() -> Value {
    serde_json::to_value(rmcp::model::ProtocolVersion::LATEST)
        .unwrap_or_else(|_| Value::String("2025-03-26".to_string()))
}

fn client_info() -> Value {
    json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    })
}

/// Where to send requests and which headers to present
struct HttpTarget {
    server: String,
    url: Url,
    headers: HeaderMap,
    session: Option<Arc<dyn AuthSession>>,
}

impl HttpTarget {
    fn new(definition: &ServerDefinition, session: Option<Arc<dyn AuthSession>>) -> Result<Self> {
        let CommandSpec::Http(http) = &definition.command else {
            anyhow::bail!("server '{}' is not an HTTP server", definition.name);
        };
        let url = Url::parse(&expand_env(&http.url))
            .with_context(|| format!("Invalid URL for server '{}'", definition.name))?;
        let mut headers = HeaderMap::new();
        for (key, value) in &http.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .with_context(|| format!("Invalid header name '{}'", key))?;
            let value = HeaderValue::from_str(&expand_env(value))
                .with_context(|| format!("Invalid value for header '{}'", key))?;
            headers.insert(name, value);
        }
        Ok(Self {
            server: definition.name.clone(),
            url,
            headers,
            session,
        })
    }

    async fn apply(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request = request.headers(self.headers.clone());
        if let Some(session) = &self.session {
            if let Some(token) = session.access_token().await {
                request = request.header(AUTHORIZATION, format!("Bearer {token}"));
            }
        }
        request
    }
}

fn send_error(err: reqwest::Error) -> anyhow::Error {
    let detail = std::error::Error::source(&err)
        .map(|source| format!("{err}: {source}"))
        .unwrap_or_else(|| err.to_string());
    if err.is_connect() || err.is_timeout() {
        McpClientError::Network(detail).into()
    } else {
        McpClientError::Transport(detail).into()
    }
}

async fn status_error(response: reqwest::Response) -> anyhow::Error {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    McpClientError::http(status, &body).into()
}

/// Unwrap a JSON-RPC response object
fn rpc_result(message: Value) -> Result<Value> {
    if let Some(error) = message.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32603);
        let text = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(McpClientError::Rpc {
            code,
            message: text,
        }
        .into());
    }
    Ok(message.get("result").cloned().unwrap_or(Value::Null))
}

fn is_response_to(message: &Value, id: i64) -> bool {
    message.get("id").and_then(Value::as_i64) == Some(id)
        && (message.get("result").is_some() || message.get("error").is_some())
}

/// Request/notify primitive shared by both transports
#[async_trait]
pub trait RpcChannel: Send + Sync {
    fn server(&self) -> &str;
    async fn request(&self, method: &str, params: Value) -> Result<Value>;
    async fn notify(&self, method: &str, params: Value) -> Result<()>;
    async fn shutdown(&self);
}

async fn handshake<C: RpcChannel>(channel: &C) -> Result<()> {
    let params = json!({
        "protocolVersion": protocol_version(),
        "capabilities": {},
        "clientInfo": client_info(),
    });
    let initialized = tokio::time::timeout(STARTUP_TIMEOUT, channel.request("initialize", params))
        .await
        .map_err(|_| {
            McpClientError::Network(format!(
                "MCP server '{}' initialize timed out after {:?}",
                channel.server(),
                STARTUP_TIMEOUT
            ))
        })??;
    let server_info = initialized
        .get("serverInfo")
        .cloned()
        .unwrap_or(Value::Null);
    tracing::debug!("initialized '{}': {}", channel.server(), server_info);
    channel
        .notify("notifications/initialized", json!({}))
        .await
}

/// An MCP session over one of the HTTP channels
pub struct HttpConnection<C> {
    channel: C,
}

async fn bounded<T>(
    server: &str,
    what: &str,
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, fut).await.map_err(|_| {
        anyhow::Error::new(McpClientError::Network(format!(
            "{what} on '{server}' timed out after {limit:?}"
        )))
    })?
}

#[async_trait]
impl<C: RpcChannel + 'static> McpConnection for HttpConnection<C> {
    async fn list_tools(&self, cursor: Option<String>) -> Result<ToolPage> {
        let params = match cursor {
            Some(cursor) => json!({ "cursor": cursor }),
            None => json!({}),
        };
        let server = self.channel.server();
        let result = bounded(
            server,
            "tools/list",
            REQUEST_TIMEOUT,
            self.channel.request("tools/list", params),
        )
        .await?;
        Ok(ToolPage::from_wire(&result))
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let params = json!({
            "name": name,
            "arguments": arguments.unwrap_or_else(|| json!({})),
        });
        match tokio::time::timeout(timeout, self.channel.request("tools/call", params)).await {
            Ok(result) => result,
            Err(_) => Err(McpClientError::CallTimeout {
                server: self.channel.server().to_string(),
                tool: name.to_string(),
                timeout,
            }
            .into()),
        }
    }

    async fn list_resources(&self, params: Option<Value>) -> Result<Value> {
        let params = params.filter(|p| !p.is_null()).unwrap_or_else(|| json!({}));
        bounded(
            self.channel.server(),
            "resources/list",
            REQUEST_TIMEOUT,
            self.channel.request("resources/list", params),
        )
        .await
    }

    async fn close(&self) {
        self.channel.shutdown().await;
    }
}

// ============================================================================
// Streamable HTTP
// ============================================================================

pub struct StreamableChannel {
    http: reqwest::Client,
    target: HttpTarget,
    session_id: Mutex<Option<String>>,
    next_id: AtomicI64,
}

pub type StreamableConnection = HttpConnection<StreamableChannel>;

impl HttpConnection<StreamableChannel> {
    pub async fn connect(
        http: reqwest::Client,
        definition: &ServerDefinition,
        session: Option<Arc<dyn AuthSession>>,
    ) -> Result<Self> {
        let channel = StreamableChannel {
            http,
            target: HttpTarget::new(definition, session)?,
            session_id: Mutex::new(None),
            next_id: AtomicI64::new(1),
        };
        handshake(&channel).await?;
        tracing::info!("Connected to '{}' over streamable HTTP", definition.name);
        Ok(Self { channel })
    }
}

impl StreamableChannel {
    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let mut request = self
            .http
            .post(self.target.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(id) = self.session_id.lock().await.clone() {
            request = request.header(SESSION_HEADER, id);
        }
        let request = self.target.apply(request).await;
        let response = request.send().await.map_err(send_error)?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().await = Some(id.to_string());
        }
        Ok(response)
    }
}

#[async_trait]
impl RpcChannel for StreamableChannel {
    fn server(&self) -> &str {
        &self.target.server
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let response = self.post(&body).await?;

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        if !is_stream {
            let message: Value = response.json().await.map_err(send_error)?;
            return rpc_result(message);
        }

        // Read events until our reply shows up; servers may interleave
        // notifications before it
        let mut frames = std::pin::pin!(sse::frames(response.bytes_stream()));
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(SseFrame::Message(message)) if is_response_to(&message, id) => {
                    return rpc_result(message)
                }
                Ok(_) => {}
                Err(EventStreamError::Transport(e)) => return Err(send_error(e)),
                Err(e) => {
                    return Err(McpClientError::Transport(format!(
                        "bad event stream from '{}': {}",
                        self.target.server, e
                    ))
                    .into())
                }
            }
        }
        Err(McpClientError::Transport(format!(
            "connection closed before '{}' answered {}",
            self.target.server, method
        ))
        .into())
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let body = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.post(&body).await?;
        Ok(())
    }

    async fn shutdown(&self) {
        let Some(id) = self.session_id.lock().await.take() else {
            return;
        };
        let request = self
            .http
            .delete(self.target.url.clone())
            .header(SESSION_HEADER, id)
            .timeout(Duration::from_secs(2));
        let request = self.target.apply(request).await;
        if let Err(e) = request.send().await {
            tracing::debug!("Ending HTTP session for {} failed: {}", self.target.server, e);
        }
    }
}

// ============================================================================
// SSE (legacy)
// ============================================================================

type Pending = Arc<Mutex<HashMap<i64, oneshot::Sender<Value>>>>;

pub struct SseChannel {
    http: reqwest::Client,
    target: HttpTarget,
    endpoint: Url,
    pending: Pending,
    reader: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicI64,
}

pub type SseConnection = HttpConnection<SseChannel>;

impl HttpConnection<SseChannel> {
    pub async fn connect(
        http: reqwest::Client,
        definition: &ServerDefinition,
        session: Option<Arc<dyn AuthSession>>,
    ) -> Result<Self> {
        let target = HttpTarget::new(definition, session)?;
        let request = http
            .get(target.url.clone())
            .header(ACCEPT, "text/event-stream");
        let request = target.apply(request).await;
        let response = request.send().await.map_err(send_error)?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
        let reader = tokio::spawn(read_stream(
            target.server.clone(),
            response,
            endpoint_tx,
            pending.clone(),
        ));

        let endpoint = match tokio::time::timeout(STARTUP_TIMEOUT, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                reader.abort();
                return Err(McpClientError::Transport(format!(
                    "SSE stream for '{}' closed before announcing an endpoint",
                    target.server
                ))
                .into());
            }
            Err(_) => {
                reader.abort();
                return Err(McpClientError::Network(format!(
                    "SSE endpoint for '{}' timed out after {:?}",
                    target.server, STARTUP_TIMEOUT
                ))
                .into());
            }
        };
        let endpoint = target
            .url
            .join(&endpoint)
            .with_context(|| format!("Invalid SSE endpoint '{}'", endpoint))?;

        let channel = SseChannel {
            http,
            target,
            endpoint,
            pending,
            reader: Mutex::new(Some(reader)),
            next_id: AtomicI64::new(1),
        };
        if let Err(e) = handshake(&channel).await {
            channel.shutdown().await;
            return Err(e);
        }
        tracing::info!("Connected to '{}' over SSE", definition.name);
        Ok(Self { channel })
    }
}

async fn read_stream(
    server: String,
    response: reqwest::Response,
    endpoint_tx: oneshot::Sender<String>,
    pending: Pending,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut frames = std::pin::pin!(sse::frames(response.bytes_stream()));
    while let Some(frame) = frames.next().await {
        let message = match frame {
            Ok(SseFrame::Endpoint(endpoint)) => {
                if let Some(tx) = endpoint_tx.take() {
                    let _ = tx.send(endpoint);
                }
                continue;
            }
            Ok(SseFrame::Message(message)) => message,
            Err(e) => {
                tracing::debug!("SSE stream for {} failed: {}", server, e);
                break;
            }
        };
        let Some(id) = message.get("id").and_then(Value::as_i64) else {
            continue;
        };
        if let Some(waiter) = pending.lock().await.remove(&id) {
            let _ = waiter.send(message);
        }
    }
    // Dropping the senders fails every outstanding request
    pending.lock().await.clear();
    tracing::debug!("SSE stream for {} ended", server);
}

impl SseChannel {
    async fn post(&self, body: &Value) -> Result<()> {
        let request = self
            .http
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .json(body);
        let request = self.target.apply(request).await;
        let response = request.send().await.map_err(send_error)?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(())
    }
}

#[async_trait]
impl RpcChannel for SseChannel {
    fn server(&self) -> &str {
        &self.target.server
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        if let Err(e) = self.post(&body).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        // Caller timeouts drop this future; the entry is cleared on close
        match rx.await {
            Ok(message) => rpc_result(message),
            Err(_) => Err(McpClientError::Transport(format!(
                "connection closed before '{}' answered {}",
                self.target.server, method
            ))
            .into()),
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let body = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.post(&body).await
    }

    async fn shutdown(&self) {
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        self.pending.lock().await.clear();
    }
}
