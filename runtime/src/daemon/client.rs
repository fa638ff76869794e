//! Client side of the keep-alive daemon
//!
//! Every request first checks that the running daemon was started from the
//! current configuration. An unreachable daemon is launched on demand and
//! the request is retried once.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mcp_common::{find_client_error, CallResult, McpClientError};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use super::launcher::{DaemonLauncher, LaunchRequest};
use super::metadata::{DaemonMetadata, DaemonPaths};
use super::protocol::*;
use crate::config::{self, ConfigLayer, LoadOptions};
use crate::mcp::ToolInfo;

/// How long a launched daemon gets to answer `status`
const READY_TIMEOUT: Duration = Duration::from_secs(10);
const READY_POLL: Duration = Duration::from_millis(100);

/// Timeout for control requests (`status`, `stop`, `closeServer`)
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Extra time the daemon gets on top of the tool call timeout
const CALL_MARGIN: Duration = Duration::from_secs(5);

/// How long `stop` waits for the socket to disappear
const STOP_WAIT: Duration = Duration::from_secs(3);

type LayerSource = Arc<dyn Fn() -> Vec<ConfigLayer> + Send + Sync>;

/// Client for communicating with the daemon of one configuration
#[derive(Clone)]
pub struct DaemonClient {
    options: LoadOptions,
    paths: DaemonPaths,
    launcher: Arc<dyn DaemonLauncher>,
    layers: LayerSource,
    call_timeout: Duration,
    margin: Duration,
    /// Serializes launches from this process
    start_lock: Arc<Mutex<()>>,
}

impl DaemonClient {
    pub fn new(options: LoadOptions, paths: DaemonPaths, launcher: Arc<dyn DaemonLauncher>) -> Self {
        let layer_options = options.clone();
        Self {
            options,
            paths,
            launcher,
            layers: Arc::new(move || config::config_layers(&layer_options)),
            call_timeout: config::call_timeout(),
            margin: CALL_MARGIN,
            start_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Replace how the current configuration layers are computed
    pub fn with_layer_source(
        mut self,
        layers: impl Fn() -> Vec<ConfigLayer> + Send + Sync + 'static,
    ) -> Self {
        self.layers = Arc::new(layers);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Time the daemon gets on top of a call's own timeout before the
    /// client gives up on it
    pub fn with_response_margin(mut self, margin: Duration) -> Self {
        self.margin = margin;
        self
    }

    pub fn paths(&self) -> &DaemonPaths {
        &self.paths
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<CallResult> {
        let timeout = timeout.unwrap_or(self.call_timeout);
        let params = CallToolParams {
            server: server.to_string(),
            tool: tool.to_string(),
            arguments,
            timeout_ms: Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)),
        };
        let raw = self
            .invoke(METHOD_CALL_TOOL, serde_json::to_value(params)?, timeout + self.margin)
            .await?;
        Ok(CallResult::new(raw))
    }

    pub async fn list_tools(
        &self,
        server: &str,
        include_schema: bool,
        auto_authorize: bool,
    ) -> Result<Vec<ToolInfo>> {
        let params = ListToolsParams {
            server: server.to_string(),
            include_schema,
            auto_authorize,
        };
        let raw = self
            .invoke(
                METHOD_LIST_TOOLS,
                serde_json::to_value(params)?,
                self.call_timeout + self.margin,
            )
            .await?;
        serde_json::from_value(raw).context("Malformed listTools result from daemon")
    }

    pub async fn list_resources(&self, server: &str, params: Option<Value>) -> Result<Value> {
        let params = ListResourcesParams {
            server: server.to_string(),
            params,
        };
        self.invoke(
            METHOD_LIST_RESOURCES,
            serde_json::to_value(params)?,
            self.call_timeout + self.margin,
        )
        .await
    }

    /// Ask the daemon to drop its connection to `server`; never launches one
    pub async fn close_server(&self, server: &str) -> Result<()> {
        self.send(METHOD_CLOSE_SERVER, json!({ "server": server }), CONTROL_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Status of the running daemon, `None` when none is reachable
    pub async fn status(&self) -> Result<Option<DaemonStatus>> {
        match self.send(METHOD_STATUS, Value::Null, CONTROL_TIMEOUT).await {
            Ok(raw) => Ok(Some(
                serde_json::from_value(raw).context("Malformed status from daemon")?,
            )),
            Err(err) if unreachable_kind(&err).is_some() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Launch a daemon unless one is already answering
    pub async fn start(&self) -> Result<()> {
        self.ensure_fresh().await?;
        if self.status().await?.is_some() {
            return Ok(());
        }
        self.launch().await
    }

    /// Stop the daemon, by request first and by signal if it lingers
    pub async fn stop(&self) -> Result<bool> {
        let metadata = DaemonMetadata::read(&self.paths.metadata).await.ok().flatten();
        let requested = match self.send(METHOD_STOP, Value::Null, CONTROL_TIMEOUT).await {
            Ok(_) => true,
            Err(err) => {
                tracing::debug!("Daemon stop request failed: {:#}", err);
                false
            }
        };

        let deadline = tokio::time::Instant::now() + STOP_WAIT;
        while requested
            && tokio::fs::try_exists(&self.paths.socket).await.unwrap_or(false)
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(READY_POLL).await;
        }

        let mut signalled = false;
        if let Some(metadata) = &metadata {
            if metadata.pid != std::process::id() && crate::mcp::process::is_alive(metadata.pid) {
                tracing::warn!("Daemon pid {} still running; terminating", metadata.pid);
                crate::mcp::process::terminate(metadata.pid);
                signalled = true;
            }
        }
        self.paths.remove_files().await;
        Ok(requested || signalled)
    }

    pub async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.launch().await
    }

    // ------------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------------

    /// Fresh-check, send, and restart-and-retry once when unreachable
    async fn invoke(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        self.ensure_fresh().await?;
        match self.send(method, params.clone(), timeout).await {
            Ok(result) => Ok(result),
            Err(err) if unreachable_kind(&err) == Some(std::io::ErrorKind::TimedOut) => {
                // Still listening but not answering: stop it before a new one
                // takes the socket
                tracing::warn!("MCP daemon not answering ({}); restarting it", err);
                self.restart().await?;
                self.send(method, params, timeout).await
            }
            Err(err) if unreachable_kind(&err).is_some_and(is_restartable) => {
                tracing::info!("MCP daemon unreachable ({}); starting it", err);
                self.launch().await?;
                self.send(method, params, timeout).await
            }
            Err(err) => Err(err),
        }
    }

    /// Restart a daemon whose configuration layers no longer match
    async fn ensure_fresh(&self) -> Result<()> {
        let metadata = match DaemonMetadata::read(&self.paths.metadata).await {
            Ok(Some(metadata)) => metadata,
            Ok(None) => return Ok(()),
            Err(e) => {
                tracing::warn!("Ignoring unreadable daemon metadata: {:#}", e);
                return Ok(());
            }
        };
        let current = (self.layers)();
        if metadata.is_stale(&current) {
            tracing::info!(
                "Configuration changed since daemon pid {} started; restarting",
                metadata.pid
            );
            self.restart().await?;
        }
        Ok(())
    }

    async fn launch(&self) -> Result<()> {
        let _guard = self.start_lock.lock().await;
        if self.ping().await {
            return Ok(());
        }
        // A daemon that holds the socket without answering is stopped first
        if let Ok(Some(metadata)) = DaemonMetadata::read(&self.paths.metadata).await {
            if metadata.pid != std::process::id() && crate::mcp::process::is_alive(metadata.pid) {
                tracing::warn!("Daemon pid {} is not answering; terminating", metadata.pid);
                crate::mcp::process::terminate(metadata.pid);
            }
        }
        // Left behind by a crashed or stopped daemon
        self.paths.remove_files().await;
        self.launcher
            .launch(&LaunchRequest {
                options: self.options.clone(),
                paths: self.paths.clone(),
            })
            .await?;

        let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if self.ping().await {
                return Ok(());
            }
            tokio::time::sleep(READY_POLL).await;
        }
        Err(McpClientError::DaemonUnreachable {
            message: format!(
                "daemon did not become ready within {}s; see {:?}",
                READY_TIMEOUT.as_secs(),
                self.paths.log
            ),
            kind: std::io::ErrorKind::TimedOut,
        }
        .into())
    }

    async fn ping(&self) -> bool {
        self.send(METHOD_STATUS, Value::Null, READY_POLL * 5)
            .await
            .is_ok()
    }

    /// One request on one connection; I/O failures become `DaemonUnreachable`
    async fn send(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let request = DaemonRequest::new(method, params);
        let body = serde_json::to_vec(&request)?;
        let exchange = exchange(&self.paths.socket, &body);
        let raw = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                return Err(McpClientError::DaemonUnreachable {
                    message: format!("{:?}: {}", self.paths.socket, e),
                    kind: e.kind(),
                }
                .into())
            }
            Err(_) => {
                // Only our connection is dropped; the daemon may still be busy
                return Err(McpClientError::DaemonUnreachable {
                    message: format!(
                        "{method} timed out after {}ms",
                        timeout.as_millis()
                    ),
                    kind: std::io::ErrorKind::TimedOut,
                }
                .into());
            }
        };

        let response: DaemonResponse =
            serde_json::from_slice(&raw).context("Failed to parse daemon response")?;
        if response.id != request.id {
            anyhow::bail!(
                "daemon answered request {} with id {}",
                request.id,
                response.id
            );
        }
        response.into_result()
    }
}

async fn exchange(socket: &Path, body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut stream = UnixStream::connect(socket).await?;
    stream.write_all(body).await?;
    stream.shutdown().await?;
    let mut raw = Vec::new();
    (&mut stream)
        .take(MAX_MESSAGE_BYTES)
        .read_to_end(&mut raw)
        .await?;
    if raw.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "daemon closed the connection without answering",
        ));
    }
    Ok(raw)
}

fn unreachable_kind(err: &anyhow::Error) -> Option<std::io::ErrorKind> {
    match find_client_error(err) {
        Some(McpClientError::DaemonUnreachable { kind, .. }) => Some(*kind),
        _ => None,
    }
}

/// Failures that a fresh daemon can fix
fn is_restartable(kind: std::io::ErrorKind) -> bool {
    use std::io::ErrorKind;
    matches!(
        kind,
        ErrorKind::ConnectionRefused
            | ErrorKind::NotFound
            | ErrorKind::TimedOut
            | ErrorKind::ConnectionReset
    )
}
