//! The daemon process: keeps keep-alive servers connected between CLI runs
//!
//! Listens on a Unix socket and serves each connection on its own task.
//! Requests for the same server wait their turn in arrival order; different
//! servers proceed independently.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use mcp_common::McpClientError;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, Notify};

use super::metadata::{DaemonMetadata, DaemonPaths};
use super::protocol::*;
use crate::config::LoadedConfig;
use crate::mcp::{CallOptions, ListToolsOptions, McpRuntime, Runtime};

/// How often idle servers are looked for
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// The daemon - owns a [`Runtime`] for the keep-alive servers
pub struct DaemonHost {
    runtime: Runtime,
    paths: DaemonPaths,
    metadata: DaemonMetadata,
    /// One FIFO turn per server name (tokio's mutex is fair)
    queues: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    last_used: std::sync::Mutex<HashMap<String, Instant>>,
    shutdown: Notify,
}

impl DaemonHost {
    /// Build a host for the keep-alive servers of a loaded configuration
    pub fn new(config: &LoadedConfig, paths: DaemonPaths) -> Self {
        let servers = config
            .servers
            .iter()
            .filter(|s| s.is_keep_alive())
            .cloned()
            .collect::<Vec<_>>();
        Self::with_runtime(Runtime::new(servers), config, paths)
    }

    pub fn with_runtime(runtime: Runtime, config: &LoadedConfig, paths: DaemonPaths) -> Self {
        let metadata = DaemonMetadata {
            pid: std::process::id(),
            socket_path: paths.socket.clone(),
            config_path: config.config_path.clone(),
            config_layers: config.layers.clone(),
            started_at: Utc::now(),
            log_path: paths.log.clone(),
        };
        Self {
            runtime,
            paths,
            metadata,
            queues: std::sync::Mutex::new(HashMap::new()),
            last_used: std::sync::Mutex::new(HashMap::new()),
            shutdown: Notify::new(),
        }
    }

    /// Run until `stop` or a termination signal
    pub async fn run(self: Arc<Self>) -> Result<()> {
        if let Some(dir) = self.paths.dir() {
            tokio::fs::create_dir_all(dir).await?;
        }
        // Remove existing socket file
        let _ = tokio::fs::remove_file(&self.paths.socket).await;

        let listener = UnixListener::bind(&self.paths.socket)
            .context(format!("Failed to bind to socket: {:?}", self.paths.socket))?;
        let _ = tokio::fs::set_permissions(
            &self.paths.socket,
            std::fs::Permissions::from_mode(0o600),
        )
        .await;
        self.metadata.write(&self.paths.metadata).await?;

        tracing::info!(
            "MCP daemon listening on {:?} for {:?} ({} keep-alive servers)",
            self.paths.socket,
            self.metadata.config_path,
            self.runtime.definitions().count()
        );

        let sweeper = {
            let host = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(IDLE_SWEEP_INTERVAL);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    host.close_idle_servers().await;
                }
            })
        };

        let mut terminate = terminate_signal()?;
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _)) => {
                            let host = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = host.handle_connection(stream).await {
                                    tracing::warn!("Connection error: {:#}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                _ = terminate.recv() => {
                    tracing::info!("Termination signal received");
                    break;
                }
            }
        }

        sweeper.abort();
        if let Err(e) = self.runtime.close(None).await {
            tracing::warn!("Error closing servers: {:#}", e);
        }
        // A newer daemon may already own these paths
        let ours = DaemonMetadata::read(&self.paths.metadata)
            .await
            .ok()
            .flatten()
            .map_or(true, |m| m.pid == self.metadata.pid);
        if ours {
            self.paths.remove_files().await;
        }

        tracing::info!("MCP daemon stopped");
        Ok(())
    }

    /// Handle a single client connection
    async fn handle_connection(&self, mut stream: UnixStream) -> Result<()> {
        let mut raw = Vec::new();
        (&mut stream)
            .take(MAX_MESSAGE_BYTES)
            .read_to_end(&mut raw)
            .await?;
        if raw.is_empty() {
            return Ok(());
        }

        let (response, stop) = match serde_json::from_slice::<DaemonRequest>(&raw) {
            Ok(request) => {
                let stop = request.method == METHOD_STOP;
                (self.handle_request(request).await, stop)
            }
            Err(e) => {
                let err = anyhow::Error::new(e).context("Failed to parse request");
                (DaemonResponse::failure("", &err), false)
            }
        };

        let body = serde_json::to_vec(&response)?;
        stream.write_all(&body).await?;
        stream.shutdown().await?;

        if stop {
            self.shutdown.notify_one();
        }
        Ok(())
    }

    /// Process a daemon request
    pub async fn handle_request(&self, request: DaemonRequest) -> DaemonResponse {
        tracing::debug!("Daemon request {} {}", request.id, request.method);
        match self.dispatch(&request.method, request.params).await {
            Ok(result) => DaemonResponse::success(request.id, result),
            Err(err) => {
                tracing::debug!("Request {} failed: {:#}", request.id, err);
                DaemonResponse::failure(request.id, &err)
            }
        }
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Value> {
        match method {
            METHOD_CALL_TOOL => {
                let p: CallToolParams = parse_params(params)?;
                let _turn = self.turn(&p.server).await?;
                let options = CallOptions {
                    arguments: p.arguments,
                    timeout: p.timeout_ms.map(Duration::from_millis),
                };
                let result = self.runtime.call_tool(&p.server, &p.tool, options).await;
                self.touch(&p.server);
                Ok(result?.into_raw())
            }
            METHOD_LIST_TOOLS => {
                let p: ListToolsParams = parse_params(params)?;
                let _turn = self.turn(&p.server).await?;
                let options = ListToolsOptions {
                    include_schema: p.include_schema,
                    auto_authorize: p.auto_authorize,
                };
                let tools = self.runtime.list_tools(&p.server, options).await;
                self.touch(&p.server);
                Ok(serde_json::to_value(tools?)?)
            }
            METHOD_LIST_RESOURCES => {
                let p: ListResourcesParams = parse_params(params)?;
                let _turn = self.turn(&p.server).await?;
                let resources = self.runtime.list_resources(&p.server, p.params).await;
                self.touch(&p.server);
                resources
            }
            METHOD_CLOSE_SERVER => {
                let p: ServerParams = parse_params(params)?;
                let _turn = self.turn(&p.server).await?;
                self.runtime.close(Some(&p.server)).await?;
                tracing::info!("Closed server '{}' on request", p.server);
                Ok(Value::Bool(true))
            }
            METHOD_STATUS => Ok(serde_json::to_value(self.status().await)?),
            METHOD_STOP => Ok(Value::Bool(true)),
            other => Err(McpClientError::Rpc {
                code: mcp_common::METHOD_NOT_FOUND,
                message: format!("unknown daemon method '{other}'"),
            }
            .into()),
        }
    }

    /// Wait for this server's turn
    async fn turn(&self, server: &str) -> Result<tokio::sync::OwnedMutexGuard<()>> {
        self.runtime.definition(server)?;
        let queue = {
            let mut queues = self
                .queues
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            queues.entry(server.to_string()).or_default().clone()
        };
        Ok(queue.lock_owned().await)
    }

    fn touch(&self, server: &str) {
        let mut last_used = self
            .last_used
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        last_used.insert(server.to_string(), Instant::now());
    }

    fn idle_for(&self, server: &str) -> Option<Duration> {
        let last_used = self
            .last_used
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        last_used.get(server).map(Instant::elapsed)
    }

    pub async fn status(&self) -> DaemonStatus {
        let connected = self.runtime.connected_servers().await;
        let servers = self
            .runtime
            .definitions()
            .map(|definition| ServerStatus {
                name: definition.name.clone(),
                connected: connected.contains(&definition.name),
                last_used_secs: self.idle_for(&definition.name).map(|d| d.as_secs()),
                idle_timeout_ms: definition
                    .lifecycle
                    .idle_timeout()
                    .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            })
            .collect();
        DaemonStatus {
            pid: self.metadata.pid,
            started_at: self.metadata.started_at,
            config_path: self.metadata.config_path.clone(),
            servers,
        }
    }

    /// Close servers whose idle timeout has elapsed
    pub async fn close_idle_servers(&self) {
        let connected = self.runtime.connected_servers().await;
        let expired: Vec<String> = self
            .runtime
            .definitions()
            .filter(|d| connected.contains(&d.name))
            .filter_map(|d| {
                let limit = d.lifecycle.idle_timeout()?;
                let idle = self.idle_for(&d.name)?;
                (idle > limit).then(|| d.name.clone())
            })
            .collect();

        for name in expired {
            let Ok(_turn) = self.turn(&name).await else {
                continue;
            };
            // Re-check under the turn; a request may have just used it
            let still_idle = self
                .runtime
                .definition(&name)
                .ok()
                .and_then(|d| d.lifecycle.idle_timeout())
                .zip(self.idle_for(&name))
                .is_some_and(|(limit, idle)| idle > limit);
            if still_idle {
                tracing::info!("Stopping idle MCP server: {}", name);
                if let Err(e) = self.runtime.close(Some(&name)).await {
                    tracing::warn!("Failed to close idle server {}: {:#}", name, e);
                }
            }
        }
    }
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| {
        McpClientError::Rpc {
            code: mcp_common::INVALID_PARAMS,
            message: format!("invalid daemon params: {e}"),
        }
        .into()
    })
}

fn terminate_signal() -> Result<tokio::signal::unix::Signal> {
    use tokio::signal::unix::{signal, SignalKind};
    signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")
}
