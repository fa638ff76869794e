//! Stdio transport
//!
//! Spawns the server ourselves and hands its pipes to rmcp, so the child
//! handle (pid, exit status) stays with us for shutdown.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use mcp_common::{McpClientError, INVALID_PARAMS};
use rmcp::model::{CallToolRequestParam, PaginatedRequestParam};
use rmcp::service::{Peer, RunningService, ServiceError};
use rmcp::{RoleClient, ServiceExt};
use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::connection::McpConnection;
use super::process::{self, TerminationPlan};
use super::types::ToolPage;
use crate::config::expand_env;
use crate::definition::{CommandSpec, ServerDefinition};

/// Spawn plus `initialize` handshake
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound for non-tool requests
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// How long `cancel` may take before we move on to the process
const CANCEL_TIMEOUT: Duration = Duration::from_secs(2);

/// How long the root may take to exit once its stdin is closed
const EXIT_WAIT: Duration = Duration::from_secs(1);

/// MCP session over a child's stdin/stdout
pub struct StdioConnection {
    name: String,
    pid: Option<u32>,
    peer: Peer<RoleClient>,
    service: Mutex<Option<RunningService<RoleClient, ()>>>,
    child: Mutex<Option<Child>>,
}

impl StdioConnection {
    /// Spawn the server and run the MCP handshake
    ///
    /// On any failure the process tree is torn down before returning.
    pub async fn spawn(definition: &ServerDefinition) -> Result<Self> {
        let CommandSpec::Stdio(stdio) = &definition.command else {
            anyhow::bail!("server '{}' is not a stdio server", definition.name);
        };
        let name = definition.name.clone();

        let mut cmd = Command::new(expand_env(&stdio.command));
        cmd.args(stdio.args.iter().map(|arg| expand_env(arg)));
        for (key, value) in &definition.env {
            cmd.env(key, expand_env(value));
        }
        if let Some(dir) = &stdio.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        tracing::debug!("Spawning MCP server '{}': {}", name, stdio.command);
        let mut child = cmd.spawn().map_err(|e| {
            McpClientError::Transport(format!(
                "failed to spawn '{}' for server '{}': {}",
                stdio.command, name, e
            ))
        })?;
        let pid = child.id();

        let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take()) else {
            shutdown_child(&name, child, pid, Vec::new()).await;
            anyhow::bail!("server '{}' started without piped stdio", name);
        };

        let started = tokio::time::timeout(STARTUP_TIMEOUT, ().serve((stdout, stdin))).await;
        let service = match started {
            Ok(Ok(service)) => service,
            Ok(Err(e)) => {
                let err = match exit_error(&mut child).await {
                    Some(exit) => exit,
                    None => McpClientError::Transport(format!("initialize failed: {e}")),
                };
                shutdown_child(&name, child, pid, Vec::new()).await;
                return Err(anyhow::Error::new(err)
                    .context(format!("failed to initialize MCP server '{}'", name)));
            }
            Err(_) => {
                shutdown_child(&name, child, pid, Vec::new()).await;
                return Err(McpClientError::Transport(format!(
                    "MCP server '{}' startup timed out after {:?}",
                    name, STARTUP_TIMEOUT
                ))
                .into());
            }
        };

        tracing::info!("MCP server started: {} (pid {:?})", name, pid);
        Ok(Self {
            name,
            pid,
            peer: service.peer().clone(),
            service: Mutex::new(Some(service)),
            child: Mutex::new(Some(child)),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status if the child has already gone away
    async fn exited(&self) -> Option<McpClientError> {
        let mut guard = self.child.lock().await;
        let child = guard.as_mut()?;
        exit_error(child).await
    }

    async fn map_error(&self, err: ServiceError) -> anyhow::Error {
        match err {
            ServiceError::McpError(data) => McpClientError::Rpc {
                code: i64::from(data.code.0),
                message: data.message.to_string(),
            }
            .into(),
            other => match self.exited().await {
                Some(exit) => exit.into(),
                None => McpClientError::Transport(other.to_string()).into(),
            },
        }
    }

    async fn bounded<T, F>(&self, what: &str, limit: Duration, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, ServiceError>>,
    {
        match tokio::time::timeout(limit, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(self.map_error(e).await),
            Err(_) => Err(McpClientError::Transport(format!(
                "{} on '{}' timed out after {:?}",
                what, self.name, limit
            ))
            .into()),
        }
    }
}

fn paginated(cursor: Option<String>) -> Result<Option<PaginatedRequestParam>> {
    match cursor {
        None => Ok(None),
        Some(cursor) => Ok(Some(serde_json::from_value(serde_json::json!({
            "cursor": cursor
        }))?)),
    }
}

#[async_trait]
impl McpConnection for StdioConnection {
    async fn list_tools(&self, cursor: Option<String>) -> Result<ToolPage> {
        let params = paginated(cursor)?;
        let result = self
            .bounded("tools/list", REQUEST_TIMEOUT, self.peer.list_tools(params))
            .await?;
        Ok(ToolPage::from_wire(&serde_json::to_value(&result)?))
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let arguments = match arguments {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map),
            Some(_) => {
                return Err(McpClientError::Rpc {
                    code: INVALID_PARAMS,
                    message: "tool arguments must be a JSON object".to_string(),
                }
                .into())
            }
        };
        let request = CallToolRequestParam {
            name: name.to_string().into(),
            arguments,
            task: None,
        };
        match tokio::time::timeout(timeout, self.peer.call_tool(request)).await {
            Ok(Ok(result)) => Ok(serde_json::to_value(&result)?),
            Ok(Err(e)) => Err(self.map_error(e).await),
            Err(_) => Err(McpClientError::CallTimeout {
                server: self.name.clone(),
                tool: name.to_string(),
                timeout,
            }
            .into()),
        }
    }

    async fn list_resources(&self, params: Option<Value>) -> Result<Value> {
        let params: Option<PaginatedRequestParam> = match params {
            None | Some(Value::Null) => None,
            Some(value) => Some(serde_json::from_value(value)?),
        };
        let result = self
            .bounded("resources/list", REQUEST_TIMEOUT, self.peer.list_resources(params))
            .await?;
        Ok(serde_json::to_value(&result)?)
    }

    async fn close(&self) {
        let service = self.service.lock().await.take();
        let child = self.child.lock().await.take();
        if service.is_none() && child.is_none() {
            return;
        }

        // Snapshot while the tree is still intact
        let known = self.pid.map(process::descendants).unwrap_or_default();

        if let Some(service) = service {
            match tokio::time::timeout(CANCEL_TIMEOUT, service.cancel()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!("Error canceling MCP server {}: {}", self.name, e),
                Err(_) => tracing::warn!("Canceling MCP server {} timed out", self.name),
            }
        }
        if let Some(child) = child {
            shutdown_child(&self.name, child, self.pid, known).await;
        }
        tracing::info!("MCP server stopped: {}", self.name);
    }
}

/// Wait briefly for the root, drop its pipes, then take the tree down
async fn shutdown_child(name: &str, mut child: Child, pid: Option<u32>, known: Vec<u32>) {
    if tokio::time::timeout(EXIT_WAIT, child.wait()).await.is_err() {
        tracing::debug!("MCP server {} still running after stdin closed", name);
    }
    drop(child.stdin.take());
    drop(child.stdout.take());
    drop(child.stderr.take());

    if let Some(pid) = pid {
        let outcome = process::terminate_tree(pid, &known, TerminationPlan::default()).await;
        tracing::debug!("process tree of {} ({}): {:?}", name, pid, outcome);
    }

    // Reap the root so it does not linger as a zombie
    if let Err(e) = child.start_kill() {
        tracing::debug!("final kill of {} skipped: {}", name, e);
    }
    if tokio::time::timeout(EXIT_WAIT, child.wait()).await.is_err() {
        tracing::warn!("MCP server {} could not be reaped", name);
    }
}

/// Translate an exit that has already happened into a typed error
async fn exit_error(child: &mut Child) -> Option<McpClientError> {
    let status = match child.try_wait() {
        Ok(Some(status)) => status,
        Ok(None) => tokio::time::timeout(Duration::from_millis(100), child.wait())
            .await
            .ok()?
            .ok()?,
        Err(_) => return None,
    };
    Some(McpClientError::StdioExit {
        code: status.code(),
        signal: exit_signal(&status),
    })
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(signal_name)
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<String> {
    None
}

#[cfg(unix)]
fn signal_name(signo: i32) -> String {
    let name = match signo {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGABRT => "SIGABRT",
        libc::SIGKILL => "SIGKILL",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGTERM => "SIGTERM",
        _ => return format!("SIG{signo}"),
    };
    name.to_string()
}
