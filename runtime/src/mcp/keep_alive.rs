//! Routes keep-alive servers through the daemon
//!
//! Everything else goes straight to the wrapped [`Runtime`]. A daemon-routed
//! failure that leaves the server unusable makes the daemon drop that
//! server, then the request is tried once more.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use mcp_common::{find_client_error, should_reset_connection, CallResult, McpClientError};
use serde_json::Value;

use super::runtime::{McpRuntime, Runtime};
use super::types::{CallOptions, ListToolsOptions, ToolInfo};
use crate::daemon::DaemonClient;

pub struct KeepAliveRuntime {
    direct: Arc<Runtime>,
    daemon: Option<DaemonClient>,
}

impl KeepAliveRuntime {
    /// `daemon: None` routes every server directly
    pub fn new(direct: Arc<Runtime>, daemon: Option<DaemonClient>) -> Self {
        Self { direct, daemon }
    }

    pub fn direct(&self) -> &Runtime {
        &self.direct
    }

    pub fn daemon(&self) -> Option<&DaemonClient> {
        self.daemon.as_ref()
    }

    fn route(&self, server: &str) -> Result<Option<&DaemonClient>> {
        let definition = self.direct.definition(server)?;
        if !definition.is_keep_alive() {
            return Ok(None);
        }
        Ok(self.daemon.as_ref())
    }

    async fn with_restart<T, F, Fut>(daemon: &DaemonClient, server: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !should_reset_connection(&err) {
            return Err(err);
        }
        tracing::warn!(
            "Keep-alive server '{}' failed ({}); restarting it",
            server,
            err
        );
        if let Err(e) = daemon.close_server(server).await {
            tracing::warn!("Failed to close '{}' in the daemon: {:#}", server, e);
        }
        op().await
    }
}

#[async_trait]
impl McpRuntime for KeepAliveRuntime {
    async fn list_tools(&self, server: &str, options: ListToolsOptions) -> Result<Vec<ToolInfo>> {
        match self.route(server)? {
            Some(daemon) => {
                Self::with_restart(daemon, server, || {
                    daemon.list_tools(server, options.include_schema, options.auto_authorize)
                })
                .await
            }
            None => self.direct.list_tools(server, options).await,
        }
    }

    async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        options: CallOptions,
    ) -> Result<CallResult> {
        match self.route(server)? {
            Some(daemon) => {
                Self::with_restart(daemon, server, || {
                    daemon.call_tool(server, tool, options.arguments.clone(), options.timeout)
                })
                .await
            }
            None => self.direct.call_tool(server, tool, options).await,
        }
    }

    async fn list_resources(&self, server: &str, params: Option<Value>) -> Result<Value> {
        match self.route(server)? {
            Some(daemon) => {
                Self::with_restart(daemon, server, || daemon.list_resources(server, params.clone()))
                    .await
            }
            None => self.direct.list_resources(server, params).await,
        }
    }

    /// A keep-alive server is closed inside the daemon. `None` closes the
    /// direct connections only; the daemon keeps its servers until it stops.
    async fn close(&self, server: Option<&str>) -> Result<()> {
        let Some(server) = server else {
            return self.direct.close(None).await;
        };
        // Unknown names close nothing, as in the direct runtime
        let Some(daemon) = self.route(server).ok().flatten() else {
            return self.direct.close(Some(server)).await;
        };
        match daemon.close_server(server).await {
            Ok(()) => Ok(()),
            Err(err) if is_daemon_unreachable(&err) => {
                tracing::debug!("No daemon holds '{}': {}", server, err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

fn is_daemon_unreachable(err: &anyhow::Error) -> bool {
    matches!(
        find_client_error(err),
        Some(McpClientError::DaemonUnreachable { .. })
    )
}
