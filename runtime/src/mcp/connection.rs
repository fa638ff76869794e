//! Connection seam
//!
//! [`McpConnection`] is what the orchestrator talks to once a transport is
//! up; [`Connector`] builds one for a definition. Tests substitute their own
//! [`Connector`] to count spawns and inject failures.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use super::types::ToolPage;
use crate::definition::ServerDefinition;
use crate::oauth::AuthSession;

/// A live, initialized MCP session
#[async_trait]
pub trait McpConnection: Send + Sync {
    /// Fetch one page of tools
    async fn list_tools(&self, cursor: Option<String>) -> Result<ToolPage>;

    /// Invoke a tool and return the raw `tools/call` result
    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> Result<Value>;

    /// Raw `resources/list` result
    async fn list_resources(&self, params: Option<Value>) -> Result<Value>;

    /// Tear the session down. Never fails; safe to call more than once.
    async fn close(&self);
}

/// Remote transport flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMode {
    Streamable,
    Sse,
}

impl std::fmt::Display for HttpMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpMode::Streamable => write!(f, "streamable-http"),
            HttpMode::Sse => write!(f, "sse"),
        }
    }
}

/// Builds connections for server definitions
#[async_trait]
pub trait Connector: Send + Sync {
    /// Spawn the server and complete the MCP handshake over stdio
    async fn connect_stdio(&self, definition: &ServerDefinition) -> Result<Box<dyn McpConnection>>;

    /// Connect to a remote server, presenting the session's bearer token
    async fn connect_http(
        &self,
        definition: &ServerDefinition,
        mode: HttpMode,
        session: Option<Arc<dyn AuthSession>>,
    ) -> Result<Box<dyn McpConnection>>;
}

/// The production connector: real processes and real HTTP
#[derive(Debug, Clone)]
pub struct TransportConnector {
    http: reqwest::Client,
}

impl TransportConnector {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for TransportConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for TransportConnector {
    async fn connect_stdio(&self, definition: &ServerDefinition) -> Result<Box<dyn McpConnection>> {
        let connection = super::stdio::StdioConnection::spawn(definition).await?;
        Ok(Box::new(connection))
    }

    async fn connect_http(
        &self,
        definition: &ServerDefinition,
        mode: HttpMode,
        session: Option<Arc<dyn AuthSession>>,
    ) -> Result<Box<dyn McpConnection>> {
        match mode {
            HttpMode::Streamable => {
                let connection =
                    super::http::StreamableConnection::connect(self.http.clone(), definition, session)
                        .await?;
                Ok(Box::new(connection))
            }
            HttpMode::Sse => {
                let connection =
                    super::http::SseConnection::connect(self.http.clone(), definition, session)
                        .await?;
                Ok(Box::new(connection))
            }
        }
    }
}
