//! Connection orchestrator
//!
//! [`Runtime`] owns one cached [`ClientContext`] per server name and decides
//! how to reach each server:
//!
//! - stdio: a single spawn attempt
//! - HTTP: streamable HTTP first, then SSE, with OAuth promotion when an
//!   unauthenticated server turns out to require authorization
//!
//! Calls on a cached context are not serialized here; only building a
//! context is, per server.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::join_all;
use mcp_common::{
    analyze_connection_error, is_auth_error, is_oauth_timeout, remediation_hint,
    should_reset_connection, CallResult, McpClientError,
};
use serde_json::Value;
use tokio::sync::Mutex;

use super::connection::{Connector, HttpMode, McpConnection, TransportConnector};
use super::types::{
    CallOptions, ConnectOptions, ListToolsOptions, ServerListing, ToolInfo,
};
use crate::config;
use crate::definition::{AuthMode, CommandSpec, ServerDefinition};
use crate::oauth::{
    connect_with_auth, read_cached_access_token, AuthSession, AuthSessionFactory,
    BrowserSessionFactory, DEFAULT_MAX_ATTEMPTS,
};

/// Name used in remediation hints
pub const BINARY_NAME: &str = "mcprt";

/// Upper bound on `tools/list` pages, in case a server repeats cursors
const MAX_TOOL_PAGES: usize = 100;

/// Operations shared by the direct runtime and the keep-alive wrapper
#[async_trait]
pub trait McpRuntime: Send + Sync {
    async fn list_tools(&self, server: &str, options: ListToolsOptions) -> Result<Vec<ToolInfo>>;

    async fn call_tool(&self, server: &str, tool: &str, options: CallOptions)
        -> Result<CallResult>;

    async fn list_resources(&self, server: &str, params: Option<Value>) -> Result<Value>;

    /// Close one server, or every server when `None`. Idempotent.
    async fn close(&self, server: Option<&str>) -> Result<()>;
}

/// A live connection and the definition that produced it
pub struct ClientContext {
    definition: ServerDefinition,
    connection: Box<dyn McpConnection>,
    session: Option<Arc<dyn AuthSession>>,
}

impl ClientContext {
    pub fn new(
        definition: ServerDefinition,
        connection: Box<dyn McpConnection>,
        session: Option<Arc<dyn AuthSession>>,
    ) -> Self {
        Self {
            definition,
            connection,
            session,
        }
    }

    /// The definition actually used, possibly promoted to OAuth
    pub fn definition(&self) -> &ServerDefinition {
        &self.definition
    }

    pub fn connection(&self) -> &dyn McpConnection {
        self.connection.as_ref()
    }

    async fn close(&self) {
        self.connection.close().await;
        if let Some(session) = &self.session {
            session.close().await;
        }
    }
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field("server", &self.definition.name)
            .field("auth", &self.definition.auth)
            .field("has_session", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

/// Tunables for [`Runtime`]
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub oauth_timeout: Duration,
    pub max_attempts: usize,
    pub call_timeout: Duration,
    /// Vault, legacy token directories, daemon files
    pub state_dir: PathBuf,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            oauth_timeout: config::oauth_timeout(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            call_timeout: config::call_timeout(),
            state_dir: config::state_dir(),
        }
    }
}

type ContextSlot = Arc<Mutex<Option<Arc<ClientContext>>>>;

pub struct Runtime {
    definitions: BTreeMap<String, ServerDefinition>,
    slots: std::sync::Mutex<HashMap<String, ContextSlot>>,
    connector: Arc<dyn Connector>,
    sessions: Arc<dyn AuthSessionFactory>,
    options: RuntimeOptions,
}

impl Runtime {
    pub fn new(definitions: impl IntoIterator<Item = ServerDefinition>) -> Self {
        let options = RuntimeOptions::default();
        Self {
            definitions: definitions
                .into_iter()
                .map(|d| (d.name.clone(), d))
                .collect(),
            slots: std::sync::Mutex::new(HashMap::new()),
            connector: Arc::new(TransportConnector::new()),
            sessions: Arc::new(BrowserSessionFactory::new(options.state_dir.clone())),
            options,
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_session_factory(mut self, sessions: Arc<dyn AuthSessionFactory>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn definitions(&self) -> impl Iterator<Item = &ServerDefinition> {
        self.definitions.values()
    }

    pub fn definition(&self, server: &str) -> Result<&ServerDefinition> {
        self.definitions
            .get(server)
            .ok_or_else(|| McpClientError::UnknownServer(server.to_string()).into())
    }

    fn slot(&self, server: &str) -> ContextSlot {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        slots.entry(server.to_string()).or_default().clone()
    }

    fn existing_slots(&self) -> Vec<(String, ContextSlot)> {
        let slots = self
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        slots.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Names of servers with a live cached connection
    pub async fn connected_servers(&self) -> Vec<String> {
        let mut names = Vec::new();
        for (name, slot) in self.existing_slots() {
            if slot.lock().await.is_some() {
                names.push(name);
            }
        }
        names.sort();
        names
    }

    /// Get the cached context or build a new one
    pub async fn connect(&self, server: &str, options: ConnectOptions) -> Result<Arc<ClientContext>> {
        let definition = self.definition(server)?.clone();
        self.connect_definition(definition, options).await
    }

    async fn connect_definition(
        &self,
        definition: ServerDefinition,
        options: ConnectOptions,
    ) -> Result<Arc<ClientContext>> {
        let slot = self.slot(&definition.name);
        let mut cached = slot.lock().await;
        if !options.force_reauth && !options.bypass_cache {
            if let Some(context) = cached.as_ref() {
                return Ok(context.clone());
            }
        }
        if let Some(previous) = cached.take() {
            previous.close().await;
        }
        let context = Arc::new(self.build_context(definition, options).await?);
        *cached = Some(context.clone());
        Ok(context)
    }

    async fn build_context(
        &self,
        definition: ServerDefinition,
        options: ConnectOptions,
    ) -> Result<ClientContext> {
        match &definition.command {
            CommandSpec::Stdio(_) => {
                let connection = self.connector.connect_stdio(&definition).await?;
                Ok(ClientContext::new(definition, connection, None))
            }
            CommandSpec::Http(_) => self.negotiate_http(definition, options).await,
        }
    }

    /// Connect over `mode`, spending connect attempts from `budget`
    async fn attempt(
        &self,
        definition: &ServerDefinition,
        mode: HttpMode,
        session: Option<&Arc<dyn AuthSession>>,
        budget: &mut usize,
    ) -> Result<Box<dyn McpConnection>> {
        let used = AtomicUsize::new(0);
        let result = connect_with_auth(
            &definition.name,
            session,
            self.options.oauth_timeout,
            *budget,
            || {
                used.fetch_add(1, Ordering::SeqCst);
                self.connector.connect_http(definition, mode, session.cloned())
            },
        )
        .await;
        *budget = budget.saturating_sub(used.into_inner());
        result
    }

    /// Streamable HTTP, then SSE, promoting to OAuth when the server asks
    ///
    /// Every connect made here, across promotion and both transports, comes
    /// out of one `max_attempts` budget. Only streamable HTTP may run the
    /// interactive authorization flow; SSE gets a single try with whatever
    /// credentials the session already holds.
    async fn negotiate_http(
        &self,
        mut definition: ServerDefinition,
        options: ConnectOptions,
    ) -> Result<ClientContext> {
        let mut budget = self.options.max_attempts.max(1);
        loop {
            let session = if definition.auth == AuthMode::OAuth && !options.non_interactive {
                Some(
                    self.sessions
                        .create(&definition, options.force_reauth)
                        .await?,
                )
            } else {
                None
            };

            let streamable_err = match self
                .attempt(&definition, HttpMode::Streamable, session.as_ref(), &mut budget)
                .await
            {
                Ok(connection) => return Ok(ClientContext::new(definition, connection, session)),
                Err(err) => err,
            };
            if is_oauth_timeout(&streamable_err) {
                close_session(&session).await;
                return Err(streamable_err);
            }
            let streamable_auth = is_auth_error(&streamable_err);
            if streamable_auth && !options.non_interactive && budget > 0 {
                if let Some(promoted) = definition.promote_to_oauth() {
                    tracing::info!(
                        "Server '{}' requires authorization; switching to OAuth",
                        definition.name
                    );
                    close_session(&session).await;
                    definition = promoted;
                    continue;
                }
            }

            let sse_budget = if streamable_auth && session.is_some() {
                budget.min(1)
            } else {
                budget
            };
            if sse_budget == 0 {
                close_session(&session).await;
                return Err(streamable_err);
            }
            tracing::debug!(
                "Streamable HTTP to '{}' failed ({}); trying SSE",
                definition.name,
                streamable_err
            );
            let mut sse_left = sse_budget;
            let sse_result = self
                .attempt(&definition, HttpMode::Sse, session.as_ref(), &mut sse_left)
                .await;
            budget -= sse_budget - sse_left;
            let sse_err = match sse_result {
                Ok(connection) => return Ok(ClientContext::new(definition, connection, session)),
                Err(err) => err,
            };
            close_session(&session).await;
            if is_oauth_timeout(&sse_err) {
                return Err(sse_err);
            }
            if is_auth_error(&sse_err) {
                if !options.non_interactive && budget > 0 {
                    if let Some(promoted) = definition.promote_to_oauth() {
                        definition = promoted;
                        continue;
                    }
                }
                return Err(sse_err);
            }
            if streamable_auth {
                return Err(streamable_err);
            }
            return Err(sse_err.context(format!(
                "failed to connect to '{}' (streamable HTTP: {})",
                definition.name, streamable_err
            )));
        }
    }

    /// Drop the cached context if it is still `context`
    async fn evict(&self, server: &str, context: &Arc<ClientContext>) {
        let slot = self.slot(server);
        let evicted = {
            let mut cached = slot.lock().await;
            match cached.as_ref() {
                Some(current) if Arc::ptr_eq(current, context) => cached.take(),
                _ => None,
            }
        };
        if let Some(evicted) = evicted {
            tracing::info!("Evicting connection to '{}'", server);
            evicted.close().await;
        }
    }

    async fn collect_tools(
        context: &ClientContext,
        include_schema: bool,
    ) -> Result<Vec<ToolInfo>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen = std::collections::HashSet::new();
        for _ in 0..MAX_TOOL_PAGES {
            let page = context.connection().list_tools(cursor.take()).await?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if seen.insert(next.clone()) => cursor = Some(next),
                Some(next) => {
                    tracing::warn!("Server repeated tools cursor '{}'; stopping", next);
                    break;
                }
                None => break,
            }
        }
        if !include_schema {
            tools = tools.into_iter().map(ToolInfo::without_schemas).collect();
        }
        Ok(tools)
    }

    /// Evict when the error leaves the connection unusable
    async fn settle<T>(
        &self,
        server: &str,
        context: &Arc<ClientContext>,
        result: Result<T>,
    ) -> Result<T> {
        if let Err(err) = &result {
            if should_reset_connection(err) {
                self.evict(server, context).await;
            }
        }
        result
    }

    /// Force a fresh authorization for an HTTP server
    pub async fn authorize(&self, server: &str) -> Result<()> {
        let definition = self.definition(server)?;
        if !definition.is_http() {
            anyhow::bail!("server '{}' is not an HTTP server", server);
        }
        let definition = definition
            .promote_to_oauth()
            .unwrap_or_else(|| definition.clone());
        self.connect_definition(
            definition,
            ConnectOptions {
                force_reauth: true,
                bypass_cache: true,
                non_interactive: false,
            },
        )
        .await?;
        Ok(())
    }

    /// Definition used by scans: cached bearer token injected, if any
    async fn scan_definition(&self, definition: &ServerDefinition) -> ServerDefinition {
        let mut scan = definition.clone();
        let CommandSpec::Http(http) = &mut scan.command else {
            return scan;
        };
        let has_auth = http
            .headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case("authorization"));
        if !has_auth {
            if let Some(token) = read_cached_access_token(definition, &self.options.state_dir).await
            {
                http.headers
                    .insert("Authorization".to_string(), format!("Bearer {token}"));
            }
        }
        scan
    }

    async fn scan_tools(&self, definition: &ServerDefinition) -> Result<Vec<ToolInfo>> {
        let slot = self.slot(&definition.name);
        let cached = slot.lock().await.clone();
        if let Some(context) = cached {
            let tools = Self::collect_tools(&context, false).await;
            return self.settle(&definition.name, &context, tools).await;
        }
        let scan = self.scan_definition(definition).await;
        let context = self
            .build_context(
                scan,
                ConnectOptions {
                    non_interactive: true,
                    ..Default::default()
                },
            )
            .await?;
        let tools = Self::collect_tools(&context, false).await;
        context.close().await;
        tools
    }

    async fn scan_one(&self, definition: &ServerDefinition) -> ServerListing {
        let name = definition.name.clone();
        let result = self.scan_tools(definition).await;

        match result {
            Ok(tools) => ServerListing {
                server: name,
                tools: Some(tools),
                issue: None,
                hint: None,
            },
            Err(err) => {
                let issue = analyze_connection_error(&err);
                let hint = remediation_hint(&issue, &name, BINARY_NAME);
                ServerListing {
                    server: name,
                    tools: None,
                    issue: Some(issue),
                    hint,
                }
            }
        }
    }

    /// List every configured server without ever starting an OAuth flow
    pub async fn list_all_tools(&self) -> Vec<ServerListing> {
        join_all(self.definitions.values().map(|d| self.scan_one(d))).await
    }
}

async fn close_session(session: &Option<Arc<dyn AuthSession>>) {
    if let Some(session) = session {
        session.close().await;
    }
}

#[async_trait]
impl McpRuntime for Runtime {
    async fn list_tools(&self, server: &str, options: ListToolsOptions) -> Result<Vec<ToolInfo>> {
        let context = self
            .connect(
                server,
                ConnectOptions {
                    non_interactive: !options.auto_authorize,
                    ..Default::default()
                },
            )
            .await?;
        let tools = Self::collect_tools(&context, options.include_schema).await;
        self.settle(server, &context, tools).await
    }

    async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        options: CallOptions,
    ) -> Result<CallResult> {
        let context = self.connect(server, ConnectOptions::default()).await?;
        let timeout = options.timeout.unwrap_or(self.options.call_timeout);
        let call = context
            .connection()
            .call_tool(tool, options.arguments, timeout);
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result.map(CallResult::new),
            Err(_) => Err(McpClientError::CallTimeout {
                server: server.to_string(),
                tool: tool.to_string(),
                timeout,
            }
            .into()),
        };
        self.settle(server, &context, result).await
    }

    async fn list_resources(&self, server: &str, params: Option<Value>) -> Result<Value> {
        let context = self.connect(server, ConnectOptions::default()).await?;
        let resources = context.connection().list_resources(params).await;
        self.settle(server, &context, resources).await
    }

    async fn close(&self, server: Option<&str>) -> Result<()> {
        let targets: Vec<(String, ContextSlot)> = match server {
            Some(name) => vec![(name.to_string(), self.slot(name))],
            None => self.existing_slots(),
        };
        for (name, slot) in targets {
            let context = slot.lock().await.take();
            if let Some(context) = context {
                tracing::debug!("Closing connection to '{}'", name);
                context.close().await;
            }
        }
        Ok(())
    }
}
