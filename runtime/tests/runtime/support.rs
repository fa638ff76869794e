//! In-memory fakes for the transport and authorization seams

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use mcp_common::McpClientError;
use mcp_runtime::definition::{AuthMode, CommandSpec, ServerDefinition};
use mcp_runtime::mcp::{
    Connector, HttpMode, McpConnection, Runtime, RuntimeOptions, ToolInfo, ToolPage,
};
use mcp_runtime::oauth::{AuthSession, AuthSessionFactory, AuthStep};
use serde_json::{json, Value};

/// One connect attempt seen by [`FakeConnector`]
#[derive(Debug, Clone)]
pub struct HttpAttempt {
    pub server: String,
    pub mode: HttpMode,
    pub auth: AuthMode,
    pub bearer: Option<String>,
}

/// Counts spawns and closes; HTTP servers accept any bearer token
#[derive(Default)]
pub struct FakeConnector {
    pub spawns: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
    /// Returned by upcoming `call_tool`s, across connections
    pub call_failures: Arc<Mutex<VecDeque<McpClientError>>>,
    /// Calls never answer while set
    pub hang_calls: Arc<AtomicBool>,
    /// Stdio servers whose command does not exist
    pub missing_commands: Mutex<Vec<String>>,
    pub http_attempts: Mutex<Vec<HttpAttempt>>,
    /// `start:<server>/<tool>` and `end:<server>/<tool>`, in order
    pub call_log: Arc<Mutex<Vec<String>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn fail_next_call(&self, err: McpClientError) {
        self.call_failures
            .lock()
            .expect("failures lock")
            .push_back(err);
    }

    pub fn attempts(&self) -> Vec<HttpAttempt> {
        self.http_attempts.lock().expect("attempts lock").clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.call_log.lock().expect("log lock").clone()
    }

    pub fn logged(&self, entry: &str) -> bool {
        self.call_log
            .lock()
            .expect("log lock")
            .iter()
            .any(|e| e == entry)
    }

    fn connection(&self, server: &str) -> Box<dyn McpConnection> {
        Box::new(FakeConnection {
            server: server.to_string(),
            log: self.call_log.clone(),
            closed: AtomicBool::new(false),
            closes: self.closes.clone(),
            failures: self.call_failures.clone(),
            hang: self.hang_calls.clone(),
        })
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect_stdio(&self, definition: &ServerDefinition) -> Result<Box<dyn McpConnection>> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        let missing = self
            .missing_commands
            .lock()
            .expect("missing lock")
            .contains(&definition.name);
        if missing {
            return Err(McpClientError::Transport(format!(
                "failed to spawn '{}': No such file or directory (os error 2)",
                definition.name
            ))
            .into());
        }
        Ok(self.connection(&definition.name))
    }

    async fn connect_http(
        &self,
        definition: &ServerDefinition,
        mode: HttpMode,
        session: Option<Arc<dyn AuthSession>>,
    ) -> Result<Box<dyn McpConnection>> {
        let from_session = match &session {
            Some(session) => session.access_token().await,
            None => None,
        };
        let from_header = match &definition.command {
            CommandSpec::Http(http) => http
                .headers
                .get("Authorization")
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string),
            CommandSpec::Stdio(_) => None,
        };
        let bearer = from_session.or(from_header);
        self.http_attempts
            .lock()
            .expect("attempts lock")
            .push(HttpAttempt {
                server: definition.name.clone(),
                mode,
                auth: definition.auth,
                bearer: bearer.clone(),
            });
        match bearer {
            Some(_) => Ok(self.connection(&definition.name)),
            None => Err(McpClientError::http(401, "missing bearer token").into()),
        }
    }
}

struct FakeConnection {
    server: String,
    log: Arc<Mutex<Vec<String>>>,
    closed: AtomicBool,
    closes: Arc<AtomicUsize>,
    failures: Arc<Mutex<VecDeque<McpClientError>>>,
    hang: Arc<AtomicBool>,
}

#[async_trait]
impl McpConnection for FakeConnection {
    async fn list_tools(&self, cursor: Option<String>) -> Result<ToolPage> {
        let tool = |name: &str| ToolInfo {
            name: name.to_string(),
            description: Some(format!("{name} a file")),
            input_schema: Some(json!({"type": "object"})),
            output_schema: None,
        };
        Ok(match cursor.as_deref() {
            None => ToolPage {
                tools: vec![tool("read")],
                next_cursor: Some("page-2".to_string()),
            },
            Some(_) => ToolPage {
                tools: vec![tool("write")],
                next_cursor: None,
            },
        })
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        _timeout: Duration,
    ) -> Result<Value> {
        let failure = self.failures.lock().expect("failures lock").pop_front();
        if let Some(err) = failure {
            return Err(err.into());
        }
        let entry = format!("{}/{name}", self.server);
        self.log
            .lock()
            .expect("log lock")
            .push(format!("start:{entry}"));
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        // Tools named `slow*` take a while
        if name.starts_with("slow") {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        self.log.lock().expect("log lock").push(format!("end:{entry}"));
        Ok(json!({
            "content": [{"type": "text", "text": format!("{name}:{}", arguments.unwrap_or(Value::Null))}]
        }))
    }

    async fn list_resources(&self, _params: Option<Value>) -> Result<Value> {
        Ok(json!({"resources": [{"uri": "file:///a", "name": "a"}]}))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Sessions that grant a token after one consent, or never
pub struct FakeSession {
    token: Mutex<Option<String>>,
    grant: bool,
    time_out: bool,
    pub begins: AtomicUsize,
    pub finishes: AtomicUsize,
}

#[async_trait]
impl AuthSession for FakeSession {
    async fn access_token(&self) -> Option<String> {
        self.token.lock().expect("token lock").clone()
    }

    async fn begin_authorization(&self) -> Result<AuthStep> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        Ok(AuthStep::AwaitingCode)
    }

    async fn wait_for_authorization_code(&self, timeout: Duration) -> Result<String> {
        if self.time_out {
            return Err(McpClientError::OAuthTimeout {
                server: "fake".to_string(),
                timeout,
            }
            .into());
        }
        Ok("code".to_string())
    }

    async fn finish_auth(&self, _code: &str) -> Result<()> {
        self.finishes.fetch_add(1, Ordering::SeqCst);
        if self.grant {
            *self.token.lock().expect("token lock") = Some("granted".to_string());
        }
        Ok(())
    }

    async fn close(&self) {}
}

#[derive(Default)]
pub struct FakeSessionFactory {
    pub grant: bool,
    pub time_out: bool,
    pub sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeSessionFactory {
    pub fn granting() -> Arc<Self> {
        Arc::new(Self {
            grant: true,
            ..Default::default()
        })
    }

    pub fn refusing() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn timing_out() -> Arc<Self> {
        Arc::new(Self {
            time_out: true,
            ..Default::default()
        })
    }

    pub fn created(&self) -> usize {
        self.sessions.lock().expect("sessions lock").len()
    }

    pub fn begins(&self) -> usize {
        self.sessions
            .lock()
            .expect("sessions lock")
            .iter()
            .map(|s| s.begins.load(Ordering::SeqCst))
            .sum()
    }
}

#[async_trait]
impl AuthSessionFactory for FakeSessionFactory {
    async fn create(
        &self,
        _definition: &ServerDefinition,
        _force_reauth: bool,
    ) -> Result<Arc<dyn AuthSession>> {
        let session = Arc::new(FakeSession {
            token: Mutex::new(None),
            grant: self.grant,
            time_out: self.time_out,
            begins: AtomicUsize::new(0),
            finishes: AtomicUsize::new(0),
        });
        self.sessions
            .lock()
            .expect("sessions lock")
            .push(session.clone());
        Ok(session)
    }
}

pub fn options(state_dir: &Path) -> RuntimeOptions {
    RuntimeOptions {
        oauth_timeout: Duration::from_secs(1),
        max_attempts: 3,
        call_timeout: Duration::from_secs(5),
        state_dir: state_dir.to_path_buf(),
    }
}

pub fn runtime(
    definitions: Vec<ServerDefinition>,
    connector: Arc<FakeConnector>,
    sessions: Arc<FakeSessionFactory>,
    state_dir: &Path,
) -> Runtime {
    Runtime::new(definitions)
        .with_connector(connector)
        .with_session_factory(sessions)
        .with_options(options(state_dir))
}

pub fn files_server() -> ServerDefinition {
    ServerDefinition::stdio("files", "files-mcp", vec!["--root".to_string(), ".".to_string()])
}

/// Poll `done` until it holds or two seconds pass
pub async fn wait_until(done: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    done()
}
