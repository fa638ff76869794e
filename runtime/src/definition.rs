//! Server definitions
//!
//! A [`ServerDefinition`] is the immutable description of how to reach one
//! named MCP server. Definitions never change in place: switching a server to
//! OAuth after a 401 produces a new definition via
//! [`ServerDefinition::promote_to_oauth`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

/// How to start or reach the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CommandSpec {
    /// Spawn a local process and speak MCP over its stdin/stdout
    Stdio(StdioCommand),
    /// Connect to a remote endpoint (streamable HTTP, SSE fallback)
    Http(HttpCommand),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StdioCommand {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpCommand {
    pub url: String,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    None,
    OAuth,
}

/// Whether the server is kept warm by the daemon between invocations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum Lifecycle {
    #[default]
    Ephemeral,
    KeepAlive {
        #[serde(rename = "idleTimeoutMs", skip_serializing_if = "Option::is_none")]
        idle_timeout_ms: Option<u64>,
    },
}

impl Lifecycle {
    pub fn is_keep_alive(&self) -> bool {
        matches!(self, Lifecycle::KeepAlive { .. })
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        match self {
            Lifecycle::KeepAlive { idle_timeout_ms } => {
                idle_timeout_ms.map(Duration::from_millis)
            }
            Lifecycle::Ephemeral => None,
        }
    }
}

/// Where a definition came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSource {
    pub kind: SourceKind,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Global,
    Project,
    Explicit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDefinition {
    pub name: String,
    pub command: CommandSpec,
    pub env: BTreeMap<String, String>,
    pub auth: AuthMode,
    pub token_cache_dir: Option<PathBuf>,
    pub lifecycle: Lifecycle,
    pub source: Option<ServerSource>,
}

impl ServerDefinition {
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command: CommandSpec::Stdio(StdioCommand {
                command: command.into(),
                args,
                working_dir: None,
            }),
            env: BTreeMap::new(),
            auth: AuthMode::None,
            token_cache_dir: None,
            lifecycle: Lifecycle::Ephemeral,
            source: None,
        }
    }

    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: CommandSpec::Http(HttpCommand {
                url: url.into(),
                headers: BTreeMap::new(),
            }),
            env: BTreeMap::new(),
            auth: AuthMode::None,
            token_cache_dir: None,
            lifecycle: Lifecycle::Ephemeral,
            source: None,
        }
    }

    pub fn with_auth(mut self, auth: AuthMode) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn is_http(&self) -> bool {
        matches!(self.command, CommandSpec::Http(_))
    }

    pub fn is_keep_alive(&self) -> bool {
        self.lifecycle.is_keep_alive()
    }

    /// Switch an unauthenticated HTTP server to OAuth
    ///
    /// Returns `None` when nothing would change (stdio servers, or servers
    /// already using OAuth), which is what terminates the negotiation loop.
    pub fn promote_to_oauth(&self) -> Option<ServerDefinition> {
        if !self.is_http() || self.auth == AuthMode::OAuth {
            return None;
        }
        Some(Self {
            auth: AuthMode::OAuth,
            ..self.clone()
        })
    }

    /// Stable identity used for vault keys: name plus target
    pub fn identity(&self) -> serde_json::Value {
        match &self.command {
            CommandSpec::Http(http) => serde_json::json!({
                "name": self.name,
                "url": http.url,
            }),
            CommandSpec::Stdio(stdio) => serde_json::json!({
                "name": self.name,
                "command": stdio.command,
                "args": stdio.args,
            }),
        }
    }
}

// ============================================================================
// Lifecycle resolution
// ============================================================================

/// Commands known to be expensive to start and safe to keep warm
const KEEP_ALIVE_SIGNATURES: &[&str] = &[
    "chrome-devtools-mcp",
    "@playwright/mcp",
    "playwright-mcp",
    "mobile-mcp",
    "xcodebuildmcp",
    "serena",
];

pub const KEEPALIVE_ENV: &str = "MCP_RUNTIME_KEEPALIVE";
pub const DISABLE_KEEPALIVE_ENV: &str = "MCP_RUNTIME_DISABLE_KEEPALIVE";

fn env_list_contains(value: Option<&str>, name: &str) -> bool {
    value.is_some_and(|v| {
        v.split(',')
            .map(str::trim)
            .any(|entry| entry == "*" || entry.eq_ignore_ascii_case(name))
    })
}

/// True when the URL still carries a `${VAR}`-style placeholder
pub fn has_placeholder(value: &str) -> bool {
    value.contains("${") || value.contains("$env:")
}

fn matches_signature(command: &CommandSpec) -> bool {
    let CommandSpec::Stdio(stdio) = command else {
        return false;
    };
    std::iter::once(&stdio.command)
        .chain(stdio.args.iter())
        .any(|part| {
            let part = part.to_lowercase();
            KEEP_ALIVE_SIGNATURES
                .iter()
                .any(|signature| part.contains(signature))
        })
}

/// Resolve the effective lifecycle for a server
///
/// Order: disable-env, enable-env, explicit config, then the signature
/// allow-list. HTTP targets with placeholders are always ephemeral.
pub fn resolve_lifecycle(
    name: &str,
    command: &CommandSpec,
    explicit: Option<Lifecycle>,
    keep_alive_env: Option<&str>,
    disable_env: Option<&str>,
) -> Lifecycle {
    if let CommandSpec::Http(http) = command {
        if has_placeholder(&http.url) {
            return Lifecycle::Ephemeral;
        }
    }
    if env_list_contains(disable_env, name) {
        return Lifecycle::Ephemeral;
    }
    if env_list_contains(keep_alive_env, name) {
        return match explicit {
            Some(lifecycle @ Lifecycle::KeepAlive { .. }) => lifecycle,
            _ => Lifecycle::KeepAlive {
                idle_timeout_ms: None,
            },
        };
    }
    if let Some(lifecycle) = explicit {
        return lifecycle;
    }
    if matches_signature(command) {
        return Lifecycle::KeepAlive {
            idle_timeout_ms: None,
        };
    }
    Lifecycle::Ephemeral
}
