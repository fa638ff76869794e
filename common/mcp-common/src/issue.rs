//! Connection issue classification
//!
//! Turns a raw error into a [`ConnectionIssue`]. The classification, not the
//! concrete error type, decides whether a cached connection is evicted,
//! whether the daemon restarts a server, and which hint a user sees.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{find_client_error, McpClientError};

/// Coarse category of a connection failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueKind {
    Auth,
    Offline,
    Http,
    StdioExit,
    Other,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::Auth => "auth",
            IssueKind::Offline => "offline",
            IssueKind::Http => "http",
            IssueKind::StdioExit => "stdio-exit",
            IssueKind::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "auth" => Some(IssueKind::Auth),
            "offline" => Some(IssueKind::Offline),
            "http" => Some(IssueKind::Http),
            "stdio-exit" => Some(IssueKind::StdioExit),
            "other" => Some(IssueKind::Other),
            _ => None,
        }
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of one failed operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionIssue {
    pub kind: IssueKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    pub raw_message: String,
}

impl ConnectionIssue {
    fn new(kind: IssueKind, raw_message: String) -> Self {
        Self {
            kind,
            status_code: None,
            exit_code: None,
            signal: None,
            raw_message,
        }
    }

    fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }
}

const AUTH_STATUSES: [u16; 3] = [401, 403, 405];

const AUTH_TOKENS: [&str; 5] = [
    "unauthorized",
    "forbidden",
    "invalid_token",
    "invalid token",
    "oauth authorization",
];

const OFFLINE_TOKENS: [&str; 17] = [
    "econnrefused",
    "connection refused",
    "enotfound",
    "dns error",
    "failed to lookup address",
    "name or service not known",
    "etimedout",
    "timed out",
    "econnreset",
    "connection reset",
    "socket hang up",
    "broken pipe",
    "connection closed",
    "transport closed",
    "enoent",
    "no such file or directory",
    "network error",
];

fn status_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:http|status(?:\s*code)?)[\s:=(]*([45]\d\d)\b")
            .unwrap_or_else(|e| panic!("invalid status pattern: {e}"))
    })
}

fn exit_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)exit(?:ed)?(?:\s+with)?\s+code[\s:=]*(-?\d+)")
            .unwrap_or_else(|e| panic!("invalid exit pattern: {e}"))
    })
}

fn signal_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)signal[\s:=]*(SIG[A-Z]+)")
            .unwrap_or_else(|e| panic!("invalid signal pattern: {e}"))
    })
}

fn flatten_message(err: &anyhow::Error) -> String {
    err.chain()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}

fn classify_status(status: u16, message: String) -> ConnectionIssue {
    let kind = if AUTH_STATUSES.contains(&status) {
        IssueKind::Auth
    } else {
        IssueKind::Http
    };
    ConnectionIssue::new(kind, message).with_status(status)
}

/// Classify an error into a [`ConnectionIssue`]
pub fn analyze_connection_error(err: &anyhow::Error) -> ConnectionIssue {
    let message = flatten_message(err);

    if let Some(typed) = find_client_error(err) {
        match typed {
            McpClientError::Http { status, .. } => return classify_status(*status, message),
            McpClientError::OAuthTimeout { .. } => {
                return ConnectionIssue::new(IssueKind::Auth, message)
            }
            McpClientError::StdioExit { code, signal } => {
                let mut issue = ConnectionIssue::new(IssueKind::StdioExit, message);
                issue.exit_code = *code;
                issue.signal = signal.clone();
                return issue;
            }
            McpClientError::Network(_)
            | McpClientError::CallTimeout { .. }
            | McpClientError::DaemonUnreachable { .. } => {
                return ConnectionIssue::new(IssueKind::Offline, message)
            }
            McpClientError::Daemon { code, .. } => {
                if let Some(kind) = IssueKind::parse(code) {
                    return ConnectionIssue::new(kind, message);
                }
            }
            McpClientError::Rpc { .. } | McpClientError::UnknownServer(_) => {
                return ConnectionIssue::new(IssueKind::Other, message)
            }
            McpClientError::Transport(_) => {}
        }
    }

    classify_message(message)
}

fn classify_message(message: String) -> ConnectionIssue {
    let lower = message.to_lowercase();

    if let Some(status) = status_regex()
        .captures(&message)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u16>().ok())
    {
        return classify_status(status, message);
    }

    if AUTH_TOKENS.iter().any(|t| lower.contains(t)) {
        return ConnectionIssue::new(IssueKind::Auth, message);
    }

    let exit_code = exit_regex()
        .captures(&message)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<i32>().ok());
    let signal = signal_regex()
        .captures(&message)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_uppercase());
    if exit_code.is_some() || signal.is_some() {
        let mut issue = ConnectionIssue::new(IssueKind::StdioExit, message);
        issue.exit_code = exit_code;
        issue.signal = signal;
        return issue;
    }

    if OFFLINE_TOKENS.iter().any(|t| lower.contains(t)) {
        return ConnectionIssue::new(IssueKind::Offline, message);
    }

    ConnectionIssue::new(IssueKind::Other, message)
}

/// True for 401/403/405-class failures
pub fn is_auth_error(err: &anyhow::Error) -> bool {
    analyze_connection_error(err).kind == IssueKind::Auth
}

/// True for the terminal OAuth consent timeout
pub fn is_oauth_timeout(err: &anyhow::Error) -> bool {
    matches!(
        find_client_error(err),
        Some(McpClientError::OAuthTimeout { .. })
    )
}

/// Whether a failed call leaves the connection unusable
///
/// Malformed-request errors (invalid params, unknown method) never count:
/// reconnecting cannot fix a caller mistake.
pub fn should_reset_connection(err: &anyhow::Error) -> bool {
    if let Some(typed) = find_client_error(err) {
        if typed.is_request_error() {
            return false;
        }
        if matches!(typed, McpClientError::CallTimeout { .. }) {
            return true;
        }
    }
    matches!(
        analyze_connection_error(err).kind,
        IssueKind::Offline | IssueKind::StdioExit
    )
}

/// A user-facing hint for a classified failure
pub fn remediation_hint(issue: &ConnectionIssue, server: &str, binary: &str) -> Option<String> {
    match issue.kind {
        IssueKind::Auth => Some(format!(
            "Authorization required. Run `{binary} auth {server}` to sign in again."
        )),
        IssueKind::Offline => Some(format!(
            "Server '{server}' appears offline or unreachable; credentials are not the problem."
        )),
        IssueKind::StdioExit => Some(match (issue.exit_code, issue.signal.as_deref()) {
            (Some(code), _) => format!("Server '{server}' exited with code {code}. Check its command and logs."),
            (None, Some(signal)) => format!("Server '{server}' was terminated by {signal}."),
            (None, None) => format!("Server '{server}' exited unexpectedly."),
        }),
        IssueKind::Http => issue
            .status_code
            .map(|status| format!("Server '{server}' responded with HTTP {status}.")),
        IssueKind::Other => None,
    }
}
