//! Typed errors raised by MCP client transports
//!
//! Everything above the transport layer propagates `anyhow::Error`; these
//! variants sit at the bottom of the chain so classification can recover
//! status codes, exit codes, and JSON-RPC codes without parsing messages.

use std::time::Duration;

use thiserror::Error;

/// JSON-RPC "invalid request" error code
pub const INVALID_REQUEST: i64 = -32600;
/// JSON-RPC "method not found" error code
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC "invalid params" error code
pub const INVALID_PARAMS: i64 = -32602;

/// Errors produced while talking to an MCP server or to the keep-alive daemon
#[derive(Error, Debug)]
pub enum McpClientError {
    /// The server answered with a non-success HTTP status
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Truncated response body
        body: String,
    },

    /// Network-level failure (connect refused, DNS, reset, timeout)
    #[error("network error: {0}")]
    Network(String),

    /// The server returned a JSON-RPC error object
    #[error("JSON-RPC error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code
        code: i64,
        /// Error message from the server
        message: String,
    },

    /// The stdio server process exited
    #[error("{}", describe_exit(*.code, .signal.as_deref()))]
    StdioExit {
        /// Exit code, when the process exited normally
        code: Option<i32>,
        /// Terminating signal name, when killed by a signal
        signal: Option<String>,
    },

    /// Any other transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// The browser authorization flow did not complete in time
    #[error("OAuth authorization for '{server}' timed out after {}s", .timeout.as_secs())]
    OAuthTimeout {
        /// Server being authorized
        server: String,
        /// Configured wait
        timeout: Duration,
    },

    /// A tool call exceeded its timeout
    #[error("call to '{server}.{tool}' timed out after {}ms", .timeout.as_millis())]
    CallTimeout {
        /// Server name
        server: String,
        /// Tool name
        tool: String,
        /// Configured timeout
        timeout: Duration,
    },

    /// The daemon processed the request and reported a failure
    #[error("{message}")]
    Daemon {
        /// Machine-readable code (an issue kind or `rpc:<code>`)
        code: String,
        /// Human-readable message
        message: String,
    },

    /// The daemon socket could not be reached
    #[error("daemon unreachable: {message}")]
    DaemonUnreachable {
        /// What went wrong
        message: String,
        /// Underlying I/O error kind
        kind: std::io::ErrorKind,
    },

    /// No server with this name is configured
    #[error("unknown MCP server '{0}'")]
    UnknownServer(String),
}

fn describe_exit(code: Option<i32>, signal: Option<&str>) -> String {
    match (code, signal) {
        (Some(code), _) => format!("server process exited with code {code}"),
        (None, Some(signal)) => format!("server process terminated by signal {signal}"),
        (None, None) => "server process exited".to_string(),
    }
}

impl McpClientError {
    /// Build an HTTP error, keeping only a short preview of the body
    pub fn http(status: u16, body: &str) -> Self {
        const PREVIEW: usize = 512;
        let body = if body.len() > PREVIEW {
            let mut end = PREVIEW;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}…", &body[..end])
        } else {
            body.to_string()
        };
        Self::Http { status, body }
    }

    /// True for JSON-RPC errors that describe a malformed request rather than
    /// a broken transport
    pub fn is_request_error(&self) -> bool {
        match self {
            Self::Rpc { code, .. } => {
                matches!(*code, INVALID_PARAMS | METHOD_NOT_FOUND | INVALID_REQUEST)
            }
            Self::Daemon { code, .. } => code.starts_with("rpc:"),
            _ => false,
        }
    }
}

/// Find the first [`McpClientError`] in an error chain
pub fn find_client_error(err: &anyhow::Error) -> Option<&McpClientError> {
    err.chain().find_map(|e| e.downcast_ref::<McpClientError>())
}
