//! Wire format between the keep-alive client and the daemon
//!
//! One request per socket connection: the client writes a JSON object and
//! shuts down its write half, the daemon answers with one JSON object and
//! closes the stream.

use mcp_common::{analyze_connection_error, find_client_error, McpClientError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const METHOD_CALL_TOOL: &str = "callTool";
pub const METHOD_LIST_TOOLS: &str = "listTools";
pub const METHOD_LIST_RESOURCES: &str = "listResources";
pub const METHOD_CLOSE_SERVER: &str = "closeServer";
pub const METHOD_STATUS: &str = "status";
pub const METHOD_STOP: &str = "stop";

/// Largest request or response the daemon will read
pub const MAX_MESSAGE_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl DaemonRequest {
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonError {
    pub message: String,
    /// Issue kind (`auth`, `offline`, ...) or `rpc:<code>` for request errors
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DaemonError>,
}

impl DaemonResponse {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, err: &anyhow::Error) -> Self {
        Self {
            id: id.into(),
            ok: false,
            result: None,
            error: Some(DaemonError {
                message: format!("{err:#}"),
                code: error_code(err),
            }),
        }
    }

    /// Turn the envelope back into a result for the caller
    pub fn into_result(self) -> anyhow::Result<Value> {
        if self.ok {
            return Ok(self.result.unwrap_or(Value::Null));
        }
        let error = self.error.unwrap_or_else(|| DaemonError {
            message: "daemon returned an error without details".to_string(),
            code: "other".to_string(),
        });
        Err(McpClientError::Daemon {
            code: error.code,
            message: error.message,
        }
        .into())
    }
}

/// Code carried across the socket so the client can classify the failure
pub fn error_code(err: &anyhow::Error) -> String {
    match find_client_error(err) {
        Some(typed @ McpClientError::Rpc { code, .. }) if typed.is_request_error() => {
            format!("rpc:{code}")
        }
        Some(McpClientError::Daemon { code, .. }) => code.clone(),
        _ => analyze_connection_error(err).kind.as_str().to_string(),
    }
}

// ============================================================================
// Params
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolParams {
    pub server: String,
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsParams {
    pub server: String,
    #[serde(default = "default_true")]
    pub include_schema: bool,
    #[serde(default = "default_true")]
    pub auto_authorize: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResourcesParams {
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerParams {
    pub server: String,
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub name: String,
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatus {
    pub pid: u32,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub config_path: std::path::PathBuf,
    pub servers: Vec<ServerStatus>,
}
