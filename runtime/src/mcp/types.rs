//! MCP type definitions
//!
//! Shared types used across the direct runtime, the daemon, and the
//! keep-alive wrapper.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool exposed by an MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    /// Tool name
    pub name: String,
    /// Tool description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Input schema (JSON)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    /// Output schema (JSON)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

impl ToolInfo {
    /// Read a tool descriptor from its wire form
    pub fn from_wire(value: &Value) -> Option<Self> {
        let name = value.get("name")?.as_str()?.to_string();
        let non_null = |key: &str| value.get(key).filter(|v| !v.is_null()).cloned();
        Some(Self {
            name,
            description: value
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            input_schema: non_null("inputSchema"),
            output_schema: non_null("outputSchema"),
        })
    }

    pub fn without_schemas(mut self) -> Self {
        self.input_schema = None;
        self.output_schema = None;
        self
    }
}

/// One page of a `tools/list` response
#[derive(Debug, Clone, Default)]
pub struct ToolPage {
    pub tools: Vec<ToolInfo>,
    pub next_cursor: Option<String>,
}

impl ToolPage {
    pub fn from_wire(value: &Value) -> Self {
        let tools = value
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| tools.iter().filter_map(ToolInfo::from_wire).collect())
            .unwrap_or_default();
        let next_cursor = value
            .get("nextCursor")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        Self { tools, next_cursor }
    }
}

/// Options for `connect`
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOptions {
    /// Ignore cached tokens and run the authorization flow again
    pub force_reauth: bool,
    /// Build a fresh connection even if one is cached
    pub bypass_cache: bool,
    /// Allow an interactive OAuth flow; scans set this to false
    pub non_interactive: bool,
}

/// Options for `list_tools`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsOptions {
    /// Include input/output schemas in the descriptors
    pub include_schema: bool,
    /// Allow an interactive OAuth flow when the server demands it
    pub auto_authorize: bool,
}

impl Default for ListToolsOptions {
    fn default() -> Self {
        Self {
            include_schema: true,
            auto_authorize: true,
        }
    }
}

/// Options for `call_tool`
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Tool arguments (a JSON object)
    pub arguments: Option<Value>,
    /// Overrides the default call timeout
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn with_arguments(arguments: Value) -> Self {
        Self {
            arguments: Some(arguments),
            timeout: None,
        }
    }
}

/// Outcome of listing one server during a scan
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerListing {
    pub server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue: Option<mcp_common::ConnectionIssue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_page_from_wire() {
        let page = ToolPage::from_wire(&json!({
            "tools": [
                {"name": "read", "description": "Read a file", "inputSchema": {"type": "object"}},
                {"description": "nameless tools are skipped"},
                {"name": "write", "outputSchema": null}
            ],
            "nextCursor": "page-2"
        }));
        assert_eq!(page.tools.len(), 2);
        assert_eq!(page.tools[0].name, "read");
        assert!(page.tools[0].input_schema.is_some());
        assert!(page.tools[1].output_schema.is_none());
        assert_eq!(page.next_cursor.as_deref(), Some("page-2"));
    }

    #[test]
    fn test_empty_cursor_ends_pagination() {
        let page = ToolPage::from_wire(&json!({"tools": [], "nextCursor": ""}));
        assert!(page.next_cursor.is_none());
    }
}
