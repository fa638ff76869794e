//! MCP Common - Shared utilities for MCP clients
//!
//! This crate provides the pieces every layer of the client runtime agrees on:
//!
//! - **Errors**: [`McpClientError`], the typed bottom of every error chain
//! - **Classification**: [`analyze_connection_error`] turns any error into a
//!   [`ConnectionIssue`] (`auth`, `offline`, `http`, `stdio-exit`, `other`)
//! - **Results**: [`CallResult`] accessors over raw `tools/call` responses
//! - **Initialization**: [`init_tracing`] for the CLI and the daemon
//!
//! # Example
//!
//! ```rust,ignore
//! use mcp_common::{analyze_connection_error, remediation_hint, CallResult};
//!
//! match runtime.call_tool("files", "read", options).await {
//!     Ok(result) => println!("{}", result.text().unwrap_or_default()),
//!     Err(err) => {
//!         let issue = analyze_connection_error(&err);
//!         if let Some(hint) = remediation_hint(&issue, "files", "mcprt") {
//!             eprintln!("{hint}");
//!         }
//!     }
//! }
//! ```

pub mod error;
pub mod init;
pub mod issue;
pub mod result;

// Re-export commonly used items at crate root
pub use error::{
    find_client_error, McpClientError, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND,
};
pub use init::init_tracing;
pub use issue::{
    analyze_connection_error, is_auth_error, is_oauth_timeout, remediation_hint,
    should_reset_connection, ConnectionIssue, IssueKind,
};
pub use result::CallResult;
