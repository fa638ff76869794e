//! MCP client runtime
//!
//! Connects to Model Context Protocol servers over stdio, streamable HTTP,
//! or SSE; handles OAuth for remote servers; tears down spawned process
//! trees; and keeps expensive servers warm in a per-configuration daemon.
//!
//! - [`mcp::Runtime`]: connection orchestrator with one cached connection
//!   per server
//! - [`mcp::KeepAliveRuntime`]: routes keep-alive servers to the daemon
//! - [`oauth`]: token persistence and the browser authorization flow
//! - [`daemon`]: socket protocol, client, and host
//! - [`config`] / [`definition`]: where server definitions come from

pub mod cli;
pub mod config;
pub mod daemon;
pub mod definition;
pub mod handlers;
pub mod mcp;
pub mod oauth;

pub use definition::{AuthMode, CommandSpec, Lifecycle, ServerDefinition};
pub use mcp::{KeepAliveRuntime, McpRuntime, Runtime};
