//! MCP client side: transports, process lifecycle, and the orchestrator
//!
//! [`Runtime`] connects to servers described by
//! [`ServerDefinition`](crate::definition::ServerDefinition)s and caches one
//! connection per server. [`KeepAliveRuntime`] sends keep-alive servers
//! through the daemon instead.

mod connection;
mod http;
mod keep_alive;
pub mod process;
mod runtime;
mod sse;
mod stdio;
mod types;

pub use connection::{Connector, HttpMode, McpConnection, TransportConnector};
pub use http::{SseConnection, StreamableConnection, SESSION_HEADER};
pub use keep_alive::KeepAliveRuntime;
pub use process::{terminate_tree, TerminationOutcome, TerminationPlan};
pub use runtime::{ClientContext, McpRuntime, Runtime, RuntimeOptions, BINARY_NAME};
pub use sse::SseFrame;
pub use stdio::StdioConnection;
pub use types::{
    CallOptions, ConnectOptions, ListToolsOptions, ServerListing, ToolInfo, ToolPage,
};
