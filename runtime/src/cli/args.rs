//! CLI argument definitions
//!
//! Contains the main CLI struct and Commands enum for clap parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use super::daemon_args::DaemonCommands;
use crate::oauth::ClearScope;

#[derive(Parser, Debug)]
#[command(name = "mcprt")]
#[command(about = "Call MCP servers over stdio or HTTP, with OAuth and a keep-alive daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file to use instead of the global and project .mcp.json
    #[arg(long, env = "MCP_RUNTIME_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Directory the project config search starts from (default: current)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Text content, falling back to JSON
    #[default]
    Text,
    /// Structured content or parsed JSON text
    Json,
    /// Markdown content, falling back to text
    Markdown,
    /// The raw tools/call result
    Raw,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List tools of one server, or scan every configured server
    List {
        /// Only list tools from this server
        server: Option<String>,
        /// Include input and output schemas
        #[arg(long)]
        schema: bool,
        /// Print JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
    /// Call a tool
    Call {
        /// Server name
        server: String,
        /// Tool name
        tool: String,
        /// Arguments as a JSON object
        #[arg(long, short)]
        args: Option<String>,
        /// Call timeout in milliseconds
        #[arg(long, env = "MCP_RUNTIME_CALL_TIMEOUT_MS")]
        timeout_ms: Option<u64>,
        /// How to print the result
        #[arg(long, short, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },
    /// List resources of a server
    Resources {
        /// Server name
        server: String,
    },
    /// Sign in to an HTTP server again, discarding cached tokens
    Auth {
        /// Server name
        server: String,
    },
    /// Remove cached OAuth credentials of a server
    Logout {
        /// Server name
        server: String,
        /// What to remove
        #[arg(long, value_enum, default_value_t = ClearScope::All)]
        scope: ClearScope,
    },
    /// Manage the keep-alive daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },
}
