//! CLI module for mcprt
//!
//! Contains argument parsing for the binary; the work happens in
//! [`crate::handlers`].

mod args;
mod daemon_args;

pub use args::{Cli, Commands, OutputFormat};
pub use daemon_args::DaemonCommands;
