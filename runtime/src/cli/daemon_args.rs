//! Daemon subcommands
//!
//! Commands for managing the keep-alive daemon of the current configuration.

use clap::Subcommand;

#[derive(Subcommand, Debug)]
pub enum DaemonCommands {
    /// Start the daemon in the background (no-op when it is running)
    Start,
    /// Stop the daemon and every server it holds
    Stop,
    /// Show daemon and keep-alive server status
    Status,
    /// Stop and start the daemon
    Restart,
    /// Run the daemon in the foreground (used by auto-launch)
    #[command(hide = true)]
    Run,
}
