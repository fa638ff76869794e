//! Daemon start/stop/status command handlers

use std::sync::Arc;

use anyhow::Result;

use super::AppContext;
use crate::cli::DaemonCommands;
use crate::daemon::{DaemonHost, DaemonStatus};

/// Handle the `daemon` subcommands
pub async fn run_daemon(ctx: &AppContext, command: DaemonCommands) -> Result<()> {
    match command {
        DaemonCommands::Run => {
            let host = Arc::new(DaemonHost::new(&ctx.config, ctx.daemon_paths()));
            host.run().await
        }
        DaemonCommands::Start => {
            let client = ctx.daemon_client()?;
            client.start().await?;
            print_status(client.status().await?.as_ref());
            Ok(())
        }
        DaemonCommands::Stop => {
            let client = ctx.daemon_client()?;
            if client.stop().await? {
                println!("MCP daemon stopped.");
            } else {
                println!("MCP daemon is not running.");
            }
            Ok(())
        }
        DaemonCommands::Status => {
            let client = ctx.daemon_client()?;
            print_status(client.status().await?.as_ref());
            Ok(())
        }
        DaemonCommands::Restart => {
            let client = ctx.daemon_client()?;
            client.restart().await?;
            print_status(client.status().await?.as_ref());
            Ok(())
        }
    }
}

fn print_status(status: Option<&DaemonStatus>) {
    let Some(status) = status else {
        println!("MCP daemon is not running.");
        return;
    };
    println!("=== MCP Daemon ===\n");
    println!("  PID: {}", status.pid);
    println!("  Started: {}", status.started_at.to_rfc3339());
    println!("  Config: {}", status.config_path.display());
    if status.servers.is_empty() {
        println!("\nNo keep-alive servers configured.");
        return;
    }
    println!();
    for server in &status.servers {
        let state = if server.connected { "connected" } else { "idle" };
        let last_used = server
            .last_used_secs
            .map(|s| format!(", last used {s}s ago"))
            .unwrap_or_default();
        println!("  {} {}{}", server.name, state, last_used);
    }
}
