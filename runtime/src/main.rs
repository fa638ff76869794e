use std::io::IsTerminal;

use anyhow::Result;
use clap::Parser;

use mcp_runtime::cli::{Cli, Commands, DaemonCommands};
use mcp_runtime::handlers::{self, AppContext};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The daemon writes into its log file
    let daemon_run = matches!(
        cli.command,
        Commands::Daemon {
            command: DaemonCommands::Run
        }
    );
    mcp_common::init_tracing("mcp_runtime", !daemon_run && std::io::stderr().is_terminal())?;

    let ctx = AppContext::load(cli.config, cli.root)?;

    match cli.command {
        Commands::List {
            server,
            schema,
            json,
        } => handlers::run_list(&ctx, server, schema, json).await?,
        Commands::Call {
            server,
            tool,
            args,
            timeout_ms,
            output,
        } => handlers::run_call(&ctx, &server, &tool, args, timeout_ms, output).await?,
        Commands::Resources { server } => handlers::run_resources(&ctx, &server).await?,
        Commands::Auth { server } => handlers::run_auth(&ctx, &server).await?,
        Commands::Logout { server, scope } => handlers::run_logout(&ctx, &server, scope).await?,
        Commands::Daemon { command } => handlers::run_daemon(&ctx, command).await?,
    }

    Ok(())
}
