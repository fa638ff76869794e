//! auth and logout

use anyhow::Result;

use super::{report_failure, AppContext};
use crate::config;
use crate::mcp::McpRuntime;
use crate::oauth::{clear_oauth_caches, ClearScope};

/// Handle the `auth` command
pub async fn run_auth(ctx: &AppContext, server: &str) -> Result<()> {
    let runtime = ctx.direct_runtime();
    let result = runtime.authorize(server).await;
    runtime.close(None).await?;
    result.inspect_err(|e| report_failure(server, e))?;
    println!("Authorized '{server}'.");
    Ok(())
}

/// Handle the `logout` command
pub async fn run_logout(ctx: &AppContext, server: &str, scope: ClearScope) -> Result<()> {
    let definition = ctx
        .config
        .get(server)
        .ok_or_else(|| mcp_common::McpClientError::UnknownServer(server.to_string()))?;
    clear_oauth_caches(definition, &config::state_dir(), scope).await?;
    println!("Cleared {scope:?} credentials for '{server}'.");
    Ok(())
}
