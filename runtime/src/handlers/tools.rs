//! list, call, and resources

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;

use super::{report_failure, AppContext};
use crate::cli::OutputFormat;
use crate::mcp::{CallOptions, ListToolsOptions, McpRuntime, ServerListing, ToolInfo};
use mcp_common::CallResult;

/// Handle the `list` command
pub async fn run_list(
    ctx: &AppContext,
    server: Option<String>,
    schema: bool,
    json: bool,
) -> Result<()> {
    let Some(server) = server else {
        let runtime = ctx.direct_runtime();
        let listings = runtime.list_all_tools().await;
        runtime.close(None).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&listings)?);
        } else {
            print_scan(&listings);
        }
        return Ok(());
    };

    let runtime = ctx.runtime()?;
    let options = ListToolsOptions {
        include_schema: schema,
        auto_authorize: true,
    };
    let result = runtime.list_tools(&server, options).await;
    runtime.close(None).await?;
    let tools = result.inspect_err(|e| report_failure(&server, e))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tools)?);
    } else {
        print_tools(&server, &tools, schema)?;
    }
    Ok(())
}

fn print_scan(listings: &[ServerListing]) {
    if listings.is_empty() {
        println!("No MCP servers configured.");
        return;
    }
    let mut total = 0;
    for listing in listings {
        match (&listing.tools, &listing.issue) {
            (Some(tools), _) => {
                total += tools.len();
                println!("  {} ✓ {} tools", listing.server, tools.len());
            }
            (None, Some(issue)) => {
                println!("  {} ✗ [{}] {}", listing.server, issue.kind, issue.raw_message);
                if let Some(hint) = &listing.hint {
                    println!("      {hint}");
                }
            }
            (None, None) => println!("  {} ✗", listing.server),
        }
    }
    println!(
        "\nTotal: {} tools across {} servers",
        total,
        listings.len()
    );
}

fn print_tools(server: &str, tools: &[ToolInfo], schema: bool) -> Result<()> {
    println!("{} ({} tools)", server, tools.len());
    for tool in tools {
        let desc = tool
            .description
            .as_deref()
            .unwrap_or("No description")
            .lines()
            .next()
            .unwrap_or("");
        // Truncate long descriptions
        let desc = match desc.char_indices().nth(60) {
            Some((end, _)) => format!("{}...", &desc[..end]),
            None => desc.to_string(),
        };
        println!("  - {} : {}", tool.name, desc);
        if schema {
            if let Some(input) = &tool.input_schema {
                println!("      input: {}", serde_json::to_string(input)?);
            }
            if let Some(output) = &tool.output_schema {
                println!("      output: {}", serde_json::to_string(output)?);
            }
        }
    }
    Ok(())
}

/// Handle the `call` command
pub async fn run_call(
    ctx: &AppContext,
    server: &str,
    tool: &str,
    args: Option<String>,
    timeout_ms: Option<u64>,
    output: OutputFormat,
) -> Result<()> {
    let arguments = args
        .map(|raw| serde_json::from_str::<Value>(&raw))
        .transpose()
        .context("Invalid --args JSON")?;
    let options = CallOptions {
        arguments,
        timeout: timeout_ms.map(Duration::from_millis),
    };

    let runtime = ctx.runtime()?;
    let result = runtime.call_tool(server, tool, options).await;
    runtime.close(None).await?;
    let result = result.inspect_err(|e| report_failure(server, e))?;

    println!("{}", render(&result, output)?);
    if result.is_error() {
        anyhow::bail!("tool '{}' on '{}' reported an error", tool, server);
    }
    Ok(())
}

fn render(result: &CallResult, output: OutputFormat) -> Result<String> {
    let pretty = |value: &Value| serde_json::to_string_pretty(value);
    Ok(match output {
        OutputFormat::Text => match result.text() {
            Some(text) => text,
            None => pretty(result.raw())?,
        },
        OutputFormat::Markdown => match result.markdown() {
            Some(text) => text,
            None => pretty(result.raw())?,
        },
        OutputFormat::Json => match result.json() {
            Some(value) => pretty(&value)?,
            None => pretty(result.raw())?,
        },
        OutputFormat::Raw => pretty(result.raw())?,
    })
}

/// Handle the `resources` command
pub async fn run_resources(ctx: &AppContext, server: &str) -> Result<()> {
    let runtime = ctx.runtime()?;
    let result = runtime.list_resources(server, None).await;
    runtime.close(None).await?;
    let resources = result.inspect_err(|e| report_failure(server, e))?;
    println!("{}", serde_json::to_string_pretty(&resources)?);
    Ok(())
}
