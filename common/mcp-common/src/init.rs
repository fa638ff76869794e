//! Tracing setup shared by the CLI and the keep-alive daemon
//!
//! Logs always go to stderr: the daemon's stderr is redirected into its log
//! file, and the CLI keeps stdout for command output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging
///
/// - Environment-based filtering via `RUST_LOG`
/// - Default level of `info` for `crate_name`
/// - `LOG_FORMAT=json` switches to structured JSON lines
///
/// # Arguments
///
/// * `crate_name` - Target whose default level is raised to `info` (e.g. "mcp_runtime")
/// * `ansi` - Whether to emit terminal colors; off for log files
pub fn init_tracing(crate_name: &str, ansi: bool) -> anyhow::Result<()> {
    let directive = format!("{}=info", crate_name);
    let filter = EnvFilter::from_default_env().add_directive(directive.parse()?);

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);

    if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(ansi),
            )
            .try_init()?;
    }

    Ok(())
}
