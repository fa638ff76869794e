//! Command handlers for the mcprt CLI
//!
//! Each handler loads what it needs through [`AppContext`], performs one
//! command, and closes the connections it opened.

mod auth;
mod daemon;
mod tools;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use mcp_common::{analyze_connection_error, remediation_hint};

use crate::config::{self, LoadOptions, LoadedConfig};
use crate::daemon::{DaemonClient, DaemonPaths, ProcessLauncher};
use crate::mcp::{KeepAliveRuntime, Runtime, BINARY_NAME};

pub use auth::{run_auth, run_logout};
pub use daemon::run_daemon;
pub use tools::{run_call, run_list, run_resources};

/// Configuration shared by every command
pub struct AppContext {
    pub options: LoadOptions,
    pub config: LoadedConfig,
}

impl AppContext {
    pub fn load(explicit: Option<PathBuf>, root: Option<PathBuf>) -> Result<Self> {
        let mut options = LoadOptions::from_cwd(explicit)?;
        if let Some(root) = root {
            options.root_dir = root;
        }
        let config = config::load(&options)?;
        Ok(Self { options, config })
    }

    pub fn daemon_paths(&self) -> DaemonPaths {
        DaemonPaths::for_config(&self.config.config_path, &config::state_dir())
    }

    pub fn daemon_client(&self) -> Result<DaemonClient> {
        Ok(DaemonClient::new(
            self.options.clone(),
            self.daemon_paths(),
            Arc::new(ProcessLauncher::current_exe()?),
        ))
    }

    pub fn direct_runtime(&self) -> Runtime {
        Runtime::new(self.config.servers.clone())
    }

    /// Keep-alive servers through the daemon unless disabled
    pub fn runtime(&self) -> Result<KeepAliveRuntime> {
        let daemon = if config::daemon_disabled() {
            None
        } else {
            Some(self.daemon_client()?)
        };
        Ok(KeepAliveRuntime::new(Arc::new(self.direct_runtime()), daemon))
    }
}

/// Print the classification hint for a failed server operation
pub(crate) fn report_failure(server: &str, err: &anyhow::Error) {
    let issue = analyze_connection_error(err);
    tracing::debug!("'{}' failed as {}: {}", server, issue.kind, issue.raw_message);
    if let Some(hint) = remediation_hint(&issue, server, BINARY_NAME) {
        eprintln!("{hint}");
    }
}
