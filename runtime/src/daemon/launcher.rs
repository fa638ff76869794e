//! Starting the daemon as a detached background process

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::metadata::DaemonPaths;
use crate::config::LoadOptions;

/// Everything a new daemon needs to find its configuration and files
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub options: LoadOptions,
    pub paths: DaemonPaths,
}

#[async_trait]
pub trait DaemonLauncher: Send + Sync {
    /// Start a daemon; returns once the process is spawned, not once it is ready
    async fn launch(&self, request: &LaunchRequest) -> Result<()>;
}

/// Re-executes the current binary as `daemon run`
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("Failed to locate the current executable")?;
        Ok(Self { program })
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl DaemonLauncher for ProcessLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<()> {
        if let Some(dir) = request.paths.dir() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create daemon directory {:?}", dir))?;
        }
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&request.paths.log)
            .with_context(|| format!("Failed to open daemon log {:?}", request.paths.log))?;
        let log_err = log.try_clone()?;

        let mut cmd = std::process::Command::new(&self.program);
        cmd.arg("--root")
            .arg(&request.options.root_dir)
            .args(
                request
                    .options
                    .explicit
                    .iter()
                    .flat_map(|path| [std::ffi::OsStr::new("--config"), path.as_os_str()]),
            )
            .arg("daemon")
            .arg("run")
            .current_dir(&request.options.root_dir)
            .stdin(std::process::Stdio::null())
            .stdout(log)
            .stderr(log_err);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so terminal signals aimed at the CLI miss it
            cmd.process_group(0);
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn daemon {:?}", self.program))?;
        tracing::info!(
            "Launched MCP daemon (pid {}), log: {:?}",
            child.id(),
            request.paths.log
        );
        Ok(())
    }
}
