//! Daemon addressing and the metadata file that sits next to its socket

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::ConfigLayer;
use crate::oauth::store::{hex, write_atomic};

/// Overrides the directory holding daemon sockets, metadata and logs
pub const DAEMON_DIR_ENV: &str = "MCP_RUNTIME_DAEMON_DIR";

/// Socket, metadata and log file for the daemon of one configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonPaths {
    pub socket: PathBuf,
    pub metadata: PathBuf,
    pub log: PathBuf,
}

impl DaemonPaths {
    /// Paths keyed on a stable hash of the absolute config path
    pub fn for_config(config_path: &Path, state_dir: &Path) -> Self {
        let dir = std::env::var_os(DAEMON_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| state_dir.join("daemon"));
        Self::in_dir(&dir, config_path)
    }

    pub fn in_dir(dir: &Path, config_path: &Path) -> Self {
        let digest = hex(&Sha256::digest(config_path.to_string_lossy().as_bytes()));
        let stem = format!("daemon-{}", &digest[..16]);
        Self {
            socket: dir.join(format!("{stem}.sock")),
            metadata: dir.join(format!("{stem}.json")),
            log: dir.join(format!("{stem}.log")),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.socket.parent()
    }

    /// Remove the socket and metadata files, ignoring missing ones
    pub async fn remove_files(&self) {
        for path in [&self.socket, &self.metadata] {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove {:?}: {}", path, e),
            }
        }
    }
}

/// What a running daemon recorded about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonMetadata {
    pub pid: u32,
    pub socket_path: PathBuf,
    pub config_path: PathBuf,
    pub config_layers: Vec<ConfigLayer>,
    pub started_at: DateTime<Utc>,
    pub log_path: PathBuf,
}

impl DaemonMetadata {
    pub async fn read(path: &Path) -> Result<Option<Self>> {
        let body = match tokio::fs::read(path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", path)),
        };
        let metadata = serde_json::from_slice(&body)
            .with_context(|| format!("Failed to parse daemon metadata {:?}", path))?;
        Ok(Some(metadata))
    }

    pub async fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &body).await
    }

    /// True when the recorded layers differ from `current` in any path or mtime
    pub fn is_stale(&self, current: &[ConfigLayer]) -> bool {
        layer_map(&self.config_layers) != layer_map(current)
    }
}

fn layer_map(layers: &[ConfigLayer]) -> BTreeMap<&Path, u64> {
    layers
        .iter()
        .map(|layer| (layer.path.as_path(), layer.mtime_ms))
        .collect()
}
