//! Configuration loading
//!
//! Reads `{"mcpServers": {...}}` documents from up to two layers (global and
//! project) and resolves them into [`ServerDefinition`]s. Also reports every
//! file that contributed, with its modification time, so the daemon client
//! can tell when a running daemon's view is stale.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::definition::{
    resolve_lifecycle, AuthMode, CommandSpec, HttpCommand, Lifecycle, ServerDefinition,
    ServerSource, SourceKind, StdioCommand, DISABLE_KEEPALIVE_ENV, KEEPALIVE_ENV,
};

/// Project-level config file name, found by walking up from the root dir
pub const PROJECT_CONFIG_FILE: &str = ".mcp.json";

/// Global config file, under the platform config directory
pub const GLOBAL_CONFIG_FILE: &str = "mcp.json";

const APP_DIR: &str = "mcp-runtime";

/// Overrides `~/.mcp-runtime` (vault, legacy token dirs, daemon files)
pub const HOME_ENV: &str = "MCP_RUNTIME_HOME";
/// Routes every server directly, bypassing the daemon
pub const NO_DAEMON_ENV: &str = "MCP_RUNTIME_NO_DAEMON";
pub const OAUTH_TIMEOUT_ENV: &str = "MCP_RUNTIME_OAUTH_TIMEOUT_MS";
pub const CALL_TIMEOUT_ENV: &str = "MCP_RUNTIME_CALL_TIMEOUT_MS";

/// Default OAuth consent wait
pub const DEFAULT_OAUTH_TIMEOUT: Duration = Duration::from_secs(60);

/// Default tool call timeout
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Directory holding runtime state (vault file, legacy token caches, daemon files)
pub fn state_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(HOME_ENV) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".mcp-runtime")
}

fn env_duration_ms(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

pub fn oauth_timeout() -> Duration {
    env_duration_ms(OAUTH_TIMEOUT_ENV).unwrap_or(DEFAULT_OAUTH_TIMEOUT)
}

pub fn call_timeout() -> Duration {
    env_duration_ms(CALL_TIMEOUT_ENV).unwrap_or(DEFAULT_CALL_TIMEOUT)
}

pub fn daemon_disabled() -> bool {
    std::env::var(NO_DAEMON_ENV)
        .map(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(false)
}

/// Find a config file by walking up the directory tree from `start`.
fn find_project_config(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let candidate = current.join(PROJECT_CONFIG_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return None,
        }
    }
}

fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(GLOBAL_CONFIG_FILE))
}

// ============================================================================
// File format
// ============================================================================

/// Raw config document
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: HashMap<String, RawServerEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawCommand {
    Line(String),
    Argv(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawLifecycle {
    Mode(String),
    Detailed {
        mode: String,
        #[serde(rename = "idleTimeoutMs")]
        idle_timeout_ms: Option<u64>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawServerEntry {
    pub command: Option<RawCommand>,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    #[serde(alias = "baseUrl")]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub auth: Option<String>,
    pub token_cache_dir: Option<PathBuf>,
    pub lifecycle: Option<RawLifecycle>,
}

fn parse_lifecycle(raw: &RawLifecycle) -> Result<Lifecycle> {
    let (mode, idle_timeout_ms) = match raw {
        RawLifecycle::Mode(mode) => (mode.as_str(), None),
        RawLifecycle::Detailed {
            mode,
            idle_timeout_ms,
        } => (mode.as_str(), *idle_timeout_ms),
    };
    match mode {
        "keep-alive" | "keepAlive" | "keepalive" => Ok(Lifecycle::KeepAlive { idle_timeout_ms }),
        "ephemeral" => Ok(Lifecycle::Ephemeral),
        other => anyhow::bail!("unknown lifecycle mode '{}'", other),
    }
}

fn expand_home(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&text).as_ref())
}

/// Expand `${VAR}` references, leaving the value untouched if a variable is
/// missing
pub fn expand_env(value: &str) -> String {
    shellexpand::env(value)
        .map(|v| v.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

impl RawServerEntry {
    /// Turn a raw entry into a definition
    ///
    /// Relative working directories resolve against the directory of the
    /// file that declared them.
    pub fn into_definition(
        self,
        name: &str,
        source: ServerSource,
        keep_alive_env: Option<&str>,
        disable_env: Option<&str>,
    ) -> Result<ServerDefinition> {
        let base_dir = source
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let command = match (self.command, self.url) {
            (Some(_), Some(_)) => {
                anyhow::bail!("server '{}' declares both a command and a url", name)
            }
            (None, None) => anyhow::bail!("server '{}' needs either a command or a url", name),
            (None, Some(url)) => CommandSpec::Http(HttpCommand {
                url,
                headers: self.headers,
            }),
            (Some(raw), None) => {
                let (command, mut args) = match raw {
                    RawCommand::Line(line) => (line, Vec::new()),
                    RawCommand::Argv(mut argv) => {
                        if argv.is_empty() {
                            anyhow::bail!("server '{}' has an empty command", name);
                        }
                        let command = argv.remove(0);
                        (command, argv)
                    }
                };
                args.extend(self.args);
                let working_dir = self.cwd.map(|cwd| {
                    let cwd = expand_home(&cwd);
                    if cwd.is_absolute() {
                        cwd
                    } else {
                        base_dir.join(cwd)
                    }
                });
                CommandSpec::Stdio(StdioCommand {
                    command,
                    args,
                    working_dir,
                })
            }
        };

        let auth = match self.auth.as_deref() {
            None | Some("none") => AuthMode::None,
            Some("oauth") => AuthMode::OAuth,
            Some(other) => anyhow::bail!("server '{}' has unknown auth mode '{}'", name, other),
        };

        let explicit = self.lifecycle.as_ref().map(parse_lifecycle).transpose()?;
        let lifecycle = resolve_lifecycle(name, &command, explicit, keep_alive_env, disable_env);

        Ok(ServerDefinition {
            name: name.to_string(),
            command,
            env: self.env,
            auth,
            token_cache_dir: self.token_cache_dir.map(|p| expand_home(&p)),
            lifecycle,
            source: Some(source),
        })
    }
}

// ============================================================================
// Layers
// ============================================================================

/// One file that contributed to the resolved configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigLayer {
    pub path: PathBuf,
    pub mtime_ms: u64,
}

/// Where to look for configuration
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Explicit config file; disables discovery
    pub explicit: Option<PathBuf>,
    /// Directory the project search starts from
    pub root_dir: PathBuf,
}

impl LoadOptions {
    pub fn from_cwd(explicit: Option<PathBuf>) -> Result<Self> {
        Ok(Self {
            explicit,
            root_dir: std::env::current_dir().context("Failed to read current directory")?,
        })
    }

    fn candidates(&self) -> Vec<(SourceKind, PathBuf)> {
        if let Some(path) = &self.explicit {
            return vec![(SourceKind::Explicit, absolutize(path, &self.root_dir))];
        }
        let mut out = Vec::new();
        if let Some(global) = global_config_path() {
            out.push((SourceKind::Global, global));
        }
        if let Some(project) = find_project_config(&self.root_dir) {
            out.push((SourceKind::Project, project));
        }
        out
    }

    /// The path that identifies this configuration (and its daemon)
    pub fn resolved_config_path(&self) -> PathBuf {
        let candidates = self.candidates();
        candidates
            .iter()
            .rev()
            .find(|(kind, path)| *kind == SourceKind::Explicit || path.is_file())
            .map(|(_, path)| path.clone())
            .unwrap_or_else(|| self.root_dir.join(PROJECT_CONFIG_FILE))
    }
}

fn absolutize(path: &Path, root: &Path) -> PathBuf {
    let path = expand_home(path);
    if path.is_absolute() {
        path
    } else {
        root.join(path)
    }
}

fn mtime_ms(path: &Path) -> Option<u64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let millis = modified.duration_since(UNIX_EPOCH).ok()?.as_millis();
    u64::try_from(millis).ok()
}

/// Every existing file that contributes to the configuration, with mtimes
pub fn config_layers(options: &LoadOptions) -> Vec<ConfigLayer> {
    options
        .candidates()
        .into_iter()
        .filter_map(|(_, path)| {
            mtime_ms(&path).map(|mtime_ms| ConfigLayer { path, mtime_ms })
        })
        .collect()
}

/// A resolved configuration
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_path: PathBuf,
    pub servers: Vec<ServerDefinition>,
    pub layers: Vec<ConfigLayer>,
}

impl LoadedConfig {
    pub fn get(&self, name: &str) -> Option<&ServerDefinition> {
        self.servers.iter().find(|s| s.name == name)
    }
}

/// Load from a specific path
pub fn load_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config: ConfigFile = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config {}", path.display()))?;
    Ok(config)
}

/// Load and merge every layer; later layers override earlier ones by name
pub fn load(options: &LoadOptions) -> Result<LoadedConfig> {
    let keep_alive_env = std::env::var(KEEPALIVE_ENV).ok();
    let disable_env = std::env::var(DISABLE_KEEPALIVE_ENV).ok();

    let mut merged: BTreeMap<String, ServerDefinition> = BTreeMap::new();
    for (kind, path) in options.candidates() {
        if kind != SourceKind::Explicit && !path.is_file() {
            continue;
        }
        tracing::debug!("Loading MCP config from: {}", path.display());
        let file = load_file(&path)?;
        for (name, entry) in file.mcp_servers {
            let source = ServerSource {
                kind,
                path: path.clone(),
            };
            let definition = entry.into_definition(
                &name,
                source,
                keep_alive_env.as_deref(),
                disable_env.as_deref(),
            )?;
            merged.insert(name, definition);
        }
    }

    Ok(LoadedConfig {
        config_path: options.resolved_config_path(),
        servers: merged.into_values().collect(),
        layers: config_layers(options),
    })
}
