//! OAuth credential persistence
//!
//! Credentials live in up to two layers:
//!
//! - an optional per-server directory (`tokenCacheDir`), one file per slot
//! - the shared vault at `<state dir>/credentials.json`, keyed by a hash of
//!   the server identity
//!
//! [`CredentialStore`] reads from the first layer that has a value and writes
//! to every layer. Tokens from the older `<state dir>/<server>/` layout are
//! copied into the vault on first use; the old directory is left alone.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::definition::{CommandSpec, ServerDefinition};

/// Token set returned by the authorization server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Absolute expiry, filled in when the tokens are received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl OAuthTokens {
    pub fn stamp_expiry(mut self) -> Self {
        if self.expires_at.is_none() {
            self.expires_at = self
                .expires_in
                .and_then(|secs| i64::try_from(secs).ok())
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        }
        self
    }

    /// Expired, or expiring within the next 30 seconds
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|at| at <= Utc::now() + chrono::Duration::seconds(30))
    }
}

/// Dynamic client registration result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One persisted value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Tokens,
    Client,
    Verifier,
    State,
}

impl Slot {
    const ALL: [Slot; 4] = [Slot::Tokens, Slot::Client, Slot::Verifier, Slot::State];

    fn file_name(&self) -> &'static str {
        match self {
            Slot::Tokens => "tokens.json",
            Slot::Client => "client.json",
            Slot::Verifier => "code_verifier.txt",
            Slot::State => "state.txt",
        }
    }

    fn is_text(&self) -> bool {
        matches!(self, Slot::Verifier | Slot::State)
    }
}

/// What `logout` removes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ClearScope {
    #[default]
    All,
    Tokens,
    Client,
    Verifier,
    State,
}

impl ClearScope {
    fn slots(&self) -> &'static [Slot] {
        match self {
            ClearScope::All => &Slot::ALL,
            ClearScope::Tokens => &[Slot::Tokens],
            ClearScope::Client => &[Slot::Client],
            ClearScope::Verifier => &[Slot::Verifier],
            ClearScope::State => &[Slot::State],
        }
    }
}

/// A persistence layer
#[async_trait]
pub trait OAuthStore: Send + Sync {
    async fn read(&self, slot: Slot) -> Result<Option<Value>>;
    async fn write(&self, slot: Slot, value: &Value) -> Result<()>;
    async fn clear(&self, scope: ClearScope) -> Result<()>;
}

// ============================================================================
// Directory layer
// ============================================================================

/// One file per slot inside a directory
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    dir: PathBuf,
}

impl DirectoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl OAuthStore for DirectoryStore {
    async fn read(&self, slot: Slot) -> Result<Option<Value>> {
        let path = self.dir.join(slot.file_name());
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", path)),
        };
        if slot.is_text() {
            let text = raw.trim();
            return Ok((!text.is_empty()).then(|| Value::String(text.to_string())));
        }
        let value: Value = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        Ok((!value.is_null()).then_some(value))
    }

    async fn write(&self, slot: Slot, value: &Value) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {:?}", self.dir))?;
        let body = match (slot.is_text(), value) {
            (true, Value::String(text)) => text.clone(),
            _ => serde_json::to_string_pretty(value)?,
        };
        write_atomic(&self.dir.join(slot.file_name()), body.as_bytes()).await
    }

    async fn clear(&self, scope: ClearScope) -> Result<()> {
        for slot in scope.slots() {
            let path = self.dir.join(slot.file_name());
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("Failed to remove {:?}", path)),
            }
        }
        Ok(())
    }
}

// ============================================================================
// Vault layer
// ============================================================================

pub const VAULT_FILE: &str = "credentials.json";
const VAULT_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct VaultFile {
    version: u32,
    #[serde(default)]
    entries: BTreeMap<String, VaultEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VaultEntry {
    server_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    server_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tokens: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_info: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code_verifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state: Option<String>,
    updated_at: DateTime<Utc>,
}

impl VaultEntry {
    fn get(&self, slot: Slot) -> Option<Value> {
        match slot {
            Slot::Tokens => self.tokens.clone(),
            Slot::Client => self.client_info.clone(),
            Slot::Verifier => self.code_verifier.clone().map(Value::String),
            Slot::State => self.state.clone().map(Value::String),
        }
    }

    fn set(&mut self, slot: Slot, value: Option<Value>) {
        let text = |v: Option<Value>| v.and_then(|v| v.as_str().map(str::to_string));
        match slot {
            Slot::Tokens => self.tokens = value,
            Slot::Client => self.client_info = value,
            Slot::Verifier => self.code_verifier = text(value),
            Slot::State => self.state = text(value),
        }
    }

    fn is_empty(&self) -> bool {
        Slot::ALL.iter().all(|slot| self.get(*slot).is_none())
    }
}

/// Serializes read-modify-write cycles on vault files within this process
fn vault_lock() -> &'static Mutex<()> {
    static LOCK: std::sync::OnceLock<Mutex<()>> = std::sync::OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Stable vault key for a server identity
pub fn vault_key(definition: &ServerDefinition) -> String {
    let identity = definition.identity().to_string();
    hex(&Sha256::digest(identity.as_bytes()))
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// The shared credentials file
#[derive(Debug, Clone)]
pub struct VaultStore {
    path: PathBuf,
    key: String,
    server_name: String,
    server_url: Option<String>,
}

impl VaultStore {
    pub fn new(path: impl Into<PathBuf>, definition: &ServerDefinition) -> Self {
        let server_url = match &definition.command {
            CommandSpec::Http(http) => Some(http.url.clone()),
            CommandSpec::Stdio(_) => None,
        };
        Self {
            path: path.into(),
            key: vault_key(definition),
            server_name: definition.name.clone(),
            server_url,
        }
    }

    async fn load(&self) -> Result<VaultFile> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => {
                let vault: VaultFile = serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse vault {:?}", self.path))?;
                Ok(vault)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(VaultFile {
                version: VAULT_VERSION,
                entries: BTreeMap::new(),
            }),
            Err(e) => Err(e).with_context(|| format!("Failed to read vault {:?}", self.path)),
        }
    }

    async fn store(&self, vault: &VaultFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(vault)?;
        write_atomic(&self.path, &body).await
    }

    async fn update<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut VaultEntry) + Send,
    {
        let _guard = vault_lock().lock().await;
        let mut vault = self.load().await?;
        vault.version = VAULT_VERSION;
        let entry = vault
            .entries
            .entry(self.key.clone())
            .or_insert_with(|| VaultEntry {
                server_name: self.server_name.clone(),
                server_url: self.server_url.clone(),
                updated_at: Utc::now(),
                ..Default::default()
            });
        apply(entry);
        entry.updated_at = Utc::now();
        if entry.is_empty() {
            vault.entries.remove(&self.key);
        }
        self.store(&vault).await
    }
}

#[async_trait]
impl OAuthStore for VaultStore {
    async fn read(&self, slot: Slot) -> Result<Option<Value>> {
        let vault = self.load().await?;
        Ok(vault.entries.get(&self.key).and_then(|entry| entry.get(slot)))
    }

    async fn write(&self, slot: Slot, value: &Value) -> Result<()> {
        let value = value.clone();
        self.update(move |entry| entry.set(slot, Some(value))).await
    }

    async fn clear(&self, scope: ClearScope) -> Result<()> {
        self.update(|entry| {
            for slot in scope.slots() {
                entry.set(*slot, None);
            }
        })
        .await
    }
}

pub(crate) async fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, body)
        .await
        .with_context(|| format!("Failed to write {:?}", tmp))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await;
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e).with_context(|| format!("Failed to replace {:?}", path));
    }
    Ok(())
}

// ============================================================================
// Composite
// ============================================================================

/// Directory layer (if configured) in front of the vault
#[derive(Clone)]
pub struct CredentialStore {
    layers: Vec<Arc<dyn OAuthStore>>,
    legacy: DirectoryStore,
}

impl CredentialStore {
    /// Layers for a definition under the given state directory
    pub fn for_definition(definition: &ServerDefinition, state_dir: &Path) -> Self {
        let mut layers: Vec<Arc<dyn OAuthStore>> = Vec::new();
        if let Some(dir) = &definition.token_cache_dir {
            layers.push(Arc::new(DirectoryStore::new(dir.clone())));
        }
        layers.push(Arc::new(VaultStore::new(
            state_dir.join(VAULT_FILE),
            definition,
        )));
        Self {
            layers,
            legacy: DirectoryStore::new(legacy_dir(state_dir, &definition.name)),
        }
    }

    pub fn with_layers(layers: Vec<Arc<dyn OAuthStore>>, legacy: DirectoryStore) -> Self {
        Self { layers, legacy }
    }

    pub fn legacy_dir(&self) -> &Path {
        self.legacy.dir()
    }

    /// Copy legacy tokens/client into the current layers if they are empty
    ///
    /// Non-destructive: the legacy directory is never modified.
    pub async fn migrate_legacy(&self) -> Result<bool> {
        if self.read(Slot::Tokens).await?.is_some() {
            return Ok(false);
        }
        let Some(tokens) = self.legacy.read(Slot::Tokens).await? else {
            return Ok(false);
        };
        tracing::info!("Migrating OAuth tokens from {:?}", self.legacy.dir());
        self.write(Slot::Tokens, &tokens).await?;
        if self.read(Slot::Client).await?.is_none() {
            if let Some(client) = self.legacy.read(Slot::Client).await? {
                self.write(Slot::Client, &client).await?;
            }
        }
        Ok(true)
    }

    pub async fn read(&self, slot: Slot) -> Result<Option<Value>> {
        for layer in &self.layers {
            if let Some(value) = layer.read(slot).await? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    pub async fn write(&self, slot: Slot, value: &Value) -> Result<()> {
        for layer in &self.layers {
            layer.write(slot, value).await?;
        }
        Ok(())
    }

    /// Clear every layer, continuing past failures
    pub async fn clear(&self, scope: ClearScope) -> Result<()> {
        let mut first_error = None;
        for layer in &self.layers {
            if let Err(e) = layer.clear(scope).await {
                tracing::warn!("Failed to clear OAuth cache layer: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn read_typed<T: DeserializeOwned>(&self, slot: Slot) -> Result<Option<T>> {
        self.read(slot)
            .await?
            .map(serde_json::from_value)
            .transpose()
            .context("Stored OAuth value has an unexpected shape")
    }

    pub async fn tokens(&self) -> Result<Option<OAuthTokens>> {
        self.read_typed(Slot::Tokens).await
    }

    pub async fn save_tokens(&self, tokens: &OAuthTokens) -> Result<()> {
        self.write(Slot::Tokens, &serde_json::to_value(tokens)?).await
    }

    pub async fn client(&self) -> Result<Option<ClientInfo>> {
        self.read_typed(Slot::Client).await
    }

    pub async fn save_client(&self, client: &ClientInfo) -> Result<()> {
        self.write(Slot::Client, &serde_json::to_value(client)?).await
    }

    pub async fn verifier(&self) -> Result<Option<String>> {
        self.read_typed(Slot::Verifier).await
    }

    pub async fn save_verifier(&self, verifier: &str) -> Result<()> {
        self.write(Slot::Verifier, &Value::String(verifier.to_string()))
            .await
    }

    pub async fn state(&self) -> Result<Option<String>> {
        self.read_typed(Slot::State).await
    }

    pub async fn save_state(&self, state: &str) -> Result<()> {
        self.write(Slot::State, &Value::String(state.to_string()))
            .await
    }
}

/// Pre-vault location of a server's credentials
///
/// Always a direct child of `state_dir`, whatever the server is called.
pub fn legacy_dir(state_dir: &Path, server: &str) -> PathBuf {
    state_dir.join(path_component(server))
}

/// `name` as one path component: separators and other unusual characters
/// become `_`, and `.`/`..` cannot survive
fn path_component(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if safe.chars().all(|c| c == '.') {
        "_".repeat(safe.len().max(1))
    } else {
        safe
    }
}
