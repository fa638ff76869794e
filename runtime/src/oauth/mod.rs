//! OAuth for remote MCP servers
//!
//! The transport only ever asks an [`AuthSession`] for a bearer token. When a
//! connect attempt is rejected, [`connect_with_auth`] drives the session
//! through refresh or the browser consent and tries again, a bounded number
//! of times.

mod callback;
mod flow;
mod session;
pub mod store;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use mcp_common::is_auth_error;

pub use callback::{CallbackListener, CallbackParams, CALLBACK_PATH};
pub use flow::{AuthServerMetadata, Pkce};
pub use session::BrowserAuthSession;
pub use store::{ClearScope, ClientInfo, CredentialStore, OAuthTokens};

use crate::definition::ServerDefinition;

/// Default number of connect attempts per server
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

/// What happened when authorization was (re)started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStep {
    /// Tokens were refreshed without user interaction; retry immediately
    Refreshed,
    /// The browser flow is running; wait for the redirect
    AwaitingCode,
}

/// Authorization state for one server connection
#[async_trait]
pub trait AuthSession: Send + Sync {
    /// Bearer token to present, if one is available
    async fn access_token(&self) -> Option<String>;

    /// React to a rejected request
    async fn begin_authorization(&self) -> Result<AuthStep>;

    /// Wait for the redirect; raises `OAuthTimeout` when `timeout` elapses
    async fn wait_for_authorization_code(&self, timeout: Duration) -> Result<String>;

    /// Exchange the code and persist the tokens
    async fn finish_auth(&self, code: &str) -> Result<()>;

    /// Release listeners. Never fails.
    async fn close(&self);
}

/// Creates sessions for OAuth-enabled definitions
#[async_trait]
pub trait AuthSessionFactory: Send + Sync {
    async fn create(
        &self,
        definition: &ServerDefinition,
        force_reauth: bool,
    ) -> Result<Arc<dyn AuthSession>>;
}

/// Factory for [`BrowserAuthSession`]s rooted at a state directory
#[derive(Debug, Clone)]
pub struct BrowserSessionFactory {
    state_dir: PathBuf,
    http: reqwest::Client,
}

impl BrowserSessionFactory {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AuthSessionFactory for BrowserSessionFactory {
    async fn create(
        &self,
        definition: &ServerDefinition,
        force_reauth: bool,
    ) -> Result<Arc<dyn AuthSession>> {
        let session =
            BrowserAuthSession::open(definition, &self.state_dir, self.http.clone(), force_reauth)
                .await?;
        Ok(Arc::new(session))
    }
}

/// Run `connect`, authorizing and retrying on authorization failures
///
/// Without a session the first error is returned as is. `OAuthTimeout` from
/// the wait ends the loop immediately.
pub async fn connect_with_auth<T, F, Fut>(
    server: &str,
    session: Option<&Arc<dyn AuthSession>>,
    wait_timeout: Duration,
    max_attempts: usize,
    mut connect: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match connect().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let Some(session) = session else {
            return Err(err);
        };
        if !is_auth_error(&err) || attempt >= max_attempts.max(1) {
            return Err(err);
        }

        tracing::info!(
            "Server '{}' requires authorization (attempt {}/{})",
            server,
            attempt,
            max_attempts
        );
        match session.begin_authorization().await? {
            AuthStep::Refreshed => {}
            AuthStep::AwaitingCode => {
                let code = session.wait_for_authorization_code(wait_timeout).await?;
                session.finish_auth(&code).await?;
            }
        }
    }
}

/// Remove cached credentials for a server from every layer
///
/// `ClearScope::All` also deletes the legacy per-server directory.
pub async fn clear_oauth_caches(
    definition: &ServerDefinition,
    state_dir: &Path,
    scope: ClearScope,
) -> Result<()> {
    let store = CredentialStore::for_definition(definition, state_dir);
    let result = store.clear(scope).await;
    if scope == ClearScope::All {
        let legacy = store.legacy_dir();
        match tokio::fs::remove_dir_all(legacy).await {
            Ok(()) => tracing::info!("Removed legacy token directory {:?}", legacy),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {:?}: {}", legacy, e),
        }
    }
    result
}

/// Cached access token, without refresh or any interaction
pub async fn read_cached_access_token(
    definition: &ServerDefinition,
    state_dir: &Path,
) -> Option<String> {
    let store = CredentialStore::for_definition(definition, state_dir);
    if let Err(e) = store.migrate_legacy().await {
        tracing::debug!("Legacy token migration for {} failed: {}", definition.name, e);
    }
    match store.tokens().await {
        Ok(tokens) => tokens.map(|t| t.access_token),
        Err(e) => {
            tracing::debug!("Failed to read cached tokens for {}: {}", definition.name, e);
            None
        }
    }
}
