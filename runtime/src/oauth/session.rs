//! Browser-based OAuth session
//!
//! Holds everything one server's authorization needs: the credential store,
//! the discovered endpoints, and the loopback listener while a consent is
//! pending.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use mcp_common::McpClientError;
use tokio::sync::Mutex;
use url::Url;

use super::callback::{CallbackListener, WaitError};
use super::flow::{self, AuthServerMetadata, Pkce};
use super::store::{ClearScope, ClientInfo, CredentialStore};
use super::{AuthSession, AuthStep};
use crate::definition::{CommandSpec, ServerDefinition};

pub struct BrowserAuthSession {
    server: String,
    resource: Url,
    http: reqwest::Client,
    store: CredentialStore,
    metadata: Mutex<Option<AuthServerMetadata>>,
    listener: Mutex<Option<CallbackListener>>,
    /// Set once a refresh has been tried, so a server that keeps rejecting
    /// refreshed tokens falls through to the browser
    refresh_attempted: AtomicBool,
}

impl BrowserAuthSession {
    pub async fn open(
        definition: &ServerDefinition,
        state_dir: &Path,
        http: reqwest::Client,
        force_reauth: bool,
    ) -> Result<Self> {
        let CommandSpec::Http(target) = &definition.command else {
            anyhow::bail!("OAuth requires an HTTP server; '{}' is stdio", definition.name);
        };
        let resource = Url::parse(&crate::config::expand_env(&target.url))
            .with_context(|| format!("Invalid URL for server '{}'", definition.name))?;

        let store = CredentialStore::for_definition(definition, state_dir);
        if let Err(e) = store.migrate_legacy().await {
            tracing::warn!("Failed to migrate legacy tokens for {}: {}", definition.name, e);
        }
        if force_reauth {
            store.clear(ClearScope::Tokens).await?;
        }

        Ok(Self {
            server: definition.name.clone(),
            resource,
            http,
            store,
            metadata: Mutex::new(None),
            listener: Mutex::new(None),
            refresh_attempted: AtomicBool::new(force_reauth),
        })
    }

    async fn metadata(&self) -> Result<AuthServerMetadata> {
        let mut cached = self.metadata.lock().await;
        if let Some(metadata) = cached.as_ref() {
            return Ok(metadata.clone());
        }
        let metadata = flow::discover(&self.http, &self.resource)
            .await
            .with_context(|| format!("OAuth discovery failed for '{}'", self.server))?;
        *cached = Some(metadata.clone());
        Ok(metadata)
    }

    async fn try_refresh(&self) -> Result<bool> {
        let (Some(tokens), Some(client)) = (self.store.tokens().await?, self.store.client().await?)
        else {
            return Ok(false);
        };
        let Some(refresh_token) = tokens.refresh_token.as_deref() else {
            return Ok(false);
        };
        let metadata = self.metadata().await?;
        let fresh = flow::refresh(
            &self.http,
            &metadata,
            &client,
            refresh_token,
            self.resource.as_str(),
        )
        .await?;
        self.store.save_tokens(&fresh).await?;
        tracing::info!("Refreshed OAuth tokens for {}", self.server);
        Ok(true)
    }

    /// Reuse the stored client when its redirect URI matches the listener
    async fn client_for(&self, redirect_uri: &str) -> Result<ClientInfo> {
        if let Some(client) = self.store.client().await? {
            if client.redirect_uris.iter().any(|uri| uri == redirect_uri) {
                return Ok(client);
            }
        }
        let metadata = self.metadata().await?;
        let client = flow::register_client(&self.http, &metadata, redirect_uri).await?;
        self.store.save_client(&client).await?;
        Ok(client)
    }

    async fn preferred_port(&self) -> Option<u16> {
        let client = self.store.client().await.ok().flatten()?;
        client
            .redirect_uris
            .iter()
            .find_map(|uri| flow::redirect_port(uri))
    }
}

#[async_trait]
impl AuthSession for BrowserAuthSession {
    async fn access_token(&self) -> Option<String> {
        let tokens = match self.store.tokens().await {
            Ok(tokens) => tokens?,
            Err(e) => {
                tracing::warn!("Failed to read OAuth tokens for {}: {}", self.server, e);
                return None;
            }
        };
        if tokens.is_expired() && tokens.refresh_token.is_some() {
            match self.try_refresh().await {
                Ok(true) => return self.store.tokens().await.ok().flatten().map(|t| t.access_token),
                Ok(false) => {}
                Err(e) => tracing::debug!("Token refresh for {} failed: {}", self.server, e),
            }
        }
        Some(tokens.access_token)
    }

    async fn begin_authorization(&self) -> Result<AuthStep> {
        if !self.refresh_attempted.swap(true, Ordering::SeqCst) {
            match self.try_refresh().await {
                Ok(true) => return Ok(AuthStep::Refreshed),
                Ok(false) => {}
                Err(e) => tracing::info!("Refresh for {} failed, starting browser flow: {}", self.server, e),
            }
        }

        let mut slot = self.listener.lock().await;
        if let Some(previous) = slot.take() {
            previous.close().await;
        }
        let listener = CallbackListener::bind(self.preferred_port().await).await?;
        let redirect_uri = listener.redirect_uri();
        let client = self.client_for(&redirect_uri).await?;
        let metadata = self.metadata().await?;

        let pkce = Pkce::generate();
        let state = flow::new_state();
        self.store.save_verifier(&pkce.verifier).await?;
        self.store.save_state(&state).await?;

        let url = flow::authorization_url(
            &metadata,
            &client,
            &redirect_uri,
            &pkce,
            &state,
            self.resource.as_str(),
        )?;
        eprintln!("Authorize '{}' in your browser:\n  {}", self.server, url);
        if let Err(e) = open::that(url.as_str()) {
            tracing::warn!("Failed to open browser: {}", e);
        }
        *slot = Some(listener);
        Ok(AuthStep::AwaitingCode)
    }

    async fn wait_for_authorization_code(&self, timeout: Duration) -> Result<String> {
        let slot = self.listener.lock().await;
        let listener = slot
            .as_ref()
            .context("No authorization is in progress")?;
        let params = match listener.wait(timeout).await {
            Ok(params) => params,
            Err(WaitError::TimedOut) => {
                return Err(McpClientError::OAuthTimeout {
                    server: self.server.clone(),
                    timeout,
                }
                .into())
            }
            Err(WaitError::Denied(reason)) => {
                anyhow::bail!("OAuth authorization for '{}' was denied: {}", self.server, reason)
            }
            Err(WaitError::Closed) => {
                anyhow::bail!("OAuth redirect listener for '{}' closed", self.server)
            }
        };
        let expected = self.store.state().await?;
        if expected.is_some() && params.state != expected {
            anyhow::bail!("OAuth state mismatch for '{}'", self.server);
        }
        Ok(params.code)
    }

    async fn finish_auth(&self, code: &str) -> Result<()> {
        let redirect_uri = {
            let slot = self.listener.lock().await;
            slot.as_ref()
                .map(CallbackListener::redirect_uri)
                .context("No authorization is in progress")?
        };
        let verifier = self
            .store
            .verifier()
            .await?
            .context("Missing PKCE verifier")?;
        let client = self
            .store
            .client()
            .await?
            .context("Missing OAuth client registration")?;
        let metadata = self.metadata().await?;

        let tokens = flow::exchange_code(
            &self.http,
            &metadata,
            &client,
            code,
            &verifier,
            &redirect_uri,
            self.resource.as_str(),
        )
        .await?;
        self.store.save_tokens(&tokens).await?;
        self.store.clear(ClearScope::Verifier).await?;
        self.store.clear(ClearScope::State).await?;
        tracing::info!("OAuth authorization for {} complete", self.server);

        if let Some(listener) = self.listener.lock().await.take() {
            listener.close().await;
        }
        Ok(())
    }

    async fn close(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            listener.close().await;
        }
    }
}
