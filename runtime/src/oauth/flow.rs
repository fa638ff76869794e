//! OAuth 2.1 authorization-code flow pieces
//!
//! Discovery, dynamic client registration, PKCE, and the token endpoint.
//! Each step is a plain async function over a `reqwest::Client`; the session
//! strings them together.

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use url::Url;

use super::store::{ClientInfo, OAuthTokens};

const CLIENT_NAME: &str = "mcp-runtime";

/// Endpoints of the authorization server
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthServerMetadata {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub scopes_supported: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ProtectedResourceMetadata {
    #[serde(default)]
    authorization_servers: Vec<String>,
    #[serde(default)]
    resource: Option<String>,
}

fn origin_of(url: &Url) -> Url {
    let mut origin = url.clone();
    origin.set_path("");
    origin.set_query(None);
    origin.set_fragment(None);
    origin
}

async fn fetch_json<T: for<'de> Deserialize<'de>>(
    http: &reqwest::Client,
    url: &Url,
) -> Option<T> {
    let response = http.get(url.clone()).send().await.ok()?;
    if !response.status().is_success() {
        tracing::debug!("{} -> HTTP {}", url, response.status());
        return None;
    }
    response.json::<T>().await.ok()
}

/// Locate the authorization server for an MCP endpoint
///
/// Order: protected-resource metadata, authorization-server metadata at the
/// issuer (RFC 8414 then OpenID), then the conventional `/authorize`,
/// `/token`, `/register` paths on the server's origin.
pub async fn discover(http: &reqwest::Client, server_url: &Url) -> Result<AuthServerMetadata> {
    let origin = origin_of(server_url);

    let mut issuer = origin.clone();
    let resource_url = origin.join("/.well-known/oauth-protected-resource")?;
    if let Some(resource) = fetch_json::<ProtectedResourceMetadata>(http, &resource_url).await {
        if let Some(first) = resource.authorization_servers.first() {
            issuer = Url::parse(first).context("Invalid authorization server URL")?;
        }
        tracing::debug!(
            "protected resource {:?} uses issuer {}",
            resource.resource,
            issuer
        );
    }

    let issuer_path = issuer.path().trim_end_matches('/').to_string();
    for well_known in [
        "/.well-known/oauth-authorization-server",
        "/.well-known/openid-configuration",
    ] {
        let candidate = origin_of(&issuer).join(&format!("{well_known}{issuer_path}"))?;
        if let Some(metadata) = fetch_json::<AuthServerMetadata>(http, &candidate).await {
            return Ok(metadata);
        }
    }

    tracing::debug!("no OAuth metadata published; using conventional endpoints");
    let base = origin_of(&issuer);
    Ok(AuthServerMetadata {
        authorization_endpoint: base.join("/authorize")?.to_string(),
        token_endpoint: base.join("/token")?.to_string(),
        registration_endpoint: Some(base.join("/register")?.to_string()),
        scopes_supported: None,
    })
}

/// PKCE verifier and its S256 challenge
#[derive(Debug, Clone)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    pub fn generate() -> Self {
        let verifier = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        Self::from_verifier(verifier)
    }

    pub fn from_verifier(verifier: String) -> Self {
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self {
            verifier,
            challenge,
        }
    }
}

pub fn new_state() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Dynamic client registration (RFC 7591)
pub async fn register_client(
    http: &reqwest::Client,
    metadata: &AuthServerMetadata,
    redirect_uri: &str,
) -> Result<ClientInfo> {
    let endpoint = metadata
        .registration_endpoint
        .as_deref()
        .context("Authorization server does not support dynamic client registration")?;
    let body = serde_json::json!({
        "client_name": CLIENT_NAME,
        "redirect_uris": [redirect_uri],
        "grant_types": ["authorization_code", "refresh_token"],
        "response_types": ["code"],
        "token_endpoint_auth_method": "none",
    });
    let response = http
        .post(endpoint)
        .json(&body)
        .send()
        .await
        .context("Client registration request failed")?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        anyhow::bail!("Client registration failed: HTTP {}: {}", status.as_u16(), text);
    }
    let mut client: ClientInfo = response
        .json()
        .await
        .context("Invalid client registration response")?;
    if client.redirect_uris.is_empty() {
        client.redirect_uris.push(redirect_uri.to_string());
    }
    Ok(client)
}

/// Browser URL for the consent screen
pub fn authorization_url(
    metadata: &AuthServerMetadata,
    client: &ClientInfo,
    redirect_uri: &str,
    pkce: &Pkce,
    state: &str,
    resource: &str,
) -> Result<Url> {
    let mut url = Url::parse(&metadata.authorization_endpoint)
        .context("Invalid authorization endpoint")?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", &client.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", state)
            .append_pair("resource", resource);
        if let Some(scopes) = &metadata.scopes_supported {
            if !scopes.is_empty() {
                query.append_pair("scope", &scopes.join(" "));
            }
        }
    }
    Ok(url)
}

async fn token_request(
    http: &reqwest::Client,
    metadata: &AuthServerMetadata,
    client: &ClientInfo,
    mut form: Vec<(&str, String)>,
) -> Result<OAuthTokens> {
    form.push(("client_id", client.client_id.clone()));
    if let Some(secret) = &client.client_secret {
        form.push(("client_secret", secret.clone()));
    }
    let response = http
        .post(&metadata.token_endpoint)
        .header(reqwest::header::ACCEPT, "application/json")
        .form(&form)
        .send()
        .await
        .context("Token request failed")?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        anyhow::bail!("Token endpoint returned HTTP {}: {}", status.as_u16(), text);
    }
    let tokens: OAuthTokens = response.json().await.context("Invalid token response")?;
    Ok(tokens.stamp_expiry())
}

/// Trade an authorization code for tokens
pub async fn exchange_code(
    http: &reqwest::Client,
    metadata: &AuthServerMetadata,
    client: &ClientInfo,
    code: &str,
    verifier: &str,
    redirect_uri: &str,
    resource: &str,
) -> Result<OAuthTokens> {
    token_request(
        http,
        metadata,
        client,
        vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("code_verifier", verifier.to_string()),
            ("redirect_uri", redirect_uri.to_string()),
            ("resource", resource.to_string()),
        ],
    )
    .await
}

/// Use a refresh token; keeps the old refresh token if none is returned
pub async fn refresh(
    http: &reqwest::Client,
    metadata: &AuthServerMetadata,
    client: &ClientInfo,
    refresh_token: &str,
    resource: &str,
) -> Result<OAuthTokens> {
    let mut tokens = token_request(
        http,
        metadata,
        client,
        vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("resource", resource.to_string()),
        ],
    )
    .await?;
    if tokens.refresh_token.is_none() {
        tokens.refresh_token = Some(refresh_token.to_string());
    }
    Ok(tokens)
}

/// Port of a loopback redirect URI, if it has one
pub fn redirect_port(redirect_uri: &str) -> Option<u16> {
    let url = Url::parse(redirect_uri).ok()?;
    match url.host_str()? {
        "127.0.0.1" | "localhost" => url.port(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_pkce_s256() {
        // RFC 7636 appendix B
        let pkce = Pkce::from_verifier("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk".to_string());
        assert_eq!(pkce.challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");

        let generated = Pkce::generate();
        assert_eq!(generated.verifier.len(), 64);
        assert!(!generated.challenge.contains('='));
    }

    #[test]
    fn test_authorization_url() {
        let metadata = AuthServerMetadata {
            authorization_endpoint: "https://auth.example.com/authorize".to_string(),
            token_endpoint: "https://auth.example.com/token".to_string(),
            registration_endpoint: None,
            scopes_supported: Some(vec!["read".to_string(), "write".to_string()]),
        };
        let client = ClientInfo {
            client_id: "client-1".to_string(),
            client_secret: None,
            redirect_uris: vec![],
            extra: BTreeMap::new(),
        };
        let pkce = Pkce::from_verifier("v".repeat(43));
        let url = authorization_url(
            &metadata,
            &client,
            "http://127.0.0.1:4567/callback",
            &pkce,
            "state-1",
            "https://mcp.example.com/mcp",
        )
        .expect("url");
        let pairs: BTreeMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["client_id"], "client-1");
        assert_eq!(pairs["code_challenge_method"], "S256");
        assert_eq!(pairs["state"], "state-1");
        assert_eq!(pairs["scope"], "read write");
    }

    #[test]
    fn test_redirect_port() {
        assert_eq!(redirect_port("http://127.0.0.1:4567/callback"), Some(4567));
        assert_eq!(redirect_port("https://example.com:8443/cb"), None);
        assert_eq!(redirect_port("not a url"), None);
    }
}
