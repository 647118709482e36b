//! OAuth 2.1 PKCE (RFC 7636) authorization-code flow for Smithery-hosted and
//! RFC 8414/9728-discoverable MCP servers — spec §3, §4.4.
//!
//! Grounded on `oauth.py`'s `PKCEAuthenticator`/`BrowserAuthHandler`/
//! `discover_oauth_metadata` for the exact wire semantics (form-encoded token
//! requests, RFC 8414-then-9728 discovery fallback, the Smithery shortcut),
//! restated with the teacher's loopback-listener idiom from
//! `mcp_client::oauth_util::make_svc`: an ephemeral-port `TcpListener`, a
//! one-shot `tokio::sync::oneshot` channel carrying the authorization code out
//! of a `hyper` `Service`, and a single `accept()` followed by exactly one
//! served connection.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::Service;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::error::OAuthError;
use crate::token_store::TokenRecord;

const PKCE_VERIFIER_BYTES: usize = 48;
const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(120);

/// Host substring marking a Smithery-centrally-hosted deployment URL, shared
/// by [`discover_oauth_metadata`]'s shortcut and `registry::SmitheryClient`'s
/// OAuth gating.
pub const SMITHERY_HOSTED_SUBSTRING: &str = "server.smithery.ai";

/// `client_id` this app registers itself as when running the PKCE flow.
pub const DEFAULT_CLIENT_ID: &str = "oneshotmcp-cli";

/// Endpoint metadata discovered via RFC 8414 / RFC 9728, or hardcoded for
/// known providers — spec §4.4.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthConfig {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub resource: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default = "default_token_types")]
    pub token_types_supported: Vec<String>,
}

fn default_token_types() -> Vec<String> {
    vec!["Bearer".to_string()]
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_bearer")]
    token_type: String,
    #[serde(default)]
    expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
}

fn default_bearer() -> String {
    "Bearer".to_string()
}

impl From<TokenResponse> for TokenRecord {
    fn from(t: TokenResponse) -> Self {
        TokenRecord {
            access_token: t.access_token,
            token_type: t.token_type,
            expires_in: t.expires_in,
            refresh_token: t.refresh_token,
            created_at: 0,
        }
    }
}

/// Generates a PKCE verifier/challenge pair and drives the authorization-code
/// exchange and refresh against one server's token endpoint.
pub struct PkceAuthenticator {
    http: reqwest::Client,
    config: OAuthConfig,
    client_id: String,
}

impl PkceAuthenticator {
    pub fn new(config: OAuthConfig, client_id: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), config, client_id: client_id.into() }
    }

    /// `verifier` is 64 base64url characters (48 random bytes, unpadded);
    /// `challenge` is `BASE64URL(SHA256(verifier))`, always 43 characters.
    pub fn generate_pkce_pair() -> (String, String) {
        let mut raw = [0u8; PKCE_VERIFIER_BYTES];
        rand::rng().fill_bytes(&mut raw);
        let verifier = URL_SAFE_NO_PAD.encode(raw);

        let digest = Sha256::digest(verifier.as_bytes());
        let challenge = URL_SAFE_NO_PAD.encode(digest);

        (verifier, challenge)
    }

    pub fn build_authorization_url(
        &self,
        redirect_uri: &str,
        code_challenge: &str,
        state: Option<&str>,
    ) -> String {
        let mut params = vec![
            ("response_type", "code".to_string()),
            ("client_id", self.client_id.clone()),
            ("redirect_uri", redirect_uri.to_string()),
            ("code_challenge", code_challenge.to_string()),
            ("code_challenge_method", "S256".to_string()),
        ];

        if !self.config.scopes.is_empty() {
            params.push(("scope", self.config.scopes.join(" ")));
        }
        if let Some(state) = state {
            params.push(("state", state.to_string()));
        }

        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();
        format!("{}?{}", self.config.authorization_endpoint, query)
    }

    pub async fn exchange_code_for_token(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenRecord, OAuthError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", &self.client_id),
            ("code_verifier", code_verifier),
        ];

        let response = self.http.post(&self.config.token_endpoint).form(&form).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(OAuthError::TokenExchange { status, body });
        }
        Ok(response.json::<TokenResponse>().await?.into())
    }

    /// OAuth 2.1 requires public-client refresh tokens to rotate; the server
    /// may return a new `refresh_token` alongside the new access token.
    pub async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenRecord, OAuthError> {
        let form =
            [("grant_type", "refresh_token"), ("refresh_token", refresh_token), ("client_id", &self.client_id)];

        let response = self.http.post(&self.config.token_endpoint).form(&form).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(OAuthError::TokenRefresh { status, body });
        }
        Ok(response.json::<TokenResponse>().await?.into())
    }
}

/// RFC 8414 Authorization Server Metadata, falling back to RFC 9728 Protected
/// Resource Metadata, with a hardcoded shortcut for Smithery-hosted servers
/// (whose centralized auth server predates both servers adopting discovery).
pub async fn discover_oauth_metadata(resource_url: &str) -> Result<OAuthConfig, OAuthError> {
    if resource_url.contains(SMITHERY_HOSTED_SUBSTRING) {
        return Ok(OAuthConfig {
            authorization_endpoint: "https://auth.smithery.ai/oauth/authorize".to_string(),
            token_endpoint: "https://auth.smithery.ai/oauth/token".to_string(),
            resource: resource_url.to_string(),
            scopes: vec!["read".to_string(), "write".to_string()],
            token_types_supported: vec!["Bearer".to_string()],
        });
    }

    let parsed = url::Url::parse(resource_url).map_err(|e| OAuthError::DiscoveryFailed(e.to_string()))?;
    let base_url = format!(
        "{}://{}",
        parsed.scheme(),
        parsed.host_str().ok_or_else(|| OAuthError::DiscoveryFailed("resource URL has no host".to_string()))?
    );

    let client = reqwest::Client::new();

    let primary = format!("{base_url}/.well-known/oauth-authorization-server");
    if let Ok(metadata) = fetch_metadata(&client, &primary).await {
        return Ok(OAuthConfig {
            authorization_endpoint: field(&metadata, "authorization_endpoint")?,
            token_endpoint: field(&metadata, "token_endpoint")?,
            resource: resource_url.to_string(),
            scopes: array_field(&metadata, "scopes_supported"),
            token_types_supported: {
                let t = array_field(&metadata, "token_types_supported");
                if t.is_empty() { vec!["Bearer".to_string()] } else { t }
            },
        });
    }

    let fallback = format!("{base_url}/.well-known/oauth-protected-resource");
    match fetch_metadata(&client, &fallback).await {
        Ok(metadata) => Ok(OAuthConfig {
            authorization_endpoint: field(&metadata, "authorization_endpoint")?,
            token_endpoint: field(&metadata, "token_endpoint")?,
            resource: metadata
                .get("resource")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| resource_url.to_string()),
            scopes: array_field(&metadata, "scopes_supported"),
            token_types_supported: {
                let t = array_field(&metadata, "token_types_supported");
                if t.is_empty() { vec!["Bearer".to_string()] } else { t }
            },
        }),
        Err(e) => Err(OAuthError::DiscoveryFailed(format!(
            "both RFC 8414 ({primary}) and RFC 9728 ({fallback}) failed: {e}"
        ))),
    }
}

async fn fetch_metadata(client: &reqwest::Client, url: &str) -> Result<serde_json::Value, OAuthError> {
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(OAuthError::DiscoveryFailed(format!("{url} returned {}", response.status())));
    }
    Ok(response.json().await?)
}

fn field(metadata: &serde_json::Value, key: &str) -> Result<String, OAuthError> {
    metadata
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| OAuthError::DiscoveryFailed(format!("missing '{key}' in metadata")))
}

fn array_field(metadata: &serde_json::Value, key: &str) -> Vec<String> {
    metadata
        .get(key)
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

/// Binds an ephemeral loopback port, serves exactly one connection, and
/// resolves to the `code` query parameter it carried (or the OAuth `error`
/// parameter, surfaced as [`OAuthError::AuthorizationDenied`]).
pub async fn run_callback_listener(timeout: Duration) -> Result<(SocketAddr, CallbackFuture), OAuthError> {
    let socket_addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let listener =
        tokio::net::TcpListener::bind(socket_addr).await.map_err(|source| OAuthError::ListenerBind {
            port: 0,
            source,
        })?;
    let actual_addr = listener.local_addr()?;

    let (tx, rx) = oneshot::channel::<CallbackResult>();
    let service = CallbackService { sender: Arc::new(Mutex::new(Some(tx))) };

    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let io = TokioIo::new(stream);
        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
            warn!("OAuth callback connection ended with an error: {err}");
        }
    });

    let future = CallbackFuture { rx, timeout };
    Ok((actual_addr, future))
}

pub struct CallbackFuture {
    rx: oneshot::Receiver<CallbackResult>,
    timeout: Duration,
}

impl CallbackFuture {
    pub async fn wait(self) -> Result<String, OAuthError> {
        let result = tokio::time::timeout(self.timeout, self.rx)
            .await
            .map_err(|_| OAuthError::Timeout(self.timeout.as_secs_f64()))?
            .map_err(|_| OAuthError::MissingCode)?;

        match result {
            CallbackResult::Code(code) => Ok(code),
            CallbackResult::Error(description) => Err(OAuthError::AuthorizationDenied(description)),
        }
    }
}

enum CallbackResult {
    Code(String),
    Error(String),
}

#[derive(Clone)]
struct CallbackService {
    sender: Arc<Mutex<Option<oneshot::Sender<CallbackResult>>>>,
}

impl Service<Request<Incoming>> for CallbackService {
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;
    type Response = Response<Full<Bytes>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let query = req.uri().query().unwrap_or("").to_string();
        let sender = self.sender.clone();

        Box::pin(async move {
            let params: HashMap<String, String> =
                url::form_urlencoded::parse(query.as_bytes()).into_owned().collect();

            let (status, body, result) = if let Some(error) = params.get("error") {
                let description = params.get("error_description").cloned().unwrap_or_else(|| error.clone());
                (400, callback_page("Authorization Failed", &description), CallbackResult::Error(description))
            } else if let Some(code) = params.get("code") {
                (200, callback_page("Authorization Successful!", "You can close this window."), CallbackResult::Code(
                    code.clone(),
                ))
            } else {
                (
                    400,
                    callback_page("Missing Authorization Code", "You can close this window."),
                    CallbackResult::Error("missing authorization code".to_string()),
                )
            };

            if let Some(tx) = sender.lock().expect("callback sender mutex poisoned").take() {
                let _ = tx.send(result);
            }

            Ok(Response::builder()
                .status(status)
                .header("Content-Type", "text/html")
                .body(Full::new(Bytes::from(body)))
                .expect("static response is always well-formed"))
        })
    }
}

fn callback_page(title: &str, detail: &str) -> String {
    format!(
        "<html><body style=\"font-family: sans-serif; padding: 40px; text-align: center;\">\
         <h1>{title}</h1><p>{detail}</p></body></html>"
    )
}

/// End-to-end authorization flow: discover endpoints, generate PKCE, bind the
/// loopback listener, hand the user an authorization URL, and exchange the
/// returned code for tokens. `present_authorization_url` is called with the
/// URL before this function blocks waiting for the callback, so the caller
/// can print it (or open a browser) while there's still time for the user to
/// visit it.
pub async fn authorize<F>(config: OAuthConfig, client_id: &str, present_authorization_url: F) -> Result<TokenRecord, OAuthError>
where
    F: FnOnce(&str),
{
    let (verifier, challenge) = PkceAuthenticator::generate_pkce_pair();
    let (addr, callback) = run_callback_listener(DEFAULT_AUTH_TIMEOUT).await?;
    let redirect_uri = format!("http://{addr}/callback");

    let authenticator = PkceAuthenticator::new(config, client_id);
    let authorization_url = authenticator.build_authorization_url(&redirect_uri, &challenge, None);

    present_authorization_url(&authorization_url);
    info!("listening for OAuth callback on {redirect_uri}");
    let code = callback.wait().await?;
    authenticator.exchange_code_for_token(&code, &verifier, &redirect_uri).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_pair_has_rfc7636_lengths() {
        let (verifier, challenge) = PkceAuthenticator::generate_pkce_pair();
        assert_eq!(verifier.len(), 64);
        assert_eq!(challenge.len(), 43);
        assert!(verifier.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn pkce_pairs_are_not_reused() {
        let (v1, _) = PkceAuthenticator::generate_pkce_pair();
        let (v2, _) = PkceAuthenticator::generate_pkce_pair();
        assert_ne!(v1, v2);
    }

    #[test]
    fn authorization_url_carries_pkce_params() {
        let config = OAuthConfig {
            authorization_endpoint: "https://auth.example.com/authorize".to_string(),
            token_endpoint: "https://auth.example.com/token".to_string(),
            resource: "https://mcp.example.com".to_string(),
            scopes: vec!["read".to_string()],
            token_types_supported: vec!["Bearer".to_string()],
        };
        let auth = PkceAuthenticator::new(config, "client-123");
        let url = auth.build_authorization_url("http://localhost:1234/callback", "chal123", Some("state1"));

        assert!(url.contains("code_challenge=chal123"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("scope=read"));
        assert!(url.contains("state=state1"));
    }

    #[tokio::test]
    async fn smithery_hosted_urls_skip_network_discovery() {
        let config = discover_oauth_metadata("https://server.smithery.ai/some-server/mcp").await.unwrap();
        assert_eq!(config.authorization_endpoint, "https://auth.smithery.ai/oauth/authorize");
        assert_eq!(config.token_endpoint, "https://auth.smithery.ai/oauth/token");
    }

    #[tokio::test]
    async fn callback_listener_resolves_code_from_query_string() {
        let (addr, callback) = run_callback_listener(Duration::from_secs(5)).await.unwrap();

        let client = reqwest::Client::new();
        let url = format!("http://{addr}/callback?code=abc123&state=xyz");
        let request = client.get(&url).send();
        let (code, _) = tokio::join!(callback.wait(), request);

        assert_eq!(code.unwrap(), "abc123");
    }

    #[tokio::test]
    async fn callback_listener_surfaces_provider_error() {
        let (addr, callback) = run_callback_listener(Duration::from_secs(5)).await.unwrap();

        let client = reqwest::Client::new();
        let url = format!("http://{addr}/callback?error=access_denied&error_description=user+declined");
        let request = client.get(&url).send();
        let (result, _) = tokio::join!(callback.wait(), request);

        match result {
            Err(OAuthError::AuthorizationDenied(desc)) => assert_eq!(desc, "user declined"),
            other => panic!("expected AuthorizationDenied, got {other:?}"),
        }
    }
}
