//! Smithery registry client: search and per-server spec retrieval — spec §3,
//! §4.3.
//!
//! Grounded on `deepmcpagent/registry.py`'s `SmitheryAPIClient` for the wire
//! shape (query params, `{"servers": [...]}` vs. bare-list response tolerance,
//! `qualifiedName`/`qualified_name` dual-key tolerance, exponential backoff on
//! network/timeout errors only), restated per spec §9's redesign flag:
//! gating on OAuth is modeled as [`GetServerOutcome::OAuthRequired`], a typed
//! signal the caller matches on, rather than raised as an exception that
//! unwinds across the discovery pipeline.
//!
//! Per spec §4.3, whether a server needs authorization is a property of its
//! `deploymentUrl` (Smithery-centrally-hosted vs. self-hosted) and of whether
//! a [`TokenStore`] record already exists for it — not of the HTTP status the
//! registry happens to answer `get_server` with.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{GetServerOutcome, OAuthRequired, RegistryError};
use crate::oauth::{self, SMITHERY_HOSTED_SUBSTRING};
use crate::server_spec::{HttpSpec, HttpTransport, ServerSpec};
use crate::token_store::TokenStore;

const DEFAULT_BASE_URL: &str = "https://registry.smithery.ai";
const MAX_RETRIES: u32 = 3;

/// Qualified names contain `@` and `/`, both of which must be escaped to
/// form a single path segment.
const QUALIFIED_NAME_PATH_SEGMENT: &AsciiSet = &CONTROLS.add(b'@').add(b'/');

#[derive(Debug, Clone, Deserialize)]
pub struct SearchResult {
    #[serde(alias = "qualifiedName")]
    pub qualified_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SearchResponse {
    Bare(Vec<SearchResult>),
    Wrapped { servers: Vec<SearchResult> },
}

#[derive(Debug, Deserialize)]
struct ServerConnection {
    #[serde(rename = "deploymentUrl")]
    deployment_url: Option<String>,
    #[serde(default = "default_transport")]
    #[serde(rename = "type")]
    transport: String,
}

fn default_transport() -> String {
    "http".to_string()
}

#[derive(Debug, Deserialize)]
struct ServerDetail {
    #[serde(default)]
    connections: Vec<ServerConnection>,
}

pub struct SmitheryClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    token_store: Arc<TokenStore>,
    search_cache: Mutex<HashMap<(String, u32), Vec<SearchResult>>>,
    server_cache: Mutex<HashMap<String, ServerSpec>>,
}

impl SmitheryClient {
    pub fn new(api_key: impl Into<String>, token_store: Arc<TokenStore>) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL, token_store)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>, token_store: Arc<TokenStore>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client builder with static config never fails"),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token_store,
            search_cache: Mutex::new(HashMap::new()),
            server_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Persists a freshly obtained token under `qualified_name` so the next
    /// `get_server` call for it finds a record and skips straight to `Ready`.
    pub async fn store_token(
        &self,
        qualified_name: &str,
        record: crate::token_store::TokenRecord,
    ) -> Result<(), crate::token_store::TokenStoreError> {
        self.token_store.save(qualified_name, record).await
    }

    pub async fn search(&self, query: &str, limit: u32) -> Result<Vec<SearchResult>, RegistryError> {
        let cache_key = (query.to_string(), limit);
        if let Some(cached) = self.search_cache.lock().unwrap().get(&cache_key) {
            return Ok(cached.clone());
        }

        let url = format!("{}/servers", self.base_url);
        let results = self
            .retry_with_backoff("search", || {
                self.http
                    .get(&url)
                    .bearer_auth(&self.api_key)
                    .query(&[("q", query), ("pageSize", &limit.to_string())])
                    .send()
            })
            .await?;

        let results = decode_search_response(results).await?;
        self.search_cache.lock().unwrap().insert(cache_key, results.clone());
        Ok(results)
    }

    /// Fetches the server's full registry metadata as raw JSON (e.g. for
    /// `connections[0].configSchema`), independent of the OAuth gating
    /// `get_server` layers on top.
    pub async fn fetch_full_metadata(&self, qualified_name: &str) -> Result<Value, RegistryError> {
        let encoded = utf8_percent_encode(qualified_name, QUALIFIED_NAME_PATH_SEGMENT);
        let url = format!("{}/servers/{encoded}", self.base_url);

        let response = self
            .retry_with_backoff("fetch_full_metadata", || self.http.get(&url).bearer_auth(&self.api_key).send())
            .await?;

        if !response.status().is_success() {
            return Err(RegistryError::Http {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        Ok(response
            .json()
            .await
            .map_err(|source| RegistryError::Network { attempts: 1, source })?)
    }

    /// Returns [`GetServerOutcome::Ready`] with a validated [`ServerSpec`], or
    /// [`GetServerOutcome::OAuthRequired`] when the server's `deploymentUrl`
    /// is Smithery-centrally-hosted and no [`TokenStore`] record exists for
    /// it yet. A self-hosted `deploymentUrl` always passes through as
    /// `Ready`; a Smithery-hosted one with a stored token is returned
    /// `Ready` with a `Bearer` `Authorization` header attached.
    pub async fn get_server(&self, qualified_name: &str) -> Result<GetServerOutcome, RegistryError> {
        if let Some(cached) = self.server_cache.lock().unwrap().get(qualified_name) {
            return Ok(GetServerOutcome::Ready(cached.clone()));
        }

        let metadata = self.fetch_full_metadata(qualified_name).await?;
        let detail: ServerDetail = serde_json::from_value(metadata)?;
        let connection = detail
            .connections
            .first()
            .ok_or_else(|| RegistryError::NoConnections { qualified_name: qualified_name.to_string() })?;

        let deployment_url = connection
            .deployment_url
            .clone()
            .ok_or_else(|| RegistryError::MissingDeploymentUrl { qualified_name: qualified_name.to_string() })?;

        let transport = HttpTransport::parse(&connection.transport).ok_or_else(|| {
            RegistryError::UnsupportedTransport {
                qualified_name: qualified_name.to_string(),
                transport: connection.transport.clone(),
            }
        })?;

        if !deployment_url.contains(SMITHERY_HOSTED_SUBSTRING) {
            let spec =
                ServerSpec::Http(HttpSpec { url: deployment_url, transport, headers: HashMap::new(), auth: None });
            self.server_cache.lock().unwrap().insert(qualified_name.to_string(), spec.clone());
            return Ok(GetServerOutcome::Ready(spec));
        }

        match self.token_store.get(qualified_name).await {
            Some(record) => {
                let mut headers = HashMap::new();
                headers.insert("Authorization".to_string(), format!("Bearer {}", record.access_token));
                let spec = ServerSpec::Http(HttpSpec {
                    url: deployment_url,
                    transport,
                    headers,
                    auth: Some("bearer".to_string()),
                });
                self.server_cache.lock().unwrap().insert(qualified_name.to_string(), spec.clone());
                Ok(GetServerOutcome::Ready(spec))
            },
            None => {
                let config = oauth::discover_oauth_metadata(&deployment_url).await.unwrap_or_else(|e| {
                    warn!("OAuth discovery failed for '{qualified_name}', using deployment URL as resource: {e}");
                    crate::oauth::OAuthConfig {
                        authorization_endpoint: String::new(),
                        token_endpoint: String::new(),
                        resource: deployment_url.clone(),
                        scopes: Vec::new(),
                        token_types_supported: vec!["Bearer".to_string()],
                    }
                });

                Ok(GetServerOutcome::OAuthRequired(OAuthRequired {
                    config,
                    authorization_url_base: deployment_url,
                }))
            },
        }
    }

    /// Retries network/timeout failures with 1s/2s/4s backoff; HTTP status
    /// responses (even error ones) are returned immediately for the caller to
    /// interpret, matching the original's "don't retry on 4xx/5xx" rule.
    async fn retry_with_backoff<F, Fut>(&self, operation: &str, mut make_request: F) -> Result<reqwest::Response, RegistryError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = reqwest::Result<reqwest::Response>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match make_request().await {
                Ok(response) => return Ok(response),
                Err(source) if (source.is_timeout() || source.is_connect()) && attempt < MAX_RETRIES => {
                    let backoff = Duration::from_secs(1 << (attempt - 1));
                    debug!("{operation} attempt {attempt} failed ({source}), retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                },
                Err(source) if source.is_timeout() || source.is_connect() => {
                    return Err(RegistryError::Network { attempts: MAX_RETRIES, source });
                },
                Err(source) => return Err(RegistryError::Network { attempts: attempt, source }),
            }
        }
    }
}

async fn decode_search_response(response: reqwest::Response) -> Result<Vec<SearchResult>, RegistryError> {
    if !response.status().is_success() {
        return Err(RegistryError::Http {
            status: response.status().as_u16(),
            body: response.text().await.unwrap_or_default(),
        });
    }
    match response
        .json::<SearchResponse>()
        .await
        .map_err(|source| RegistryError::Network { attempts: 1, source })?
    {
        SearchResponse::Bare(v) => Ok(v),
        SearchResponse::Wrapped { servers } => Ok(servers),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// The backing `TempDir` is dropped (and its directory removed) as soon
    /// as this returns; `TokenStore` recreates the directory lazily on first
    /// write, so the path remains usable for the rest of the test.
    fn test_token_store() -> Arc<TokenStore> {
        let dir = tempdir().unwrap();
        Arc::new(TokenStore::new(dir.path().join("tokens.json"), dir.path().join("key")))
    }

    fn client(base_url: impl Into<String>) -> SmitheryClient {
        SmitheryClient::with_base_url("key", base_url, test_token_store())
    }

    #[tokio::test]
    async fn search_tolerates_bare_list_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/servers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"qualifiedName": "@smithery/github", "name": "github"}
            ])))
            .mount(&server)
            .await;

        let client = client(server.uri());
        let results = client.search("github", 5).await.unwrap();
        assert_eq!(results[0].qualified_name.as_deref(), Some("@smithery/github"));
    }

    #[tokio::test]
    async fn search_tolerates_wrapped_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/servers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "servers": [{"qualified_name": "@smithery/weather", "name": "weather"}]
            })))
            .mount(&server)
            .await;

        let client = client(server.uri());
        let results = client.search("weather", 5).await.unwrap();
        assert_eq!(results[0].qualified_name.as_deref(), Some("@smithery/weather"));
    }

    #[tokio::test]
    async fn search_results_are_cached_by_query_and_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/servers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(server.uri());
        client.search("github", 5).await.unwrap();
        client.search("github", 5).await.unwrap();
    }

    #[tokio::test]
    async fn get_server_extracts_first_connection_when_self_hosted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/servers/%40smithery%2Fgithub"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "connections": [{"deploymentUrl": "https://my-own-host.example.com/mcp", "type": "http"}]
            })))
            .mount(&server)
            .await;

        let client = client(server.uri());
        let outcome = client.get_server("@smithery/github").await.unwrap();
        match outcome {
            GetServerOutcome::Ready(ServerSpec::Http(h)) => {
                assert_eq!(h.url, "https://my-own-host.example.com/mcp");
                assert_eq!(h.transport, HttpTransport::Http);
                assert!(h.headers.is_empty());
            },
            other => panic!("expected Ready(Http(..)), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_server_with_no_connections_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/servers/%40smithery%2Fempty"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"connections": []})))
            .mount(&server)
            .await;

        let client = client(server.uri());
        let err = client.get_server("@smithery/empty").await.unwrap_err();
        assert!(matches!(err, RegistryError::NoConnections { .. }));
    }

    #[tokio::test]
    async fn get_server_requires_oauth_for_smithery_hosted_url_with_no_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/servers/%40smithery%2Fsecure"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "connections": [{"deploymentUrl": "https://server.smithery.ai/secure/mcp", "type": "http"}]
            })))
            .mount(&server)
            .await;

        let client = client(server.uri());
        let outcome = client.get_server("@smithery/secure").await.unwrap();
        assert!(matches!(outcome, GetServerOutcome::OAuthRequired(_)));
    }

    #[tokio::test]
    async fn get_server_attaches_bearer_token_when_record_exists() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/servers/%40smithery%2Fsecure"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "connections": [{"deploymentUrl": "https://server.smithery.ai/secure/mcp", "type": "http"}]
            })))
            .mount(&server)
            .await;

        let token_store = test_token_store();
        token_store
            .save(
                "@smithery/secure",
                crate::token_store::TokenRecord {
                    access_token: "abc123".to_string(),
                    token_type: "Bearer".to_string(),
                    expires_in: 3600,
                    refresh_token: None,
                    created_at: 0,
                },
            )
            .await
            .unwrap();

        let client = SmitheryClient::with_base_url("key", server.uri(), token_store);
        let outcome = client.get_server("@smithery/secure").await.unwrap();
        match outcome {
            GetServerOutcome::Ready(ServerSpec::Http(h)) => {
                assert_eq!(h.headers.get("Authorization"), Some(&"Bearer abc123".to_string()));
            },
            other => panic!("expected Ready(Http(..)), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsupported_transport_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/servers/%40smithery%2Fweird"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "connections": [{"deploymentUrl": "https://x", "type": "websocket"}]
            })))
            .mount(&server)
            .await;

        let client = client(server.uri());
        let err = client.get_server("@smithery/weird").await.unwrap_err();
        assert!(matches!(err, RegistryError::UnsupportedTransport { .. }));
    }
}
