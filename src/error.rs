//! Error taxonomy, as kinds rather than a single flat type — see spec §7.
//!
//! Each component owns the enum describing how it can fail; the orchestrator
//! and discovery pipeline match on these to decide whether a failure is
//! recovered locally (move to the next candidate) or fatal.

use thiserror::Error;

/// The remote registry returned a non-2xx response or retries were exhausted.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry request failed after {attempts} attempt(s): {source}")]
    Network {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("registry returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("server '{qualified_name}' has no connections defined")]
    NoConnections { qualified_name: String },
    #[error("server '{qualified_name}' connection missing 'deploymentUrl'")]
    MissingDeploymentUrl { qualified_name: String },
    #[error("server '{qualified_name}' has unsupported transport '{transport}'")]
    UnsupportedTransport { qualified_name: String, transport: String },
    #[error("failed to decode registry response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A typed signal, not a failure: the registry requires an OAuth flow before
/// the caller can retry `get_server`.
#[derive(Debug)]
pub struct OAuthRequired {
    pub config: crate::oauth::OAuthConfig,
    pub authorization_url_base: String,
}

/// Result of a registry `get_server` call: either a spec, a request for OAuth
/// consent, or a recoverable error. Modeled as a tagged enum, not an
/// exception, per spec §9 "Exception-driven control transfer".
#[derive(Debug)]
pub enum GetServerOutcome {
    Ready(crate::server_spec::ServerSpec),
    OAuthRequired(OAuthRequired),
}

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("token exchange failed ({status}): {body}")]
    TokenExchange { status: u16, body: String },
    #[error("token refresh failed ({status}): {body}")]
    TokenRefresh { status: u16, body: String },
    #[error("verifier validation failed")]
    VerifierMismatch,
    #[error("OAuth discovery failed at both RFC 8414 and RFC 9728 endpoints: {0}")]
    DiscoveryFailed(String),
    #[error("authorization timed out after {0:.0}s")]
    Timeout(f64),
    #[error("authorization failed: {0}")]
    AuthorizationDenied(String),
    #[error("no authorization code received")]
    MissingCode,
    #[error("failed to bind callback listener on port {port}: {source}")]
    ListenerBind { port: u16, source: std::io::Error },
    #[error(transparent)]
    Network(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("missing required configuration: {0}")]
    MissingConfig(String),
    #[error("installation cancelled by user")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ToolInvocationError {
    #[error("tool '{tool}' on server '{server}' failed: {source}")]
    Failed {
        server: String,
        tool: String,
        #[source]
        source: eyre::Report,
    },
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("{0}")]
    BadArgument(String),
    #[error("SMITHERY_API_KEY is required (set it via --smithery-key or the environment)")]
    MissingSmitheryKey,
    #[error("a model is required")]
    MissingModel,
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to list tools from configured servers: {0}")]
    CatalogListing(#[source] eyre::Report),
}
