//! CLI surface and server-spec parsing — spec §6.
//!
//! Grounded on `chat-cli`'s `clap`-derived top-level `Cli` (env-backed flags,
//! `#[command(version)]`) and on `cli.py`'s `--http`/`--stdio` key=value
//! blob parsing and `_get_default_servers`/`TAVILY_API_KEY` auto-wiring,
//! restated as a typed parser instead of `shlex.split` + dict comprehension.

use std::collections::HashMap;

use clap::Parser;

use crate::error::ConfigurationError;
use crate::server_spec::{HttpSpec, HttpTransport, ServerSpec, SubprocessSpec};

const TAVILY_MCP_URL: &str = "https://mcp.tavily.com/mcp/";

#[derive(Parser, Debug)]
#[command(name = "oneshot-mcp", version, about = "Dynamic MCP tool-discovery orchestrator for LLM agents")]
pub struct Cli {
    /// Provider-id string passed to `build_model`, e.g. "openai:gpt-4o-mini".
    #[arg(long, env = "ONESHOT_MODEL", default_value = "openai:gpt-4o-mini")]
    pub model: String,

    #[arg(long, env = "SMITHERY_API_KEY")]
    pub smithery_key: Option<String>,

    /// `"name=… url=… [transport=http|streamable-http|sse] [header.X=Y] [auth=…]"`, repeatable.
    #[arg(long = "http")]
    pub http: Vec<String>,

    /// `"name=… command=… args='…' [env.X=Y] [cwd=…] [keep_alive=true|false]"`, repeatable.
    #[arg(long = "stdio")]
    pub stdio: Vec<String>,

    #[arg(long)]
    pub instructions: Option<String>,

    #[arg(short, long)]
    pub verbose: bool,
}

/// Splits a blob into `key=value` tokens, respecting single/double-quoted
/// values (so `args='-y @foo/bar'` survives as one token) the way the
/// original's `shlex.split` does for its space-delimited flag blobs.
fn tokenize(blob: &str) -> Result<Vec<String>, ConfigurationError> {
    shlex::split(blob).ok_or_else(|| ConfigurationError::BadArgument(format!("unparseable server spec: '{blob}'")))
}

fn split_pair(token: &str) -> Result<(&str, &str), ConfigurationError> {
    token.split_once('=').ok_or_else(|| ConfigurationError::BadArgument(format!("expected key=value, got '{token}'")))
}

/// Parses one `--http` blob into `(alias, ServerSpec::Http)`.
fn parse_http_spec(blob: &str) -> Result<(String, ServerSpec), ConfigurationError> {
    let tokens = tokenize(blob)?;

    let mut name = None;
    let mut url = None;
    let mut transport = HttpTransport::Http;
    let mut headers = HashMap::new();
    let mut auth = None;

    for token in &tokens {
        let (key, value) = split_pair(token)?;
        match key {
            "name" => name = Some(value.to_string()),
            "url" => url = Some(value.to_string()),
            "transport" => {
                transport = HttpTransport::parse(value)
                    .ok_or_else(|| ConfigurationError::BadArgument(format!("unsupported transport '{value}'")))?;
            },
            "auth" => auth = Some(value.to_string()),
            _ if key.starts_with("header.") => {
                headers.insert(key.trim_start_matches("header.").to_string(), value.to_string());
            },
            other => return Err(ConfigurationError::BadArgument(format!("unknown --http field '{other}'"))),
        }
    }

    let name = name.ok_or_else(|| ConfigurationError::BadArgument("--http spec missing 'name'".to_string()))?;
    let url = url.ok_or_else(|| ConfigurationError::BadArgument("--http spec missing 'url'".to_string()))?;

    Ok((name, ServerSpec::Http(HttpSpec { url, transport, headers, auth })))
}

/// Parses one `--stdio` blob into `(alias, ServerSpec::Subprocess)`.
fn parse_stdio_spec(blob: &str) -> Result<(String, ServerSpec), ConfigurationError> {
    let tokens = tokenize(blob)?;

    let mut name = None;
    let mut command = None;
    let mut args = Vec::new();
    let mut env = HashMap::new();
    let mut cwd = None;
    let mut keep_alive = true;

    for token in &tokens {
        let (key, value) = split_pair(token)?;
        match key {
            "name" => name = Some(value.to_string()),
            "command" => command = Some(value.to_string()),
            "args" => args = shlex::split(value).unwrap_or_else(|| vec![value.to_string()]),
            "cwd" => cwd = Some(value.to_string()),
            "keep_alive" => {
                keep_alive = value.parse().map_err(|_| {
                    ConfigurationError::BadArgument(format!("keep_alive must be true/false, got '{value}'"))
                })?;
            },
            _ if key.starts_with("env.") => {
                env.insert(key.trim_start_matches("env.").to_string(), value.to_string());
            },
            other => return Err(ConfigurationError::BadArgument(format!("unknown --stdio field '{other}'"))),
        }
    }

    let name = name.ok_or_else(|| ConfigurationError::BadArgument("--stdio spec missing 'name'".to_string()))?;
    let command = command.ok_or_else(|| ConfigurationError::BadArgument("--stdio spec missing 'command'".to_string()))?;

    Ok((name, ServerSpec::Subprocess(SubprocessSpec { command, args, env, cwd, keep_alive })))
}

/// Adds the `tavily` server automatically when `TAVILY_API_KEY` is set,
/// mirroring `cli.py::_get_default_servers`. Runs before user-provided
/// `--http`/`--stdio` blocks are merged in, so a user override of the same
/// alias still wins.
fn default_servers() -> HashMap<String, ServerSpec> {
    let mut servers = HashMap::new();
    if let Ok(key) = std::env::var("TAVILY_API_KEY") {
        servers.insert(
            "tavily".to_string(),
            ServerSpec::Http(HttpSpec {
                url: format!("{TAVILY_MCP_URL}?tavilyApiKey={key}"),
                transport: HttpTransport::Http,
                headers: HashMap::new(),
                auth: None,
            }),
        );
    }
    servers
}

/// Builds the initial server map: environment-wired defaults, overridden by
/// whatever the user passed via `--http`/`--stdio`, matching the original's
/// `{**default_servers, **user_servers}` merge where user entries win on
/// alias collision.
pub fn merge_servers(cli: &Cli) -> Result<HashMap<String, ServerSpec>, ConfigurationError> {
    let mut servers = default_servers();

    for blob in &cli.http {
        let (alias, spec) = parse_http_spec(blob)?;
        spec.validate().map_err(ConfigurationError::BadArgument)?;
        servers.insert(alias, spec);
    }

    for blob in &cli.stdio {
        let (alias, spec) = parse_stdio_spec(blob)?;
        spec.validate().map_err(ConfigurationError::BadArgument)?;
        servers.insert(alias, spec);
    }

    Ok(servers)
}

pub fn require_smithery_key(cli: &Cli) -> Result<String, ConfigurationError> {
    cli.smithery_key.clone().ok_or(ConfigurationError::MissingSmitheryKey)
}
