//! A local description of how to reach one MCP server — spec §3, §4.1.
//!
//! Grounded on `deepmcpagent/config.py`'s `StdioServerSpec`/`HTTPServerSpec`/
//! `servers_to_mcp_config`, restated as a Rust tagged enum instead of a
//! `Union` of two Pydantic models.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One of the two transport variants MCP servers are reached by.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerSpec {
    Subprocess(SubprocessSpec),
    Http(HttpSpec),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubprocessSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: bool,
}

fn default_keep_alive() -> bool {
    true
}

/// Transports allowed for an HTTP-reachable server, per spec §3 invariant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HttpTransport {
    Http,
    StreamableHttp,
    Sse,
}

impl HttpTransport {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "http" => Some(Self::Http),
            "streamable-http" => Some(Self::StreamableHttp),
            "sse" => Some(Self::Sse),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::StreamableHttp => "streamable-http",
            Self::Sse => "sse",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpSpec {
    pub url: String,
    pub transport: HttpTransport,
    pub headers: HashMap<String, String>,
    pub auth: Option<String>,
}

impl ServerSpec {
    /// Invariant (§3): url is non-empty; transport is in the allowed set.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            ServerSpec::Http(h) => {
                if h.url.trim().is_empty() {
                    return Err("HTTP server spec has an empty url".to_string());
                }
                Ok(())
            },
            ServerSpec::Subprocess(s) => {
                if s.command.trim().is_empty() {
                    return Err("subprocess server spec has an empty command".to_string());
                }
                Ok(())
            },
        }
    }
}

/// A single entry in the wire-config mapping passed to the MCP client
/// library's constructor. Fields are `Option` so that `serde_json` omits
/// `null`-less absent keys entirely (via `skip_serializing_if`), matching
/// the "omitted, not null" contract of spec §4.1.
#[derive(Debug, Serialize)]
pub struct WireConfigEntry {
    pub transport: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

/// Produce the wire-config mapping consumed by the MCP client library's
/// `{"mcpServers": {alias: wire-config}}` constructor, keyed by local alias.
///
/// Empty env maps and absent working directories are omitted, not encoded as
/// null, because the downstream client library rejects explicit nulls.
pub fn to_wire_config(
    specs: &HashMap<String, ServerSpec>,
) -> HashMap<String, WireConfigEntry> {
    specs
        .iter()
        .map(|(alias, spec)| {
            let entry = match spec {
                ServerSpec::Subprocess(s) => WireConfigEntry {
                    transport: "stdio".to_string(),
                    command: Some(s.command.clone()),
                    args: Some(s.args.clone()),
                    env: if s.env.is_empty() { None } else { Some(s.env.clone()) },
                    cwd: s.cwd.clone(),
                    keep_alive: Some(s.keep_alive),
                    url: None,
                    headers: None,
                    auth: None,
                },
                ServerSpec::Http(h) => WireConfigEntry {
                    transport: h.transport.as_str().to_string(),
                    command: None,
                    args: None,
                    env: None,
                    cwd: None,
                    keep_alive: None,
                    url: Some(h.url.clone()),
                    headers: if h.headers.is_empty() { None } else { Some(h.headers.clone()) },
                    auth: h.auth.clone(),
                },
            };
            (alias.clone(), entry)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_env_is_omitted_from_wire_config() {
        let mut specs = HashMap::new();
        specs.insert(
            "foo".to_string(),
            ServerSpec::Subprocess(SubprocessSpec {
                command: "npx".to_string(),
                args: vec!["-y".to_string(), "@foo/bar".to_string()],
                env: HashMap::new(),
                cwd: None,
                keep_alive: true,
            }),
        );

        let wire = to_wire_config(&specs);
        let json = serde_json::to_value(&wire["foo"]).unwrap();
        assert!(json.get("env").is_none());
        assert!(json.get("cwd").is_none());
    }

    #[test]
    fn populated_env_passes_through() {
        let mut env = HashMap::new();
        env.insert("API_KEY".to_string(), "xyz".to_string());
        let mut specs = HashMap::new();
        specs.insert(
            "foo".to_string(),
            ServerSpec::Subprocess(SubprocessSpec {
                command: "npx".to_string(),
                args: vec![],
                env,
                cwd: Some("/tmp".to_string()),
                keep_alive: true,
            }),
        );

        let wire = to_wire_config(&specs);
        let json = serde_json::to_value(&wire["foo"]).unwrap();
        assert_eq!(json["env"]["API_KEY"], "xyz");
        assert_eq!(json["cwd"], "/tmp");
    }

    #[test]
    fn http_spec_omits_empty_headers_and_auth() {
        let mut specs = HashMap::new();
        specs.insert(
            "web".to_string(),
            ServerSpec::Http(HttpSpec {
                url: "https://example.com/mcp".to_string(),
                transport: HttpTransport::Http,
                headers: HashMap::new(),
                auth: None,
            }),
        );

        let wire = to_wire_config(&specs);
        let json = serde_json::to_value(&wire["web"]).unwrap();
        assert!(json.get("headers").is_none());
        assert!(json.get("auth").is_none());
        assert_eq!(json["transport"], "http");
    }

    #[test]
    fn http_transport_parses_the_allowed_set_only() {
        assert_eq!(HttpTransport::parse("http"), Some(HttpTransport::Http));
        assert_eq!(HttpTransport::parse("streamable-http"), Some(HttpTransport::StreamableHttp));
        assert_eq!(HttpTransport::parse("sse"), Some(HttpTransport::Sse));
        assert_eq!(HttpTransport::parse("carrier-pigeon"), None);
    }
}
