//! Per-session MCP tool discovery, JSON-Schema→argument-type translation, and
//! the namespaced invocation shim — spec §3, §4.6.
//!
//! Session lifecycle (`serve`/`list_tools`/`call_tool`) is grounded on
//! `chat-cli::mcp_client::new_client`'s `TokioChildProcess` + `ServiceExt::serve`
//! pattern for stdio servers, and on `unicity-orchestrator::mcp_client`'s
//! `StreamableHttpClientTransport::from_uri` for HTTP ones — both wrap the
//! same `rmcp::Peer<RoleClient>` the teacher stores on `CustomTool`. The
//! per-server cap and tool-name mapping are grounded on
//! `deepmcpagent/tools.py`'s `_jsonschema_to_pydantic`/`MCPToolLoader`, with
//! the cap itself (`MAX_TOOLS_PER_SERVER`) carried over from
//! `oneshotmcp/config.py`.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use rmcp::RoleClient;
use rmcp::model::CallToolRequestParam;
use rmcp::service::RunningService;
use rmcp::transport::{StreamableHttpClientTransport, TokioChildProcess};
use rmcp::ServiceExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::ToolInvocationError;
use crate::server_spec::{HttpTransport, ServerSpec};
use crate::util::MCP_SERVER_TOOL_DELIMITER;

/// Context-window management (spec §4.6): beyond this many tools, a server's
/// remaining tools are dropped from the catalog, not truncated arbitrarily —
/// the first N as reported by `list_tools` are kept.
pub const MAX_TOOLS_PER_SERVER: usize = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgumentType {
    Text,
    Int,
    Float,
    Bool,
    List,
    Mapping,
    Opaque,
}

impl ArgumentType {
    fn from_json_schema_type(t: Option<&str>) -> Self {
        match t {
            Some("string") => Self::Text,
            Some("integer") => Self::Int,
            Some("number") => Self::Float,
            Some("boolean") => Self::Bool,
            Some("array") => Self::List,
            Some("object") => Self::Mapping,
            _ => Self::Opaque,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ArgumentSpec {
    pub name: String,
    pub arg_type: ArgumentType,
    pub description: Option<String>,
    pub required: bool,
}

/// A tool as presented to the agent: namespaced by its owning server so
/// identically-named tools on different servers don't collide.
#[derive(Clone, Debug)]
pub struct ToolDescriptor {
    pub server: String,
    pub tool_name: String,
    pub qualified_name: String,
    pub description: String,
    pub arguments: Vec<ArgumentSpec>,
}

fn arguments_from_schema(schema: &Value) -> Vec<ArgumentSpec> {
    let properties = schema.get("properties").and_then(|v| v.as_object());
    let required: Vec<&str> =
        schema.get("required").and_then(|v| v.as_array()).map(|a| a.iter().filter_map(|v| v.as_str()).collect()).unwrap_or_default();

    let Some(properties) = properties else {
        return Vec::new();
    };

    properties
        .iter()
        .map(|(name, prop)| ArgumentSpec {
            name: name.clone(),
            arg_type: ArgumentType::from_json_schema_type(prop.get("type").and_then(|v| v.as_str())),
            description: prop.get("description").and_then(|v| v.as_str()).map(str::to_string),
            required: required.contains(&name.as_str()),
        })
        .collect()
}

type Session = RunningService<RoleClient, ()>;

struct ConnectedServer {
    session: Arc<Mutex<Session>>,
    tool_names: Vec<String>,
}

/// Holds one live MCP session per connected server and the flattened,
/// namespaced view of their tools presented to the agent.
#[derive(Default)]
pub struct ToolCatalog {
    servers: HashMap<String, ConnectedServer>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects to every spec in `servers`, listing (and capping) each
    /// server's tools. A single server failing to connect is logged and
    /// skipped rather than aborting the whole catalog build, so partial
    /// discovery still yields a usable agent.
    pub async fn build(servers: &HashMap<String, ServerSpec>) -> Self {
        let mut catalog = Self::new();
        for (alias, spec) in servers {
            if let Err(e) = catalog.connect(alias, spec).await {
                warn!("failed to connect MCP server '{alias}': {e}");
            }
        }
        catalog
    }

    pub async fn connect(&mut self, alias: &str, spec: &ServerSpec) -> eyre::Result<()> {
        let session = connect_session(spec).await?;
        let tools = session.list_tools(Default::default()).await?.tools;

        let total = tools.len();
        let tool_names: Vec<String> = tools.into_iter().take(MAX_TOOLS_PER_SERVER).map(|t| t.name.to_string()).collect();

        if total > tool_names.len() {
            info!(
                "server '{alias}' reported {total} tools; capped to {} (MAX_TOOLS_PER_SERVER={MAX_TOOLS_PER_SERVER})",
                tool_names.len()
            );
        }

        self.servers.insert(alias.to_string(), ConnectedServer { session: Arc::new(Mutex::new(session)), tool_names });
        Ok(())
    }

    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        let mut out = Vec::new();
        for (alias, server) in &self.servers {
            let session = server.session.lock().await;
            let Ok(result) = session.list_tools(Default::default()).await else {
                continue;
            };
            for tool in result.tools.into_iter().take(MAX_TOOLS_PER_SERVER) {
                let schema = Value::Object((*tool.input_schema).clone());
                out.push(ToolDescriptor {
                    server: alias.clone(),
                    tool_name: tool.name.to_string(),
                    qualified_name: format!("{alias}{MCP_SERVER_TOOL_DELIMITER}{}", tool.name),
                    description: tool.description.map(|d| d.to_string()).unwrap_or_default(),
                    arguments: arguments_from_schema(&schema),
                });
            }
        }
        out
    }

    /// `loaded`/`total` per server, for the build-summary log line spec §4.6
    /// mandates when a server's tool count exceeds the cap.
    pub async fn tool_stats(&self) -> HashMap<String, (usize, usize)> {
        let mut stats = HashMap::new();
        for (alias, server) in &self.servers {
            let session = server.session.lock().await;
            let total = session.list_tools(Default::default()).await.map(|r| r.tools.len()).unwrap_or(server.tool_names.len());
            stats.insert(alias.clone(), (server.tool_names.len(), total));
        }
        stats
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub async fn invoke(&self, server: &str, tool_name: &str, arguments: Value) -> Result<Value, ToolInvocationError> {
        let connected = self.servers.get(server).ok_or_else(|| ToolInvocationError::Failed {
            server: server.to_string(),
            tool: tool_name.to_string(),
            source: eyre::eyre!("no connected server named '{server}'"),
        })?;

        let args_map = match arguments {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("payload".to_string(), other);
                Some(map)
            },
        };

        let params = CallToolRequestParam { name: Cow::from(tool_name.to_string()), arguments: args_map };

        let session = connected.session.lock().await;
        let result = session.call_tool(params).await.map_err(|e| ToolInvocationError::Failed {
            server: server.to_string(),
            tool: tool_name.to_string(),
            source: eyre::Report::new(e),
        })?;

        let value = serde_json::to_value(&result).unwrap_or(Value::Null);
        Ok(unwrap_result_value(value))
    }
}

/// Mirrors the original FastMCP tool wrapper's duck-typed unwrap order
/// (`data`, `text`, `content`, `result`): the first of those keys present on
/// the decoded response is returned, falling back to the whole value.
fn unwrap_result_value(value: Value) -> Value {
    if let Value::Object(ref map) = value {
        for key in ["data", "text", "content", "result"] {
            if let Some(v) = map.get(key) {
                return v.clone();
            }
        }
    }
    value
}

async fn connect_session(spec: &ServerSpec) -> eyre::Result<Session> {
    match spec {
        ServerSpec::Subprocess(s) => {
            let mut command = tokio::process::Command::new(&s.command);
            command.args(&s.args).envs(&s.env);
            if let Some(cwd) = &s.cwd {
                command.current_dir(cwd);
            }
            let child = TokioChildProcess::new(command)?;
            Ok(().serve(child).await?)
        },
        ServerSpec::Http(h) => match h.transport {
            HttpTransport::Http | HttpTransport::StreamableHttp => {
                let transport = StreamableHttpClientTransport::from_uri(h.url.as_str());
                Ok(().serve(transport).await?)
            },
            HttpTransport::Sse => {
                let transport = rmcp::transport::SseClientTransport::start(h.url.as_str()).await?;
                Ok(().serve(transport).await?)
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_types_map_to_argument_types() {
        assert_eq!(ArgumentType::from_json_schema_type(Some("string")), ArgumentType::Text);
        assert_eq!(ArgumentType::from_json_schema_type(Some("integer")), ArgumentType::Int);
        assert_eq!(ArgumentType::from_json_schema_type(Some("number")), ArgumentType::Float);
        assert_eq!(ArgumentType::from_json_schema_type(Some("boolean")), ArgumentType::Bool);
        assert_eq!(ArgumentType::from_json_schema_type(Some("array")), ArgumentType::List);
        assert_eq!(ArgumentType::from_json_schema_type(Some("object")), ArgumentType::Mapping);
        assert_eq!(ArgumentType::from_json_schema_type(Some("null")), ArgumentType::Opaque);
        assert_eq!(ArgumentType::from_json_schema_type(None), ArgumentType::Opaque);
    }

    #[test]
    fn arguments_from_schema_marks_required_fields() {
        let schema = serde_json::json!({
            "properties": {
                "owner": {"type": "string", "description": "repo owner"},
                "limit": {"type": "integer"}
            },
            "required": ["owner"]
        });

        let args = arguments_from_schema(&schema);
        let owner = args.iter().find(|a| a.name == "owner").unwrap();
        let limit = args.iter().find(|a| a.name == "limit").unwrap();
        assert!(owner.required);
        assert!(!limit.required);
        assert_eq!(owner.arg_type, ArgumentType::Text);
        assert_eq!(limit.arg_type, ArgumentType::Int);
    }

    #[test]
    fn unwrap_prefers_data_over_other_keys() {
        let value = serde_json::json!({"data": "payload", "text": "ignored", "content": "ignored"});
        assert_eq!(unwrap_result_value(value), serde_json::json!("payload"));
    }

    #[test]
    fn unwrap_falls_back_to_whole_value_when_no_known_key() {
        let value = serde_json::json!({"other": 1});
        assert_eq!(unwrap_result_value(value.clone()), value);
    }
}
