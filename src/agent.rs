//! Agent Builder and the ReAct-style tool-use loop — spec §3, §4.7.
//!
//! Grounded on `deepmcpagent/agent.py::build_deep_agent` for the shape
//! (connect servers → load tools → wrap a chat model → hand back something
//! invocable), restated around [`crate::mcp::ToolCatalog`] and
//! [`crate::model::ChatModel`] instead of a LangGraph `Runnable`, since the
//! in-process MCP client and LLM runtime the original delegates to
//! (`fastmcp.Client`, `create_react_agent`) are both out of scope here.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::StartupError;
use crate::mcp::ToolCatalog;
use crate::message::Message;
use crate::model::{ChatModel, ModelTurn};
use crate::server_spec::ServerSpec;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a capable deep agent. Use available tools from connected MCP servers \
to plan and execute tasks. Always inspect tool descriptions and input schemas \
before calling them. Be precise and avoid hallucinating tool arguments. \
Prefer calling tools rather than guessing, and cite results from tools clearly.";

/// A usable agent: an LLM wired to the tool catalog of every connected MCP
/// server, plus the system prompt it was built with.
pub struct Agent {
    model: Arc<dyn ChatModel>,
    catalog: ToolCatalog,
    system_prompt: String,
    trace_tools: bool,
}

impl Agent {
    /// Catalog listing failures are fatal (spec §4.7): an agent with no way
    /// to enumerate its tools cannot be trusted to decide when to call them.
    /// An empty catalog (zero servers, or every server failed to connect) is
    /// only a warning — the agent still runs, just tool-less.
    pub async fn build(
        servers: &HashMap<String, ServerSpec>,
        model: Arc<dyn ChatModel>,
        instructions: Option<String>,
        trace_tools: bool,
    ) -> Result<Self, StartupError> {
        let catalog = ToolCatalog::build(servers).await;

        if catalog.is_empty() && !servers.is_empty() {
            return Err(StartupError::CatalogListing(eyre::eyre!(
                "failed to list tools from any of {} configured server(s)",
                servers.len()
            )));
        }

        if catalog.is_empty() {
            warn!("agent built with zero connected servers; it has no tools available");
        } else if trace_tools {
            for (alias, (loaded, total)) in catalog.tool_stats().await {
                if total > loaded {
                    info!("{alias}: loaded {loaded}/{total} tools (filtered)");
                } else {
                    info!("{alias}: loaded {loaded} tools");
                }
            }
        }

        Ok(Self {
            model,
            catalog,
            system_prompt: instructions.unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            trace_tools,
        })
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn tool_count(&self) -> usize {
        self.catalog.server_count()
    }

    /// Runs the ReAct loop: ask the model for the next turn given the full
    /// message history, execute any requested tool call, append the result,
    /// and ask again — until the model returns plain text or the loop budget
    /// is exhausted.
    pub async fn invoke(&self, history: &[Message]) -> eyre::Result<String> {
        const MAX_TOOL_ITERATIONS: usize = 8;

        let tools = self.catalog.list_tools().await;
        let mut transcript = history.to_vec();
        if transcript.first().is_none_or(|m| m.role != crate::message::Role::System) {
            transcript.insert(0, Message::system(self.system_prompt.clone()));
        }

        for _ in 0..MAX_TOOL_ITERATIONS {
            match self.model.complete(&transcript, &tools).await? {
                ModelTurn::Text(text) => return Ok(text),
                ModelTurn::ToolCall { name, arguments } => {
                    let Some((server, tool_name)) = name.split_once(crate::util::MCP_SERVER_TOOL_DELIMITER) else {
                        return Err(eyre::eyre!("model requested unqualified tool name '{name}'"));
                    };

                    if self.trace_tools {
                        info!("invoking {server}/{tool_name} with {arguments}");
                    }

                    let result = self.catalog.invoke(server, tool_name, arguments.clone()).await;
                    let result_value = match result {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("tool call {name} failed: {e}");
                            serde_json::json!({"error": e.to_string()})
                        },
                    };

                    transcript.push(Message {
                        role: crate::message::Role::Assistant,
                        content: crate::message::Content::ToolCall { name: name.clone(), arguments },
                        tool_call_id: None,
                    });
                    transcript.push(Message {
                        role: crate::message::Role::Tool,
                        content: crate::message::Content::ToolResult { name, result: result_value },
                        tool_call_id: None,
                    });
                },
            }
        }

        Err(eyre::eyre!("exceeded maximum tool-call iterations ({MAX_TOOL_ITERATIONS}) without a final answer"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::mock::MockChatModel;

    #[tokio::test]
    async fn build_with_no_servers_succeeds_with_empty_catalog() {
        let model: Arc<dyn ChatModel> = Arc::new(MockChatModel::new(vec![]));
        let agent = Agent::build(&HashMap::new(), model, None, false).await.unwrap();
        assert_eq!(agent.tool_count(), 0);
    }

    #[tokio::test]
    async fn invoke_returns_text_turn_directly() {
        let model: Arc<dyn ChatModel> = Arc::new(MockChatModel::new(vec![ModelTurn::Text("42".to_string())]));
        let agent = Agent::build(&HashMap::new(), model, None, false).await.unwrap();

        let response = agent.invoke(&[Message::user("what is 6*7?")]).await.unwrap();
        assert_eq!(response, "42");
    }

    #[tokio::test]
    async fn default_system_prompt_is_injected_when_absent() {
        let model: Arc<dyn ChatModel> = Arc::new(MockChatModel::new(vec![ModelTurn::Text("ok".to_string())]));
        let agent = Agent::build(&HashMap::new(), model, None, false).await.unwrap();
        assert!(agent.system_prompt().contains("capable deep agent"));
    }

    #[tokio::test]
    async fn custom_instructions_override_default_prompt() {
        let model: Arc<dyn ChatModel> = Arc::new(MockChatModel::new(vec![]));
        let agent = Agent::build(&HashMap::new(), model, Some("be terse".to_string()), false).await.unwrap();
        assert_eq!(agent.system_prompt(), "be terse");
    }
}
