//! Conversation message model — spec §3.
//!
//! Grounded on `chat-cli`'s `conversation.rs` message-history shape (ordered,
//! append-only, roles carrying either plain text or a tool-call/result), but
//! simplified to exactly what the orchestrator needs: a role-tagged,
//! append-only sequence that survives agent rebuilds.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    ToolCall { name: String, arguments: serde_json::Value },
    ToolResult { name: String, result: serde_json::Value },
}

impl Content {
    pub fn as_text(&self) -> String {
        match self {
            Content::Text(s) => s.clone(),
            Content::ToolCall { name, arguments } => format!("[tool-call {name} {arguments}]"),
            Content::ToolResult { name, result } => format!("[tool-result {name} {result}]"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: Content::Text(text.into()), tool_call_id: None }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: Content::Text(text.into()), tool_call_id: None }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self { role: Role::System, content: Content::Text(text.into()), tool_call_id: None }
    }
}
