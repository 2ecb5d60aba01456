//! Model-facing types: the conversation as the model sees it and the deltas it streams back.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::errors::AppError;
use crate::models::{Message, MessageRole, ToolCallRecord};
use crate::tools::ToolDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        }
    }
}

/// A tool call as requested by the model; `arguments` is the raw JSON text.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into(), tool_calls: Vec::new(), tool_call_id: None }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into(), tool_calls, tool_call_id: None }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelDelta {
    Token(String),
    /// A fragment of tool call `index`; `id` and `name` usually arrive on the first fragment only.
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<ModelDelta, AppError>> + Send>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Starts a streamed completion. The configured system prompt is prepended,
    /// followed by `extra_system_prompt` when given.
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        cancel: &CancellationToken,
        extra_system_prompt: Option<&str>,
    ) -> Result<DeltaStream, AppError>;
}

/// Replays stored messages in the shape the model expects.
pub fn history_to_chat_messages(messages: &[Message]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|m| match m.role {
            MessageRole::User => ChatMessage::user(&m.content),
            MessageRole::Assistant => {
                let calls = m
                    .tool_calls
                    .clone()
                    .and_then(|v| serde_json::from_value::<Vec<ToolCallRecord>>(v).ok())
                    .unwrap_or_default()
                    .into_iter()
                    .map(|r| ToolCallRequest { id: r.id, name: r.tool_name, arguments: r.arguments.to_string() })
                    .collect();
                ChatMessage::assistant(&m.content, calls)
            }
            MessageRole::Tool => {
                let call_id = m
                    .tool_calls
                    .as_ref()
                    .and_then(|v| v.get("tool_call_id"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                ChatMessage::tool(call_id, &m.content)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ToolCallStatus;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn msg(role: MessageRole, content: &str, position: i64, tool_calls: Option<Value>) -> Message {
        Message {
            id: format!("m{position}"),
            conversation_id: "c1".into(),
            role,
            content: content.into(),
            position,
            tool_calls,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn replays_tool_rounds() {
        let record = ToolCallRecord {
            id: "call_1".into(),
            tool_name: "bash".into(),
            arguments: json!({"command": "ls"}),
            status: ToolCallStatus::Success,
            output: json!({"stdout": "a"}),
            elapsed_seconds: 0.1,
        };
        let history = vec![
            msg(MessageRole::User, "list files", 0, None),
            msg(MessageRole::Assistant, "", 1, Some(serde_json::to_value(vec![record]).unwrap())),
            msg(MessageRole::Tool, r#"{"stdout":"a"}"#, 2, Some(json!({"tool_call_id": "call_1"}))),
            msg(MessageRole::Assistant, "one file", 3, None),
        ];

        let chat = history_to_chat_messages(&history);
        assert_eq!(chat.len(), 4);
        assert_eq!(chat[1].tool_calls[0].id, "call_1");
        assert_eq!(chat[1].tool_calls[0].arguments, r#"{"command":"ls"}"#);
        assert_eq!(chat[2].role, ChatRole::Tool);
        assert_eq!(chat[2].tool_call_id.as_deref(), Some("call_1"));
        assert!(chat[3].tool_calls.is_empty());
    }
}
