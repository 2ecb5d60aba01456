use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Conversations ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    #[default]
    Chat,
    Note,
    Document,
}

impl ConversationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationType::Chat => "chat",
            ConversationType::Note => "note",
            ConversationType::Document => "document",
        }
    }
}

impl TryFrom<String> for ConversationType {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "chat" => Ok(ConversationType::Chat),
            "note" => Ok(ConversationType::Note),
            "document" => Ok(ConversationType::Document),
            other => Err(format!("Unknown conversation type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    pub title: String,
    pub project_id: Option<String>,
    pub folder_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: String, title: String, conversation_type: ConversationType) -> Self {
        let now = Utc::now();
        Self {
            id,
            conversation_type,
            title,
            project_id: None,
            folder_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for MessageRole {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "tool" => Ok(MessageRole::Tool),
            other => Err(format!("Unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    /// Monotonic within a conversation; assigned by storage on insert.
    pub position: i64,
    /// Tool-call metadata: an array of [`ToolCallRecord`] on assistant messages,
    /// `{"tool_call_id", "tool_name", "status"}` on tool messages.
    pub tool_calls: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// A message that has not been stored yet; storage assigns its id and position.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub tool_calls: Option<serde_json::Value>,
}

impl NewMessage {
    pub fn new(conversation_id: impl Into<String>, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            role,
            content: content.into(),
            tool_calls: None,
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: serde_json::Value) -> Self {
        self.tool_calls = Some(tool_calls);
        self
    }
}

// ── Tool calls ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Pending,
    Approved,
    Denied,
    Success,
    Error,
}

impl ToolCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCallStatus::Pending => "pending",
            ToolCallStatus::Approved => "approved",
            ToolCallStatus::Denied => "denied",
            ToolCallStatus::Success => "success",
            ToolCallStatus::Error => "error",
        }
    }
}

/// One tool invocation within a turn, folded into the assistant message of its round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub status: ToolCallStatus,
    pub output: serde_json::Value,
    pub elapsed_seconds: f64,
}

// ── Canvas ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Canvas {
    pub id: String,
    pub conversation_id: String,
    pub title: String,
    pub content: String,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Embeddings ────────────────────────────────────────────────────────────────

/// A stored message still lacking an embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEmbedding {
    pub message_id: String,
    pub conversation_id: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct StoredEmbedding {
    pub message_id: String,
    pub conversation_id: String,
    pub content: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub message_id: String,
    pub conversation_id: String,
    pub content: String,
    pub score: f32,
}

// ── Request / response bodies ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, rename = "type")]
    pub conversation_type: ConversationType,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub folder_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RewindRequest {
    pub position: i64,
}

#[derive(Debug, Deserialize)]
pub struct ApprovalResponse {
    pub approved: bool,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    #[serde(default)]
    pub limit: Option<usize>,
}
