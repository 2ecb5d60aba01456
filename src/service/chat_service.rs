use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::embedding_worker::EmbeddingIndexer;
use crate::agent::TurnOutcome;
use crate::db::{CanvasStore, ChatStore, EmbeddingStore};
use crate::errors::AppError;
use crate::models::{Canvas, Conversation, CreateConversationRequest, Message, MessageRole, NewMessage};

pub const MAX_MESSAGE_LENGTH: usize = 32_000;
const DEFAULT_TITLE: &str = "New Conversation";
const MAX_TITLE_LENGTH: usize = 200;

/// Conversation bookkeeping around agent turns.
#[derive(Clone)]
pub struct ChatService {
    chats: Arc<dyn ChatStore>,
    embeddings: Arc<dyn EmbeddingStore>,
    canvases: Arc<dyn CanvasStore>,
    indexer: Option<EmbeddingIndexer>,
}

impl ChatService {
    pub fn new<S>(store: Arc<S>) -> Self
    where
        S: ChatStore + EmbeddingStore + CanvasStore + 'static,
    {
        Self {
            chats: store.clone(),
            embeddings: store.clone(),
            canvases: store,
            indexer: None,
        }
    }

    /// Embeds new user messages inline as soon as they are stored.
    pub fn with_indexer(mut self, indexer: EmbeddingIndexer) -> Self {
        self.indexer = Some(indexer);
        self
    }

    pub fn canvas_store(&self) -> Arc<dyn CanvasStore> {
        self.canvases.clone()
    }

    // ── Validation ────────────────────────────────────────────────────────────

    pub fn validate_id(id: &str) -> Result<(), AppError> {
        Uuid::parse_str(id)
            .map(|_| ())
            .map_err(|_| AppError::InvalidId { id: id.to_string() })
    }

    pub fn validate_message(message: &str) -> Result<(), AppError> {
        if message.trim().is_empty() {
            return Err(AppError::EmptyField { field_name: "message".to_string() });
        }
        let length = message.chars().count();
        if length > MAX_MESSAGE_LENGTH {
            return Err(AppError::FieldTooLong {
                field_name: "message".to_string(),
                max_length: MAX_MESSAGE_LENGTH,
                actual_length: length,
            });
        }
        Ok(())
    }

    /// Validates the id and loads the conversation, or `ConversationNotFound`.
    pub async fn require_conversation(&self, id: &str) -> Result<Conversation, AppError> {
        Self::validate_id(id)?;
        self.chats
            .get_conversation(id)
            .await?
            .ok_or_else(|| AppError::ConversationNotFound { id: id.to_string() })
    }

    // ── Conversations ─────────────────────────────────────────────────────────

    pub async fn get_conversations(&self) -> Result<Vec<Conversation>, AppError> {
        self.chats.list_conversations().await
    }

    pub async fn create_conversation(&self, request: CreateConversationRequest) -> Result<Conversation, AppError> {
        let title = request
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_TITLE.to_string());
        let length = title.chars().count();
        if length > MAX_TITLE_LENGTH {
            return Err(AppError::FieldTooLong {
                field_name: "title".to_string(),
                max_length: MAX_TITLE_LENGTH,
                actual_length: length,
            });
        }

        let mut conversation = Conversation::new(Uuid::new_v4().to_string(), title, request.conversation_type);
        conversation.project_id = request.project_id;
        conversation.folder_id = request.folder_id;
        let saved = self.chats.create_conversation(&conversation).await?;
        info!(conversation_id = %saved.id, kind = saved.conversation_type.as_str(), "Conversation created");
        Ok(saved)
    }

    pub async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>, AppError> {
        self.require_conversation(conversation_id).await?;
        self.chats.list_messages(conversation_id).await
    }

    /// Deletes a conversation and everything it owns. Embedding cleanup is best-effort.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<(), AppError> {
        Self::validate_id(conversation_id)?;
        if let Err(e) = self.embeddings.delete_embeddings(conversation_id).await {
            warn!(conversation_id, error = %e, "Embedding cleanup failed, deleting anyway");
        }
        if !self.chats.delete_conversation(conversation_id).await? {
            return Err(AppError::ConversationNotFound { id: conversation_id.to_string() });
        }
        info!(conversation_id, "Conversation deleted");
        Ok(())
    }

    /// Drops every message after `position`; returns how many were removed.
    pub async fn rewind(&self, conversation_id: &str, position: i64) -> Result<u64, AppError> {
        self.require_conversation(conversation_id).await?;
        if position < 0 {
            return Err(AppError::InvalidValue {
                field_name: "position".to_string(),
                message: "must be zero or greater".to_string(),
            });
        }
        let removed = self.chats.rewind(conversation_id, position).await?;
        info!(conversation_id, position, removed, "Conversation rewound");
        Ok(removed)
    }

    pub async fn get_canvas(&self, conversation_id: &str) -> Result<Canvas, AppError> {
        self.require_conversation(conversation_id).await?;
        self.canvases
            .get_canvas(conversation_id)
            .await?
            .ok_or_else(|| AppError::RecordNotFound {
                entity_type: "canvas".to_string(),
                id: conversation_id.to_string(),
            })
    }

    // ── Turns ─────────────────────────────────────────────────────────────────

    /// Stores the user message and returns the full history including it.
    pub async fn begin_turn(&self, conversation_id: &str, message: &str) -> Result<Vec<Message>, AppError> {
        Self::validate_message(message)?;
        let stored = self
            .chats
            .create_message(NewMessage::new(conversation_id, MessageRole::User, message))
            .await?;
        debug!(conversation_id, position = stored.position, "User message stored");

        if let Some(indexer) = self.indexer.clone() {
            let stored = stored.clone();
            tokio::spawn(async move {
                indexer
                    .embed_message(&stored.id, &stored.content, &stored.conversation_id)
                    .await;
            });
        }

        self.chats.list_messages(conversation_id).await
    }

    /// Persists every completed round: the assistant message carrying its
    /// tool-call records, then one `tool` message per call.
    pub async fn persist_outcome(&self, conversation_id: &str, outcome: &TurnOutcome) -> Result<usize, AppError> {
        let mut batch = Vec::new();
        for round in &outcome.rounds {
            if round.text.is_empty() && round.tool_calls.is_empty() {
                continue;
            }

            let mut assistant = NewMessage::new(conversation_id, MessageRole::Assistant, round.text.clone());
            if !round.tool_calls.is_empty() {
                let records = serde_json::to_value(&round.tool_calls)
                    .map_err(|e| AppError::Unexpected(format!("Failed to encode tool calls: {e}")))?;
                assistant = assistant.with_tool_calls(records);
            }
            batch.push(assistant);

            for (record, content) in round.tool_calls.iter().zip(&round.tool_results) {
                let meta = json!({
                    "tool_call_id": record.id,
                    "tool_name": record.tool_name,
                    "status": record.status,
                });
                batch.push(NewMessage::new(conversation_id, MessageRole::Tool, content.clone()).with_tool_calls(meta));
            }
        }
        let stored = self.chats.create_messages(batch).await?.len();

        if let Err(e) = self.chats.touch_conversation(conversation_id).await {
            error!(conversation_id, error = %e, "Failed to update conversation timestamp");
        }
        debug!(conversation_id, stored, "Turn persisted");
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{RoundRecord, Termination};
    use crate::db::memory::MemoryStore;
    use crate::models::{ConversationType, ToolCallRecord, ToolCallStatus};
    use pretty_assertions::assert_eq;

    fn request(title: Option<&str>) -> CreateConversationRequest {
        CreateConversationRequest {
            title: title.map(str::to_string),
            conversation_type: ConversationType::Chat,
            project_id: None,
            folder_id: None,
        }
    }

    async fn service_with_conversation() -> (ChatService, String) {
        let service = ChatService::new(Arc::new(MemoryStore::new()));
        let conv = service.create_conversation(request(Some("Test"))).await.unwrap();
        (service, conv.id)
    }

    #[test]
    fn message_validation() {
        assert!(ChatService::validate_message("hi").is_ok());
        assert!(ChatService::validate_message("  \n").unwrap_err().is_validation());
        let long = "x".repeat(MAX_MESSAGE_LENGTH + 1);
        assert!(matches!(
            ChatService::validate_message(&long),
            Err(AppError::FieldTooLong { actual_length, .. }) if actual_length == MAX_MESSAGE_LENGTH + 1
        ));
        assert!(ChatService::validate_id("not-a-uuid").unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn create_defaults_title() {
        let service = ChatService::new(Arc::new(MemoryStore::new()));
        let conv = service.create_conversation(request(Some("   "))).await.unwrap();
        assert_eq!(conv.title, "New Conversation");
        assert_eq!(service.get_conversations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let service = ChatService::new(Arc::new(MemoryStore::new()));
        let id = Uuid::new_v4().to_string();
        assert!(service.get_messages(&id).await.unwrap_err().is_not_found());
        assert!(service.delete_conversation(&id).await.unwrap_err().is_not_found());
        assert!(service.get_messages("nope").await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn persists_rounds_with_tool_messages() {
        let (service, id) = service_with_conversation().await;
        let history = service.begin_turn(&id, "list files").await.unwrap();
        assert_eq!(history.len(), 1);

        let outcome = TurnOutcome {
            termination: Termination::Done,
            rounds: vec![
                RoundRecord {
                    text: String::new(),
                    tool_calls: vec![ToolCallRecord {
                        id: "call_1".into(),
                        tool_name: "bash".into(),
                        arguments: json!({"command": "ls"}),
                        status: ToolCallStatus::Success,
                        output: json!({"stdout": "a.txt"}),
                        elapsed_seconds: 0.01,
                    }],
                    tool_results: vec![r#"{"stdout":"a.txt"}"#.into()],
                },
                RoundRecord { text: "One file.".into(), tool_calls: vec![], tool_results: vec![] },
            ],
            final_text: "One file.".into(),
        };
        assert_eq!(service.persist_outcome(&id, &outcome).await.unwrap(), 3);

        let messages = service.get_messages(&id).await.unwrap();
        let roles: Vec<MessageRole> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![MessageRole::User, MessageRole::Assistant, MessageRole::Tool, MessageRole::Assistant]);
        assert_eq!(messages[1].tool_calls.as_ref().unwrap()[0]["id"], "call_1");
        assert_eq!(
            messages[2].tool_calls,
            Some(json!({"tool_call_id": "call_1", "tool_name": "bash", "status": "success"}))
        );
        let positions: Vec<i64> = messages.iter().map(|m| m.position).collect();
        assert_eq!(positions, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn rewind_drops_later_messages() {
        let (service, id) = service_with_conversation().await;
        for text in ["one", "two", "three"] {
            service.begin_turn(&id, text).await.unwrap();
        }
        assert_eq!(service.rewind(&id, 0).await.unwrap(), 2);
        assert_eq!(service.get_messages(&id).await.unwrap().len(), 1);
        assert!(service.rewind(&id, -1).await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn missing_canvas_is_not_found() {
        let (service, id) = service_with_conversation().await;
        assert!(service.get_canvas(&id).await.unwrap_err().is_not_found());
        service.canvas_store().create_canvas(&id, "Doc", "# Hi").await.unwrap();
        assert_eq!(service.get_canvas(&id).await.unwrap().version, 1);
    }
}
