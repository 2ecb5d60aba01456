//! Process-local storage used by `exec --no-conversation` and by tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{CanvasStore, ChatStore, EmbeddingStore};
use crate::errors::AppError;
use crate::models::{Canvas, Conversation, Message, MessageRole, NewMessage, PendingEmbedding, StoredEmbedding};

#[derive(Default)]
struct Tables {
    conversations: HashMap<String, Conversation>,
    messages: Vec<Message>,
    embeddings: HashMap<String, (StoredEmbedding, String)>,
    canvases: HashMap<String, Canvas>,
}

impl Tables {
    fn append(&mut self, message: NewMessage) -> Message {
        let position = self
            .messages
            .iter()
            .filter(|m| m.conversation_id == message.conversation_id)
            .map(|m| m.position)
            .max()
            .map_or(0, |p| p + 1);
        let stored = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: message.conversation_id,
            role: message.role,
            content: message.content,
            position,
            tool_calls: message.tool_calls,
            created_at: Utc::now(),
        };
        self.messages.push(stored.clone());
        stored
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Content hash stored alongside a message's embedding, if any.
    pub fn content_hash(&self, message_id: &str) -> Option<String> {
        self.lock().embeddings.get(message_id).map(|(_, hash)| hash.clone())
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn create_conversation(&self, conversation: &Conversation) -> Result<Conversation, AppError> {
        self.lock()
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation.clone())
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, AppError> {
        let mut all: Vec<Conversation> = self.lock().conversations.values().cloned().collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(all)
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, AppError> {
        Ok(self.lock().conversations.get(id).cloned())
    }

    async fn delete_conversation(&self, id: &str) -> Result<bool, AppError> {
        let mut tables = self.lock();
        let existed = tables.conversations.remove(id).is_some();
        tables.messages.retain(|m| m.conversation_id != id);
        tables.canvases.remove(id);
        tables.embeddings.retain(|_, (e, _)| e.conversation_id != id);
        Ok(existed)
    }

    async fn touch_conversation(&self, id: &str) -> Result<(), AppError> {
        if let Some(c) = self.lock().conversations.get_mut(id) {
            c.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn create_message(&self, message: NewMessage) -> Result<Message, AppError> {
        Ok(self.lock().append(message))
    }

    async fn create_messages(&self, messages: Vec<NewMessage>) -> Result<Vec<Message>, AppError> {
        let mut tables = self.lock();
        Ok(messages.into_iter().map(|m| tables.append(m)).collect())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, AppError> {
        let mut msgs: Vec<Message> = self
            .lock()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        msgs.sort_by_key(|m| m.position);
        Ok(msgs)
    }

    async fn rewind(&self, conversation_id: &str, position: i64) -> Result<u64, AppError> {
        let mut tables = self.lock();
        let before = tables.messages.len();
        tables
            .messages
            .retain(|m| m.conversation_id != conversation_id || m.position <= position);
        Ok((before - tables.messages.len()) as u64)
    }
}

#[async_trait]
impl EmbeddingStore for MemoryStore {
    async fn unembedded_messages(&self, limit: usize, min_length: usize) -> Result<Vec<PendingEmbedding>, AppError> {
        let tables = self.lock();
        Ok(tables
            .messages
            .iter()
            .filter(|m| matches!(m.role, MessageRole::User | MessageRole::Assistant))
            .filter(|m| !tables.embeddings.contains_key(&m.id))
            .filter(|m| m.content.trim().chars().count() >= min_length)
            .take(limit)
            .map(|m| PendingEmbedding {
                message_id: m.id.clone(),
                conversation_id: m.conversation_id.clone(),
                content: m.content.clone(),
            })
            .collect())
    }

    async fn store_embedding(
        &self,
        message_id: &str,
        conversation_id: &str,
        embedding: &[f32],
        content_hash: &str,
    ) -> Result<(), AppError> {
        let mut tables = self.lock();
        let content = tables
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        tables.embeddings.insert(
            message_id.to_string(),
            (
                StoredEmbedding {
                    message_id: message_id.to_string(),
                    conversation_id: conversation_id.to_string(),
                    content,
                    embedding: embedding.to_vec(),
                },
                content_hash.to_string(),
            ),
        );
        Ok(())
    }

    async fn all_embeddings(&self) -> Result<Vec<StoredEmbedding>, AppError> {
        Ok(self.lock().embeddings.values().map(|(e, _)| e.clone()).collect())
    }

    async fn delete_embeddings(&self, conversation_id: &str) -> Result<u64, AppError> {
        let mut tables = self.lock();
        let before = tables.embeddings.len();
        tables.embeddings.retain(|_, (e, _)| e.conversation_id != conversation_id);
        Ok((before - tables.embeddings.len()) as u64)
    }
}

#[async_trait]
impl CanvasStore for MemoryStore {
    async fn get_canvas(&self, conversation_id: &str) -> Result<Option<Canvas>, AppError> {
        Ok(self.lock().canvases.get(conversation_id).cloned())
    }

    async fn create_canvas(&self, conversation_id: &str, title: &str, content: &str) -> Result<Canvas, AppError> {
        let mut tables = self.lock();
        if tables.canvases.contains_key(conversation_id) {
            return Err(AppError::CanvasExists { conversation_id: conversation_id.to_string() });
        }
        let now = Utc::now();
        let canvas = Canvas {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            title: title.to_string(),
            content: content.to_string(),
            version: 1,
            created_at: now,
            updated_at: now,
        };
        tables.canvases.insert(conversation_id.to_string(), canvas.clone());
        Ok(canvas)
    }

    async fn update_canvas(&self, conversation_id: &str, content: &str, title: Option<&str>) -> Result<Canvas, AppError> {
        let mut tables = self.lock();
        let canvas = tables
            .canvases
            .get_mut(conversation_id)
            .ok_or_else(|| AppError::RecordNotFound {
                entity_type: "canvas".to_string(),
                id: conversation_id.to_string(),
            })?;
        canvas.content = content.to_string();
        if let Some(title) = title {
            canvas.title = title.to_string();
        }
        canvas.version += 1;
        canvas.updated_at = Utc::now();
        Ok(canvas.clone())
    }
}
