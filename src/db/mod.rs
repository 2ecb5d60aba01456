//! Storage traits consumed by the core, with a PostgreSQL implementation
//! ([`Database`]) and an in-process one ([`memory::MemoryStore`]).

pub mod canvas_repository;
pub mod conversation_repository;
pub mod embedding_repository;
pub mod memory;
pub mod message_repository;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{error, info};

use crate::errors::AppError;
use crate::models::{Canvas, Conversation, Message, NewMessage, PendingEmbedding, StoredEmbedding};

use canvas_repository::CanvasRepository;
use conversation_repository::ConversationRepository;
use embedding_repository::EmbeddingRepository;
use message_repository::MessageRepository;

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_conversation(&self, conversation: &Conversation) -> Result<Conversation, AppError>;
    async fn list_conversations(&self) -> Result<Vec<Conversation>, AppError>;
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, AppError>;
    async fn delete_conversation(&self, id: &str) -> Result<bool, AppError>;
    async fn touch_conversation(&self, id: &str) -> Result<(), AppError>;
    async fn create_message(&self, message: NewMessage) -> Result<Message, AppError>;
    /// Appends `messages` in order as one contiguous run of positions.
    async fn create_messages(&self, messages: Vec<NewMessage>) -> Result<Vec<Message>, AppError>;
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, AppError>;
    async fn rewind(&self, conversation_id: &str, position: i64) -> Result<u64, AppError>;
}

#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    /// Messages without an embedding whose trimmed content has at least `min_length` chars.
    async fn unembedded_messages(&self, limit: usize, min_length: usize) -> Result<Vec<PendingEmbedding>, AppError>;
    async fn store_embedding(
        &self,
        message_id: &str,
        conversation_id: &str,
        embedding: &[f32],
        content_hash: &str,
    ) -> Result<(), AppError>;
    async fn all_embeddings(&self) -> Result<Vec<StoredEmbedding>, AppError>;
    async fn delete_embeddings(&self, conversation_id: &str) -> Result<u64, AppError>;
}

#[async_trait]
pub trait CanvasStore: Send + Sync {
    async fn get_canvas(&self, conversation_id: &str) -> Result<Option<Canvas>, AppError>;
    async fn create_canvas(&self, conversation_id: &str, title: &str, content: &str) -> Result<Canvas, AppError>;
    async fn update_canvas(&self, conversation_id: &str, content: &str, title: Option<&str>) -> Result<Canvas, AppError>;
}

/// PostgreSQL-backed storage: one repository per table.
#[derive(Clone)]
pub struct Database {
    conversations: ConversationRepository,
    messages: MessageRepository,
    embeddings: EmbeddingRepository,
    canvases: CanvasRepository,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self {
            conversations: ConversationRepository::new(pool.clone()),
            messages: MessageRepository::new(pool.clone()),
            embeddings: EmbeddingRepository::new(pool.clone()),
            canvases: CanvasRepository::new(pool),
        }
    }

    /// Connects and applies pending migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| {
                error!("Failed to connect to database: {e}");
                AppError::DatabaseConnectionFailed(e)
            })?;
        info!("Connected to PostgreSQL");

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| AppError::Config(format!("Failed to run migrations: {e}")))?;
        info!("Migrations applied");

        Ok(Self::new(pool))
    }
}

#[async_trait]
impl ChatStore for Database {
    async fn create_conversation(&self, conversation: &Conversation) -> Result<Conversation, AppError> {
        self.conversations.save(conversation).await
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, AppError> {
        self.conversations.find_all().await
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, AppError> {
        self.conversations.find_by_id(id).await
    }

    async fn delete_conversation(&self, id: &str) -> Result<bool, AppError> {
        self.conversations.delete(id).await
    }

    async fn touch_conversation(&self, id: &str) -> Result<(), AppError> {
        self.conversations.update_timestamp(id).await
    }

    async fn create_message(&self, message: NewMessage) -> Result<Message, AppError> {
        self.messages.save(message).await
    }

    async fn create_messages(&self, messages: Vec<NewMessage>) -> Result<Vec<Message>, AppError> {
        self.messages.save_all(messages).await
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, AppError> {
        self.messages.find_by_conversation_id(conversation_id).await
    }

    async fn rewind(&self, conversation_id: &str, position: i64) -> Result<u64, AppError> {
        self.messages.delete_after(conversation_id, position).await
    }
}

#[async_trait]
impl EmbeddingStore for Database {
    async fn unembedded_messages(&self, limit: usize, min_length: usize) -> Result<Vec<PendingEmbedding>, AppError> {
        self.messages.find_unembedded(limit, min_length).await
    }

    async fn store_embedding(
        &self,
        message_id: &str,
        conversation_id: &str,
        embedding: &[f32],
        content_hash: &str,
    ) -> Result<(), AppError> {
        self.embeddings.save(message_id, conversation_id, embedding, content_hash).await
    }

    async fn all_embeddings(&self) -> Result<Vec<StoredEmbedding>, AppError> {
        self.embeddings.find_all().await
    }

    async fn delete_embeddings(&self, conversation_id: &str) -> Result<u64, AppError> {
        self.embeddings.delete_by_conversation_id(conversation_id).await
    }
}

#[async_trait]
impl CanvasStore for Database {
    async fn get_canvas(&self, conversation_id: &str) -> Result<Option<Canvas>, AppError> {
        self.canvases.find_by_conversation_id(conversation_id).await
    }

    async fn create_canvas(&self, conversation_id: &str, title: &str, content: &str) -> Result<Canvas, AppError> {
        self.canvases.create(conversation_id, title, content).await
    }

    async fn update_canvas(&self, conversation_id: &str, content: &str, title: Option<&str>) -> Result<Canvas, AppError> {
        self.canvases.update(conversation_id, content, title).await
    }
}
