use sqlx::{PgPool, Row};
use tracing::error;

use crate::errors::AppError;
use crate::models::StoredEmbedding;

#[derive(Clone)]
pub struct EmbeddingRepository {
    pool: PgPool,
}

impl EmbeddingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upserts on `message_id`; storing the same message twice overwrites.
    pub async fn save(
        &self,
        message_id: &str,
        conversation_id: &str,
        embedding: &[f32],
        content_hash: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO message_embeddings (message_id, conversation_id, embedding, content_hash)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (message_id) DO UPDATE
             SET embedding = EXCLUDED.embedding,
                 content_hash = EXCLUDED.content_hash,
                 created_at = now()",
        )
        .bind(message_id)
        .bind(conversation_id)
        .bind(embedding)
        .bind(content_hash)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to store embedding for message {message_id}: {e}");
            AppError::db_query("Failed to store embedding", e)
        })?;
        Ok(())
    }

    pub async fn find_all(&self) -> Result<Vec<StoredEmbedding>, AppError> {
        let rows = sqlx::query(
            "SELECT e.message_id, e.conversation_id, m.content, e.embedding
             FROM message_embeddings e
             JOIN messages m ON m.id = e.message_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fetch embeddings: {e}");
            AppError::db_query("Failed to fetch embeddings", e)
        })?;

        rows.iter()
            .map(|row| {
                Ok(StoredEmbedding {
                    message_id: row
                        .try_get("message_id")
                        .map_err(|e| AppError::db_query("Failed to read message_id", e))?,
                    conversation_id: row
                        .try_get("conversation_id")
                        .map_err(|e| AppError::db_query("Failed to read conversation_id", e))?,
                    content: row
                        .try_get("content")
                        .map_err(|e| AppError::db_query("Failed to read content", e))?,
                    embedding: row
                        .try_get("embedding")
                        .map_err(|e| AppError::db_query("Failed to read embedding", e))?,
                })
            })
            .collect()
    }

    pub async fn delete_by_conversation_id(&self, conversation_id: &str) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM message_embeddings WHERE conversation_id = $1")
            .bind(conversation_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to delete embeddings for conversation {conversation_id}: {e}");
                AppError::db_query("Failed to delete embeddings", e)
            })?;
        Ok(result.rows_affected())
    }
}
