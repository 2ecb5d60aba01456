use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::error;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{Message, MessageRole, NewMessage, PendingEmbedding};

#[derive(Clone)]
pub struct MessageRepository {
    pool: PgPool,
}

impl MessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_conversation_id(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Message>, AppError> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, role, content, position, tool_calls, created_at
             FROM messages
             WHERE conversation_id = $1
             ORDER BY position ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fetch messages for conversation {conversation_id}: {e}");
            AppError::db_query(
                format!("Failed to fetch messages for conversation {conversation_id}"),
                e,
            )
        })?;

        rows.iter().map(row_to_message).collect()
    }

    pub async fn save(&self, message: NewMessage) -> Result<Message, AppError> {
        let mut saved = self.save_all(vec![message]).await?;
        saved
            .pop()
            .ok_or_else(|| AppError::Unexpected("Insert returned no message".to_string()))
    }

    /// Appends `messages` as one contiguous block after the conversation's last position.
    ///
    /// Position assignment is serialized per conversation with a transaction-scoped
    /// advisory lock, so concurrent writers never collide on `(conversation_id, position)`.
    pub async fn save_all(&self, messages: Vec<NewMessage>) -> Result<Vec<Message>, AppError> {
        let Some(conversation_id) = messages.first().map(|m| m.conversation_id.clone()) else {
            return Ok(Vec::new());
        };
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::db_query("Failed to begin message transaction", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&conversation_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!("Failed to lock positions for conversation {conversation_id}: {e}");
                AppError::db_query("Failed to lock message positions", e)
            })?;

        let next: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(position), -1) + 1 FROM messages WHERE conversation_id = $1",
        )
        .bind(&conversation_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::db_query("Failed to read next message position", e))?;

        let mut saved = Vec::with_capacity(messages.len());
        for (offset, message) in messages.into_iter().enumerate() {
            let id = Uuid::new_v4().to_string();
            let row = sqlx::query(
                "INSERT INTO messages (id, conversation_id, role, content, position, tool_calls)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 RETURNING id, conversation_id, role, content, position, tool_calls, created_at",
            )
            .bind(&id)
            .bind(&message.conversation_id)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(next + offset as i64)
            .bind(&message.tool_calls)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                error!("Failed to save message {id}: {e}");
                AppError::db_query("Failed to save message", e)
            })?;
            saved.push(row_to_message(&row)?);
        }

        tx.commit()
            .await
            .map_err(|e| AppError::db_query("Failed to commit messages", e))?;
        Ok(saved)
    }

    /// Deletes every message after `position`; returns how many went.
    pub async fn delete_after(&self, conversation_id: &str, position: i64) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM messages WHERE conversation_id = $1 AND position > $2")
            .bind(conversation_id)
            .bind(position)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to rewind conversation {conversation_id} to {position}: {e}");
                AppError::db_query("Failed to rewind conversation", e)
            })?;
        Ok(result.rows_affected())
    }

    pub async fn find_unembedded(
        &self,
        limit: usize,
        min_length: usize,
    ) -> Result<Vec<PendingEmbedding>, AppError> {
        let rows = sqlx::query(
            "SELECT m.id, m.conversation_id, m.content
             FROM messages m
             LEFT JOIN message_embeddings e ON e.message_id = m.id
             WHERE e.message_id IS NULL
               AND m.role IN ('user', 'assistant')
               AND char_length(btrim(m.content)) >= $2
             ORDER BY m.created_at ASC
             LIMIT $1",
        )
        .bind(limit as i64)
        .bind(min_length as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fetch unembedded messages: {e}");
            AppError::db_query("Failed to fetch unembedded messages", e)
        })?;

        rows.iter()
            .map(|row| {
                Ok(PendingEmbedding {
                    message_id: row.try_get("id").map_err(|e| AppError::db_query("Failed to read id", e))?,
                    conversation_id: row
                        .try_get("conversation_id")
                        .map_err(|e| AppError::db_query("Failed to read conversation_id", e))?,
                    content: row
                        .try_get("content")
                        .map_err(|e| AppError::db_query("Failed to read content", e))?,
                })
            })
            .collect()
    }
}

fn row_to_message(row: &PgRow) -> Result<Message, AppError> {
    let role_str: String = row
        .try_get("role")
        .map_err(|e| AppError::db_query("Failed to read role", e))?;
    let role = MessageRole::try_from(role_str)
        .map_err(|e| AppError::Unexpected(format!("Unknown message role: {e}")))?;
    Ok(Message {
        id: row.try_get("id").map_err(|e| AppError::db_query("Failed to read id", e))?,
        conversation_id: row
            .try_get("conversation_id")
            .map_err(|e| AppError::db_query("Failed to read conversation_id", e))?,
        role,
        content: row
            .try_get("content")
            .map_err(|e| AppError::db_query("Failed to read content", e))?,
        position: row
            .try_get("position")
            .map_err(|e| AppError::db_query("Failed to read position", e))?,
        tool_calls: row
            .try_get("tool_calls")
            .map_err(|e| AppError::db_query("Failed to read tool_calls", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| AppError::db_query("Failed to read created_at", e))?,
    })
}
