use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::error;

use crate::errors::AppError;
use crate::models::{Conversation, ConversationType};

const SELECT_COLUMNS: &str = "SELECT id, type, title, project_id, folder_id, created_at, updated_at FROM conversations";

#[derive(Clone)]
pub struct ConversationRepository {
    pool: PgPool,
}

impl ConversationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_all(&self) -> Result<Vec<Conversation>, AppError> {
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} ORDER BY updated_at DESC"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to fetch all conversations: {e}");
                AppError::db_query("Failed to fetch conversations", e)
            })?;
        rows.iter().map(row_to_conversation).collect()
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Conversation>, AppError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to find conversation {id}: {e}");
                AppError::db_query(format!("Failed to find conversation {id}"), e)
            })?;
        row.as_ref().map(row_to_conversation).transpose()
    }

    pub async fn save(&self, conversation: &Conversation) -> Result<Conversation, AppError> {
        sqlx::query(
            "INSERT INTO conversations (id, type, title, project_id, folder_id, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&conversation.id)
        .bind(conversation.conversation_type.as_str())
        .bind(&conversation.title)
        .bind(&conversation.project_id)
        .bind(&conversation.folder_id)
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to save conversation {}: {e}", conversation.id);
            AppError::db_query("Failed to save conversation", e)
        })?;
        Ok(conversation.clone())
    }

    pub async fn update_timestamp(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE conversations SET updated_at = $1 WHERE id = $2")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to update conversation timestamp {id}: {e}");
                AppError::db_query("Failed to update conversation", e)
            })?;
        Ok(())
    }

    /// Returns `false` when no conversation had that id. Messages and canvas go with it.
    pub async fn delete(&self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM conversations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to delete conversation {id}: {e}");
                AppError::db_query(format!("Failed to delete conversation {id}"), e)
            })?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_conversation(row: &PgRow) -> Result<Conversation, AppError> {
    let type_str: String = row
        .try_get("type")
        .map_err(|e| AppError::db_query("Failed to read type", e))?;
    let conversation_type = ConversationType::try_from(type_str).map_err(AppError::Unexpected)?;
    Ok(Conversation {
        id: row.try_get("id").map_err(|e| AppError::db_query("Failed to read id", e))?,
        conversation_type,
        title: row
            .try_get("title")
            .map_err(|e| AppError::db_query("Failed to read title", e))?,
        project_id: row
            .try_get("project_id")
            .map_err(|e| AppError::db_query("Failed to read project_id", e))?,
        folder_id: row
            .try_get("folder_id")
            .map_err(|e| AppError::db_query("Failed to read folder_id", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| AppError::db_query("Failed to read created_at", e))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| AppError::db_query("Failed to read updated_at", e))?,
    })
}
