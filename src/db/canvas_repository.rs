use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::error;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::Canvas;

const RETURNING: &str = "RETURNING id, conversation_id, title, content, version, created_at, updated_at";

#[derive(Clone)]
pub struct CanvasRepository {
    pool: PgPool,
}

impl CanvasRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_conversation_id(&self, conversation_id: &str) -> Result<Option<Canvas>, AppError> {
        let row = sqlx::query(
            "SELECT id, conversation_id, title, content, version, created_at, updated_at
             FROM canvases WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to find canvas for conversation {conversation_id}: {e}");
            AppError::db_query("Failed to find canvas", e)
        })?;
        row.as_ref().map(row_to_canvas).transpose()
    }

    /// One canvas per conversation: a second create is a conflict.
    pub async fn create(&self, conversation_id: &str, title: &str, content: &str) -> Result<Canvas, AppError> {
        let row = sqlx::query(&format!(
            "INSERT INTO canvases (id, conversation_id, title, content, version)
             VALUES ($1, $2, $3, $4, 1)
             ON CONFLICT (conversation_id) DO NOTHING
             {RETURNING}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(conversation_id)
        .bind(title)
        .bind(content)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create canvas for conversation {conversation_id}: {e}");
            AppError::db_query("Failed to create canvas", e)
        })?;

        match row {
            Some(row) => row_to_canvas(&row),
            None => Err(AppError::CanvasExists { conversation_id: conversation_id.to_string() }),
        }
    }

    pub async fn update(
        &self,
        conversation_id: &str,
        content: &str,
        title: Option<&str>,
    ) -> Result<Canvas, AppError> {
        let row = sqlx::query(&format!(
            "UPDATE canvases
             SET content = $2, title = COALESCE($3, title), version = version + 1, updated_at = now()
             WHERE conversation_id = $1
             {RETURNING}"
        ))
        .bind(conversation_id)
        .bind(content)
        .bind(title)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to update canvas for conversation {conversation_id}: {e}");
            AppError::db_query("Failed to update canvas", e)
        })?;

        match row {
            Some(row) => row_to_canvas(&row),
            None => Err(AppError::RecordNotFound {
                entity_type: "canvas".to_string(),
                id: conversation_id.to_string(),
            }),
        }
    }
}

fn row_to_canvas(row: &PgRow) -> Result<Canvas, AppError> {
    Ok(Canvas {
        id: row.try_get("id").map_err(|e| AppError::db_query("Failed to read id", e))?,
        conversation_id: row
            .try_get("conversation_id")
            .map_err(|e| AppError::db_query("Failed to read conversation_id", e))?,
        title: row.try_get("title").map_err(|e| AppError::db_query("Failed to read title", e))?,
        content: row
            .try_get("content")
            .map_err(|e| AppError::db_query("Failed to read content", e))?,
        version: row
            .try_get("version")
            .map_err(|e| AppError::db_query("Failed to read version", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| AppError::db_query("Failed to read created_at", e))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| AppError::db_query("Failed to read updated_at", e))?,
    })
}
