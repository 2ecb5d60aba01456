use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::{error_response, AppState};
use crate::errors::AppError;
use crate::models::{CreateConversationRequest, RewindRequest, SearchQuery};

// ── Conversations ─────────────────────────────────────────────────────────────

/// GET `/api/conversations`
pub async fn list_conversations_handler(State(state): State<AppState>) -> Response {
    match state.chat.get_conversations().await {
        Ok(convs) => Json(convs).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST `/api/conversations`
pub async fn create_conversation_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateConversationRequest>,
) -> Response {
    match state.chat.create_conversation(request).await {
        Ok(conv) => (StatusCode::CREATED, Json(conv)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// DELETE `/api/conversations/{id}`: stops any running stream first.
pub async fn delete_conversation_handler(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    state.streams.stop(&id);
    match state.chat.delete_conversation(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/conversations/{id}/messages`
pub async fn list_messages_handler(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match state.chat.get_messages(&id).await {
        Ok(msgs) => Json(msgs).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST `/api/conversations/{id}/rewind`
pub async fn rewind_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<RewindRequest>,
) -> Response {
    if state.streams.is_active(&id) {
        let err = AppError::StreamAlreadyActive { id };
        return error_response(&err);
    }
    match state.chat.rewind(&id, request.position).await {
        Ok(deleted) => Json(json!({ "deleted": deleted })).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/conversations/{id}/canvas`
pub async fn canvas_handler(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match state.chat.get_canvas(&id).await {
        Ok(canvas) => Json(canvas).into_response(),
        Err(e) => error_response(&e),
    }
}

// ── Search & embeddings ───────────────────────────────────────────────────────

/// GET `/api/search?q=…&limit=…`
pub async fn search_handler(State(state): State<AppState>, Query(query): Query<SearchQuery>) -> Response {
    match state.search.search(&query.q, query.limit).await {
        Ok(hits) => Json(hits).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/embeddings/status`
pub async fn embedding_status_handler(State(state): State<AppState>) -> Response {
    match &state.worker {
        Some(worker) => Json(json!({ "enabled": true, "worker": worker.status() })).into_response(),
        None => Json(json!({ "enabled": false })).into_response(),
    }
}

/// POST `/api/embeddings/reset`
pub async fn embedding_reset_handler(State(state): State<AppState>) -> Response {
    match &state.worker {
        Some(worker) => {
            worker.reset();
            Json(json!({ "status": "reset" })).into_response()
        }
        None => error_response(&AppError::Unavailable("embeddings are disabled".to_string())),
    }
}
