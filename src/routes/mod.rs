pub mod api_routes;
pub mod chat_routes;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::agent::AgentLoop;
use crate::errors::AppError;
use crate::service::{ActiveStreams, ApprovalBroker, ChatService, SearchService, WorkerHandle};

/// Shared handler state; every field is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub chat: ChatService,
    pub agent: Arc<AgentLoop>,
    pub streams: Arc<ActiveStreams>,
    pub approvals: Arc<ApprovalBroker>,
    pub search: SearchService,
    pub worker: Option<Arc<WorkerHandle>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Conversations
        .route(
            "/api/conversations",
            get(api_routes::list_conversations_handler).post(api_routes::create_conversation_handler),
        )
        .route("/api/conversations/{id}", axum::routing::delete(api_routes::delete_conversation_handler))
        .route("/api/conversations/{id}/messages", get(api_routes::list_messages_handler))
        .route("/api/conversations/{id}/rewind", post(api_routes::rewind_handler))
        .route("/api/conversations/{id}/canvas", get(api_routes::canvas_handler))
        // Streaming
        .route("/api/conversations/{id}/chat", post(chat_routes::chat_stream_handler))
        .route("/api/conversations/{id}/stop", post(chat_routes::stop_handler))
        .route("/api/approvals/{approval_id}", post(chat_routes::approval_handler))
        // Search & embeddings
        .route("/api/search", get(api_routes::search_handler))
        .route("/api/embeddings/status", get(api_routes::embedding_status_handler))
        .route("/api/embeddings/reset", post(api_routes::embedding_reset_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Helper ────────────────────────────────────────────────────────────────────

pub(crate) fn error_response(err: &AppError) -> Response {
    let status = if err.is_validation() {
        StatusCode::BAD_REQUEST
    } else if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if err.is_conflict() {
        StatusCode::CONFLICT
    } else if err.is_agent_unavailable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        error!("Request failed: {err}");
        StatusCode::INTERNAL_SERVER_ERROR
    };

    (status, Json(json!({ "error": err.to_string() }))).into_response()
}
