//! The chat stream endpoint: agent events pumped into an SSE response.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{error_response, AppState};
use crate::agent::{history_to_chat_messages, AgentEvent, EventSink, Termination};
use crate::errors::AppError;
use crate::models::{ApprovalResponse, ChatRequest, Message};
use crate::service::{ChatService, StreamGuard};

const SSE_CHANNEL_BUFFER: usize = 256;
pub const DISCONNECT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

type SseSender = mpsc::Sender<Result<Event, Infallible>>;

pub fn to_sse_event(event: &AgentEvent) -> Event {
    Event::default().event(event.kind()).data(event.payload().to_string())
}

/// POST `/api/conversations/{id}/chat`
pub async fn chat_stream_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Response {
    match start_stream(&id, &state, &request.message).await {
        Ok(rx) => Sse::new(ReceiverStream::new(rx))
            .keep_alive(KeepAlive::default())
            .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn start_stream(
    id: &str,
    state: &AppState,
    message: &str,
) -> Result<mpsc::Receiver<Result<Event, Infallible>>, AppError> {
    // ── Validation ────────────────────────────────────────────────────────────
    state.chat.require_conversation(id).await?;
    ChatService::validate_message(message)?;

    // ── Register & persist ────────────────────────────────────────────────────
    let (sse_tx, sse_rx) = mpsc::channel::<Result<Event, Infallible>>(SSE_CHANNEL_BUFFER);
    let cancel = CancellationToken::new();
    let weak = sse_tx.downgrade();
    let guard = state.streams.begin(
        id,
        cancel.clone(),
        Box::new(move || weak.upgrade().map_or(true, |tx| tx.is_closed())),
    )?;
    let history = state.chat.begin_turn(id, message).await?;

    info!(conversation_id = id, history = history.len(), "Chat stream started");
    tokio::spawn(pump(state.clone(), id.to_string(), history, cancel, guard, sse_tx));
    Ok(sse_rx)
}

/// Runs the agent loop and forwards its events until a terminal state or disconnect,
/// then persists the turn. The guard unregisters the stream on every exit path.
async fn pump(
    state: AppState,
    conversation_id: String,
    history: Vec<Message>,
    cancel: CancellationToken,
    guard: StreamGuard,
    sse_tx: SseSender,
) {
    let (event_tx, mut event_rx) = mpsc::channel::<AgentEvent>(SSE_CHANNEL_BUFFER);
    let confirm = state.approvals.confirm_callback(event_tx.clone(), cancel.clone());

    let run = {
        let agent = state.agent.clone();
        let cancel = cancel.clone();
        let conversation_id = conversation_id.clone();
        let chat_history = history_to_chat_messages(&history);
        tokio::spawn(async move {
            let mut sink = EventSink::Live(event_tx);
            agent
                .run(&conversation_id, chat_history, &mut sink, &cancel, Some(&confirm))
                .await
        })
    };

    let mut disconnect_check = tokio::time::interval(DISCONNECT_CHECK_INTERVAL);
    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                if sse_tx.send(Ok(to_sse_event(&event))).await.is_err() {
                    info!(%conversation_id, "Client disconnected, cancelling");
                    cancel.cancel();
                    break;
                }
            }
            _ = disconnect_check.tick() => {
                if sse_tx.is_closed() {
                    info!(%conversation_id, "Client disconnected, cancelling");
                    cancel.cancel();
                    break;
                }
            }
        }
    }
    // Unblocks any pending emit so the loop can observe cancellation.
    drop(event_rx);

    let outcome = match run.await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(%conversation_id, error = %e, "Agent task failed");
            return;
        }
    };
    match &outcome.termination {
        Termination::Done => debug!(%conversation_id, "Turn finished"),
        Termination::Error(message) => info!(%conversation_id, %message, "Turn ended with error"),
        Termination::Cancelled => info!(%conversation_id, "Turn cancelled"),
    }
    if !guard.claim_for_persist() {
        warn!(%conversation_id, "Stream was reaped or replaced, dropping its turn");
        return;
    }
    if let Err(e) = state.chat.persist_outcome(&conversation_id, &outcome).await {
        error!(%conversation_id, error = %e, "Failed to persist turn");
    }
}

/// POST `/api/conversations/{id}/stop`: always `stopped`, running or not.
pub async fn stop_handler(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    if let Err(e) = state.chat.require_conversation(&id).await {
        return error_response(&e);
    }
    let was_running = state.streams.stop(&id);
    debug!(conversation_id = %id, was_running, "Stop requested");
    Json(json!({ "status": "stopped" })).into_response()
}

/// POST `/api/approvals/{approval_id}`
pub async fn approval_handler(
    Path(approval_id): Path<String>,
    State(state): State<AppState>,
    Json(response): Json<ApprovalResponse>,
) -> Response {
    if state.approvals.respond(&approval_id, response.approved) {
        Json(json!({ "status": "ok", "approved": response.approved })).into_response()
    } else {
        let err = AppError::RecordNotFound { entity_type: "approval".to_string(), id: approval_id };
        error_response(&err)
    }
}
