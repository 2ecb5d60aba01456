//! Background embedding of stored messages, with backoff and auto-disable.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::embeddings::Embedder;
use crate::db::EmbeddingStore;
use crate::errors::AppError;

pub const MIN_CONTENT_LENGTH: usize = 10;
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);
pub const MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// SHA-256 of the message text, hex encoded.
pub fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn long_enough(content: &str) -> bool {
    content.trim().chars().count() >= MIN_CONTENT_LENGTH
}

// ── Indexer ───────────────────────────────────────────────────────────────────

/// Fetches unembedded messages, embeds them and stores the vectors.
#[derive(Clone)]
pub struct EmbeddingIndexer {
    store: Arc<dyn EmbeddingStore>,
    embedder: Arc<dyn Embedder>,
}

impl EmbeddingIndexer {
    pub fn new(store: Arc<dyn EmbeddingStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Embeds up to `batch_size` pending messages; returns how many were stored.
    ///
    /// Fetch and embedding failures are returned for the caller to classify.
    /// A failure storing one item is logged and the rest are still attempted.
    pub async fn process_pending(&self, batch_size: usize) -> Result<usize, AppError> {
        let pending = self.store.unembedded_messages(batch_size, MIN_CONTENT_LENGTH).await?;
        let eligible: Vec<_> = pending.into_iter().filter(|m| long_enough(&m.content)).collect();
        if eligible.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = eligible.iter().map(|m| m.content.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;

        let mut stored = 0;
        for (message, vector) in eligible.iter().zip(vectors) {
            let Some(vector) = vector else {
                debug!(message_id = %message.message_id, "No embedding returned, skipping");
                continue;
            };
            let hash = hash_content(&message.content);
            match self
                .store
                .store_embedding(&message.message_id, &message.conversation_id, &vector, &hash)
                .await
            {
                Ok(()) => stored += 1,
                Err(e) => error!(message_id = %message.message_id, error = %e, "Failed to store embedding"),
            }
        }

        if stored > 0 {
            info!(count = stored, "Embedded messages");
        }
        Ok(stored)
    }

    /// Inline path right after a message is created. Never fails the caller.
    pub async fn embed_message(&self, message_id: &str, content: &str, conversation_id: &str) {
        if !long_enough(content) {
            return;
        }
        let vector = match self.embedder.embed(content).await {
            Ok(Some(v)) => v,
            Ok(None) => return,
            Err(e) => {
                warn!(message_id, error = %e, "Inline embedding failed, worker will retry");
                return;
            }
        };
        let hash = hash_content(content);
        if let Err(e) = self.store.store_embedding(message_id, conversation_id, &vector, &hash).await {
            error!(message_id, error = %e, "Failed to store embedding");
        }
    }
}

// ── Worker state ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStatus {
    pub running: bool,
    pub disabled: bool,
    pub disabled_reason: Option<String>,
    pub consecutive_failures: u32,
    pub current_interval_secs: f64,
}

#[derive(Debug, Clone)]
pub struct EmbeddingWorkerState {
    base_interval: Duration,
    current_interval: Duration,
    consecutive_failures: u32,
    disabled: bool,
    disabled_reason: Option<String>,
}

impl EmbeddingWorkerState {
    pub fn new(base_interval: Duration) -> Self {
        Self {
            base_interval,
            current_interval: base_interval,
            consecutive_failures: 0,
            disabled: false,
            disabled_reason: None,
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn disabled_reason(&self) -> Option<&str> {
        self.disabled_reason.as_deref()
    }

    pub fn record_success(&mut self) {
        if self.consecutive_failures > 0 {
            info!(after_failures = self.consecutive_failures, "Embedding worker recovered");
        }
        self.consecutive_failures = 0;
        self.current_interval = self.base_interval;
    }

    /// Doubles the interval up to [`MAX_BACKOFF`]; disables after
    /// [`MAX_CONSECUTIVE_FAILURES`] in a row.
    pub fn record_transient_failure(&mut self, error: &str) {
        self.consecutive_failures += 1;
        self.current_interval = (self.current_interval * 2).min(MAX_BACKOFF);
        warn!(
            failures = self.consecutive_failures,
            next_interval_secs = self.current_interval.as_secs_f64(),
            error,
            "Embedding worker transient failure"
        );
        if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            self.disable(format!(
                "Auto-disabled after {} consecutive failures: {error}",
                self.consecutive_failures
            ));
        }
    }

    pub fn record_permanent_failure(&mut self, error: &str) {
        self.disable(format!("Permanent failure: {error}"));
    }

    pub fn record_failure(&mut self, error: &AppError) {
        if error.is_permanent() {
            self.record_permanent_failure(&error.to_string());
        } else {
            self.record_transient_failure(&error.to_string());
        }
    }

    /// Re-enables the worker with base settings.
    pub fn reset(&mut self) {
        *self = Self::new(self.base_interval);
        info!("Embedding worker reset");
    }

    pub fn status(&self, running: bool) -> WorkerStatus {
        WorkerStatus {
            running,
            disabled: self.disabled,
            disabled_reason: self.disabled_reason.clone(),
            consecutive_failures: self.consecutive_failures,
            current_interval_secs: self.current_interval.as_secs_f64(),
        }
    }

    fn disable(&mut self, reason: String) {
        error!(%reason, "Embedding worker disabled");
        self.disabled = true;
        self.disabled_reason = Some(reason);
    }
}

// ── Worker loop ───────────────────────────────────────────────────────────────

pub struct EmbeddingWorker {
    indexer: EmbeddingIndexer,
    batch_size: usize,
    state: EmbeddingWorkerState,
}

impl EmbeddingWorker {
    pub fn new(indexer: EmbeddingIndexer, batch_size: usize, base_interval: Duration) -> Self {
        Self { indexer, batch_size, state: EmbeddingWorkerState::new(base_interval) }
    }

    pub fn state(&self) -> &EmbeddingWorkerState {
        &self.state
    }

    /// One poll: process a batch unless disabled, then update the backoff state.
    pub async fn poll_once(&mut self) -> Option<usize> {
        if self.state.is_disabled() {
            debug!("Embedding worker disabled, skipping poll");
            return None;
        }
        match self.indexer.process_pending(self.batch_size).await {
            Ok(count) => {
                self.state.record_success();
                Some(count)
            }
            Err(e) => {
                self.state.record_failure(&e);
                None
            }
        }
    }

    pub fn spawn(mut self) -> WorkerHandle {
        let cancel = CancellationToken::new();
        let reset = Arc::new(Notify::new());
        let (status_tx, status_rx) = watch::channel(self.state.status(true));

        let task = {
            let cancel = cancel.clone();
            let reset = reset.clone();
            tokio::spawn(async move {
                info!(
                    interval_secs = self.state.current_interval().as_secs_f64(),
                    batch_size = self.batch_size,
                    "Embedding worker started"
                );
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    self.poll_once().await;
                    status_tx.send_replace(self.state.status(true));

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = reset.notified() => {
                            self.state.reset();
                            status_tx.send_replace(self.state.status(true));
                        }
                        _ = tokio::time::sleep(self.state.current_interval()) => {}
                    }
                }
                status_tx.send_replace(self.state.status(false));
                info!("Embedding worker stopped");
            })
        };

        WorkerHandle { cancel, reset, status: status_rx, task }
    }
}

/// Control surface of a spawned worker.
pub struct WorkerHandle {
    cancel: CancellationToken,
    reset: Arc<Notify>,
    status: watch::Receiver<WorkerStatus>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Idempotent; the loop exits at its next suspension point.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Clears failures and re-enables a disabled worker.
    pub fn reset(&self) {
        self.reset.notify_one();
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerStatus> {
        self.status.clone()
    }

    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!(error = %e, "Embedding worker task failed");
        }
    }
}
