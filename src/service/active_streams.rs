//! Registry of in-progress chat generations, one per conversation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::AppError;

/// Probe answering "has the client of this stream gone away?".
pub type DisconnectProbe = Box<dyn Fn() -> bool + Send + Sync>;

struct StreamEntry {
    stream_id: Uuid,
    started_at: Instant,
    cancel: CancellationToken,
    client_gone: DisconnectProbe,
    /// Set once the loop has finished and the turn is being written.
    persisting: bool,
}

impl StreamEntry {
    fn is_stale(&self, stale_after: Duration) -> bool {
        !self.persisting && (self.client_gone)() && self.started_at.elapsed() >= stale_after
    }
}

pub struct ActiveStreams {
    entries: Mutex<HashMap<String, StreamEntry>>,
    stale_after: Duration,
}

impl ActiveStreams {
    pub fn new(stale_after: Duration) -> Self {
        Self { entries: Mutex::new(HashMap::new()), stale_after }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StreamEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a stream for `conversation_id`.
    ///
    /// A live stream already registered is a conflict; a stale one is
    /// cancelled and replaced. The entry is removed when the guard drops.
    pub fn begin(
        self: &Arc<Self>,
        conversation_id: &str,
        cancel: CancellationToken,
        client_gone: DisconnectProbe,
    ) -> Result<StreamGuard, AppError> {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(conversation_id) {
            if !existing.is_stale(self.stale_after) {
                return Err(AppError::StreamAlreadyActive { id: conversation_id.to_string() });
            }
            warn!(conversation_id, "Replacing stale stream");
            existing.cancel.cancel();
        }

        let stream_id = Uuid::new_v4();
        entries.insert(
            conversation_id.to_string(),
            StreamEntry { stream_id, started_at: Instant::now(), cancel, client_gone, persisting: false },
        );
        debug!(conversation_id, %stream_id, "Stream registered");
        Ok(StreamGuard { registry: Arc::clone(self), conversation_id: conversation_id.to_string(), stream_id })
    }

    /// Signals cancellation; `false` when nothing was running. Idempotent.
    pub fn stop(&self, conversation_id: &str) -> bool {
        match self.lock().get(conversation_id) {
            Some(entry) => {
                entry.cancel.cancel();
                info!(conversation_id, "Stream stop requested");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.lock().contains_key(conversation_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancels and removes every stale entry; returns how many were reaped.
    pub fn reap_stale(&self) -> usize {
        let mut entries = self.lock();
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.is_stale(self.stale_after))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            if let Some(entry) = entries.remove(id) {
                entry.cancel.cancel();
                warn!(conversation_id = %id, "Reaped stale stream");
            }
        }
        stale.len()
    }

    /// Periodic [`reap_stale`](Self::reap_stale) until `shutdown` fires.
    pub fn spawn_reaper(self: Arc<Self>, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.reap_stale();
                    }
                }
            }
            debug!("Stream reaper stopped");
        })
    }

    fn claim_for_persist(&self, conversation_id: &str, stream_id: Uuid) -> bool {
        match self.lock().get_mut(conversation_id) {
            Some(entry) if entry.stream_id == stream_id => {
                entry.persisting = true;
                true
            }
            _ => false,
        }
    }

    fn finish(&self, conversation_id: &str, stream_id: Uuid) {
        let mut entries = self.lock();
        if entries.get(conversation_id).is_some_and(|e| e.stream_id == stream_id) {
            entries.remove(conversation_id);
            debug!(conversation_id, %stream_id, "Stream unregistered");
        }
    }
}

/// Removes its registry entry on drop, unless a newer stream has replaced it.
pub struct StreamGuard {
    registry: Arc<ActiveStreams>,
    conversation_id: String,
    stream_id: Uuid,
}

impl StreamGuard {
    /// Marks the stream as writing its turn, which shields it from reaping.
    ///
    /// `false` when the stream was reaped or replaced: a newer turn may already
    /// be in the conversation, so this one must not be persisted.
    pub fn claim_for_persist(&self) -> bool {
        self.registry.claim_for_persist(&self.conversation_id, self.stream_id)
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.registry.finish(&self.conversation_id, self.stream_id);
    }
}
