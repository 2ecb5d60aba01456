//! Pending human approvals for gated tool calls during web streams.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::AgentEvent;
use crate::tools::{ConfirmCallback, SafetyVerdict};

pub struct ApprovalBroker {
    pending: Mutex<HashMap<String, oneshot::Sender<bool>>>,
    timeout: Duration,
}

impl ApprovalBroker {
    pub fn new(timeout: Duration) -> Self {
        Self { pending: Mutex::new(HashMap::new()), timeout }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<bool>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Callback that publishes `approval_required` on `events` and waits for
    /// [`respond`](Self::respond). Timeout, cancellation or a closed channel deny.
    pub fn confirm_callback(self: &Arc<Self>, events: mpsc::Sender<AgentEvent>, cancel: CancellationToken) -> ConfirmCallback {
        let broker = Arc::clone(self);
        Arc::new(move |verdict: SafetyVerdict| {
            let broker = Arc::clone(&broker);
            let events = events.clone();
            let cancel = cancel.clone();
            async move { broker.request(verdict, &events, &cancel).await }.boxed()
        })
    }

    async fn request(&self, verdict: SafetyVerdict, events: &mpsc::Sender<AgentEvent>, cancel: &CancellationToken) -> bool {
        let approval_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.lock().insert(approval_id.clone(), tx);

        let event = AgentEvent::ApprovalRequired {
            approval_id: approval_id.clone(),
            tool_name: verdict.tool_name.clone(),
            reason: verdict.reason.clone(),
            details: verdict.details.clone(),
        };
        if events.send(event).await.is_err() {
            self.lock().remove(&approval_id);
            warn!(tool = %verdict.tool_name, "Approval channel closed, denying");
            return false;
        }
        debug!(%approval_id, tool = %verdict.tool_name, "Waiting for approval");

        let decision = tokio::select! {
            _ = cancel.cancelled() => None,
            _ = tokio::time::sleep(self.timeout) => None,
            answer = rx => answer.ok(),
        };
        self.lock().remove(&approval_id);

        match decision {
            Some(approved) => approved,
            None => {
                warn!(%approval_id, tool = %verdict.tool_name, "No approval received, denying");
                false
            }
        }
    }

    /// Delivers a decision; `false` when the id is unknown or already answered.
    pub fn respond(&self, approval_id: &str, approved: bool) -> bool {
        let Some(tx) = self.lock().remove(approval_id) else {
            return false;
        };
        info!(approval_id, approved, "Approval answered");
        tx.send(approved).is_ok()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }
}
