use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};

use rusty_bridge_core::{ApprovalPort, ApprovalRequest, PortError};

/// Answers every approval the same way. Records what was asked.
#[derive(Debug, Default)]
pub struct StaticApproval {
    approve: bool,
    requests: Mutex<Vec<ApprovalRequest>>,
}

impl StaticApproval {
    pub fn new(approve: bool) -> Self {
        Self {
            approve,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ApprovalRequest> {
        self.requests
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ApprovalPort for StaticApproval {
    async fn request_approval(&self, request: ApprovalRequest) -> Result<bool, PortError> {
        self.requests
            .lock()
            .map_err(|e| PortError::Transport(format!("approval lock poisoned: {e}")))?
            .push(request);
        Ok(self.approve)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub id: u64,
    pub request: ApprovalRequest,
}

/// Parks approval requests until the host resolves them by id.
pub struct QueuedApprovals {
    next_id: AtomicU64,
    pending: Mutex<BTreeMap<u64, (ApprovalRequest, oneshot::Sender<bool>)>>,
    announcements: broadcast::Sender<PendingApproval>,
}

impl Default for QueuedApprovals {
    fn default() -> Self {
        let (announcements, _) = broadcast::channel(32);
        Self {
            next_id: AtomicU64::new(0),
            pending: Mutex::new(BTreeMap::new()),
            announcements,
        }
    }
}

impl QueuedApprovals {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending_map(
        &self,
    ) -> Result<MutexGuard<'_, BTreeMap<u64, (ApprovalRequest, oneshot::Sender<bool>)>>, PortError>
    {
        self.pending
            .lock()
            .map_err(|e| PortError::Transport(format!("approval queue lock poisoned: {e}")))
    }

    /// New requests are announced here as they are queued.
    pub fn subscribe(&self) -> broadcast::Receiver<PendingApproval> {
        self.announcements.subscribe()
    }

    pub fn pending(&self) -> Result<Vec<PendingApproval>, PortError> {
        Ok(self
            .pending_map()?
            .iter()
            .map(|(id, (request, _))| PendingApproval {
                id: *id,
                request: request.clone(),
            })
            .collect())
    }

    pub fn resolve(&self, id: u64, approved: bool) -> Result<(), PortError> {
        let (_, tx) = self
            .pending_map()?
            .remove(&id)
            .ok_or_else(|| PortError::NotFound(format!("approval {id}")))?;
        if tx.send(approved).is_err() {
            tracing::debug!(id, "approval requester went away");
        }
        Ok(())
    }

    /// Declines everything still waiting. Returns how many were declined.
    pub fn reject_all(&self) -> Result<usize, PortError> {
        let drained = std::mem::take(&mut *self.pending_map()?);
        let count = drained.len();
        for (_, (_, tx)) in drained {
            let _ = tx.send(false);
        }
        Ok(count)
    }
}

#[async_trait]
impl ApprovalPort for QueuedApprovals {
    async fn request_approval(&self, request: ApprovalRequest) -> Result<bool, PortError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending_map()?.insert(id, (request.clone(), tx));
        tracing::info!(id, origin = %request.origin, "approval requested");
        // No subscriber is fine; the host can still poll `pending()`.
        let _ = self.announcements.send(PendingApproval { id, request });
        rx.await
            .map_err(|_| PortError::Closed(format!("approval {id} abandoned")))
    }
}
