use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use rusty_bridge_core::{PortError, Visibility, VisibilityEvent, WalletBackend};

/// Locks the wallet after the host window has been hidden for a while.
///
/// `lock_time_ms` of `-1` never locks; `0` locks as soon as the window is
/// hidden; anything else arms a timer on hide that a show cancels.
pub struct LockManager {
    task: JoinHandle<()>,
}

impl LockManager {
    pub fn spawn(
        backend: Arc<dyn WalletBackend>,
        visibility: &Visibility,
        lock_time_ms: i64,
    ) -> Result<Self, PortError> {
        let runtime = Handle::try_current()
            .map_err(|_| PortError::Policy("lock manager needs a tokio runtime".to_owned()))?;
        let events = visibility.subscribe();
        let task = runtime.spawn(run(backend, events, lock_time_ms));
        Ok(Self { task })
    }

    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn lock(backend: &dyn WalletBackend) {
    if !backend.snapshot().is_unlocked {
        return;
    }
    match backend.lock() {
        Ok(()) => tracing::info!("wallet auto-locked"),
        Err(error) => tracing::warn!(%error, "auto-lock failed"),
    }
}

async fn run(
    backend: Arc<dyn WalletBackend>,
    mut events: broadcast::Receiver<VisibilityEvent>,
    lock_time_ms: i64,
) {
    let delay = match u64::try_from(lock_time_ms) {
        Ok(ms) => Duration::from_millis(ms),
        Err(_) => {
            tracing::debug!(lock_time_ms, "auto-lock disabled");
            return;
        }
    };
    let mut deadline: Option<Instant> = None;
    loop {
        let expiry = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            event = events.recv() => match event {
                Ok(VisibilityEvent::Hide) if delay.is_zero() => lock(backend.as_ref()),
                Ok(VisibilityEvent::Hide) => deadline = Some(Instant::now() + delay),
                Ok(VisibilityEvent::Show) => deadline = None,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "visibility events lagged");
                }
                Err(RecvError::Closed) => return,
            },
            () = expiry => {
                deadline = None;
                lock(backend.as_ref());
            }
        }
    }
}
