use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;

use crate::domain::{BackendEvent, VisibilityEvent};
use crate::message::RpcError;
use crate::ports::{BackendListener, ListenerId, WalletBackend};
use crate::visibility::Visibility;

struct ListenerGuard<'a> {
    backend: &'a dyn WalletBackend,
    id: ListenerId,
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        self.backend.unsubscribe(self.id);
    }
}

/// Resolves once the wallet is unlocked. If the host window is hidden first,
/// fails with the unlock-dismissed error instead of waiting forever.
pub async fn ensure_unlocked(
    backend: &dyn WalletBackend,
    visibility: &Visibility,
) -> Result<(), RpcError> {
    if backend.snapshot().is_unlocked {
        return Ok(());
    }

    let (tx, rx) = oneshot::channel::<()>();
    let tx = Mutex::new(Some(tx));
    let listener: BackendListener = Arc::new(move |event: &BackendEvent| {
        if *event != BackendEvent::Unlocked {
            return;
        }
        if let Some(tx) = tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = tx.send(());
        }
    });
    let _guard = ListenerGuard {
        backend,
        id: backend.subscribe(listener),
    };
    let mut visibility_events = visibility.subscribe();

    // An unlock may have landed between the first check and the subscribe.
    if backend.snapshot().is_unlocked {
        return Ok(());
    }
    tracing::debug!("waiting for wallet unlock");
    backend.request_unlock();

    let hidden = async move {
        loop {
            match visibility_events.recv().await {
                Ok(VisibilityEvent::Hide) => return,
                Ok(VisibilityEvent::Show) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    };

    tokio::select! {
        unlocked = rx => unlocked
            .map_err(|_| RpcError::internal("unlock listener dropped before unlock")),
        () = hidden => {
            tracing::debug!("unlock prompt dismissed");
            Err(RpcError::unlock_dismissed())
        }
    }
}
