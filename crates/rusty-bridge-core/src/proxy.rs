//! Stable-identity stand-ins for the current network provider and block
//! tracker. Sessions capture the proxy once; network switches only swap the
//! delegate behind it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use serde_json::Value;

use crate::message::RpcError;
use crate::ports::{BlockListener, BlockTracker, ListenerId, UpstreamProvider};

fn same_target<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}

pub struct SwappableProvider {
    target: RwLock<Arc<dyn UpstreamProvider>>,
}

impl SwappableProvider {
    pub fn new(initial: Arc<dyn UpstreamProvider>) -> Self {
        Self {
            target: RwLock::new(initial),
        }
    }

    /// Returns `false` when `next` is already the delegate.
    pub fn retarget(&self, next: Arc<dyn UpstreamProvider>) -> bool {
        let mut target = self.target.write().unwrap_or_else(PoisonError::into_inner);
        if same_target(&*target, &next) {
            return false;
        }
        *target = next;
        true
    }

    pub fn current(&self) -> Arc<dyn UpstreamProvider> {
        Arc::clone(&*self.target.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn is_target(&self, candidate: &Arc<dyn UpstreamProvider>) -> bool {
        same_target(&self.current(), candidate)
    }
}

#[async_trait]
impl UpstreamProvider for SwappableProvider {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        // The delegate is resolved once; a retarget during the await does not
        // move this call to the new provider.
        let target = self.current();
        target.request(method, params).await
    }
}

/// Block tracker used when an upstream has none. Never emits.
#[derive(Debug, Default)]
pub struct EmptyBlockTracker;

impl BlockTracker for EmptyBlockTracker {
    fn latest_block(&self) -> Option<u64> {
        None
    }

    fn add_listener(&self, _listener: BlockListener) -> ListenerId {
        0
    }

    fn remove_listener(&self, _id: ListenerId) {}

    // Consumers may not strip internal listeners.
    fn remove_all_listeners(&self) {}
}

#[derive(Default)]
struct ListenerTable {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, BlockListener)>>,
}

impl ListenerTable {
    fn add(&self, listener: BlockListener) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    fn remove(&self, id: ListenerId) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(existing, _)| *existing != id);
    }

    fn clear(&self) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn len(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn emit(&self, block: u64) {
        let snapshot: Vec<BlockListener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(block);
        }
    }
}

/// Event-forwarding proxy over a block tracker. External listeners live on
/// the proxy and survive retargets; a single internal forwarder is moved
/// from the old delegate to the new one.
pub struct SwappableBlockTracker {
    target: RwLock<Arc<dyn BlockTracker>>,
    forwarder: Mutex<Option<ListenerId>>,
    table: Arc<ListenerTable>,
}

impl SwappableBlockTracker {
    pub fn new(initial: Arc<dyn BlockTracker>) -> Self {
        let table = Arc::new(ListenerTable::default());
        let forwarder = initial.add_listener(forwarder_for(&table));
        Self {
            target: RwLock::new(initial),
            forwarder: Mutex::new(Some(forwarder)),
            table,
        }
    }

    pub fn retarget(&self, next: Arc<dyn BlockTracker>) -> bool {
        let mut target = self.target.write().unwrap_or_else(PoisonError::into_inner);
        if same_target(&*target, &next) {
            return false;
        }
        let mut forwarder = self.forwarder.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = forwarder.take() {
            target.remove_listener(id);
        }
        *forwarder = Some(next.add_listener(forwarder_for(&self.table)));
        *target = next;
        true
    }

    pub fn current(&self) -> Arc<dyn BlockTracker> {
        Arc::clone(&*self.target.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn is_target(&self, candidate: &Arc<dyn BlockTracker>) -> bool {
        same_target(&self.current(), candidate)
    }

    pub fn listener_count(&self) -> usize {
        self.table.len()
    }
}

fn forwarder_for(table: &Arc<ListenerTable>) -> BlockListener {
    let table: Weak<ListenerTable> = Arc::downgrade(table);
    Arc::new(move |block| {
        if let Some(table) = table.upgrade() {
            table.emit(block);
        }
    })
}

impl BlockTracker for SwappableBlockTracker {
    fn latest_block(&self) -> Option<u64> {
        self.current().latest_block()
    }

    fn add_listener(&self, listener: BlockListener) -> ListenerId {
        self.table.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.table.remove(id);
    }

    /// Clears external listeners only; the internal forwarder stays.
    fn remove_all_listeners(&self) {
        self.table.clear();
    }
}

impl Drop for SwappableBlockTracker {
    fn drop(&mut self) {
        let forwarder = self
            .forwarder
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = forwarder {
            self.target
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .remove_listener(id);
        }
    }
}
