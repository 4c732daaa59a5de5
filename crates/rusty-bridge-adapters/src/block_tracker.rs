use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use rusty_bridge_core::{BlockListener, BlockTracker, ListenerId, PortError, UpstreamProvider};

#[derive(Default)]
struct TrackerState {
    head: Mutex<Option<u64>>,
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, BlockListener)>>,
}

impl TrackerState {
    fn publish(&self, block: u64) -> bool {
        {
            let mut head = self.head.lock().unwrap_or_else(PoisonError::into_inner);
            if head.is_some_and(|current| block <= current) {
                return false;
            }
            *head = Some(block);
        }
        let listeners: Vec<BlockListener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(block);
        }
        true
    }
}

/// Block tracker that polls `eth_blockNumber` and notifies listeners when
/// the head moves forward.
#[derive(Default)]
pub struct PollingBlockTracker {
    state: Arc<TrackerState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingBlockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns the poll loop on the current runtime. The first poll happens
    /// immediately.
    pub fn start(
        provider: Arc<dyn UpstreamProvider>,
        interval: Duration,
    ) -> Result<Arc<Self>, PortError> {
        let runtime = Handle::try_current()
            .map_err(|_| PortError::Policy("block polling needs a tokio runtime".to_owned()))?;
        let tracker = Arc::new(Self::new());
        let state = Arc::downgrade(&tracker.state);
        let handle = runtime.spawn(poll(provider, interval, state));
        *tracker.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(tracker)
    }

    /// Returns `false` if `block` is not past the current head.
    pub fn publish_block(&self, block: u64) -> bool {
        self.state.publish(block)
    }

    pub fn stop(&self) {
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    pub fn is_polling(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

async fn poll(provider: Arc<dyn UpstreamProvider>, every: Duration, state: Weak<TrackerState>) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let Some(state) = state.upgrade() else {
            break;
        };
        match provider.request("eth_blockNumber", json!([])).await {
            Ok(raw) => match parse_block_number(&raw) {
                Some(block) => {
                    if state.publish(block) {
                        tracing::debug!(block, "new block");
                    }
                }
                None => tracing::warn!(result = %raw, "unparseable block number"),
            },
            Err(error) => tracing::warn!(%error, "block poll failed"),
        }
    }
}

fn parse_block_number(raw: &Value) -> Option<u64> {
    let text = raw.as_str()?;
    let digits = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X"))?;
    u64::from_str_radix(digits, 16).ok()
}

impl Drop for PollingBlockTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl BlockTracker for PollingBlockTracker {
    fn latest_block(&self) -> Option<u64> {
        *self.state.head.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_listener(&self, listener: BlockListener) -> ListenerId {
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.state
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(existing, _)| *existing != id);
    }

    fn remove_all_listeners(&self) {
        self.state
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_forward_progress_is_published() {
        let tracker = PollingBlockTracker::new();
        let seen = Arc::new(Mutex::new(Vec::<u64>::new()));
        tracker.add_listener({
            let seen = Arc::clone(&seen);
            Arc::new(move |block: u64| seen.lock().expect("seen").push(block))
        });
        assert!(tracker.publish_block(5));
        assert!(!tracker.publish_block(5));
        assert!(!tracker.publish_block(3));
        assert!(tracker.publish_block(6));
        assert_eq!(*seen.lock().expect("seen"), vec![5, 6]);
        assert_eq!(tracker.latest_block(), Some(6));
    }

    #[test]
    fn block_numbers_parse_from_hex_only() {
        assert_eq!(parse_block_number(&json!("0x1f")), Some(31));
        assert_eq!(parse_block_number(&json!("31")), None);
        assert_eq!(parse_block_number(&json!(31)), None);
    }
}
