use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::to_hex;
use crate::engine::{Flow, Middleware, NotificationSink};
use crate::message::{RpcError, RpcNotification, RpcRequest};
use crate::ports::{BlockTracker, ListenerId, UpstreamProvider};

const SUBSCRIPTION_METHOD: &str = "eth_subscription";

#[derive(Debug, Clone)]
enum SubscriptionKind {
    NewHeads,
    Logs(Map<String, Value>),
}

struct Pump {
    listener: ListenerId,
    task: JoinHandle<()>,
}

struct SubscriptionState {
    provider: Arc<dyn UpstreamProvider>,
    block_tracker: Arc<dyn BlockTracker>,
    notifications: NotificationSink,
    next_id: AtomicU64,
    subscriptions: Mutex<HashMap<String, SubscriptionKind>>,
    pump: Mutex<Option<Pump>>,
}

/// `eth_subscribe` polyfill driven by the block tracker proxy. The pump task
/// starts with the first subscription and is torn down by `destroy`.
pub struct SubscriptionMiddleware {
    state: Arc<SubscriptionState>,
}

impl SubscriptionMiddleware {
    pub fn new(
        provider: Arc<dyn UpstreamProvider>,
        block_tracker: Arc<dyn BlockTracker>,
        notifications: NotificationSink,
    ) -> Self {
        Self {
            state: Arc::new(SubscriptionState {
                provider,
                block_tracker,
                notifications,
                next_id: AtomicU64::new(0),
                subscriptions: Mutex::new(HashMap::new()),
                pump: Mutex::new(None),
            }),
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.state.subscriptions().len()
    }
}

impl SubscriptionState {
    fn subscriptions(&self) -> MutexGuard<'_, HashMap<String, SubscriptionKind>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_pump(self: &Arc<Self>) {
        let mut pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner);
        if pump.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
        let listener = self.block_tracker.add_listener(Arc::new(move |block| {
            let _ = tx.send(block);
        }));
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(block) = rx.recv().await {
                let Some(state) = weak.upgrade() else {
                    break;
                };
                state.publish(block).await;
            }
        });
        *pump = Some(Pump { listener, task });
    }

    fn stop_pump(&self) {
        let pump = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            self.block_tracker.remove_listener(pump.listener);
            pump.task.abort();
        }
    }

    fn emit(&self, subscription: &str, result: Value) {
        (self.notifications)(RpcNotification::new(
            SUBSCRIPTION_METHOD,
            json!({ "subscription": subscription, "result": result }),
        ));
    }

    async fn publish(&self, block: u64) {
        let subscriptions: Vec<(String, SubscriptionKind)> = self
            .subscriptions()
            .iter()
            .map(|(id, kind)| (id.clone(), kind.clone()))
            .collect();
        if subscriptions.is_empty() {
            return;
        }

        let mut header: Option<Value> = None;
        for (id, kind) in subscriptions {
            match kind {
                SubscriptionKind::NewHeads => {
                    let result = match &header {
                        Some(header) => header.clone(),
                        None => match self
                            .provider
                            .request("eth_getBlockByNumber", json!([to_hex(block), false]))
                            .await
                        {
                            Ok(fetched) => {
                                header = Some(fetched.clone());
                                fetched
                            }
                            Err(error) => {
                                tracing::warn!(block, %error, "newHeads fetch failed");
                                continue;
                            }
                        },
                    };
                    self.emit(&id, result);
                }
                SubscriptionKind::Logs(criteria) => {
                    let mut query = criteria;
                    query.insert("fromBlock".to_owned(), Value::String(to_hex(block)));
                    query.insert("toBlock".to_owned(), Value::String(to_hex(block)));
                    match self
                        .provider
                        .request("eth_getLogs", json!([Value::Object(query)]))
                        .await
                    {
                        Ok(Value::Array(logs)) => {
                            for log in logs {
                                self.emit(&id, log);
                            }
                        }
                        Ok(other) => {
                            tracing::warn!(block, result = %other, "eth_getLogs returned a non-array");
                        }
                        Err(error) => {
                            tracing::warn!(block, %error, "logs fetch failed");
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Middleware for SubscriptionMiddleware {
    fn name(&self) -> &'static str {
        "subscriptions"
    }

    async fn handle(&self, request: &mut RpcRequest) -> Result<Flow, RpcError> {
        match request.method.as_str() {
            "eth_subscribe" => {
                let kind = match request.param(0).and_then(Value::as_str) {
                    Some("newHeads") => SubscriptionKind::NewHeads,
                    Some("logs") => match request.param(1) {
                        Some(Value::Object(criteria)) => SubscriptionKind::Logs(criteria.clone()),
                        None => SubscriptionKind::Logs(Map::new()),
                        Some(_) => {
                            return Err(RpcError::invalid_params(
                                "logs subscription expects a filter object",
                            ))
                        }
                    },
                    Some(other) => {
                        return Err(RpcError::invalid_params(format!(
                            "unsupported subscription type: {other}"
                        )))
                    }
                    None => {
                        return Err(RpcError::invalid_params(
                            "eth_subscribe expects a subscription type",
                        ))
                    }
                };
                self.state.ensure_pump();
                let id = to_hex(self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1);
                self.state.subscriptions().insert(id.clone(), kind);
                Ok(Flow::Done(Value::String(id)))
            }
            "eth_unsubscribe" => {
                let id = request
                    .param(0)
                    .and_then(Value::as_str)
                    .ok_or_else(|| RpcError::invalid_params("expected a subscription id"))?;
                let removed = self.state.subscriptions().remove(id).is_some();
                Ok(Flow::Done(Value::Bool(removed)))
            }
            _ => Ok(Flow::Next),
        }
    }

    fn destroy(&self) {
        self.state.stop_pump();
        self.state.subscriptions().clear();
    }
}
