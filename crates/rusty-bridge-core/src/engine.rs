use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::message::{RpcError, RpcNotification, RpcRequest, RpcResponse};
use crate::middleware::{
    FilterMiddleware, ForwardMiddleware, LoggerMiddleware, OriginMiddleware,
    SubscriptionMiddleware,
};
use crate::ports::{BlockTracker, UpstreamProvider};
use crate::proxy::{SwappableBlockTracker, SwappableProvider};

/// Outcome of one stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    Next,
    Done(Value),
}

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, request: &mut RpcRequest) -> Result<Flow, RpcError>;

    fn destroy(&self) {}
}

pub type NotificationSink = Arc<dyn Fn(RpcNotification) + Send + Sync>;

pub struct EngineParts {
    pub origin: String,
    pub provider: Arc<SwappableProvider>,
    pub block_tracker: Arc<SwappableBlockTracker>,
    /// The wallet-domain stage; the only slot open to new methods.
    pub dispatcher: Arc<dyn Middleware>,
    pub notifications: NotificationSink,
}

/// JSON-RPC pipeline for one session. The stack order is fixed at build
/// time: origin, logger, filters, subscriptions, wallet dispatch, forward.
pub struct RpcEngine {
    stack: Vec<Arc<dyn Middleware>>,
    notifications: NotificationSink,
    destroyed: AtomicBool,
}

impl RpcEngine {
    pub fn build(parts: EngineParts) -> Self {
        let provider: Arc<dyn UpstreamProvider> = parts.provider;
        let block_tracker: Arc<dyn BlockTracker> = parts.block_tracker;
        let stack: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(OriginMiddleware::new(parts.origin.clone())),
            Arc::new(LoggerMiddleware::new(parts.origin)),
            Arc::new(FilterMiddleware::new(
                Arc::clone(&provider),
                Arc::clone(&block_tracker),
            )),
            Arc::new(SubscriptionMiddleware::new(
                Arc::clone(&provider),
                block_tracker,
                Arc::clone(&parts.notifications),
            )),
            parts.dispatcher,
            Arc::new(ForwardMiddleware::new(provider)),
        ];
        Self {
            stack,
            notifications: parts.notifications,
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stack.iter().map(|stage| stage.name()).collect()
    }

    pub async fn handle(&self, mut request: RpcRequest) -> RpcResponse {
        let id = request.id.clone();
        if self.is_destroyed() {
            return RpcResponse::failure(id, RpcError::disconnected());
        }
        for stage in &self.stack {
            match stage.handle(&mut request).await {
                Ok(Flow::Next) => continue,
                Ok(Flow::Done(result)) => return RpcResponse::success(id, result),
                Err(error) => {
                    tracing::debug!(
                        stage = stage.name(),
                        method = %request.method,
                        code = error.code,
                        "rpc request failed"
                    );
                    return RpcResponse::failure(id, error);
                }
            }
        }
        RpcResponse::failure(id, RpcError::method_not_found(&request.method))
    }

    pub fn emit_notification(&self, notification: RpcNotification) {
        (self.notifications)(notification);
    }

    /// Runs every stage's destroy hook. Only the first call has an effect.
    pub fn destroy(&self) -> bool {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return false;
        }
        for stage in &self.stack {
            stage.destroy();
        }
        true
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}
