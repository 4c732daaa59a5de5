use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::domain::{
    ApprovalRequest, BackendEvent, ProviderState, SessionKey, UpstreamTarget, WalletState,
};
use crate::engine::Middleware;
use crate::message::{OutboundMessage, RpcError};

#[derive(Debug, Error)]
pub enum PortError {
    #[error("port not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("policy error: {0}")]
    Policy(String),
    #[error("transport closed: {0}")]
    Closed(String),
}

pub type ListenerId = u64;
pub type BlockListener = Arc<dyn Fn(u64) + Send + Sync>;
pub type BackendListener = Arc<dyn Fn(&BackendEvent) + Send + Sync>;
pub type ProviderStateFn = Arc<dyn Fn() -> ProviderState + Send + Sync>;

pub trait ClockPort: Send + Sync {
    fn now_ms(&self) -> Result<u64, PortError>;
}

/// Outbound half of a session transport. The inbound half is the session's
/// own inbox, fed by the router.
pub trait Transport: Send + Sync {
    fn post_message(&self, message: &OutboundMessage, target_origin: &str) -> Result<(), PortError>;
}

pub struct OpenedPort {
    pub transport: Arc<dyn Transport>,
    pub is_main_frame: bool,
}

/// Opens the transport for a newly created session.
pub trait PortFactory: Send + Sync {
    fn open(&self, key: &SessionKey) -> Result<OpenedPort, PortError>;
}

#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError>;
}

pub trait BlockTracker: Send + Sync {
    fn latest_block(&self) -> Option<u64>;
    fn add_listener(&self, listener: BlockListener) -> ListenerId;
    fn remove_listener(&self, id: ListenerId);
    fn remove_all_listeners(&self);
}

/// The account/network side of the wallet as seen by the bridge.
#[async_trait]
pub trait WalletBackend: Send + Sync {
    fn snapshot(&self) -> WalletState;
    fn upstream(&self) -> Option<UpstreamTarget>;
    fn subscribe(&self, listener: BackendListener) -> ListenerId;
    fn unsubscribe(&self, id: ListenerId);
    /// Ask the host to surface the unlock screen.
    fn request_unlock(&self);
    fn lock(&self) -> Result<(), PortError>;
    async fn switch_chain(&self, chain_id: &str) -> Result<(), PortError>;
    async fn sign(&self, method: &str, params: &Value) -> Result<Value, PortError>;
}

#[async_trait]
pub trait ApprovalPort: Send + Sync {
    /// `Ok(false)` means the user declined.
    async fn request_approval(&self, request: ApprovalRequest) -> Result<bool, PortError>;
}

/// Builds the wallet-domain stage of a session's middleware stack.
pub trait DispatcherFactory: Send + Sync {
    fn create(
        &self,
        hostname: &str,
        provider_state: ProviderStateFn,
    ) -> Result<Arc<dyn Middleware>, PortError>;
}
