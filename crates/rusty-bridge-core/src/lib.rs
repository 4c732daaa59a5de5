pub mod approved;
pub mod delta;
pub mod domain;
pub mod engine;
pub mod message;
pub mod middleware;
pub mod ports;
pub mod proxy;
pub mod router;
pub mod session;
pub mod state_machine;
pub mod unlock;
pub mod visibility;

pub use approved::ApprovedHosts;
pub use delta::{compute_state_delta, LastSent};
pub use domain::{
    format_address, normalize_chain_id, parse_chain_id, ApprovalKind, ApprovalRequest,
    BackendEvent, NetworkState, NotificationName, PendingMessage, ProviderState, SessionEvent,
    SessionKey, TimestampMs, UpstreamTarget, VisibilityEvent, WalletState, DEFAULT_MAX_IDLE_MS,
    LOADING_NETWORK, MAIN_FRAME_PEER, PROVIDER_STATE_METHOD, PROVIDER_STREAM,
};
pub use engine::{EngineParts, Flow, Middleware, NotificationSink, RpcEngine};
pub use message::{
    InboundMessage, MessageError, OutboundMessage, OutboundPayload, RpcError, RpcNotification,
    RpcRequest, RpcResponse,
};
pub use ports::{
    ApprovalPort, BackendListener, BlockListener, BlockTracker, ClockPort, DispatcherFactory,
    ListenerId, OpenedPort, PortError, PortFactory, ProviderStateFn, Transport, UpstreamProvider,
    WalletBackend,
};
pub use proxy::{EmptyBlockTracker, SwappableBlockTracker, SwappableProvider};
pub use router::{parse_origin, Router, RouterDeps};
pub use session::{Session, SessionParams};
pub use state_machine::{session_transition, SessionAction, SessionState, StateTransition};
pub use unlock::ensure_unlocked;
pub use visibility::Visibility;
