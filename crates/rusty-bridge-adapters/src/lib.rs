pub mod approval;
pub mod backend;
pub mod block_tracker;
pub mod clock;
pub mod config;
pub mod eip1193;
pub mod lock_manager;
pub mod methods;
pub mod native;
pub mod peer;
pub mod webview;

pub use approval::{PendingApproval, QueuedApprovals, StaticApproval};
pub use backend::InMemoryWalletBackend;
pub use block_tracker::PollingBlockTracker;
pub use clock::SystemClock;
pub use config::BridgeConfig;
pub use eip1193::Eip1193Upstream;
pub use lock_manager::LockManager;
pub use methods::WalletRpcMethods;
pub use native::{NativePort, NativePortFactory, NativeSink};
pub use peer::{PeerPort, PeerPortFactory, PeerSessionActions, SessionUpdate};
pub use webview::{post_message_script, ScriptSink, WebviewPort, WebviewPortFactory};
