#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::Address;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use rusty_bridge_adapters::{
    Eip1193Upstream, InMemoryWalletBackend, NativePortFactory, NativeSink, StaticApproval,
    WalletRpcMethods,
};
use rusty_bridge_core::{
    ApprovalPort, ApprovedHosts, ClockPort, EmptyBlockTracker, PortError, Router, RouterDeps,
    UpstreamTarget, Visibility, PROVIDER_STREAM,
};

#[derive(Debug, Default)]
pub struct TestClock {
    now: AtomicU64,
}

impl ClockPort for TestClock {
    fn now_ms(&self) -> Result<u64, PortError> {
        Ok(self.now.fetch_add(1, Ordering::SeqCst) + 1_739_750_400_000)
    }
}

/// Native sink that hands every posted message to the test.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<(Value, String)>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Value, String)>>,
}

impl Default for ChannelSink {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }
}

impl ChannelSink {
    pub async fn next(&self) -> (Value, String) {
        tokio::time::timeout(Duration::from_secs(5), self.rx.lock().await.recv())
            .await
            .expect("message within timeout")
            .expect("sink open")
    }

    /// Skips notifications until a response arrives.
    pub async fn next_response(&self) -> Value {
        loop {
            let (message, _) = self.next().await;
            if message["data"].get("id").is_some() {
                return message["data"].clone();
            }
        }
    }
}

impl NativeSink for ChannelSink {
    fn post_from_bridge(&self, json: &str, origin: &str) -> Result<(), PortError> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| PortError::Validation(format!("sink got bad json: {e}")))?;
        self.tx
            .send((value, origin.to_owned()))
            .map_err(|_| PortError::Closed("sink receiver dropped".to_owned()))
    }
}

pub fn deterministic_target(chain_id: &str, version: &str) -> (Arc<Eip1193Upstream>, UpstreamTarget) {
    let upstream = Arc::new(Eip1193Upstream::deterministic(chain_id, version));
    let target = UpstreamTarget {
        provider: upstream.clone(),
        block_tracker: Some(Arc::new(EmptyBlockTracker)),
    };
    (upstream, target)
}

pub struct Bridge {
    pub router: Router,
    pub backend: Arc<InMemoryWalletBackend>,
    pub sink: Arc<ChannelSink>,
    pub visibility: Arc<Visibility>,
    pub approved_hosts: ApprovedHosts,
}

pub fn bridge(approvals: Arc<dyn ApprovalPort>) -> Bridge {
    let (_, target) = deterministic_target("0x1", "1");
    let backend = Arc::new(InMemoryWalletBackend::new("0x1", "1", target));
    let (_, polygon) = deterministic_target("0x89", "137");
    backend
        .add_network("0x89", "137", polygon)
        .expect("add polygon");
    let sink = Arc::new(ChannelSink::default());
    let visibility = Arc::new(Visibility::new(true));
    let approved_hosts = ApprovedHosts::default();
    let methods = WalletRpcMethods::new(
        backend.clone(),
        approvals,
        approved_hosts.clone(),
        Arc::clone(&visibility),
    );
    let router = Router::new(RouterDeps {
        backend: backend.clone(),
        dispatcher: Arc::new(methods),
        ports: Arc::new(NativePortFactory::new(sink.clone())),
        clock: Arc::new(TestClock::default()),
        approved_hosts: approved_hosts.clone(),
        visibility: Arc::clone(&visibility),
    });
    router.on_backend_ready().expect("backend ready");
    Bridge {
        router,
        backend,
        sink,
        visibility,
        approved_hosts,
    }
}

pub fn approving() -> Arc<StaticApproval> {
    Arc::new(StaticApproval::new(true))
}

pub fn request(id: u64, method: &str, params: Value) -> Value {
    json!({
        "name": PROVIDER_STREAM,
        "data": { "id": id, "jsonrpc": "2.0", "method": method, "params": params }
    })
}

pub fn account() -> Address {
    "0x1000000000000000000000000000000000000001"
        .parse()
        .expect("valid account")
}

/// Records every peer session action in order.
#[derive(Default)]
pub struct RecordingPeer {
    pub actions: Mutex<Vec<Value>>,
}

impl RecordingPeer {
    pub fn actions(&self) -> Vec<Value> {
        self.actions.lock().expect("actions lock").clone()
    }
}

impl rusty_bridge_adapters::PeerSessionActions for RecordingPeer {
    fn update_session(&self, update: rusty_bridge_adapters::SessionUpdate) -> Result<(), PortError> {
        self.actions
            .lock()
            .expect("actions lock")
            .push(json!({ "update": update }));
        Ok(())
    }

    fn approve_request(&self, id: &Value, result: &Value) -> Result<(), PortError> {
        self.actions
            .lock()
            .expect("actions lock")
            .push(json!({ "approve": id, "result": result }));
        Ok(())
    }

    fn reject_request(
        &self,
        id: &Value,
        error: &rusty_bridge_core::RpcError,
    ) -> Result<(), PortError> {
        self.actions
            .lock()
            .expect("actions lock")
            .push(json!({ "reject": id, "code": error.code }));
        Ok(())
    }
}
