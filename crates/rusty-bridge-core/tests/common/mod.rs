#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use alloy::primitives::Address;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use rusty_bridge_core::{
    ensure_unlocked, ApprovedHosts, BackendEvent, BackendListener, BlockListener, BlockTracker,
    ClockPort, DispatcherFactory, Flow, ListenerId, Middleware, OpenedPort, OutboundMessage,
    PortError, PortFactory, ProviderStateFn, RpcError, RpcRequest, Router, RouterDeps, SessionKey,
    Transport, UpstreamProvider, UpstreamTarget, Visibility, WalletBackend, WalletState,
    MAIN_FRAME_PEER, PROVIDER_STREAM,
};

pub const T0: u64 = 1_739_750_400_000;

#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU64,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            now: AtomicU64::new(T0),
        }
    }
}

impl ManualClock {
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl ClockPort for ManualClock {
    fn now_ms(&self) -> Result<u64, PortError> {
        Ok(self.now.load(Ordering::SeqCst))
    }
}

pub struct RecordingTransport {
    sent: Mutex<Vec<(OutboundMessage, String)>>,
    tx: mpsc::UnboundedSender<OutboundMessage>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<OutboundMessage>>,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sent: Mutex::new(Vec::new()),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<(OutboundMessage, String)> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub fn notifications(&self, method: &str) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter_map(|(message, _)| message.data.as_notification().cloned())
            .filter(|notification| notification.method == method)
            .map(|notification| notification.params)
            .collect()
    }

    pub async fn next(&self) -> OutboundMessage {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("outbound message within timeout")
            .expect("transport channel open")
    }

    /// Next response, skipping notifications.
    pub async fn next_response(&self) -> rusty_bridge_core::RpcResponse {
        loop {
            let message = self.next().await;
            assert_eq!(message.name, PROVIDER_STREAM);
            if let Some(response) = message.data.as_response() {
                return response.clone();
            }
        }
    }
}

impl Transport for RecordingTransport {
    fn post_message(&self, message: &OutboundMessage, target_origin: &str) -> Result<(), PortError> {
        self.sent
            .lock()
            .map_err(|_| PortError::Transport("sent lock poisoned".into()))?
            .push((message.clone(), target_origin.to_owned()));
        let _ = self.tx.send(message.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct StaticPorts {
    transports: Mutex<HashMap<SessionKey, Arc<RecordingTransport>>>,
    opened: Mutex<Vec<SessionKey>>,
    fail_next: Mutex<bool>,
}

impl StaticPorts {
    pub fn transport(&self, origin: &str, peer_id: &str) -> Arc<RecordingTransport> {
        let key = SessionKey::new(origin, peer_id);
        Arc::clone(
            self.transports
                .lock()
                .expect("transports lock")
                .entry(key)
                .or_default(),
        )
    }

    pub fn opened(&self) -> Vec<SessionKey> {
        self.opened.lock().expect("opened lock").clone()
    }

    pub fn fail_next_open(&self) {
        *self.fail_next.lock().expect("fail lock") = true;
    }
}

impl PortFactory for StaticPorts {
    fn open(&self, key: &SessionKey) -> Result<OpenedPort, PortError> {
        if std::mem::take(&mut *self.fail_next.lock().expect("fail lock")) {
            return Err(PortError::Transport("port refused".into()));
        }
        self.opened.lock().expect("opened lock").push(key.clone());
        let transport: Arc<dyn Transport> = self.transport(&key.origin, &key.peer_id);
        Ok(OpenedPort {
            transport,
            is_main_frame: key.peer_id == MAIN_FRAME_PEER,
        })
    }
}

/// Wraps [`StaticPorts`] and, on the first open, sends one more inbound
/// message through the router that is opening the port.
pub struct ReentrantPorts {
    pub ports: StaticPorts,
    router: OnceLock<Weak<Router>>,
    inject: Mutex<Option<(String, String, Value)>>,
    pending_after_inject: Mutex<Option<usize>>,
}

impl ReentrantPorts {
    pub fn new(origin: &str, peer_id: &str, payload: Value) -> Arc<Self> {
        Arc::new(Self {
            ports: StaticPorts::default(),
            router: OnceLock::new(),
            inject: Mutex::new(Some((origin.to_owned(), peer_id.to_owned(), payload))),
            pending_after_inject: Mutex::new(None),
        })
    }

    pub fn bind(&self, router: &Arc<Router>) {
        assert!(self.router.set(Arc::downgrade(router)).is_ok(), "bound twice");
    }

    /// Queue length seen right after the extra message went in.
    pub fn pending_after_inject(&self) -> Option<usize> {
        *self.pending_after_inject.lock().expect("pending lock")
    }
}

impl PortFactory for ReentrantPorts {
    fn open(&self, key: &SessionKey) -> Result<OpenedPort, PortError> {
        let opened = self.ports.open(key)?;
        let inject = self.inject.lock().expect("inject lock").take();
        if let Some((origin, peer_id, payload)) = inject {
            let router = self
                .router
                .get()
                .and_then(Weak::upgrade)
                .expect("router bound before opening");
            router.dispatch_inbound(&origin, &peer_id, payload)?;
            *self.pending_after_inject.lock().expect("pending lock") = Some(router.pending_len()?);
        }
        Ok(opened)
    }
}

/// Answers a handful of methods, tagging results with its label so tests can
/// tell which delegate served a call.
pub struct StubProvider {
    pub label: String,
    pub head: AtomicU64,
    calls: Mutex<Vec<String>>,
}

impl StubProvider {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_owned(),
            head: AtomicU64::new(16),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl UpstreamProvider for StubProvider {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.calls.lock().expect("calls lock").push(method.to_owned());
        match method {
            "eth_blockNumber" => Ok(json!(format!(
                "0x{:x}",
                self.head.load(Ordering::SeqCst)
            ))),
            "eth_getBlockByNumber" => {
                let number = params.get(0).cloned().unwrap_or(Value::Null);
                Ok(json!({
                    "number": number,
                    "hash": format!("{}-{}", self.label, number.as_str().unwrap_or("?")),
                }))
            }
            "eth_getLogs" => Ok(json!([{ "provider": self.label, "filter": params }])),
            "test_fail" => Err(RpcError::internal("upstream exploded")),
            _ => Ok(json!({ "provider": self.label, "method": method })),
        }
    }
}

#[derive(Default)]
pub struct ManualBlockTracker {
    head: Mutex<Option<u64>>,
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, BlockListener)>>,
}

impl ManualBlockTracker {
    pub fn emit(&self, block: u64) {
        *self.head.lock().expect("head lock") = Some(block);
        let listeners: Vec<BlockListener> = self
            .listeners
            .lock()
            .expect("listeners lock")
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(block);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().expect("listeners lock").len()
    }
}

impl BlockTracker for ManualBlockTracker {
    fn latest_block(&self) -> Option<u64> {
        *self.head.lock().expect("head lock")
    }

    fn add_listener(&self, listener: BlockListener) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.listeners
            .lock()
            .expect("listeners lock")
            .push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners
            .lock()
            .expect("listeners lock")
            .retain(|(existing, _)| *existing != id);
    }

    fn remove_all_listeners(&self) {
        self.listeners.lock().expect("listeners lock").clear();
    }
}

pub struct StubBackend {
    state: Mutex<WalletState>,
    upstream: Mutex<Option<UpstreamTarget>>,
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, BackendListener)>>,
    pub unlock_requests: AtomicUsize,
}

impl StubBackend {
    pub fn new(upstream: Option<UpstreamTarget>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WalletState {
                chain_id: "0x1".to_owned(),
                network_version: "1".to_owned(),
                selected_address: None,
                is_unlocked: true,
            }),
            upstream: Mutex::new(upstream),
            next_id: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
            unlock_requests: AtomicUsize::new(0),
        })
    }

    pub fn with_provider(provider: Arc<StubProvider>) -> Arc<Self> {
        Self::new(Some(UpstreamTarget {
            provider,
            block_tracker: None,
        }))
    }

    pub fn update(&self, change: impl FnOnce(&mut WalletState)) {
        change(&mut self.state.lock().expect("state lock"));
        self.emit(BackendEvent::StateChanged);
    }

    pub fn set_upstream(&self, target: UpstreamTarget) {
        *self.upstream.lock().expect("upstream lock") = Some(target);
    }

    pub fn set_locked(&self, locked: bool) {
        self.state.lock().expect("state lock").is_unlocked = !locked;
        self.emit(if locked {
            BackendEvent::Locked
        } else {
            BackendEvent::Unlocked
        });
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().expect("listeners lock").len()
    }

    pub fn emit(&self, event: BackendEvent) {
        let listeners: Vec<BackendListener> = self
            .listeners
            .lock()
            .expect("listeners lock")
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&event);
        }
    }
}

#[async_trait]
impl WalletBackend for StubBackend {
    fn snapshot(&self) -> WalletState {
        self.state.lock().expect("state lock").clone()
    }

    fn upstream(&self) -> Option<UpstreamTarget> {
        self.upstream.lock().expect("upstream lock").clone()
    }

    fn subscribe(&self, listener: BackendListener) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.listeners
            .lock()
            .expect("listeners lock")
            .push((id, listener));
        id
    }

    fn unsubscribe(&self, id: ListenerId) {
        self.listeners
            .lock()
            .expect("listeners lock")
            .retain(|(existing, _)| *existing != id);
    }

    fn request_unlock(&self) {
        self.unlock_requests.fetch_add(1, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<(), PortError> {
        self.set_locked(true);
        Ok(())
    }

    async fn switch_chain(&self, chain_id: &str) -> Result<(), PortError> {
        Err(PortError::NotFound(chain_id.to_owned()))
    }

    async fn sign(&self, method: &str, params: &Value) -> Result<Value, PortError> {
        Ok(json!({ "method": method, "params": params }))
    }
}

/// Wallet stage used by the router tests: answers the provider-state query,
/// gates `test_unlocked` on the unlock flow, and lets everything else fall
/// through to the upstream.
pub struct TestDispatcher {
    pub backend: Arc<StubBackend>,
    pub visibility: Arc<Visibility>,
    pub hostnames: Mutex<Vec<String>>,
}

struct TestStage {
    backend: Arc<StubBackend>,
    visibility: Arc<Visibility>,
    provider_state: ProviderStateFn,
}

#[async_trait]
impl Middleware for TestStage {
    fn name(&self) -> &'static str {
        "wallet"
    }

    async fn handle(&self, request: &mut RpcRequest) -> Result<Flow, RpcError> {
        match request.method.as_str() {
            "metamask_getProviderState" => Ok(Flow::Done(
                serde_json::to_value((self.provider_state)()).expect("provider state json"),
            )),
            "test_origin" => Ok(Flow::Done(json!(request.origin))),
            "test_unlocked" => {
                ensure_unlocked(self.backend.as_ref(), &self.visibility).await?;
                Ok(Flow::Done(json!("unlocked")))
            }
            _ => Ok(Flow::Next),
        }
    }
}

impl DispatcherFactory for TestDispatcher {
    fn create(
        &self,
        hostname: &str,
        provider_state: ProviderStateFn,
    ) -> Result<Arc<dyn Middleware>, PortError> {
        self.hostnames
            .lock()
            .map_err(|_| PortError::Transport("hostnames lock poisoned".into()))?
            .push(hostname.to_owned());
        Ok(Arc::new(TestStage {
            backend: Arc::clone(&self.backend),
            visibility: Arc::clone(&self.visibility),
            provider_state,
        }))
    }
}

pub struct Harness<P = StaticPorts> {
    pub router: Router,
    pub backend: Arc<StubBackend>,
    pub provider: Arc<StubProvider>,
    pub ports: Arc<P>,
    pub clock: Arc<ManualClock>,
    pub dispatcher: Arc<TestDispatcher>,
}

pub fn harness() -> Harness {
    harness_with(Arc::new(StaticPorts::default()))
}

pub fn harness_with<P: PortFactory + 'static>(ports: Arc<P>) -> Harness<P> {
    let provider = StubProvider::new("main");
    let backend = StubBackend::with_provider(Arc::clone(&provider));
    let clock = Arc::new(ManualClock::default());
    let visibility = Arc::new(Visibility::new(true));
    let dispatcher = Arc::new(TestDispatcher {
        backend: Arc::clone(&backend),
        visibility: Arc::clone(&visibility),
        hostnames: Mutex::new(Vec::new()),
    });
    let router = Router::new(RouterDeps {
        backend: backend.clone(),
        dispatcher: dispatcher.clone(),
        ports: ports.clone(),
        clock: clock.clone(),
        approved_hosts: ApprovedHosts::default(),
        visibility,
    });
    Harness {
        router,
        backend,
        provider,
        ports,
        clock,
        dispatcher,
    }
}

pub fn request(id: u64, method: &str) -> Value {
    json!({
        "name": PROVIDER_STREAM,
        "data": { "id": id, "jsonrpc": "2.0", "method": method, "params": [] }
    })
}

pub fn address(byte: u8) -> Address {
    Address::repeat_byte(byte)
}
