use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use url::Url;

use crate::approved::ApprovedHosts;
use crate::delta::{compute_state_delta, LastSent};
use crate::domain::{
    BackendEvent, NotificationName, SessionEvent, SessionKey, TimestampMs, UpstreamTarget,
    WalletState, PROVIDER_STREAM,
};
use crate::engine::{EngineParts, NotificationSink, RpcEngine};
use crate::message::{InboundMessage, OutboundMessage, OutboundPayload, RpcNotification, RpcRequest};
use crate::ports::{
    BlockTracker, DispatcherFactory, ListenerId, PortError, ProviderStateFn, Transport,
    WalletBackend,
};
use crate::proxy::{EmptyBlockTracker, SwappableBlockTracker, SwappableProvider};
use crate::state_machine::{session_transition, SessionAction, SessionState};

const EVENT_CAPACITY: usize = 16;

pub struct SessionParams {
    pub key: SessionKey,
    pub transport: Arc<dyn Transport>,
    pub is_main_frame: bool,
    pub backend: Arc<dyn WalletBackend>,
    pub dispatcher: Arc<dyn DispatcherFactory>,
    pub approved_hosts: ApprovedHosts,
}

struct Outbound {
    transport: Arc<dyn Transport>,
    target_origin: String,
    disconnected: AtomicBool,
}

impl Outbound {
    fn send(&self, payload: OutboundPayload) -> Result<(), PortError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(PortError::Closed(self.target_origin.clone()));
        }
        let message = OutboundMessage {
            name: PROVIDER_STREAM.to_owned(),
            data: payload,
        };
        self.transport.post_message(&message, &self.target_origin)
    }
}

struct SessionInner {
    key: SessionKey,
    hostname: String,
    is_main_frame: bool,
    backend: Arc<dyn WalletBackend>,
    approved_hosts: ApprovedHosts,
    outbound: Arc<Outbound>,
    engine: Arc<RpcEngine>,
    provider: Arc<SwappableProvider>,
    block_tracker: Arc<SwappableBlockTracker>,
    fallback_tracker: Arc<dyn BlockTracker>,
    inbox: Mutex<Option<mpsc::UnboundedSender<RpcRequest>>>,
    state: Mutex<SessionState>,
    last_active: Mutex<Option<TimestampMs>>,
    last_sent: Mutex<LastSent>,
    backend_listener: Mutex<Option<ListenerId>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let listener = self
            .backend_listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = listener {
            self.backend.unsubscribe(id);
        }
    }
}

/// One dapp endpoint: a transport plus the engine serving it. Requests are
/// handled one at a time, in arrival order, by a task owned by the session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The snapshot as `origin` may see it: the selected address is hidden
/// unless the origin is approved and the wallet is unlocked.
fn visible_snapshot(
    mut snapshot: WalletState,
    origin: &str,
    approved_hosts: &ApprovedHosts,
) -> WalletState {
    if !snapshot.is_unlocked || !approved_hosts.contains(origin) {
        snapshot.selected_address = None;
    }
    snapshot
}

fn hostname_of(origin: &str) -> String {
    Url::parse(origin)
        .ok()
        .and_then(|url| url.host_str().map(str::to_owned))
        .unwrap_or_else(|| origin.to_owned())
}

impl Session {
    pub fn open(params: SessionParams) -> Result<Self, PortError> {
        let runtime = Handle::try_current()
            .map_err(|_| PortError::Policy("sessions need a tokio runtime".into()))?;
        let SessionParams {
            key,
            transport,
            is_main_frame,
            backend,
            dispatcher,
            approved_hosts,
        } = params;

        let target = backend
            .upstream()
            .ok_or_else(|| PortError::NotFound("wallet backend has no upstream".into()))?;
        let hostname = hostname_of(&key.origin);

        let fallback_tracker: Arc<dyn BlockTracker> = Arc::new(EmptyBlockTracker);
        let provider = Arc::new(SwappableProvider::new(target.provider));
        let block_tracker = Arc::new(SwappableBlockTracker::new(
            target
                .block_tracker
                .unwrap_or_else(|| Arc::clone(&fallback_tracker)),
        ));

        let outbound = Arc::new(Outbound {
            transport,
            target_origin: key.origin.clone(),
            disconnected: AtomicBool::new(false),
        });
        let notifications: NotificationSink = {
            let outbound = Arc::clone(&outbound);
            Arc::new(move |notification: RpcNotification| {
                let method = notification.method.clone();
                if let Err(error) = outbound.send(OutboundPayload::Notification(notification)) {
                    tracing::debug!(%method, %error, "notification not delivered");
                }
            })
        };
        let provider_state: ProviderStateFn = {
            let backend = Arc::clone(&backend);
            Arc::new(move || backend.snapshot().provider_state())
        };
        let dispatcher = dispatcher.create(&hostname, provider_state)?;
        let engine = Arc::new(RpcEngine::build(EngineParts {
            origin: key.origin.clone(),
            provider: Arc::clone(&provider),
            block_tracker: Arc::clone(&block_tracker),
            dispatcher,
            notifications,
        }));

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let last_sent = LastSent::from_snapshot(&visible_snapshot(
            backend.snapshot(),
            &key.origin,
            &approved_hosts,
        ));
        let inner = Arc::new(SessionInner {
            key,
            hostname,
            is_main_frame,
            backend,
            approved_hosts,
            outbound,
            engine,
            provider,
            block_tracker,
            fallback_tracker,
            inbox: Mutex::new(Some(inbox_tx)),
            state: Mutex::new(SessionState::Created),
            last_active: Mutex::new(None),
            last_sent: Mutex::new(last_sent),
            backend_listener: Mutex::new(None),
            events,
        });

        let weak = Arc::downgrade(&inner);
        let listener = inner.backend.subscribe(Arc::new(move |event: &BackendEvent| {
            if let Some(inner) = weak.upgrade() {
                Session { inner }.on_backend_event(*event);
            }
        }));
        *lock(&inner.backend_listener) = Some(listener);

        runtime.spawn(serve(
            inbox_rx,
            Arc::clone(&inner.engine),
            Arc::clone(&inner.outbound),
            Arc::downgrade(&inner),
        ));

        let session = Session { inner };
        tracing::info!(
            session = %session.key(),
            main_frame = session.is_main_frame(),
            "session opened"
        );
        session.emit(SessionEvent::Connect);
        Ok(session)
    }

    pub fn key(&self) -> &SessionKey {
        &self.inner.key
    }

    pub fn origin(&self) -> &str {
        &self.inner.key.origin
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.key.peer_id
    }

    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    pub fn is_main_frame(&self) -> bool {
        self.inner.is_main_frame
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.outbound.disconnected.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.inner.state)
    }

    pub fn last_active_time(&self) -> Option<TimestampMs> {
        *lock(&self.inner.last_active)
    }

    pub fn touch(&self, now: TimestampMs) {
        *lock(&self.inner.last_active) = Some(now);
    }

    pub fn last_sent(&self) -> LastSent {
        lock(&self.inner.last_sent).clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// The proxy handed to the engine. Identity is fixed for the session's
    /// lifetime.
    pub fn upstream_proxy(&self) -> &Arc<SwappableProvider> {
        &self.inner.provider
    }

    pub fn block_tracker_proxy(&self) -> &Arc<SwappableBlockTracker> {
        &self.inner.block_tracker
    }

    pub fn engine_stages(&self) -> Vec<&'static str> {
        self.inner.engine.stage_names()
    }

    pub fn is_engine_destroyed(&self) -> bool {
        self.inner.engine.is_destroyed()
    }

    pub fn same_session(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Queues one request for the engine.
    pub fn on_message(&self, message: InboundMessage) -> Result<(), PortError> {
        if self.is_disconnected() {
            return Err(PortError::Closed(self.key().to_string()));
        }
        {
            let mut state = lock(&self.inner.state);
            if *state == SessionState::Created {
                let (next, transition) = session_transition(*state, SessionAction::Activate)?;
                *state = next;
                tracing::debug!(
                    session = %self.key(),
                    from = ?transition.from,
                    to = ?transition.to,
                    reason = transition.reason,
                    "session transition"
                );
            }
        }
        match lock(&self.inner.inbox).as_ref() {
            Some(inbox) => inbox
                .send(message.request)
                .map_err(|_| PortError::Closed(self.key().to_string())),
            None => Err(PortError::Closed(self.key().to_string())),
        }
    }

    pub fn send_notification(&self, notification: RpcNotification) {
        if self.is_disconnected() {
            return;
        }
        self.inner.engine.emit_notification(notification);
    }

    /// `None` is ignored. Returns whether either proxy changed delegate.
    pub fn set_upstream_target(&self, target: Option<UpstreamTarget>) -> bool {
        let Some(target) = target else {
            tracing::debug!(session = %self.key(), "ignoring empty upstream target");
            return false;
        };
        let tracker = target
            .block_tracker
            .unwrap_or_else(|| Arc::clone(&self.inner.fallback_tracker));
        let provider_changed = self.inner.provider.retarget(target.provider);
        let tracker_changed = self.inner.block_tracker.retarget(tracker);
        provider_changed || tracker_changed
    }

    /// Diffs `snapshot` against what this session last saw. The address only
    /// counts when the origin is approved and the wallet is unlocked, so an
    /// address that stops being visible is reported as `[]`.
    pub fn compute_state_delta(&self, snapshot: &WalletState) -> Vec<RpcNotification> {
        let visible = visible_snapshot(
            snapshot.clone(),
            self.origin(),
            &self.inner.approved_hosts,
        );
        compute_state_delta(&mut lock(&self.inner.last_sent), &visible)
    }

    /// Follows the backend onto its current upstream and pushes whatever
    /// changed since the last update.
    pub fn on_state_update(&self) {
        if self.is_disconnected() {
            return;
        }
        if self.set_upstream_target(self.inner.backend.upstream()) {
            tracing::debug!(session = %self.key(), "upstream retargeted");
        }
        let snapshot = self.inner.backend.snapshot();
        let notifications = self.compute_state_delta(&snapshot);
        if notifications.is_empty() {
            return;
        }
        for notification in notifications {
            self.send_notification(notification);
        }
        self.emit(SessionEvent::Update);
    }

    pub fn on_backend_event(&self, event: BackendEvent) {
        if self.is_disconnected() {
            return;
        }
        match event {
            BackendEvent::StateChanged => self.on_state_update(),
            BackendEvent::Locked | BackendEvent::Unlocked => {
                let unlocked = event == BackendEvent::Unlocked;
                self.send_notification(RpcNotification::named(
                    NotificationName::UnlockStateChanged,
                    serde_json::Value::Bool(unlocked),
                ));
                // Lock state decides whether the address is visible.
                self.on_state_update();
            }
        }
    }

    /// Returns `false` if the session was already disconnected.
    pub fn on_disconnect(&self) -> bool {
        if self.inner.outbound.disconnected.swap(true, Ordering::SeqCst) {
            return false;
        }
        {
            let mut state = lock(&self.inner.state);
            if let Ok((next, _)) = session_transition(*state, SessionAction::Disconnect) {
                *state = next;
            }
        }
        if let Some(id) = lock(&self.inner.backend_listener).take() {
            self.inner.backend.unsubscribe(id);
        }
        // Closing the inbox ends the serving task, which tears the engine down.
        lock(&self.inner.inbox).take();
        tracing::info!(session = %self.key(), "session disconnected");
        self.emit(SessionEvent::Disconnect);
        true
    }
}

async fn serve(
    mut inbox: mpsc::UnboundedReceiver<RpcRequest>,
    engine: Arc<RpcEngine>,
    outbound: Arc<Outbound>,
    session: Weak<SessionInner>,
) {
    while let Some(request) = inbox.recv().await {
        let response = engine.handle(request).await;
        match outbound.send(OutboundPayload::Response(response)) {
            Ok(()) => {}
            Err(PortError::Closed(peer)) => {
                tracing::debug!(%peer, "transport closed");
                if let Some(inner) = session.upgrade() {
                    Session { inner }.on_disconnect();
                }
                break;
            }
            Err(error) => tracing::warn!(%error, "response not delivered"),
        }
    }
    engine.destroy();
}
