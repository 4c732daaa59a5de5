use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use url::Url;

use crate::approved::ApprovedHosts;
use crate::domain::{
    PendingMessage, SessionKey, TimestampMs, DEFAULT_MAX_IDLE_MS, MAIN_FRAME_PEER,
    PROVIDER_STATE_METHOD,
};
use crate::message::{InboundMessage, RpcNotification};
use crate::ports::{ClockPort, DispatcherFactory, PortError, PortFactory, WalletBackend};
use crate::session::{Session, SessionParams};
use crate::visibility::Visibility;

/// Navigations that never get a main-frame session.
const BLANK_PAGES: [&str; 2] = ["about://newtab/", "about:blank"];

pub struct RouterDeps {
    pub backend: Arc<dyn WalletBackend>,
    pub dispatcher: Arc<dyn DispatcherFactory>,
    pub ports: Arc<dyn PortFactory>,
    pub clock: Arc<dyn ClockPort>,
    pub approved_hosts: ApprovedHosts,
    pub visibility: Arc<Visibility>,
}

#[derive(Default)]
struct RouterState {
    ready: bool,
    draining: bool,
    pending: VecDeque<PendingMessage>,
    sessions: Vec<Session>,
}

/// Registry of live sessions keyed by `(origin, peer_id)`. Traffic arriving
/// before the backend is ready is queued and replayed in arrival order.
pub struct Router {
    deps: RouterDeps,
    max_idle_ms: u64,
    state: Mutex<RouterState>,
}

/// Scheme, host and port of `raw`, or `None` if it has no such origin.
pub fn parse_origin(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    let origin = url.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

impl Router {
    pub fn new(deps: RouterDeps) -> Self {
        Self::with_max_idle(deps, DEFAULT_MAX_IDLE_MS)
    }

    pub fn with_max_idle(deps: RouterDeps, max_idle_ms: u64) -> Self {
        Self {
            deps,
            max_idle_ms,
            state: Mutex::new(RouterState::default()),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, RouterState>, PortError> {
        self.state
            .lock()
            .map_err(|_| PortError::Transport("router lock poisoned".into()))
    }

    fn now(&self) -> Result<TimestampMs, PortError> {
        self.deps.clock.now_ms().map(TimestampMs)
    }

    pub fn approved_hosts(&self) -> &ApprovedHosts {
        &self.deps.approved_hosts
    }

    pub fn visibility(&self) -> &Arc<Visibility> {
        &self.deps.visibility
    }

    pub fn max_idle_ms(&self) -> u64 {
        self.max_idle_ms
    }

    pub fn is_ready(&self) -> Result<bool, PortError> {
        Ok(self.state()?.ready)
    }

    pub fn pending_len(&self) -> Result<usize, PortError> {
        Ok(self.state()?.pending.len())
    }

    /// Live sessions, in creation order.
    pub fn sessions(&self) -> Result<Vec<Session>, PortError> {
        Ok(self
            .state()?
            .sessions
            .iter()
            .filter(|session| !session.is_disconnected())
            .cloned()
            .collect())
    }

    pub fn find_session(&self, origin: &str, peer_id: &str) -> Result<Option<Session>, PortError> {
        Ok(self
            .state()?
            .sessions
            .iter()
            .find(|session| {
                !session.is_disconnected()
                    && session.origin() == origin
                    && session.peer_id() == peer_id
            })
            .cloned())
    }

    /// Queues `message` and returns `None` until the backend is ready;
    /// afterwards finds or creates the session for the key.
    pub fn activate(
        &self,
        origin: &str,
        peer_id: &str,
        message: &InboundMessage,
    ) -> Result<Option<Session>, PortError> {
        {
            let mut state = self.state()?;
            if !state.ready {
                let enqueued_at_ms = self.now()?;
                state.pending.push_back(PendingMessage {
                    origin: origin.to_owned(),
                    peer_id: peer_id.to_owned(),
                    payload: message.clone(),
                    enqueued_at_ms,
                });
                tracing::debug!(
                    origin,
                    peer_id,
                    queued = state.pending.len(),
                    "backend not ready, message queued"
                );
                return Ok(None);
            }
        }
        self.find_or_create(&SessionKey::new(origin, peer_id))
            .map(Some)
    }

    fn find_or_create(&self, key: &SessionKey) -> Result<Session, PortError> {
        self.evict_idle_except(self.max_idle_ms, Some(key))?;
        if let Some(session) = self.find_session(&key.origin, &key.peer_id)? {
            return Ok(session);
        }

        // Opening runs outside the registry lock; a failure leaves no entry.
        let opened = self.deps.ports.open(key)?;
        let session = Session::open(SessionParams {
            key: key.clone(),
            transport: opened.transport,
            is_main_frame: opened.is_main_frame,
            backend: Arc::clone(&self.deps.backend),
            dispatcher: Arc::clone(&self.deps.dispatcher),
            approved_hosts: self.deps.approved_hosts.clone(),
        })?;

        let mut state = self.state()?;
        let existing = state
            .sessions
            .iter()
            .find(|candidate| !candidate.is_disconnected() && candidate.key() == key)
            .cloned();
        if let Some(existing) = existing {
            drop(state);
            session.on_disconnect();
            return Ok(existing);
        }
        state.sessions.push(session.clone());
        Ok(session)
    }

    /// Flushes the pending queue in arrival order, then opens the gate.
    /// Messages arriving during the flush queue behind it.
    pub fn on_backend_ready(&self) -> Result<usize, PortError> {
        {
            let mut state = self.state()?;
            if state.ready || state.draining {
                return Ok(0);
            }
            state.draining = true;
        }
        let mut flushed = 0;
        loop {
            let next = {
                let mut state = self.state()?;
                match state.pending.pop_front() {
                    Some(next) => next,
                    None => {
                        state.ready = true;
                        state.draining = false;
                        break;
                    }
                }
            };
            flushed += 1;
            let key = SessionKey::new(next.origin, next.peer_id);
            match self.find_or_create(&key) {
                Ok(session) => self.deliver(&session, next.payload),
                Err(error) => tracing::warn!(session = %key, %error, "dropping queued message"),
            }
        }
        tracing::info!(flushed, "backend ready");
        Ok(flushed)
    }

    fn deliver(&self, session: &Session, message: InboundMessage) {
        if message.method() != PROVIDER_STATE_METHOD {
            match self.now() {
                Ok(now) => session.touch(now),
                Err(error) => tracing::warn!(%error, "clock unavailable"),
            }
        }
        if let Err(error) = session.on_message(message) {
            tracing::warn!(session = %session.key(), %error, "message not delivered");
        }
    }

    pub fn evict_idle(&self, max_idle_ms: u64) -> Result<Vec<SessionKey>, PortError> {
        self.evict_idle_except(max_idle_ms, None)
    }

    fn evict_idle_except(
        &self,
        max_idle_ms: u64,
        keep: Option<&SessionKey>,
    ) -> Result<Vec<SessionKey>, PortError> {
        let now = self.now()?;
        let evicted: Vec<Session> = {
            let mut state = self.state()?;
            let (stale, live): (Vec<Session>, Vec<Session>) =
                state.sessions.drain(..).partition(|session| {
                    if session.is_disconnected() {
                        return true;
                    }
                    if keep == Some(session.key()) {
                        return false;
                    }
                    match session.last_active_time() {
                        None => true,
                        Some(last) => now.0.saturating_sub(last.0) > max_idle_ms,
                    }
                });
            state.sessions = live;
            stale
        };
        let mut keys = Vec::with_capacity(evicted.len());
        for session in evicted {
            if session.on_disconnect() {
                tracing::info!(session = %session.key(), "evicted idle session");
                keys.push(session.key().clone());
            }
        }
        Ok(keys)
    }

    /// Routes one host message. Malformed input is logged and dropped.
    pub fn dispatch_inbound(
        &self,
        origin: &str,
        peer_id: &str,
        payload: Value,
    ) -> Result<(), PortError> {
        let message = match InboundMessage::from_value(payload) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(origin, peer_id, %error, "dropping malformed message");
                return Ok(());
            }
        };
        self.route(origin, peer_id, message)
    }

    fn route(&self, origin: &str, peer_id: &str, message: InboundMessage) -> Result<(), PortError> {
        if let Some(session) = self.activate(origin, peer_id, &message)? {
            self.deliver(&session, message);
        }
        Ok(())
    }

    /// Raw entry from the host shell: `{name, origin?, data: {...}}`, as a
    /// JSON string or value.
    pub fn post_message(&self, raw: Value) -> Result<(), PortError> {
        let message = match InboundMessage::from_value(raw) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(%error, "dropping malformed host message");
                return Ok(());
            }
        };
        let Some(frame_url) = message.origin().map(str::to_owned) else {
            tracing::warn!(method = message.method(), "dropping host message without origin");
            return Ok(());
        };

        // Frames are keyed by their raw URL; the main frame by parsed origin.
        let frame = self
            .sessions()?
            .into_iter()
            .find(|session| !session.is_main_frame() && session.origin() == frame_url);
        if let Some(frame) = frame {
            let (origin, peer_id) = (frame.origin().to_owned(), frame.peer_id().to_owned());
            return self.route(&origin, &peer_id, message);
        }
        match parse_origin(&frame_url) {
            Some(origin) => self.route(&origin, MAIN_FRAME_PEER, message),
            None => {
                tracing::warn!(origin = %frame_url, "dropping host message, bad origin");
                Ok(())
            }
        }
    }

    /// Navigation in the main webview. Every live session is dropped; the
    /// main-frame session for the new page is opened straight away when the
    /// backend is ready.
    pub fn load_started(&self, url: &str) -> Result<Option<Session>, PortError> {
        if BLANK_PAGES.contains(&url) {
            return Ok(None);
        }
        let dropped = self.disconnect_all()?;
        tracing::info!(url, dropped, "page load started");

        let Some(origin) = parse_origin(url) else {
            tracing::warn!(url, "navigation target has no origin");
            return Ok(None);
        };
        if !self.is_ready()? {
            return Ok(None);
        }
        let session = self.find_or_create(&SessionKey::main_frame(origin))?;
        session.touch(self.now()?);
        Ok(Some(session))
    }

    fn disconnect_all(&self) -> Result<usize, PortError> {
        let sessions = std::mem::take(&mut self.state()?.sessions);
        let count = sessions.len();
        for session in sessions {
            session.on_disconnect();
        }
        Ok(count)
    }

    /// Fans `notification` out to live sessions of approved origins. Returns
    /// how many sessions it was sent to.
    pub fn send_notification(&self, notification: RpcNotification) -> Result<usize, PortError> {
        self.evict_idle(self.max_idle_ms)?;
        let targets: Vec<Session> = self
            .sessions()?
            .into_iter()
            .filter(|session| self.deps.approved_hosts.contains(session.origin()))
            .collect();
        for session in &targets {
            session.send_notification(notification.clone());
        }
        Ok(targets.len())
    }

    pub fn on_window_visibility_change(&self, visible: bool) {
        tracing::debug!(visible, "window visibility changed");
        self.deps.visibility.set(visible);
    }

    pub fn is_visible(&self) -> bool {
        self.deps.visibility.is_visible()
    }

    /// Disconnects every session and closes the gate again.
    pub fn shutdown(&self) -> Result<usize, PortError> {
        let dropped = self.disconnect_all()?;
        let mut state = self.state()?;
        state.ready = false;
        state.pending.clear();
        tracing::info!(dropped, "router shut down");
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origins_keep_scheme_host_and_port() {
        assert_eq!(
            parse_origin("https://app.example:8443/swap?x=1").as_deref(),
            Some("https://app.example:8443")
        );
        assert_eq!(
            parse_origin("https://app.example/").as_deref(),
            Some("https://app.example")
        );
        assert_eq!(parse_origin("about:blank"), None);
        assert_eq!(parse_origin("not a url"), None);
    }
}
