//! Line protocol between the host application and the bridge.
//! This must remain the only shell-facing boundary for bridge traffic.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use rusty_bridge_adapters::{
    BridgeConfig, Eip1193Upstream, InMemoryWalletBackend, LockManager, NativePortFactory,
    NativeSink, PendingApproval, PollingBlockTracker, QueuedApprovals, SystemClock,
    WalletRpcMethods,
};
use rusty_bridge_core::{
    ApprovedHosts, BlockTracker, PortError, Router, RouterDeps, UpstreamTarget, Visibility,
};

/// One line of host input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HostCommand {
    PostMessage { message: Value },
    LoadStarted { url: String },
    WindowStatusChanged { visible: bool },
    BackendReady,
    Unlock,
    Lock,
    SelectAddress { address: Option<Address> },
    SwitchChain { chain_id: String },
    ApproveHost { origin: String },
    ResolveApproval { id: u64, approved: bool },
    Shutdown,
}

/// One line of host output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HostEvent {
    PostMessage { origin: String, message: Value },
    ShowUnlock,
    ApprovalRequested(PendingApproval),
    Error { message: String },
}

struct ChannelSink {
    events: mpsc::UnboundedSender<HostEvent>,
}

impl NativeSink for ChannelSink {
    fn post_from_bridge(&self, json: &str, origin: &str) -> Result<(), PortError> {
        let message = serde_json::from_str(json)
            .map_err(|e| PortError::Validation(format!("outbound json: {e}")))?;
        self.events
            .send(HostEvent::PostMessage {
                origin: origin.to_owned(),
                message,
            })
            .map_err(|_| PortError::Closed("host output closed".to_owned()))
    }
}

pub struct Host {
    router: Router,
    backend: Arc<InMemoryWalletBackend>,
    approvals: Arc<QueuedApprovals>,
    events: mpsc::UnboundedSender<HostEvent>,
    tracker: Arc<PollingBlockTracker>,
    _lock_manager: LockManager,
}

impl Host {
    /// Wires the bridge from `config`. Must run inside a tokio runtime.
    pub fn start(
        config: &BridgeConfig,
        events: mpsc::UnboundedSender<HostEvent>,
    ) -> Result<Self, PortError> {
        let upstream = Arc::new(Eip1193Upstream::with_config(config));
        tracing::info!(mode = upstream.mode_name(), "upstream ready");
        let tracker = PollingBlockTracker::start(
            upstream.clone(),
            Duration::from_millis(config.block_poll_interval_ms),
        )?;
        let block_tracker: Arc<dyn BlockTracker> = tracker.clone();
        let backend = Arc::new(InMemoryWalletBackend::new(
            &config.chain_id,
            &config.network_version,
            UpstreamTarget {
                provider: upstream,
                block_tracker: Some(block_tracker),
            },
        ));
        backend.set_unlock_prompt({
            let events = events.clone();
            move || {
                let _ = events.send(HostEvent::ShowUnlock);
            }
        });

        let approvals = Arc::new(QueuedApprovals::new());
        let mut announced = approvals.subscribe();
        let approval_events = events.clone();
        tokio::spawn(async move {
            while let Ok(pending) = announced.recv().await {
                if approval_events
                    .send(HostEvent::ApprovalRequested(pending))
                    .is_err()
                {
                    break;
                }
            }
        });

        let visibility = Arc::new(Visibility::new(true));
        let approved_hosts = ApprovedHosts::new(config.approved_hosts.iter().cloned());
        let methods = WalletRpcMethods::new(
            backend.clone(),
            approvals.clone(),
            approved_hosts.clone(),
            Arc::clone(&visibility),
        );
        let lock_manager = LockManager::spawn(backend.clone(), &visibility, config.lock_time_ms)?;
        let router = Router::with_max_idle(
            RouterDeps {
                backend: backend.clone(),
                dispatcher: Arc::new(methods),
                ports: Arc::new(NativePortFactory::new(Arc::new(ChannelSink {
                    events: events.clone(),
                }))),
                clock: Arc::new(SystemClock),
                approved_hosts,
                visibility,
            },
            config.max_idle_ms,
        );

        Ok(Self {
            router,
            backend,
            approvals,
            events,
            tracker,
            _lock_manager: lock_manager,
        })
    }

    /// Returns `false` once the host asked the bridge to stop.
    pub fn handle_line(&self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return true;
        }
        match serde_json::from_str::<HostCommand>(line) {
            Ok(command) => match self.apply(command) {
                Ok(keep_running) => keep_running,
                Err(error) => {
                    self.report(error.to_string());
                    true
                }
            },
            Err(error) => {
                tracing::warn!(%error, "unreadable host command");
                self.report(format!("unreadable host command: {error}"));
                true
            }
        }
    }

    fn report(&self, message: String) {
        let _ = self.events.send(HostEvent::Error { message });
    }

    pub fn apply(&self, command: HostCommand) -> Result<bool, PortError> {
        tracing::debug!(?command, "host command");
        match command {
            HostCommand::PostMessage { message } => self.router.post_message(message)?,
            HostCommand::LoadStarted { url } => {
                self.router.load_started(&url)?;
            }
            HostCommand::WindowStatusChanged { visible } => {
                self.router.on_window_visibility_change(visible)
            }
            HostCommand::BackendReady => {
                let flushed = self.router.on_backend_ready()?;
                tracing::info!(flushed, "backend ready");
            }
            HostCommand::Unlock => {
                self.backend.unlock()?;
            }
            HostCommand::Lock => {
                self.backend.lock_wallet()?;
            }
            HostCommand::SelectAddress { address } => self.backend.select_address(address)?,
            HostCommand::SwitchChain { chain_id } => self.backend.switch_network(&chain_id)?,
            HostCommand::ApproveHost { origin } => {
                self.router.approved_hosts().approve(origin);
            }
            HostCommand::ResolveApproval { id, approved } => {
                self.approvals.resolve(id, approved)?
            }
            HostCommand::Shutdown => {
                self.shutdown()?;
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn shutdown(&self) -> Result<(), PortError> {
        let declined = self.approvals.reject_all()?;
        let closed = self.router.shutdown()?;
        self.tracker.stop();
        tracing::info!(closed, declined, "bridge shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn host_commands_parse_from_tagged_json() {
        let command: HostCommand =
            serde_json::from_value(json!({ "type": "switchChain", "chainId": "0x89" }))
                .expect("switch chain");
        assert_eq!(
            command,
            HostCommand::SwitchChain {
                chain_id: "0x89".to_owned()
            }
        );
        let command: HostCommand =
            serde_json::from_value(json!({ "type": "windowStatusChanged", "visible": false }))
                .expect("visibility");
        assert_eq!(command, HostCommand::WindowStatusChanged { visible: false });
        let command: HostCommand =
            serde_json::from_value(json!({ "type": "backendReady" })).expect("ready");
        assert_eq!(command, HostCommand::BackendReady);
    }

    #[tokio::test]
    async fn requests_flow_from_stdin_commands_to_host_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let host = Host::start(&BridgeConfig::default(), tx).expect("start host");
        assert!(host.handle_line(r#"{"type":"backendReady"}"#));
        let line = json!({
            "type": "postMessage",
            "message": {
                "name": "metamask-provider",
                "origin": "https://app.example/page",
                "data": { "id": 1, "jsonrpc": "2.0", "method": "eth_chainId", "params": [] }
            }
        })
        .to_string();
        assert!(host.handle_line(&line));

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event within timeout")
            .expect("channel open");
        match event {
            HostEvent::PostMessage { origin, message } => {
                assert_eq!(origin, "https://app.example");
                assert_eq!(message["data"]["result"], json!("0x1"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        assert!(host.handle_line("not json"));
        assert!(matches!(rx.recv().await, Some(HostEvent::Error { .. })));
        assert!(!host.handle_line(r#"{"type":"shutdown"}"#));
    }
}
