use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use rusty_bridge_core::{
    parse_chain_id, ApprovedHosts, NotificationName, OpenedPort, OutboundMessage, OutboundPayload, PortError,
    PortFactory, RpcError, RpcNotification, SessionKey, Transport, WalletBackend,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    pub chain_id: u64,
    pub accounts: Vec<String>,
}

/// Remote-peer session operations (WalletConnect-style pairing).
pub trait PeerSessionActions: Send + Sync {
    fn update_session(&self, update: SessionUpdate) -> Result<(), PortError>;
    fn approve_request(&self, id: &Value, result: &Value) -> Result<(), PortError>;
    fn reject_request(&self, id: &Value, error: &RpcError) -> Result<(), PortError>;
}

/// Transport for a remote peer. Translates outbound provider traffic into
/// session updates and request approvals/rejections.
pub struct PeerPort {
    actions: Arc<dyn PeerSessionActions>,
    backend: Arc<dyn WalletBackend>,
    approved_hosts: ApprovedHosts,
}

impl PeerPort {
    pub fn new(
        actions: Arc<dyn PeerSessionActions>,
        backend: Arc<dyn WalletBackend>,
        approved_hosts: ApprovedHosts,
    ) -> Self {
        Self {
            actions,
            backend,
            approved_hosts,
        }
    }

    /// Accounts a chain update carries: none unless the peer is approved and
    /// the wallet is unlocked.
    fn visible_accounts(&self, origin: &str) -> Vec<String> {
        let state = self.backend.snapshot();
        if !state.is_unlocked || !self.approved_hosts.contains(origin) {
            return Vec::new();
        }
        state.selected_address_hex().into_iter().collect()
    }

    fn forward_notification(
        &self,
        notification: &RpcNotification,
        origin: &str,
    ) -> Result<(), PortError> {
        match NotificationName::parse(&notification.method) {
            Some(NotificationName::ChainChanged) => {
                let raw = notification
                    .params
                    .get("chainId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| PortError::Validation("chainChanged without chainId".into()))?;
                self.actions.update_session(SessionUpdate {
                    chain_id: parse_chain_id(raw)?,
                    accounts: self.visible_accounts(origin),
                })
            }
            Some(NotificationName::AccountsChanged) => {
                let accounts = notification
                    .params
                    .as_array()
                    .map(|list| {
                        list.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_owned)
                            .collect()
                    })
                    .unwrap_or_default();
                let chain_id = parse_chain_id(&self.backend.snapshot().chain_id)?;
                self.actions
                    .update_session(SessionUpdate { chain_id, accounts })
            }
            Some(NotificationName::UnlockStateChanged) => Ok(()),
            None => {
                tracing::debug!(method = %notification.method, "notification not relayed to peer");
                Ok(())
            }
        }
    }
}

impl Transport for PeerPort {
    fn post_message(
        &self,
        message: &OutboundMessage,
        target_origin: &str,
    ) -> Result<(), PortError> {
        match &message.data {
            OutboundPayload::Notification(notification) => {
                self.forward_notification(notification, target_origin)
            }
            OutboundPayload::Response(response) => match &response.error {
                Some(error) => self.actions.reject_request(&response.id, error),
                None => {
                    let result = response.result.clone().unwrap_or(Value::Null);
                    self.actions.approve_request(&response.id, &result)
                }
            },
        }
    }
}

pub struct PeerPortFactory {
    actions: Arc<dyn PeerSessionActions>,
    backend: Arc<dyn WalletBackend>,
    approved_hosts: ApprovedHosts,
}

impl PeerPortFactory {
    pub fn new(
        actions: Arc<dyn PeerSessionActions>,
        backend: Arc<dyn WalletBackend>,
        approved_hosts: ApprovedHosts,
    ) -> Self {
        Self {
            actions,
            backend,
            approved_hosts,
        }
    }
}

impl PortFactory for PeerPortFactory {
    fn open(&self, _key: &SessionKey) -> Result<OpenedPort, PortError> {
        Ok(OpenedPort {
            transport: Arc::new(PeerPort::new(
                Arc::clone(&self.actions),
                Arc::clone(&self.backend),
                self.approved_hosts.clone(),
            )),
            is_main_frame: true,
        })
    }
}
