use std::fmt;
use std::sync::Arc;

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::InboundMessage;
use crate::ports::{BlockTracker, PortError, UpstreamProvider};

pub const PROVIDER_STREAM: &str = "metamask-provider";
/// Idempotent provider-state query; never refreshes a session's activity time.
pub const PROVIDER_STATE_METHOD: &str = "metamask_getProviderState";
pub const LOADING_NETWORK: &str = "loading";
pub const MAIN_FRAME_PEER: &str = "main";
pub const DEFAULT_MAX_IDLE_MS: u64 = 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimestampMs(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub origin: String,
    pub peer_id: String,
}

impl SessionKey {
    pub fn new(origin: impl Into<String>, peer_id: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            peer_id: peer_id.into(),
        }
    }

    pub fn main_frame(origin: impl Into<String>) -> Self {
        Self::new(origin, MAIN_FRAME_PEER)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.origin, self.peer_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationName {
    ChainChanged,
    AccountsChanged,
    UnlockStateChanged,
}

impl NotificationName {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationName::ChainChanged => "chainChanged",
            NotificationName::AccountsChanged => "accountsChanged",
            NotificationName::UnlockStateChanged => "unlockStateChanged",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "chainChanged" => Some(NotificationName::ChainChanged),
            "accountsChanged" => Some(NotificationName::AccountsChanged),
            "unlockStateChanged" => Some(NotificationName::UnlockStateChanged),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletState {
    pub chain_id: String,
    pub network_version: String,
    pub selected_address: Option<Address>,
    pub is_unlocked: bool,
}

impl WalletState {
    pub fn network_state(&self) -> NetworkState {
        NetworkState {
            chain_id: normalize_chain_id(&self.chain_id),
            network_version: self.network_version.clone(),
        }
    }

    pub fn provider_state(&self) -> ProviderState {
        ProviderState {
            is_unlocked: self.is_unlocked,
            chain_id: normalize_chain_id(&self.chain_id),
            network_version: self.network_version.clone(),
        }
    }

    pub fn selected_address_hex(&self) -> Option<String> {
        self.selected_address.as_ref().map(format_address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkState {
    pub chain_id: String,
    pub network_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderState {
    pub is_unlocked: bool,
    pub chain_id: String,
    pub network_version: String,
}

/// The provider + block tracker pair a session's proxies delegate to.
#[derive(Clone)]
pub struct UpstreamTarget {
    pub provider: Arc<dyn UpstreamProvider>,
    pub block_tracker: Option<Arc<dyn BlockTracker>>,
}

impl fmt::Debug for UpstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamTarget")
            .field("provider", &Arc::as_ptr(&self.provider).cast::<()>())
            .field("has_block_tracker", &self.block_tracker.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendEvent {
    StateChanged,
    Locked,
    Unlocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityEvent {
    Show,
    Hide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connect,
    Update,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub origin: String,
    pub peer_id: String,
    pub payload: InboundMessage,
    pub enqueued_at_ms: TimestampMs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ApprovalKind {
    Connect,
    SwitchChain { chain_id: String },
    Sign { method: String, params: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub origin: String,
    #[serde(flatten)]
    pub kind: ApprovalKind,
}

/// `0x`-prefixed lowercase hex; decimal input is converted.
pub fn normalize_chain_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        return format!("0x{}", hex.to_ascii_lowercase());
    }
    match trimmed.parse::<u64>() {
        Ok(n) => format!("0x{n:x}"),
        Err(_) => trimmed.to_owned(),
    }
}

pub fn parse_chain_id(raw: &str) -> Result<u64, PortError> {
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
            .map_err(|e| PortError::Validation(format!("invalid hex chain id: {e}")))
    } else {
        raw.parse()
            .map_err(|e| PortError::Validation(format!("invalid chain id: {e}")))
    }
}

pub fn format_address(address: &Address) -> String {
    address.to_string().to_ascii_lowercase()
}
