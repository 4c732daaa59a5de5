use serde_json::{json, Value};

use crate::domain::{normalize_chain_id, NotificationName, WalletState, LOADING_NETWORK};
use crate::message::RpcNotification;

/// Values most recently pushed to a session; a notification is only sent when
/// the snapshot differs from these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastSent {
    pub chain_id: String,
    pub network_version: String,
    pub address: Option<String>,
}

impl LastSent {
    pub fn from_snapshot(snapshot: &WalletState) -> Self {
        Self {
            chain_id: normalize_chain_id(&snapshot.chain_id),
            network_version: snapshot.network_version.clone(),
            address: snapshot.selected_address_hex(),
        }
    }
}

pub fn compute_state_delta(last: &mut LastSent, snapshot: &WalletState) -> Vec<RpcNotification> {
    let mut out = Vec::new();
    let network = snapshot.network_state();

    // Mid-switch snapshots carry one new value and one stale one; wait for both.
    if network.chain_id != last.chain_id
        && network.network_version != last.network_version
        && network.network_version != LOADING_NETWORK
    {
        let params = serde_json::to_value(&network).unwrap_or(Value::Null);
        out.push(RpcNotification::named(NotificationName::ChainChanged, params));
        last.chain_id = network.chain_id;
        last.network_version = network.network_version;
    }

    let address = snapshot.selected_address_hex();
    if address != last.address {
        let accounts = match &address {
            Some(address) => json!([address]),
            None => json!([]),
        };
        out.push(RpcNotification::named(
            NotificationName::AccountsChanged,
            accounts,
        ));
        last.address = address;
    }
    out
}
