use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use alloy::primitives::{hex, keccak256, Address};
use async_trait::async_trait;
use serde_json::{json, Value};

use rusty_bridge_core::{
    format_address, normalize_chain_id, BackendEvent, BackendListener, ListenerId, PortError,
    UpstreamTarget, WalletBackend, WalletState,
};

type UnlockPrompt = Arc<dyn Fn() + Send + Sync>;

struct Network {
    network_version: String,
    target: UpstreamTarget,
}

struct BackendState {
    networks: HashMap<String, Network>,
    chain_id: String,
    selected: Option<Address>,
    unlocked: bool,
}

/// Wallet backend kept entirely in memory. Networks are registered with
/// their upstream target; switching networks retargets every session.
pub struct InMemoryWalletBackend {
    state: Mutex<BackendState>,
    listeners: Mutex<Vec<(ListenerId, BackendListener)>>,
    next_id: AtomicU64,
    unlock_requests: AtomicUsize,
    unlock_prompt: Mutex<Option<UnlockPrompt>>,
}

impl InMemoryWalletBackend {
    pub fn new(chain_id: &str, network_version: &str, target: UpstreamTarget) -> Self {
        let chain_id = normalize_chain_id(chain_id);
        let mut networks = HashMap::new();
        networks.insert(
            chain_id.clone(),
            Network {
                network_version: network_version.to_owned(),
                target,
            },
        );
        Self {
            state: Mutex::new(BackendState {
                networks,
                chain_id,
                selected: None,
                unlocked: false,
            }),
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            unlock_requests: AtomicUsize::new(0),
            unlock_prompt: Mutex::new(None),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, BackendState>, PortError> {
        self.state
            .lock()
            .map_err(|e| PortError::Transport(format!("backend lock poisoned: {e}")))
    }

    fn listeners(&self) -> Result<MutexGuard<'_, Vec<(ListenerId, BackendListener)>>, PortError> {
        self.listeners
            .lock()
            .map_err(|e| PortError::Transport(format!("backend listeners lock poisoned: {e}")))
    }

    fn emit(&self, event: BackendEvent) {
        let listeners: Vec<BackendListener> = match self.listeners() {
            Ok(g) => g.iter().map(|(_, listener)| Arc::clone(listener)).collect(),
            Err(e) => {
                tracing::warn!(error = %e, ?event, "backend event dropped");
                return;
            }
        };
        for listener in listeners {
            listener(&event);
        }
    }

    pub fn add_network(
        &self,
        chain_id: &str,
        network_version: &str,
        target: UpstreamTarget,
    ) -> Result<(), PortError> {
        self.state()?.networks.insert(
            normalize_chain_id(chain_id),
            Network {
                network_version: network_version.to_owned(),
                target,
            },
        );
        Ok(())
    }

    pub fn switch_network(&self, chain_id: &str) -> Result<(), PortError> {
        let chain_id = normalize_chain_id(chain_id);
        {
            let mut g = self.state()?;
            if !g.networks.contains_key(&chain_id) {
                return Err(PortError::NotFound(format!("unknown chain: {chain_id}")));
            }
            if g.chain_id == chain_id {
                return Ok(());
            }
            g.chain_id = chain_id.clone();
        }
        tracing::info!(%chain_id, "network switched");
        self.emit(BackendEvent::StateChanged);
        Ok(())
    }

    pub fn select_address(&self, address: Option<Address>) -> Result<(), PortError> {
        {
            let mut g = self.state()?;
            if g.selected == address {
                return Ok(());
            }
            g.selected = address;
        }
        self.emit(BackendEvent::StateChanged);
        Ok(())
    }

    /// Returns `false` if the wallet was already unlocked.
    pub fn unlock(&self) -> Result<bool, PortError> {
        {
            let mut g = self.state()?;
            if g.unlocked {
                return Ok(false);
            }
            g.unlocked = true;
        }
        tracing::info!("wallet unlocked");
        self.emit(BackendEvent::Unlocked);
        Ok(true)
    }

    /// Returns `false` if the wallet was already locked.
    pub fn lock_wallet(&self) -> Result<bool, PortError> {
        {
            let mut g = self.state()?;
            if !g.unlocked {
                return Ok(false);
            }
            g.unlocked = false;
        }
        tracing::info!("wallet locked");
        self.emit(BackendEvent::Locked);
        Ok(true)
    }

    /// Called whenever a request needs the unlock screen.
    pub fn set_unlock_prompt(&self, prompt: impl Fn() + Send + Sync + 'static) {
        if let Ok(mut g) = self.unlock_prompt.lock() {
            *g = Some(Arc::new(prompt));
        }
    }

    pub fn unlock_requests(&self) -> usize {
        self.unlock_requests.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners().map(|g| g.len()).unwrap_or(0)
    }
}

#[async_trait]
impl WalletBackend for InMemoryWalletBackend {
    fn snapshot(&self) -> WalletState {
        match self.state() {
            Ok(g) => WalletState {
                chain_id: g.chain_id.clone(),
                network_version: g
                    .networks
                    .get(&g.chain_id)
                    .map(|n| n.network_version.clone())
                    .unwrap_or_else(|| rusty_bridge_core::LOADING_NETWORK.to_owned()),
                selected_address: g.selected,
                is_unlocked: g.unlocked,
            },
            Err(e) => {
                tracing::warn!(error = %e, "backend snapshot unavailable");
                WalletState {
                    chain_id: String::new(),
                    network_version: rusty_bridge_core::LOADING_NETWORK.to_owned(),
                    selected_address: None,
                    is_unlocked: false,
                }
            }
        }
    }

    fn upstream(&self) -> Option<UpstreamTarget> {
        let g = self.state().ok()?;
        g.networks.get(&g.chain_id).map(|n| n.target.clone())
    }

    fn subscribe(&self, listener: BackendListener) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        match self.listeners() {
            Ok(mut g) => g.push((id, listener)),
            Err(e) => tracing::warn!(error = %e, "backend subscribe failed"),
        }
        id
    }

    fn unsubscribe(&self, id: ListenerId) {
        if let Ok(mut g) = self.listeners() {
            g.retain(|(existing, _)| *existing != id);
        }
    }

    fn request_unlock(&self) {
        self.unlock_requests.fetch_add(1, Ordering::SeqCst);
        let prompt = self.unlock_prompt.lock().ok().and_then(|g| g.clone());
        if let Some(prompt) = prompt {
            prompt();
        }
    }

    fn lock(&self) -> Result<(), PortError> {
        self.lock_wallet().map(|_| ())
    }

    async fn switch_chain(&self, chain_id: &str) -> Result<(), PortError> {
        self.switch_network(chain_id)
    }

    async fn sign(&self, method: &str, params: &Value) -> Result<Value, PortError> {
        let (signer, chain_id) = {
            let g = self.state()?;
            if !g.unlocked {
                return Err(PortError::Policy("wallet is locked".to_owned()));
            }
            let signer = g
                .selected
                .ok_or_else(|| PortError::Policy("no account selected".to_owned()))?;
            (signer, g.chain_id.clone())
        };
        let mut seed = Vec::new();
        seed.extend_from_slice(signer.as_slice());
        seed.extend_from_slice(chain_id.as_bytes());
        seed.extend_from_slice(method.as_bytes());
        seed.extend_from_slice(params.to_string().as_bytes());
        let digest = keccak256(&seed);
        tracing::debug!(method, signer = %format_address(&signer), "signed");
        if method == "eth_sendTransaction" {
            return Ok(json!(digest.to_string()));
        }
        let s = keccak256(digest);
        Ok(json!(format!(
            "0x{}{}1b",
            hex::encode(digest),
            hex::encode(s)
        )))
    }
}
