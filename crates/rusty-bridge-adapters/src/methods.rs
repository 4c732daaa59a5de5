use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use rusty_bridge_core::{
    ensure_unlocked, normalize_chain_id, ApprovalKind, ApprovalPort, ApprovalRequest,
    ApprovedHosts, DispatcherFactory, Flow, Middleware, PortError, ProviderStateFn, RpcError,
    RpcRequest, Visibility, WalletBackend,
};

const SIGNING_METHODS: &[&str] = &[
    "personal_sign",
    "eth_sign",
    "eth_signTypedData",
    "eth_signTypedData_v3",
    "eth_signTypedData_v4",
    "eth_sendTransaction",
];

fn port_error_to_rpc(error: PortError) -> RpcError {
    match error {
        PortError::Policy(message) => {
            RpcError::unauthorized().with_data(json!({ "cause": message }))
        }
        PortError::Closed(_) => RpcError::disconnected(),
        other => RpcError::internal(other.to_string()),
    }
}

/// Default wallet-domain dispatcher. Everything it does not recognise falls
/// through to the upstream forwarder.
pub struct WalletRpcMethods {
    backend: Arc<dyn WalletBackend>,
    approvals: Arc<dyn ApprovalPort>,
    approved_hosts: ApprovedHosts,
    visibility: Arc<Visibility>,
}

impl WalletRpcMethods {
    pub fn new(
        backend: Arc<dyn WalletBackend>,
        approvals: Arc<dyn ApprovalPort>,
        approved_hosts: ApprovedHosts,
        visibility: Arc<Visibility>,
    ) -> Self {
        Self {
            backend,
            approvals,
            approved_hosts,
            visibility,
        }
    }
}

impl DispatcherFactory for WalletRpcMethods {
    fn create(
        &self,
        hostname: &str,
        provider_state: ProviderStateFn,
    ) -> Result<Arc<dyn Middleware>, PortError> {
        tracing::debug!(hostname, "wallet stage created");
        Ok(Arc::new(WalletStage {
            backend: Arc::clone(&self.backend),
            approvals: Arc::clone(&self.approvals),
            approved_hosts: self.approved_hosts.clone(),
            visibility: Arc::clone(&self.visibility),
            provider_state,
        }))
    }
}

struct WalletStage {
    backend: Arc<dyn WalletBackend>,
    approvals: Arc<dyn ApprovalPort>,
    approved_hosts: ApprovedHosts,
    visibility: Arc<Visibility>,
    provider_state: ProviderStateFn,
}

impl WalletStage {
    fn origin(request: &RpcRequest) -> Result<&str, RpcError> {
        request
            .origin
            .as_deref()
            .ok_or_else(|| RpcError::invalid_request("request has no origin"))
    }

    fn visible_accounts(&self, origin: &str) -> Value {
        let state = self.backend.snapshot();
        if !state.is_unlocked || !self.approved_hosts.contains(origin) {
            return json!([]);
        }
        json!(state.selected_address_hex().into_iter().collect::<Vec<_>>())
    }

    async fn ask(&self, origin: &str, kind: ApprovalKind) -> Result<(), RpcError> {
        let approved = self
            .approvals
            .request_approval(ApprovalRequest {
                origin: origin.to_owned(),
                kind,
            })
            .await
            .map_err(port_error_to_rpc)?;
        if approved {
            Ok(())
        } else {
            Err(RpcError::user_rejected())
        }
    }

    async fn request_accounts(&self, origin: &str) -> Result<Value, RpcError> {
        ensure_unlocked(self.backend.as_ref(), &self.visibility).await?;
        if !self.approved_hosts.contains(origin) {
            self.ask(origin, ApprovalKind::Connect).await?;
            self.approved_hosts.approve(origin);
            tracing::info!(origin, "host approved");
        }
        Ok(self.visible_accounts(origin))
    }

    async fn switch_chain(&self, origin: &str, request: &RpcRequest) -> Result<Value, RpcError> {
        let requested = request
            .param(0)
            .and_then(|p| p.get("chainId"))
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("expected [{ chainId }]"))?;
        if !requested.starts_with("0x") {
            return Err(RpcError::invalid_params(format!(
                "chainId must be 0x-prefixed hex: {requested}"
            )));
        }
        let chain_id = normalize_chain_id(requested);
        if normalize_chain_id(&self.backend.snapshot().chain_id) == chain_id {
            return Ok(Value::Null);
        }
        self.ask(
            origin,
            ApprovalKind::SwitchChain {
                chain_id: chain_id.clone(),
            },
        )
        .await?;
        match self.backend.switch_chain(&chain_id).await {
            Ok(()) => Ok(Value::Null),
            Err(PortError::NotFound(_)) => Err(RpcError::unrecognized_chain(&chain_id)),
            Err(e) => Err(port_error_to_rpc(e)),
        }
    }

    async fn sign(&self, origin: &str, request: &RpcRequest) -> Result<Value, RpcError> {
        if !self.approved_hosts.contains(origin) {
            return Err(RpcError::unauthorized());
        }
        ensure_unlocked(self.backend.as_ref(), &self.visibility).await?;
        self.ask(
            origin,
            ApprovalKind::Sign {
                method: request.method.clone(),
                params: request.params.clone(),
            },
        )
        .await?;
        self.backend
            .sign(&request.method, &request.params)
            .await
            .map_err(port_error_to_rpc)
    }
}

#[async_trait]
impl Middleware for WalletStage {
    fn name(&self) -> &'static str {
        "wallet"
    }

    async fn handle(&self, request: &mut RpcRequest) -> Result<Flow, RpcError> {
        let request = &*request;
        let result = match request.method.as_str() {
            "metamask_getProviderState" => serde_json::to_value((self.provider_state)())
                .map_err(|e| RpcError::internal(format!("provider state encode failed: {e}")))?,
            "eth_chainId" => json!(normalize_chain_id(&self.backend.snapshot().chain_id)),
            "net_version" => json!(self.backend.snapshot().network_version),
            "eth_accounts" => self.visible_accounts(Self::origin(request)?),
            "eth_coinbase" => self
                .visible_accounts(Self::origin(request)?)
                .get(0)
                .cloned()
                .unwrap_or(Value::Null),
            "eth_requestAccounts" => self.request_accounts(Self::origin(request)?).await?,
            "wallet_switchEthereumChain" => {
                self.switch_chain(Self::origin(request)?, request).await?
            }
            method if SIGNING_METHODS.contains(&method) => {
                self.sign(Self::origin(request)?, request).await?
            }
            _ => return Ok(Flow::Next),
        };
        Ok(Flow::Done(result))
    }
}
