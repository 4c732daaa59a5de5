use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use alloy::primitives::keccak256;
use async_trait::async_trait;
use serde_json::{json, Value};

use rusty_bridge_core::{normalize_chain_id, PortError, RpcError, UpstreamProvider};

use crate::BridgeConfig;

/// Upstream network provider handed to sessions. Talks JSON-RPC over HTTP
/// when a node URL is configured, otherwise answers from a local
/// deterministic chain.
#[derive(Debug, Clone)]
pub struct Eip1193Upstream {
    mode: ProviderMode,
    chain: Arc<Mutex<DeterministicChain>>,
}

#[derive(Debug, Clone)]
enum ProviderMode {
    Disabled(String),
    Deterministic,
    Http(HttpRuntime),
}

#[derive(Debug, Clone)]
struct HttpRuntime {
    url: String,
    client: reqwest::Client,
    next_id: Arc<AtomicU64>,
}

#[derive(Debug, Clone)]
struct DeterministicChain {
    chain_id: String,
    network_version: String,
    head: u64,
}

impl Eip1193Upstream {
    pub fn with_config(config: &BridgeConfig) -> Self {
        let chain = DeterministicChain {
            chain_id: normalize_chain_id(&config.chain_id),
            network_version: config.network_version.clone(),
            head: 1,
        };
        let mode = match &config.rpc_url {
            None => ProviderMode::Deterministic,
            Some(url) => {
                let timeout = Duration::from_millis(config.rpc_timeout_ms);
                match reqwest::Client::builder().timeout(timeout).build() {
                    Ok(client) => ProviderMode::Http(HttpRuntime {
                        url: url.clone(),
                        client,
                        next_id: Arc::new(AtomicU64::new(0)),
                    }),
                    Err(e) => {
                        tracing::warn!(%url, error = %e, "http upstream unavailable");
                        ProviderMode::Disabled(format!("failed to initialize http client: {e}"))
                    }
                }
            }
        };
        Self {
            mode,
            chain: Arc::new(Mutex::new(chain)),
        }
    }

    pub fn deterministic(chain_id: &str, network_version: &str) -> Self {
        Self::with_config(&BridgeConfig {
            chain_id: chain_id.to_owned(),
            network_version: network_version.to_owned(),
            rpc_url: None,
            ..BridgeConfig::default()
        })
    }

    pub fn http(url: &str, timeout_ms: u64) -> Self {
        Self::with_config(&BridgeConfig {
            rpc_url: Some(url.to_owned()),
            rpc_timeout_ms: timeout_ms,
            ..BridgeConfig::default()
        })
    }

    pub fn disabled(reason: impl Into<String>) -> Self {
        Self {
            mode: ProviderMode::Disabled(reason.into()),
            chain: Arc::new(Mutex::new(DeterministicChain {
                chain_id: "0x1".to_owned(),
                network_version: "1".to_owned(),
                head: 0,
            })),
        }
    }

    pub fn mode_name(&self) -> &'static str {
        match self.mode {
            ProviderMode::Disabled(_) => "disabled",
            ProviderMode::Deterministic => "deterministic",
            ProviderMode::Http(_) => "http",
        }
    }

    fn chain(&self) -> Result<MutexGuard<'_, DeterministicChain>, PortError> {
        self.chain
            .lock()
            .map_err(|e| PortError::Transport(format!("provider lock poisoned: {e}")))
    }

    /// Mines one block on the deterministic chain. Returns the new head.
    pub fn advance_block(&self) -> Result<u64, PortError> {
        let mut chain = self.chain()?;
        chain.head = chain.head.saturating_add(1);
        Ok(chain.head)
    }

    pub fn head(&self) -> Result<u64, PortError> {
        Ok(self.chain()?.head)
    }

    fn deterministic_call(&self, method: &str, params: &Value) -> Result<Value, RpcError> {
        let chain = self
            .chain()
            .map_err(|e| RpcError::internal(e.to_string()))?
            .clone();
        match method {
            "eth_chainId" => Ok(json!(chain.chain_id)),
            "net_version" => Ok(json!(chain.network_version)),
            "eth_blockNumber" => Ok(json!(hex_quantity(chain.head))),
            "eth_getBlockByNumber" => {
                let tag = params.get(0).and_then(Value::as_str).unwrap_or("latest");
                let number = match tag {
                    "latest" | "pending" | "safe" | "finalized" => chain.head,
                    "earliest" => 0,
                    raw => parse_quantity(raw)
                        .ok_or_else(|| RpcError::invalid_params(format!("bad block tag: {raw}")))?,
                };
                if number > chain.head {
                    return Ok(Value::Null);
                }
                Ok(deterministic_block(&chain.chain_id, number))
            }
            "eth_getLogs" => Ok(json!([])),
            "eth_getBalance" | "eth_getTransactionCount" => Ok(json!("0x0")),
            "eth_gasPrice" => Ok(json!("0x3b9aca00")),
            "eth_estimateGas" => Ok(json!("0x5208")),
            "eth_call" | "eth_getCode" => Ok(json!("0x")),
            "web3_clientVersion" => Ok(json!("rusty-bridge/deterministic")),
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    async fn http_call(
        &self,
        runtime: &HttpRuntime,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcError> {
        let id = runtime.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let response = runtime
            .client
            .post(&runtime.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(method, error = %e, "upstream request failed");
                RpcError::disconnected().with_data(json!({ "cause": e.to_string() }))
            })?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| RpcError::internal(format!("upstream json decode failed: {e}")))?;
        if let Some(error) = body.get("error") {
            return Err(
                serde_json::from_value::<RpcError>(error.clone()).unwrap_or_else(|_| {
                    RpcError::internal(format!("upstream returned error: {error}"))
                }),
            );
        }
        if !status.is_success() {
            return Err(RpcError::internal(format!("upstream status {status}")));
        }
        body.get("result")
            .cloned()
            .ok_or_else(|| RpcError::internal("upstream response missing result"))
    }
}

#[async_trait]
impl UpstreamProvider for Eip1193Upstream {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match &self.mode {
            ProviderMode::Disabled(reason) => {
                Err(RpcError::disconnected().with_data(json!({ "cause": reason })))
            }
            ProviderMode::Deterministic => self.deterministic_call(method, &params),
            ProviderMode::Http(runtime) => self.http_call(runtime, method, params).await,
        }
    }
}

fn hex_quantity(n: u64) -> String {
    format!("0x{n:x}")
}

fn parse_quantity(raw: &str) -> Option<u64> {
    let digits = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X"))?;
    u64::from_str_radix(digits, 16).ok()
}

fn block_hash(chain_id: &str, number: u64) -> String {
    let mut seed = Vec::new();
    seed.extend_from_slice(chain_id.as_bytes());
    seed.extend_from_slice(&number.to_be_bytes());
    keccak256(seed).to_string()
}

fn deterministic_block(chain_id: &str, number: u64) -> Value {
    let parent = match number {
        0 => format!("0x{}", "00".repeat(32)),
        n => block_hash(chain_id, n - 1),
    };
    json!({
        "number": hex_quantity(number),
        "hash": block_hash(chain_id, number),
        "parentHash": parent,
        "timestamp": hex_quantity(1_600_000_000 + number * 12),
        "transactions": [],
    })
}
