use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{parse_hex_u64, to_hex};
use crate::engine::{Flow, Middleware};
use crate::message::{RpcError, RpcRequest};
use crate::ports::{BlockTracker, UpstreamProvider};

const MAX_BLOCK_BACKFILL: u64 = 100;

#[derive(Debug, Clone)]
enum FilterKind {
    Block,
    PendingTransaction,
    Log(Map<String, Value>),
}

#[derive(Debug, Clone)]
struct FilterEntry {
    kind: FilterKind,
    last_block: u64,
}

/// `eth_newFilter`-family polyfill. Changes are computed lazily on poll,
/// from the block after the filter's last poll up to the current head.
pub struct FilterMiddleware {
    provider: Arc<dyn UpstreamProvider>,
    block_tracker: Arc<dyn BlockTracker>,
    next_id: AtomicU64,
    filters: Mutex<HashMap<u64, FilterEntry>>,
}

impl FilterMiddleware {
    pub fn new(provider: Arc<dyn UpstreamProvider>, block_tracker: Arc<dyn BlockTracker>) -> Self {
        Self {
            provider,
            block_tracker,
            next_id: AtomicU64::new(0),
            filters: Mutex::new(HashMap::new()),
        }
    }

    pub fn filter_count(&self) -> usize {
        self.filters().len()
    }

    fn filters(&self) -> MutexGuard<'_, HashMap<u64, FilterEntry>> {
        self.filters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn head(&self) -> Result<u64, RpcError> {
        if let Some(block) = self.block_tracker.latest_block() {
            return Ok(block);
        }
        let raw = self.provider.request("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&raw)
            .ok_or_else(|| RpcError::internal("upstream returned an invalid block number"))
    }

    async fn install(&self, kind: FilterKind) -> Result<Flow, RpcError> {
        let head = self.head().await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.filters().insert(
            id,
            FilterEntry {
                kind,
                last_block: head,
            },
        );
        Ok(Flow::Done(Value::String(to_hex(id))))
    }

    fn entry(&self, id: u64) -> Result<FilterEntry, RpcError> {
        self.filters()
            .get(&id)
            .cloned()
            .ok_or_else(|| RpcError::invalid_params(format!("filter not found: {}", to_hex(id))))
    }

    async fn changes(&self, id: u64) -> Result<Value, RpcError> {
        let entry = self.entry(id)?;
        let head = self.head().await?;
        if head <= entry.last_block {
            return Ok(json!([]));
        }
        let from = entry.last_block + 1;
        let result = match &entry.kind {
            FilterKind::PendingTransaction => json!([]),
            FilterKind::Block => {
                let start = from.max(head.saturating_sub(MAX_BLOCK_BACKFILL - 1));
                let mut hashes = Vec::new();
                for number in start..=head {
                    let block = self
                        .provider
                        .request("eth_getBlockByNumber", json!([to_hex(number), false]))
                        .await?;
                    if let Some(hash) = block.get("hash") {
                        hashes.push(hash.clone());
                    }
                }
                Value::Array(hashes)
            }
            FilterKind::Log(criteria) => self.logs(criteria, Some((from, head))).await?,
        };
        if let Some(entry) = self.filters().get_mut(&id) {
            entry.last_block = entry.last_block.max(head);
        }
        Ok(result)
    }

    async fn logs(
        &self,
        criteria: &Map<String, Value>,
        range: Option<(u64, u64)>,
    ) -> Result<Value, RpcError> {
        let mut query = criteria.clone();
        if let Some((from, to)) = range {
            query.insert("fromBlock".to_owned(), Value::String(to_hex(from)));
            query.insert("toBlock".to_owned(), Value::String(to_hex(to)));
        }
        self.provider
            .request("eth_getLogs", json!([Value::Object(query)]))
            .await
    }
}

fn filter_id(request: &RpcRequest) -> Result<u64, RpcError> {
    request
        .param(0)
        .and_then(parse_hex_u64)
        .ok_or_else(|| RpcError::invalid_params("expected a filter id"))
}

#[async_trait]
impl Middleware for FilterMiddleware {
    fn name(&self) -> &'static str {
        "filters"
    }

    async fn handle(&self, request: &mut RpcRequest) -> Result<Flow, RpcError> {
        match request.method.as_str() {
            "eth_newFilter" => {
                let criteria = match request.param(0) {
                    Some(Value::Object(criteria)) => criteria.clone(),
                    _ => {
                        return Err(RpcError::invalid_params(
                            "eth_newFilter expects a filter object",
                        ))
                    }
                };
                self.install(FilterKind::Log(criteria)).await
            }
            "eth_newBlockFilter" => self.install(FilterKind::Block).await,
            "eth_newPendingTransactionFilter" => {
                self.install(FilterKind::PendingTransaction).await
            }
            "eth_uninstallFilter" => {
                let id = filter_id(request)?;
                let removed = self.filters().remove(&id).is_some();
                Ok(Flow::Done(Value::Bool(removed)))
            }
            "eth_getFilterChanges" => {
                let id = filter_id(request)?;
                self.changes(id).await.map(Flow::Done)
            }
            "eth_getFilterLogs" => {
                let id = filter_id(request)?;
                match self.entry(id)?.kind {
                    FilterKind::Log(criteria) => self.logs(&criteria, None).await.map(Flow::Done),
                    _ => Err(RpcError::invalid_params("filter does not track logs")),
                }
            }
            _ => Ok(Flow::Next),
        }
    }

    fn destroy(&self) {
        self.filters().clear();
    }
}
