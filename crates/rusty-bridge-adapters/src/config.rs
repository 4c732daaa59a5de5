use rusty_bridge_core::DEFAULT_MAX_IDLE_MS;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// JSON-RPC endpoint of the upstream node. `None` selects the offline
    /// deterministic provider.
    pub rpc_url: Option<String>,
    pub chain_id: String,
    pub network_version: String,
    pub rpc_timeout_ms: u64,
    pub block_poll_interval_ms: u64,
    pub max_idle_ms: u64,
    /// -1 never locks, 0 locks as soon as the window hides.
    pub lock_time_ms: i64,
    pub approved_hosts: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            rpc_url: None,
            chain_id: "0x1".to_owned(),
            network_version: "1".to_owned(),
            rpc_timeout_ms: 15_000,
            block_poll_interval_ms: 12_000,
            max_idle_ms: DEFAULT_MAX_IDLE_MS,
            lock_time_ms: 30_000,
            approved_hosts: Vec::new(),
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup; unparseable values keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let text = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };

        Self {
            rpc_url: text("RUSTY_BRIDGE_RPC_URL"),
            chain_id: text("RUSTY_BRIDGE_CHAIN_ID").unwrap_or(defaults.chain_id),
            network_version: text("RUSTY_BRIDGE_NETWORK_VERSION")
                .unwrap_or(defaults.network_version),
            rpc_timeout_ms: parsed(&text, "RUSTY_BRIDGE_RPC_TIMEOUT_MS", defaults.rpc_timeout_ms),
            block_poll_interval_ms: parsed(
                &text,
                "RUSTY_BRIDGE_BLOCK_POLL_MS",
                defaults.block_poll_interval_ms,
            ),
            max_idle_ms: parsed(&text, "RUSTY_BRIDGE_MAX_IDLE_MS", defaults.max_idle_ms),
            lock_time_ms: parsed(&text, "RUSTY_BRIDGE_LOCK_TIME_MS", defaults.lock_time_ms),
            approved_hosts: text("RUSTY_BRIDGE_APPROVED_HOSTS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|host| !host.is_empty())
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or(defaults.approved_hosts),
        }
    }
}

fn parsed<T: std::str::FromStr>(
    text: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match text(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparseable config value");
            default
        }),
    }
}
