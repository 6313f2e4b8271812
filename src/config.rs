use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub enable_tracing: bool,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub allocation: AllocationConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    /// PostgreSQL connection URL for the durable event store
    #[serde(default)]
    pub postgres_url: Option<String>,
}

/// Ledger aggregate configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LedgerConfig {
    /// Max reload-and-retry rounds on an optimistic concurrency conflict
    pub max_append_retries: u32,
    /// Events older than this many days are archival candidates
    pub archive_retention_days: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_append_retries: 5,
            archive_retention_days: 90,
        }
    }
}

/// Custodian resilience configuration (circuit breaker + retry + fallback)
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ResilienceConfig {
    /// Rolling outcome window size per connector (samples)
    pub window_size: usize,
    /// Failure rate threshold within the window (0.0 - 1.0)
    pub failure_rate_threshold: f64,
    /// Absolute failure count threshold within the window
    pub failure_count_threshold: usize,
    /// Open -> HalfOpen cooldown in milliseconds
    pub cooldown_ms: u64,
    /// Retry: max attempts per call
    pub max_attempts: u32,
    /// Retry: initial backoff delay in milliseconds
    pub base_delay_ms: u64,
    /// Retry: backoff multiplier
    pub backoff_multiplier: f64,
    /// Retry: backoff cap in milliseconds
    pub max_delay_ms: u64,
    /// Per-call timeout in milliseconds
    pub call_timeout_ms: u64,
    /// Last-known-good read cache TTL in seconds
    pub read_cache_ttl_secs: u64,
    /// Deferred write queue capacity per custodian
    pub deferred_queue_capacity: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            failure_rate_threshold: 0.5,
            failure_count_threshold: 5,
            cooldown_ms: 30_000,
            max_attempts: 3,
            base_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 5_000,
            call_timeout_ms: 10_000,
            read_cache_ttl_secs: 30,
            deferred_queue_capacity: 1024,
        }
    }
}

/// Bank allocation configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AllocationConfig {
    /// Minimum number of custodian bindings per account
    pub min_bindings: usize,
    /// Maximum number of custodian bindings per account
    pub max_bindings: usize,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            min_bindings: 2,
            max_bindings: 10,
        }
    }
}

/// Settlement engine configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SettlementConfig {
    /// Settlement mode: "realtime", "batch" or "net"
    pub mode: String,
    /// Period between batch closes in seconds
    pub period_secs: u64,
    /// Pairs netting below this amount are carried forward, not settled
    pub min_settlement_amount: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            mode: "net".to_string(),
            period_secs: 3600,
            min_settlement_amount: 10_000,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Self {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .unwrap_or_else(|_| panic!("Failed to read config file: {}", config_path));
        serde_yaml::from_str(&content).expect("Failed to parse config yaml")
    }
}
