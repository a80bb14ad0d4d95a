//! Runtime configuration, env-first with defaults (SPEC_FULL §4.0),
//! mirroring `Config::from_env` in the teacher codebase: `dotenv().ok()`
//! first, then `env::var(...).unwrap_or_else(...)` per field, numeric
//! fields parsed with a fallback rather than a hard failure.

use std::env;
use std::time::Duration;

/// Every knob the scheduler, cognitive cycle, guardrails, and control
/// plane read at startup. Environment overrides structured defaults
/// (`spec.md` §6 "Environment").
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub database_path: String,
    pub http_host: String,
    pub http_port: u16,
    pub api_key: Option<String>,

    pub poll_interval_ms: u64,
    pub max_concurrent_cycles: usize,
    pub max_backoff_ms: u64,
    pub graceful_shutdown_ms: u64,
    pub max_run_records: usize,
    pub circuit_breaker_threshold: u32,

    pub shadow_mode_default: bool,
    pub shadow_execute_tx: bool,

    pub hard_validator_address: String,
    pub chain_id: i64,

    pub default_timeout_ms: u64,
    pub rpc_timeout_ms: u64,
    pub llm_timeout_ms: u64,
    pub db_timeout_ms: u64,

    pub memory_recall_limit: usize,

    /// §7 "If category = infrastructure_error and the caller wraps it
    /// with withRetry... it is retried". Only applied to chain/perception
    /// calls in the cognitive cycle; never to business/model failures.
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl RunnerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let default_timeout_ms = env_u64("DEFAULT_TIMEOUT_MS", 10_000);

        Ok(Self {
            database_path: env::var("DATABASE_URL")
                .or_else(|_| env::var("DATABASE_PATH"))
                .unwrap_or_else(|_| "./autopilot_runner.db".to_string()),
            http_host: env::var("HTTP_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            http_port: env_u64("HTTP_PORT", 8090) as u16,
            api_key: env::var("API_KEY").ok().filter(|s| !s.is_empty()),

            poll_interval_ms: env_u64("POLL_INTERVAL_MS", 5_000),
            max_concurrent_cycles: env_u64("MAX_CONCURRENT_CYCLES", 16) as usize,
            max_backoff_ms: env_u64("MAX_BACKOFF_MS", 300_000),
            graceful_shutdown_ms: env_u64("GRACEFUL_SHUTDOWN_MS", 10_000),
            max_run_records: env_u64("MAX_RUN_RECORDS", 500) as usize,
            circuit_breaker_threshold: env_u64("CIRCUIT_BREAKER_THRESHOLD", 5) as u32,

            shadow_mode_default: env_bool("SHADOW_MODE_DEFAULT", false),
            shadow_execute_tx: env_bool("SHADOW_EXECUTE_TX", false),

            hard_validator_address: env::var("HARD_VALIDATOR_ADDRESS")
                .unwrap_or_else(|_| crate::chain::ZERO_ADDRESS.to_string()),
            chain_id: env::var("CHAIN_ID")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),

            default_timeout_ms,
            rpc_timeout_ms: env_u64("RPC_TIMEOUT_MS", default_timeout_ms),
            llm_timeout_ms: env_u64("LLM_TIMEOUT_MS", default_timeout_ms),
            db_timeout_ms: env_u64("DB_TIMEOUT_MS", default_timeout_ms),

            memory_recall_limit: env_u64("MEMORY_RECALL_LIMIT", 20) as usize,

            retry_max_attempts: env_u64("RETRY_MAX_ATTEMPTS", 3) as u32,
            retry_base_delay_ms: env_u64("RETRY_BASE_DELAY_MS", 250),
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn graceful_shutdown(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_millis(self.llm_timeout_ms)
    }

    pub fn db_timeout(&self) -> Duration {
        Duration::from_millis(self.db_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}
