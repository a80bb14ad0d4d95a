//! Schema for the five logical tables of §3 plus the two ambient tables
//! named in `spec.md` §6 ("Persisted state layout"). WAL mode mirrors
//! `DbSignalStorage::new` in the teacher codebase this is derived from.

pub const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS autopilots (
    token_id INTEGER PRIMARY KEY,
    agent_type TEXT NOT NULL,
    owner TEXT NOT NULL,
    renter TEXT,
    vault TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS token_strategies (
    token_id INTEGER PRIMARY KEY,
    chain_id INTEGER NOT NULL,
    strategy_type TEXT NOT NULL,
    target TEXT NOT NULL,
    data TEXT NOT NULL,
    value TEXT NOT NULL,
    strategy_params TEXT,
    min_interval_ms INTEGER NOT NULL,
    require_positive_balance INTEGER NOT NULL DEFAULT 0,
    max_failures INTEGER NOT NULL,
    failure_count INTEGER NOT NULL DEFAULT 0,
    enabled INTEGER NOT NULL DEFAULT 1,
    last_run_at TEXT,
    last_error TEXT,
    next_check_at TEXT NOT NULL,
    budget_day TEXT NOT NULL,
    daily_runs_used INTEGER NOT NULL DEFAULT 0,
    daily_value_used TEXT NOT NULL DEFAULT '0',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_token_strategies_runnable
    ON token_strategies(enabled, next_check_at);

CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chain_id INTEGER NOT NULL,
    token_id INTEGER NOT NULL,
    action_type TEXT NOT NULL,
    action_hash TEXT NOT NULL,
    simulate_ok INTEGER NOT NULL,
    tx_hash TEXT,
    error TEXT,
    error_code TEXT,
    failure_category TEXT,
    violation_code TEXT,
    brain_type TEXT,
    intent_type TEXT,
    decision_reason TEXT,
    decision_message TEXT,
    execution_trace TEXT NOT NULL,
    run_mode TEXT NOT NULL,
    shadow_compare TEXT,
    gas_used TEXT,
    pnl_usd REAL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_chain_created
    ON runs(chain_id, created_at);

CREATE INDEX IF NOT EXISTS idx_runs_token_created
    ON runs(token_id, created_at DESC);

CREATE TABLE IF NOT EXISTS agent_memory (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    token_id INTEGER NOT NULL,
    entry_type TEXT NOT NULL,
    action TEXT,
    params TEXT,
    result TEXT,
    reasoning TEXT,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_agent_memory_token_ts
    ON agent_memory(token_id, timestamp DESC);

CREATE TABLE IF NOT EXISTS market_signals (
    chain_id INTEGER NOT NULL,
    pair TEXT NOT NULL,
    price_change_bps INTEGER NOT NULL,
    volume_5m TEXT NOT NULL,
    unique_traders_5m INTEGER NOT NULL,
    sampled_at TEXT NOT NULL,
    source TEXT NOT NULL,
    PRIMARY KEY (chain_id, pair)
);

CREATE TABLE IF NOT EXISTS agent_blueprints (
    agent_type TEXT PRIMARY KEY,
    brain TEXT NOT NULL,
    perception TEXT NOT NULL,
    actions TEXT NOT NULL,
    guardrails TEXT NOT NULL,
    memory TEXT NOT NULL,
    llm_config TEXT
);

CREATE TABLE IF NOT EXISTS user_safety_configs (
    token_id INTEGER PRIMARY KEY,
    allowed_tokens TEXT NOT NULL DEFAULT '[]',
    blocked_tokens TEXT NOT NULL DEFAULT '[]',
    max_trade_amount TEXT NOT NULL,
    max_daily_amount TEXT NOT NULL,
    max_slippage_bps INTEGER NOT NULL,
    cooldown_seconds INTEGER NOT NULL DEFAULT 0,
    max_runs_per_day INTEGER NOT NULL,
    allowed_dexes TEXT NOT NULL DEFAULT '[]'
);
"#;
