//! Persistence contract (§4.5): a narrow interface the scheduler depends
//! on. `sqlite` provides the one implementation this core ships; it is a
//! relational store, as `spec.md` prescribes, built on the same
//! WAL-mode-rusqlite idiom as `DbSignalStorage` in the teacher codebase.

pub mod schema;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::RunnerError;
use crate::models::{
    AgentIdentity, Blueprint, ChainId, MarketSignal, MemoryEntry, RunRecord, SafetyConfig,
    StrategyConfig, TokenId,
};

pub use sqlite::SqliteStore;

/// Aggregate primary-vs-shadow comparison (§4.5 `getShadowMetrics`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShadowMetrics {
    pub total_runs: u64,
    pub diverged_runs: u64,
    pub primary_success_rate: f64,
    pub shadow_would_have_succeeded_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SafetyMetrics {
    pub total_runs: u64,
    pub blocked_runs: u64,
    pub violations_by_code: Vec<(String, u64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyTimelineEntry {
    pub at: DateTime<Utc>,
    pub blocked: bool,
    pub violation_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyViolationEntry {
    pub at: DateTime<Utc>,
    pub violation_code: String,
    pub error_code: Option<String>,
    pub action_type: String,
}

#[async_trait]
pub trait PersistenceStore: Send + Sync {
    // --- Agents ---
    async fn upsert_agent(&self, identity: &AgentIdentity) -> Result<(), RunnerError>;
    async fn get_agent(&self, token_id: TokenId) -> Result<Option<AgentIdentity>, RunnerError>;
    async fn list_agents(&self) -> Result<Vec<AgentIdentity>, RunnerError>;
    async fn remove_agent(&self, token_id: TokenId) -> Result<(), RunnerError>;

    // --- Strategies ---
    /// Enabled, not paused (caller-filtered), `nextCheckAt <= now` (§4.5).
    async fn select_runnable(&self, now: DateTime<Utc>) -> Result<Vec<TokenId>, RunnerError>;
    async fn get_strategy(&self, token_id: TokenId) -> Result<Option<StrategyConfig>, RunnerError>;
    async fn upsert_strategy(&self, strategy: &StrategyConfig) -> Result<(), RunnerError>;

    // --- Runs ---
    /// Persist `run` and the updated `strategy` as one transaction (§4.5
    /// invariant), then trim `runs` for `run.chain_id` down to
    /// `max_run_records` (oldest first).
    async fn record_run_and_update_strategy(
        &self,
        run: &RunRecord,
        strategy: &StrategyConfig,
        max_run_records: usize,
    ) -> Result<i64, RunnerError>;
    async fn list_runs(&self, token_id: TokenId, limit: usize) -> Result<Vec<RunRecord>, RunnerError>;
    async fn count_runs_for_chain(&self, chain_id: ChainId) -> Result<u64, RunnerError>;

    // --- Memory ---
    async fn append_memory(&self, entry: MemoryEntry) -> Result<(), RunnerError>;
    async fn recall_memory(
        &self,
        token_id: TokenId,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, RunnerError>;

    // --- Market signals ---
    async fn upsert_market_signal(&self, signal: MarketSignal) -> Result<(), RunnerError>;
    async fn batch_upsert_market_signals(
        &self,
        signals: Vec<MarketSignal>,
    ) -> Result<(), RunnerError>;
    async fn get_market_signal(
        &self,
        chain_id: ChainId,
        pair: &str,
    ) -> Result<Option<MarketSignal>, RunnerError>;

    // --- Shadow metrics ---
    async fn get_shadow_metrics(
        &self,
        since: DateTime<Utc>,
        token_id: Option<TokenId>,
    ) -> Result<ShadowMetrics, RunnerError>;

    // --- Safety ---
    async fn get_safety_config(&self, token_id: TokenId) -> Result<Option<SafetyConfig>, RunnerError>;
    async fn upsert_safety_config(&self, cfg: SafetyConfig) -> Result<(), RunnerError>;
    async fn get_safety_metrics(&self, token_id: TokenId) -> Result<SafetyMetrics, RunnerError>;
    async fn get_safety_timeline(
        &self,
        token_id: TokenId,
        limit: usize,
    ) -> Result<Vec<SafetyTimelineEntry>, RunnerError>;
    async fn get_safety_violations(
        &self,
        token_id: TokenId,
        limit: usize,
    ) -> Result<Vec<SafetyViolationEntry>, RunnerError>;

    // --- Blueprints ---
    async fn get_blueprint(&self, agent_type: &str) -> Result<Option<Blueprint>, RunnerError>;
    async fn list_blueprints(&self) -> Result<Vec<Blueprint>, RunnerError>;
    async fn upsert_blueprint(&self, blueprint: &Blueprint) -> Result<(), RunnerError>;
}
