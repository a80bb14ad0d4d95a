//! Data model shared across the scheduler, cognitive cycle, guardrails,
//! planner, and persistence contract. Mirrors `spec.md` §3 field-for-field;
//! amounts are `BigInt` per the "ambient big integer arithmetic" redesign
//! flag — the core never reasons about money in floats.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub type TokenId = i64;
pub type ChainId = i64;

/// `num-bigint`'s derived `serde` impl round-trips `BigInt` as its internal
/// `{sign, data}` representation, not a wire-friendly number. Every `BigInt`
/// field that crosses the HTTP boundary uses one of these helpers instead so
/// callers send/receive a plain decimal string (matching how the SQLite
/// layer already stores amounts as text).
mod bigint_str {
    use std::str::FromStr;

    use num_bigint::BigInt;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &BigInt, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigInt, D::Error> {
        let s = String::deserialize(deserializer)?;
        BigInt::from_str(&s).map_err(D::Error::custom)
    }
}

mod opt_bigint_str {
    use std::str::FromStr;

    use num_bigint::BigInt;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<BigInt>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_str(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<BigInt>, D::Error> {
        let s: Option<String> = Option::deserialize(deserializer)?;
        s.map(|s| BigInt::from_str(&s).map_err(D::Error::custom))
            .transpose()
    }
}

/// Immutable fields of a runtime agent. The five capability modules are
/// wired separately (see `crate::capability` and `crate::factory`) because
/// trait objects don't round-trip through serde.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub token_id: TokenId,
    pub agent_type: String,
    pub owner: String,
    pub renter: Option<String>,
    pub vault: String,
}

/// Assembly template keyed by `agentType`. Loaded from the persistent
/// store on startup with a built-in fallback set (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blueprint {
    pub agent_type: String,
    pub brain: String,
    pub perception: String,
    pub actions: Vec<String>,
    pub guardrails: Vec<String>,
    pub memory: String,
    pub llm_config: Option<JsonValue>,
}

/// Per-agent persisted row (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub token_id: TokenId,
    pub chain_id: ChainId,
    pub strategy_type: String,
    pub target: String,
    pub data: String,
    #[serde(with = "bigint_str")]
    pub value: BigInt,
    pub strategy_params: Option<JsonValue>,
    pub min_interval_ms: i64,
    pub require_positive_balance: bool,
    pub max_failures: u32,
    pub failure_count: u32,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub next_check_at: DateTime<Utc>,
    pub budget_day: NaiveDate,
    pub daily_runs_used: u32,
    #[serde(with = "bigint_str")]
    pub daily_value_used: BigInt,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StrategyConfig {
    /// Resets the daily counters if `now`'s UTC calendar day differs from
    /// `budget_day` (§9 open question, resolved as UTC calendar day).
    pub fn roll_budget_day_if_needed(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.budget_day {
            self.budget_day = today;
            self.daily_runs_used = 0;
            self.daily_value_used = BigInt::from(0);
        }
    }

    /// Invariant: `failureCount <= maxFailures` while `enabled`. Returns
    /// true if this failure pushed the strategy past the limit, in which
    /// case the caller (scheduler) must disable it and record `last_error`.
    pub fn record_failure(&mut self, error: impl Into<String>) -> bool {
        self.failure_count += 1;
        self.last_error = Some(error.into());
        if self.failure_count > self.max_failures {
            self.enabled = false;
            true
        } else {
            false
        }
    }

    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.last_error = None;
    }
}

/// Per-agent safety policy (§4.4 soft layer). Absence means pass-through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    pub token_id: TokenId,
    pub allowed_tokens: Vec<String>,
    pub blocked_tokens: Vec<String>,
    #[serde(with = "bigint_str")]
    pub max_trade_amount: BigInt,
    #[serde(with = "bigint_str")]
    pub max_daily_amount: BigInt,
    pub max_slippage_bps: u32,
    pub cooldown_seconds: i64,
    pub max_runs_per_day: u32,
    pub allowed_dexes: Vec<String>,
}

/// Immutable snapshot produced by perception (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub vault: String,
    pub vault_token_balances: Vec<TokenBalance>,
    #[serde(with = "bigint_str")]
    pub native_balance: BigInt,
    pub prices: HashMap<String, f64>,
    #[serde(with = "bigint_str")]
    pub gas_price: BigInt,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
    pub paused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBalance {
    pub token: String,
    #[serde(with = "bigint_str")]
    pub balance: BigInt,
}

/// Append-only per-agent history row (§3). Newest-first on recall.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub token_id: TokenId,
    #[serde(rename = "type")]
    pub entry_type: MemoryEntryType,
    pub action: Option<String>,
    pub params: Option<JsonValue>,
    pub result: Option<ExecutionResult>,
    pub reasoning: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryEntryType {
    Execution,
    Decision,
    Blocked,
    Observation,
    Goal,
    UserMessage,
    AgentReply,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
}

/// Output of `Brain::think` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action: String,
    pub params: JsonValue,
    pub reasoning: String,
    pub confidence: f64,
    pub message: Option<String>,
    pub done: Option<bool>,
    pub next_check_ms: Option<i64>,
    pub blocked: Option<bool>,
    pub block_reason: Option<String>,
}

impl Decision {
    pub fn wait(reasoning: impl Into<String>) -> Self {
        Self {
            action: "wait".to_string(),
            params: JsonValue::Null,
            reasoning: reasoning.into(),
            confidence: 1.0,
            message: None,
            done: None,
            next_check_ms: None,
            blocked: None,
            block_reason: None,
        }
    }
}

/// The kind of plan the planner produced (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    Wait,
    Readonly,
    Write,
    Blocked,
}

/// Output of the planner (§3/§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub kind: PlanKind,
    pub action_name: Option<String>,
    pub params: JsonValue,
    pub reason: String,
    pub action_module: Option<String>,
    pub failure_category: Option<crate::errors::FailureCategory>,
    pub error_code: Option<crate::errors::ErrorCode>,
}

impl ExecutionPlan {
    pub fn wait(reason: impl Into<String>) -> Self {
        Self {
            kind: PlanKind::Wait,
            action_name: None,
            params: JsonValue::Null,
            reason: reason.into(),
            action_module: None,
            failure_category: None,
            error_code: None,
        }
    }

    pub fn blocked(
        reason: impl Into<String>,
        failure_category: crate::errors::FailureCategory,
        error_code: crate::errors::ErrorCode,
    ) -> Self {
        Self {
            kind: PlanKind::Blocked,
            action_name: None,
            params: JsonValue::Null,
            reason: reason.into(),
            action_module: None,
            failure_category: Some(failure_category),
            error_code: Some(error_code),
        }
    }
}

/// Guardrail input (§3). Derived from the action's params/payload by the
/// cognitive cycle's `guard` stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub token_id: TokenId,
    pub agent_type: String,
    pub vault: String,
    pub timestamp: DateTime<Utc>,
    pub action_name: Option<String>,
    #[serde(with = "opt_bigint_str")]
    pub spend_amount: Option<BigInt>,
    pub action_tokens: Option<Vec<String>>,
    #[serde(with = "opt_bigint_str")]
    pub min_out: Option<BigInt>,
    #[serde(with = "opt_bigint_str")]
    pub amount_in: Option<BigInt>,
    pub target: Option<String>,
}

/// One stage's outcome in the cognitive cycle's execution trace (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTraceEntry {
    pub stage: String,
    pub status: TraceStatus,
    pub at: DateTime<Utc>,
    pub note: Option<String>,
    pub meta: Option<JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Ok,
    Skip,
    Blocked,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Primary,
    Shadow,
}

/// Divergence record between the canonical and legacy planner (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowCompare {
    pub primary_kind: PlanKind,
    pub legacy_kind: PlanKind,
    pub primary_action: Option<String>,
    pub legacy_action: Option<String>,
    pub primary_error_code: Option<crate::errors::ErrorCode>,
    pub legacy_error_code: Option<crate::errors::ErrorCode>,
    pub diverged: bool,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Persisted outcome of one cycle (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Option<i64>,
    pub chain_id: ChainId,
    pub token_id: TokenId,
    pub action_type: String,
    pub action_hash: String,
    pub simulate_ok: bool,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
    pub error_code: Option<crate::errors::ErrorCode>,
    pub failure_category: Option<crate::errors::FailureCategory>,
    pub violation_code: Option<String>,
    pub brain_type: Option<String>,
    pub intent_type: Option<String>,
    pub decision_reason: Option<String>,
    pub decision_message: Option<String>,
    pub execution_trace: Vec<ExecutionTraceEntry>,
    pub run_mode: RunMode,
    pub shadow_compare: Option<ShadowCompare>,
    #[serde(with = "opt_bigint_str")]
    pub gas_used: Option<BigInt>,
    pub pnl_usd: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Market-signal row (§3). Unique by `(chainId, pair)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSignal {
    pub chain_id: ChainId,
    pub pair: String,
    pub price_change_bps: i64,
    #[serde(with = "bigint_str")]
    pub volume_5m: BigInt,
    pub unique_traders_5m: u32,
    pub sampled_at: DateTime<Utc>,
    pub source: String,
}

/// The data the factory receives from on-chain metadata to assemble an
/// agent (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainAgentData {
    pub token_id: TokenId,
    pub agent_type: String,
    pub owner: String,
    pub renter: Option<String>,
    pub vault: String,
    pub strategy_params: Option<JsonValue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_day_resets_on_new_calendar_day() {
        let mut cfg = sample_strategy();
        cfg.daily_runs_used = 5;
        cfg.daily_value_used = BigInt::from(1000);

        let tomorrow = cfg.budget_day.succ_opt().unwrap();
        let now = tomorrow.and_hms_opt(0, 0, 1).unwrap().and_utc();
        cfg.roll_budget_day_if_needed(now);

        assert_eq!(cfg.budget_day, tomorrow);
        assert_eq!(cfg.daily_runs_used, 0);
        assert_eq!(cfg.daily_value_used, BigInt::from(0));
    }

    #[test]
    fn budget_day_untouched_within_same_day() {
        let mut cfg = sample_strategy();
        cfg.daily_runs_used = 3;
        let later_same_day = cfg
            .budget_day
            .and_hms_opt(23, 0, 0)
            .unwrap()
            .and_utc();
        cfg.roll_budget_day_if_needed(later_same_day);
        assert_eq!(cfg.daily_runs_used, 3);
    }

    #[test]
    fn failure_count_disables_past_max() {
        let mut cfg = sample_strategy();
        cfg.max_failures = 2;
        assert!(!cfg.record_failure("transient"));
        assert!(cfg.record_failure("transient again"));
        assert!(!cfg.enabled);
        assert_eq!(cfg.last_error.as_deref(), Some("transient again"));
    }

    fn sample_strategy() -> StrategyConfig {
        let now = Utc::now();
        StrategyConfig {
            token_id: 1,
            chain_id: 1,
            strategy_type: "hotpump_watchlist".to_string(),
            target: "0xdex".to_string(),
            data: "0x".to_string(),
            value: BigInt::from(0),
            strategy_params: None,
            min_interval_ms: 60_000,
            require_positive_balance: false,
            max_failures: 5,
            failure_count: 0,
            enabled: true,
            last_run_at: None,
            last_error: None,
            next_check_at: now,
            budget_day: now.date_naive(),
            daily_runs_used: 0,
            daily_value_used: BigInt::from(0),
            created_at: now,
            updated_at: now,
        }
    }
}
