//! Soft policy guardrail: local, DB-backed pre-flight checks (§4.4).
//!
//! `todayExecCount`, `todaySpent`, and `lastExecTs` are derived from the
//! memory log scoped to `type=execution` and `result.success=true` for the
//! current UTC calendar day (§4.4, §9 open question resolved in
//! DESIGN.md). Absence of a `SafetyConfig` row is pass-through.

use async_trait::async_trait;
use chrono::Utc;
use num_bigint::BigInt;
use num_traits::Zero;

use crate::errors::RunnerError;
use crate::models::{ExecutionContext, MemoryEntryType, SafetyConfig};
use crate::persistence::PersistenceStore;

use std::sync::Arc;

pub struct SoftPolicyGuardrail {
    store: Arc<dyn PersistenceStore>,
}

impl SoftPolicyGuardrail {
    pub fn new(store: Arc<dyn PersistenceStore>) -> Self {
        Self { store }
    }
}

const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

#[async_trait]
impl Guardrail for SoftPolicyGuardrail {
    async fn check(&self, ctx: &ExecutionContext) -> Result<(), RunnerError> {
        let Some(cfg) = self.store.get_safety_config(ctx.token_id).await? else {
            return Ok(());
        };

        let memories = self.store.recall_memory(ctx.token_id, usize::MAX).await?;
        let today = Utc::now().date_naive();

        let mut today_exec_count: u32 = 0;
        let mut today_spent: BigInt = BigInt::zero();
        let mut last_exec_ts: Option<chrono::DateTime<Utc>> = None;

        for entry in &memories {
            if entry.entry_type != MemoryEntryType::Execution {
                continue;
            }
            let Some(result) = &entry.result else { continue };
            if !result.success {
                continue;
            }
            if last_exec_ts.is_none() || entry.timestamp > last_exec_ts.unwrap() {
                last_exec_ts = Some(entry.timestamp);
            }
            if entry.timestamp.date_naive() != today {
                continue;
            }
            today_exec_count += 1;
            if let Some(spend) = entry
                .params
                .as_ref()
                .and_then(|p| p.get("spendAmount"))
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<BigInt>().ok())
            {
                today_spent += spend;
            }
        }

        // Allowed DEX (swap only).
        if ctx.action_name.as_deref() == Some("swap") {
            if let Some(target) = &ctx.target {
                if !cfg.allowed_dexes.is_empty() && !cfg.allowed_dexes.iter().any(|d| d == target) {
                    return Err(RunnerError::from_violation_code("SOFT_ALLOWED_DEX"));
                }
            }
        }

        // Per-trade limit.
        if let Some(spend) = &ctx.spend_amount {
            if *spend > cfg.max_trade_amount {
                return Err(RunnerError::from_violation_code("SOFT_MAX_TRADE_AMOUNT"));
            }
        }

        // Cooldown.
        if cfg.cooldown_seconds > 0 {
            if let Some(last) = last_exec_ts {
                let elapsed = (Utc::now() - last).num_seconds();
                if elapsed < cfg.cooldown_seconds {
                    return Err(RunnerError::from_violation_code("SOFT_COOLDOWN"));
                }
            }
        }

        // Daily run count.
        if cfg.max_runs_per_day > 0 && today_exec_count >= cfg.max_runs_per_day {
            return Err(RunnerError::from_violation_code("SOFT_MAX_RUNS_PER_DAY"));
        }

        // Daily spend.
        if let Some(spend) = &ctx.spend_amount {
            if &today_spent + spend > cfg.max_daily_amount {
                return Err(RunnerError::from_violation_code("SOFT_MAX_DAILY_AMOUNT"));
            }
        }

        // Allowed / blocked tokens.
        if let Some(tokens) = &ctx.action_tokens {
            for token in tokens {
                if token == ZERO_ADDRESS {
                    continue;
                }
                if !cfg.allowed_tokens.is_empty() && !cfg.allowed_tokens.iter().any(|t| t == token) {
                    return Err(RunnerError::from_violation_code("SOFT_ALLOWED_TOKENS"));
                }
                if cfg.blocked_tokens.iter().any(|t| t == token) {
                    return Err(RunnerError::from_violation_code("SOFT_BLOCKED_TOKENS"));
                }
            }
        }

        // Implied slippage.
        if let (Some(amount_in), Some(min_out)) = (&ctx.amount_in, &ctx.min_out) {
            if !amount_in.is_zero() {
                let slippage_bps = (amount_in - min_out) * BigInt::from(10_000) / amount_in;
                if slippage_bps > BigInt::from(cfg.max_slippage_bps) {
                    return Err(RunnerError::from_violation_code("SOFT_MAX_SLIPPAGE_BPS"));
                }
            }
        }

        Ok(())
    }
}

use crate::guardrails::Guardrail;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutionResult, MemoryEntry};
    use crate::persistence::sqlite::SqliteStore;
    use serde_json::json;

    async fn store_with_safety_config(cfg: SafetyConfig) -> Arc<dyn PersistenceStore> {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.upsert_safety_config(cfg).await.unwrap();
        store
    }

    fn base_cfg(token_id: i64) -> SafetyConfig {
        SafetyConfig {
            token_id,
            allowed_tokens: vec![],
            blocked_tokens: vec![],
            max_trade_amount: BigInt::from(1_000_000_000_000_000_000i64),
            max_daily_amount: BigInt::from(10_000_000_000_000_000_000i64),
            max_slippage_bps: 500,
            cooldown_seconds: 0,
            max_runs_per_day: 1000,
            allowed_dexes: vec![],
        }
    }

    fn ctx_with_spend(token_id: i64, spend: BigInt) -> ExecutionContext {
        ExecutionContext {
            token_id,
            agent_type: "trader".to_string(),
            vault: "0xvault".to_string(),
            timestamp: Utc::now(),
            action_name: Some("swap".to_string()),
            spend_amount: Some(spend),
            action_tokens: None,
            min_out: None,
            amount_in: None,
            target: Some("0xdex".to_string()),
        }
    }

    #[tokio::test]
    async fn missing_safety_config_is_pass_through() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let guardrail = SoftPolicyGuardrail::new(store);
        let result = guardrail
            .check(&ctx_with_spend(1, BigInt::from(999_999_999_999_999_999i64)))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn max_trade_amount_violation() {
        let mut cfg = base_cfg(1);
        cfg.max_trade_amount = BigInt::from(1_000_000_000_000_000i64); // 1e15
        let store = store_with_safety_config(cfg).await;
        let guardrail = SoftPolicyGuardrail::new(store);

        let result = guardrail
            .check(&ctx_with_spend(1, BigInt::from(1_000_000_000_000_0000i64))) // 1e16
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::BusinessPolicyMaxTradeAmount);
    }

    #[tokio::test]
    async fn allowed_dex_violation() {
        let mut cfg = base_cfg(1);
        cfg.allowed_dexes = vec!["0xuniswap".to_string()];
        let store = store_with_safety_config(cfg).await;
        let guardrail = SoftPolicyGuardrail::new(store);

        let mut ctx = ctx_with_spend(1, BigInt::from(1));
        ctx.target = Some("0xsketchy".to_string());
        let err = guardrail.check(&ctx).await.unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::BusinessPolicyAllowedDex);
    }

    #[tokio::test]
    async fn blocked_token_violation() {
        let mut cfg = base_cfg(1);
        cfg.blocked_tokens = vec!["0xbadtoken".to_string()];
        let store = store_with_safety_config(cfg).await;
        let guardrail = SoftPolicyGuardrail::new(store);

        let mut ctx = ctx_with_spend(1, BigInt::from(1));
        ctx.action_tokens = Some(vec!["0xbadtoken".to_string()]);
        let err = guardrail.check(&ctx).await.unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::BusinessPolicyBlockedTokens);
    }

    #[tokio::test]
    async fn slippage_violation() {
        let mut cfg = base_cfg(1);
        cfg.max_slippage_bps = 100; // 1%
        let store = store_with_safety_config(cfg).await;
        let guardrail = SoftPolicyGuardrail::new(store);

        let mut ctx = ctx_with_spend(1, BigInt::from(1));
        ctx.amount_in = Some(BigInt::from(1_000_000));
        ctx.min_out = Some(BigInt::from(900_000)); // 10% slippage > 1% max
        let err = guardrail.check(&ctx).await.unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::BusinessPolicyMaxSlippageBps);
    }

    #[tokio::test]
    async fn cooldown_violation_from_recent_execution_memory() {
        let mut cfg = base_cfg(1);
        cfg.cooldown_seconds = 3600;
        let store = store_with_safety_config(cfg).await;
        store
            .append_memory(MemoryEntry {
                token_id: 1,
                entry_type: MemoryEntryType::Execution,
                action: Some("swap".to_string()),
                params: Some(json!({"spendAmount": "1"})),
                result: Some(ExecutionResult {
                    success: true,
                    tx_hash: Some("0xabc".to_string()),
                    error: None,
                }),
                reasoning: None,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        let guardrail = SoftPolicyGuardrail::new(store);
        let err = guardrail
            .check(&ctx_with_spend(1, BigInt::from(1)))
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::BusinessPolicyCooldown);
    }
}
