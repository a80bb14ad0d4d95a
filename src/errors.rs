//! Failure taxonomy and the typed error that flows through the cognitive cycle.
//!
//! Every failure the core produces is normalized into exactly one
//! `(FailureCategory, ErrorCode)` pair (§4.6 / §8 "classifier totality").
//! Only `FailureCategory::InfrastructureError` is retryable.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse bucket a failure falls into. Drives retry eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// The brain emitted something impossible or malformed.
    ModelOutputError,
    /// A policy or chain-level rule denied the action.
    BusinessRejected,
    /// Transient/environmental failure. The only retryable category.
    InfrastructureError,
}

impl FailureCategory {
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureCategory::InfrastructureError)
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureCategory::ModelOutputError => "model_output_error",
            FailureCategory::BusinessRejected => "business_rejected",
            FailureCategory::InfrastructureError => "infrastructure_error",
        };
        f.write_str(s)
    }
}

/// Machine-readable error code. Grouped by the taxonomy that produces them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    // model_output_error
    ModelUnknownAction,
    ModelSchemaValidationFailed,
    ModelLowConfidence,

    // business_rejected — policy violations (soft)
    BusinessPolicyAllowedDex,
    BusinessPolicyMaxTradeAmount,
    BusinessPolicyCooldown,
    BusinessPolicyMaxRunsPerDay,
    BusinessPolicyMaxDailyAmount,
    BusinessPolicyAllowedTokens,
    BusinessPolicyBlockedTokens,
    BusinessPolicyMaxSlippageBps,
    // business_rejected — policy violations (hard)
    BusinessPolicyHardRejected,
    BusinessPolicyHardSimulationReverted,
    // business_rejected — other
    BusinessAgentPaused,
    BusinessCircuitBreaker,
    BusinessChainReverted,
    BusinessUnauthorized,
    BusinessInsufficientGas,
    BusinessInsufficientFunds,

    // infrastructure_error
    InfraRateLimit,
    InfraTimeout,
    InfraNetwork,
    InfraRuntimeException,
}

impl fmt::Display for ErrorCode {
    /// Renders as SCREAMING_SNAKE_CASE to match the wire-facing codes in spec.md
    /// (e.g. `ErrorCode::ModelUnknownAction` -> `MODEL_UNKNOWN_ACTION`).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", to_screaming_snake(&format!("{:?}", self)))
    }
}

fn to_screaming_snake(camel: &str) -> String {
    let mut out = String::with_capacity(camel.len() + 8);
    for (i, c) in camel.chars().enumerate() {
        if c.is_uppercase() && i != 0 {
            out.push('_');
        }
        out.push(c.to_ascii_uppercase());
    }
    out
}

/// The typed error that terminates a cognitive cycle stage or an
/// infrastructure call. Carries everything §7 requires: category, code,
/// retry eligibility, and a sanitized user-facing message.
#[derive(Debug, Clone, Error)]
#[error("{code} ({category}): {user_message}")]
pub struct RunnerError {
    pub category: FailureCategory,
    pub code: ErrorCode,
    pub retryable: bool,
    pub user_message: String,
    /// Raw detail, kept for server-side logs only — never surfaced to users.
    pub detail: Option<String>,
}

impl RunnerError {
    pub fn new(category: FailureCategory, code: ErrorCode, user_message: impl Into<String>) -> Self {
        Self {
            retryable: category.is_retryable(),
            category,
            code,
            user_message: user_message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Wrap a storage/serialization failure as a retryable infrastructure
    /// error. Used by the persistence layer, which has no business-level
    /// meaning to assign a raw `rusqlite`/`serde_json` failure.
    pub fn storage_error(detail: impl Into<String>) -> Self {
        RunnerError::new(
            FailureCategory::InfrastructureError,
            ErrorCode::InfraRuntimeException,
            "A storage operation failed; this will be retried if applicable.",
        )
        .with_detail(detail.into())
    }

    /// Build from a violation code produced by the soft/hard guardrail layers.
    /// Direct table lookup — §4.6 "From a policy violation code".
    pub fn from_violation_code(violation: &str) -> Self {
        let (code, user_message): (ErrorCode, &str) = match violation {
            "SOFT_ALLOWED_DEX" => (
                ErrorCode::BusinessPolicyAllowedDex,
                "This destination is not on the allowed list for this agent.",
            ),
            "SOFT_MAX_TRADE_AMOUNT" => (
                ErrorCode::BusinessPolicyMaxTradeAmount,
                "The trade amount exceeds the configured per-trade limit.",
            ),
            "SOFT_COOLDOWN" => (
                ErrorCode::BusinessPolicyCooldown,
                "The agent is still in its cooldown window since the last execution.",
            ),
            "SOFT_MAX_RUNS_PER_DAY" => (
                ErrorCode::BusinessPolicyMaxRunsPerDay,
                "The agent has reached its daily run limit.",
            ),
            "SOFT_MAX_DAILY_AMOUNT" => (
                ErrorCode::BusinessPolicyMaxDailyAmount,
                "This trade would exceed the agent's daily spend limit.",
            ),
            "SOFT_ALLOWED_TOKENS" => (
                ErrorCode::BusinessPolicyAllowedTokens,
                "One of the tokens involved is not on the allowed list.",
            ),
            "SOFT_BLOCKED_TOKENS" => (
                ErrorCode::BusinessPolicyBlockedTokens,
                "One of the tokens involved is explicitly blocked.",
            ),
            "SOFT_MAX_SLIPPAGE_BPS" => (
                ErrorCode::BusinessPolicyMaxSlippageBps,
                "The implied slippage exceeds the configured maximum.",
            ),
            "HARD_POLICY_REJECTED" => (
                ErrorCode::BusinessPolicyHardRejected,
                "The on-chain validator rejected this action.",
            ),
            "HARD_SIMULATION_REVERTED" => (
                ErrorCode::BusinessPolicyHardSimulationReverted,
                "The on-chain validator call reverted.",
            ),
            _ => (
                ErrorCode::InfraRuntimeException,
                "An unexpected policy violation occurred.",
            ),
        };
        RunnerError::new(FailureCategory::BusinessRejected, code, user_message)
            .with_detail(violation.to_string())
    }

    /// Classify a "blocked" reason string produced by a Decision or plan.
    /// Substring rules, priority order per §4.6.
    pub fn from_blocked_reason(reason: &str) -> Self {
        let lower = reason.to_lowercase();
        let (category, code, user_message) = if lower.contains("unknown action") {
            (
                FailureCategory::ModelOutputError,
                ErrorCode::ModelUnknownAction,
                "The agent proposed an action that does not exist.",
            )
        } else if lower.contains("invalid action params") || lower.contains("schema validation") {
            (
                FailureCategory::ModelOutputError,
                ErrorCode::ModelSchemaValidationFailed,
                "The agent proposed parameters that do not match the action's schema.",
            )
        } else if lower.contains("confidence") {
            (
                FailureCategory::ModelOutputError,
                ErrorCode::ModelLowConfidence,
                "The agent's confidence was too low to proceed.",
            )
        } else if lower.contains("paused on-chain") {
            (
                FailureCategory::BusinessRejected,
                ErrorCode::BusinessAgentPaused,
                "The agent's vault is currently paused on-chain.",
            )
        } else if lower.contains("circuit breaker") {
            (
                FailureCategory::BusinessRejected,
                ErrorCode::BusinessCircuitBreaker,
                "Too many consecutive failures; the agent is paused until re-enabled.",
            )
        } else if lower.contains("safety policy") || lower.contains("policy violation") {
            (
                FailureCategory::BusinessRejected,
                ErrorCode::BusinessPolicyHardRejected,
                "This action was blocked by safety policy.",
            )
        } else if lower.contains("unauthorized") {
            (
                FailureCategory::BusinessRejected,
                ErrorCode::BusinessUnauthorized,
                "This action requires authorization that was not present.",
            )
        } else if lower.contains("insufficient gas") {
            (
                FailureCategory::BusinessRejected,
                ErrorCode::BusinessInsufficientGas,
                "There was not enough gas to execute this action.",
            )
        } else if lower.contains("insufficient funds") || is_balance_cue(&lower) {
            (
                FailureCategory::BusinessRejected,
                ErrorCode::BusinessInsufficientFunds,
                "There were insufficient funds to execute this action.",
            )
        } else if lower.contains("execution reverted") {
            (
                FailureCategory::BusinessRejected,
                ErrorCode::BusinessChainReverted,
                "Transaction was rejected by the contract.",
            )
        } else {
            (
                FailureCategory::InfrastructureError,
                ErrorCode::InfraRuntimeException,
                "An unexpected error occurred; the cycle will retry if applicable.",
            )
        };
        RunnerError::new(category, code, user_message).with_detail(reason.to_string())
    }

    /// Classify an arbitrary error message from an external call. Same
    /// structure as `from_blocked_reason` plus infra-specific patterns;
    /// order matters, first match wins.
    pub fn from_error_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("rate limit") || lower.contains("429") || lower.contains("too many requests")
        {
            return RunnerError::new(
                FailureCategory::InfrastructureError,
                ErrorCode::InfraRateLimit,
                "Network is busy right now; this will be retried shortly.",
            )
            .with_detail(message.to_string());
        }
        if lower.contains("timed out") || lower.contains("timeout") {
            return RunnerError::new(
                FailureCategory::InfrastructureError,
                ErrorCode::InfraTimeout,
                "A request took too long to complete; this will be retried shortly.",
            )
            .with_detail(message.to_string());
        }
        if lower.contains("connection") || lower.contains("network") || lower.contains("dns") {
            return RunnerError::new(
                FailureCategory::InfrastructureError,
                ErrorCode::InfraNetwork,
                "Network is busy right now; this will be retried shortly.",
            )
            .with_detail(message.to_string());
        }
        // Fall through to the same substring table used for blocked reasons,
        // then default to a runtime exception (infra, retryable).
        Self::from_blocked_reason(message)
    }
}

fn is_balance_cue(lower: &str) -> bool {
    lower.contains("not enough balance")
        || lower.contains("balance too low")
        || lower.contains("exceeds balance")
}

/// Retry only infrastructure failures, with exponential backoff and jitter.
///
/// `base_delay` is doubled after every attempt (capped implicitly by
/// `max_attempts`); jitter is applied as +/-20% of the computed delay to
/// avoid thundering-herd retries across a fleet.
pub async fn with_retry<F, Fut, T>(
    max_attempts: u32,
    base_delay: Duration,
    mut f: F,
) -> Result<T, RunnerError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, RunnerError>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.category.is_retryable() && attempt + 1 < max_attempts => {
                attempt += 1;
                metrics::counter!("retry_attempts_total").increment(1);
                let delay = jittered_delay(base_delay, attempt);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn jittered_delay(base_delay: Duration, attempt: u32) -> Duration {
    let exp = base_delay.saturating_mul(1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX));
    let jitter_frac = rand::thread_rng().gen_range(0.8..1.2);
    Duration::from_secs_f64((exp.as_secs_f64() * jitter_frac).max(0.0))
}
