//! The cognitive cycle (§4.2): a strictly sequential
//! observe -> propose -> plan -> validate -> guard -> simulate -> execute
//! -> verify -> record pipeline over one `(agent, now)` tuple. Every stage
//! appends to an in-memory `executionTrace`, persisted with the run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use serde_json::Value as JsonValue;

use crate::capability::Agent;
use crate::chain::Chain;
use crate::config::RunnerConfig;
use crate::errors::{ErrorCode, FailureCategory, RunnerError};
use crate::guardrails;
use crate::models::{
    Decision, ExecutionContext, ExecutionPlan, ExecutionResult, ExecutionTraceEntry, MemoryEntry,
    MemoryEntryType, PlanKind, RunMode, RunRecord, StrategyConfig, TraceStatus,
};
use crate::persistence::PersistenceStore;
use crate::planner::Planner;

/// A cancellation flag checked at every suspension point inside a cycle
/// (§5 "Cancellation & timeouts"). Cheap, lock-free (`AtomicBool`), shared
/// by `Arc` between the scheduler's shutdown path and every in-flight
/// cycle task.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Shared services a cycle needs beyond the agent itself.
pub struct CycleDeps {
    pub store: Arc<dyn PersistenceStore>,
    pub chain: Arc<dyn Chain>,
    pub planner: Arc<dyn Planner>,
    pub config: Arc<RunnerConfig>,
}

/// Run one cognitive cycle for `agent` against `strategy`. Never returns
/// an `Err` — every failure is classified and folded into the returned
/// `RunRecord`; `strategy` is mutated in place to reflect the new
/// `failureCount`/`dailyRunsUsed`/`lastRunAt`/`nextCheckAt` (§4.2 stage 9,
/// §4.5 "recordRun and strategy-counter update are one transaction").
pub async fn run_cycle(
    agent: &Agent,
    strategy: &mut StrategyConfig,
    deps: &CycleDeps,
    now: DateTime<Utc>,
    cancel: &CancelToken,
) -> RunRecord {
    let mut trace = Vec::new();

    if cancel.is_cancelled() {
        return terminate(
            &mut trace,
            agent,
            strategy,
            deps,
            now,
            RunnerError::new(
                FailureCategory::InfrastructureError,
                ErrorCode::InfraRuntimeException,
                "Shutdown in progress; this cycle was cancelled.",
            ),
            None,
            None,
        )
        .await;
    }

    // --- circuit breaker pre-check ---
    if let Some(tripped) = check_circuit_breaker(agent, strategy, deps).await {
        trace.push(trace_entry(
            "circuit_breaker",
            TraceStatus::Blocked,
            Some(tripped.reason.clone()),
        ));
        return terminate(
            &mut trace,
            agent,
            strategy,
            deps,
            now,
            RunnerError::new(
                FailureCategory::BusinessRejected,
                ErrorCode::BusinessCircuitBreaker,
                "Too many consecutive failures; the agent is paused until re-enabled.",
            )
            .with_detail(tripped.reason),
            None,
            Some(tripped.action),
        )
        .await;
    }

    // --- 1. observe ---
    let observation = match with_retry_if_infra(deps, || agent.perception.observe()).await {
        Ok(obs) => obs,
        Err(e) => return terminate(&mut trace, agent, strategy, deps, now, e, None, None).await,
    };
    if observation.paused {
        trace.push(trace_entry("observe", TraceStatus::Blocked, Some("agent paused on-chain".into())));
        return terminate(
            &mut trace,
            agent,
            strategy,
            deps,
            now,
            RunnerError::new(
                FailureCategory::BusinessRejected,
                ErrorCode::BusinessAgentPaused,
                "The agent's vault is currently paused on-chain.",
            ),
            None,
            None,
        )
        .await;
    }
    trace.push(trace_entry("observe", TraceStatus::Ok, None));

    // --- 2. propose ---
    let memories = match agent.memory.recall(deps.config.memory_recall_limit).await {
        Ok(m) => m,
        Err(e) => return terminate(&mut trace, agent, strategy, deps, now, e, None, None).await,
    };
    let decision = match timeout_call(
        deps.config.llm_timeout(),
        agent.brain.think(&observation, &memories, &agent.actions),
    )
    .await
    {
        Ok(d) => d,
        Err(e) => return terminate(&mut trace, agent, strategy, deps, now, e, None, None).await,
    };
    trace.push(trace_entry("propose", TraceStatus::Ok, Some(decision.action.clone())));

    // --- 3. plan ---
    let plan = deps.planner.build_execution_plan(&decision, &agent.actions);
    trace.push(trace_entry(
        "plan",
        match plan.kind {
            PlanKind::Blocked => TraceStatus::Blocked,
            _ => TraceStatus::Ok,
        },
        plan.action_name.clone(),
    ));

    // --- 4. validate ---
    match plan.kind {
        PlanKind::Blocked => {
            let err = RunnerError::from_blocked_reason(&plan.reason);
            return terminate(&mut trace, agent, strategy, deps, now, err, Some(decision), None).await;
        }
        PlanKind::Wait => {
            trace.push(trace_entry("validate", TraceStatus::Skip, Some("wait".into())));
            return finalize(
                &mut trace,
                agent,
                strategy,
                deps,
                now,
                FinalOutcome {
                    plan: &plan,
                    decision: Some(decision),
                    simulate_ok: false,
                    tx_hash: None,
                    gas_used: None,
                    error: None,
                    failure_category: None,
                    error_code: None,
                    violation_code: None,
                    execution_success: None,
                },
            )
            .await;
        }
        PlanKind::Readonly => {
            let action = agent.find_action(plan.action_name.as_deref().unwrap_or_default());
            let result = match action {
                Some(a) => a.execute(&plan.params).await,
                None => Err(crate::capability::ActionError::ExecutionFailed(
                    "action not found".to_string(),
                )),
            };
            match result {
                Ok(_) => {
                    trace.push(trace_entry("validate", TraceStatus::Ok, Some("readonly".into())));
                    return finalize(
                        &mut trace,
                        agent,
                        strategy,
                        deps,
                        now,
                        FinalOutcome {
                            plan: &plan,
                            decision: Some(decision),
                            simulate_ok: true,
                            tx_hash: None,
                            gas_used: None,
                            error: None,
                            failure_category: None,
                            error_code: None,
                            violation_code: None,
                            execution_success: Some(true),
                        },
                    )
                    .await;
                }
                Err(e) => {
                    let err = RunnerError::from_error_message(&e.to_string());
                    return terminate(&mut trace, agent, strategy, deps, now, err, Some(decision), None).await;
                }
            }
        }
        PlanKind::Write => {
            trace.push(trace_entry("validate", TraceStatus::Ok, None));
        }
    }

    // --- 5. guard ---
    let ctx = derive_execution_context(agent, &plan, now);
    if let Err(e) = guardrails::run_pipeline(&agent.guardrails, &ctx).await {
        trace.push(trace_entry("guard", TraceStatus::Blocked, Some(e.code.to_string())));
        return terminate(&mut trace, agent, strategy, deps, now, e, Some(decision), None).await;
    }
    trace.push(trace_entry("guard", TraceStatus::Ok, None));

    // --- 6. simulate ---
    let sim = match with_retry_if_infra(deps, || deps.chain.simulate(&plan.params)).await {
        Ok(s) => s,
        Err(e) => return terminate(&mut trace, agent, strategy, deps, now, e, Some(decision), None).await,
    };
    if !sim.ok {
        let reason = sim.revert_reason.unwrap_or_else(|| "execution reverted".to_string());
        trace.push(trace_entry("simulate", TraceStatus::Blocked, Some(reason.clone())));
        let err = RunnerError::new(
            FailureCategory::BusinessRejected,
            ErrorCode::BusinessChainReverted,
            "Transaction was rejected by the contract.",
        )
        .with_detail(reason);
        return terminate(&mut trace, agent, strategy, deps, now, err, Some(decision), None).await;
    }
    trace.push(trace_entry("simulate", TraceStatus::Ok, None));

    // --- 7. execute ---
    let tx_hash = match with_retry_if_infra(deps, || deps.chain.submit(&plan.params)).await {
        Ok(h) => h,
        Err(e) => return terminate(&mut trace, agent, strategy, deps, now, e, Some(decision), None).await,
    };
    trace.push(trace_entry("execute", TraceStatus::Ok, Some(tx_hash.clone())));

    // --- 8. verify ---
    let receipt = with_retry_if_infra(deps, || deps.chain.receipt(&tx_hash)).await;
    let (gas_used, exec_success) = match receipt {
        Ok(r) => {
            trace.push(trace_entry("verify", TraceStatus::Ok, None));
            (r.gas_used, r.success)
        }
        Err(_) => {
            // Receipt lookup failing doesn't unwind a submitted tx; record
            // what we know and let the operator reconcile out of band.
            trace.push(trace_entry("verify", TraceStatus::Error, Some("receipt unavailable".into())));
            (None, true)
        }
    };

    finalize(
        &mut trace,
        agent,
        strategy,
        deps,
        now,
        FinalOutcome {
            plan: &plan,
            decision: Some(decision),
            simulate_ok: true,
            tx_hash: Some(tx_hash),
            gas_used,
            error: None,
            failure_category: None,
            error_code: None,
            violation_code: None,
            execution_success: Some(exec_success),
        },
    )
    .await
}

async fn timeout_call<T>(
    duration: std::time::Duration,
    fut: impl std::future::Future<Output = Result<T, RunnerError>>,
) -> Result<T, RunnerError> {
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(RunnerError::new(
            FailureCategory::InfrastructureError,
            ErrorCode::InfraTimeout,
            "A request took too long to complete; this will be retried shortly.",
        )),
    }
}

/// Wraps a chain/perception call in its per-attempt timeout, then retries
/// across attempts with `deps.config`'s retry knobs whenever the
/// classified failure is an `infrastructure_error` (§7) — e.g. an RPC
/// 429 that clears up a moment later. Schema/business rejections are
/// never retryable, so `with_retry` returns on the first attempt for
/// those.
async fn with_retry_if_infra<F, Fut, T>(deps: &CycleDeps, mut f: F) -> Result<T, RunnerError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, RunnerError>>,
{
    let timeout = deps.config.rpc_timeout();
    crate::errors::with_retry(deps.config.retry_max_attempts, deps.config.retry_base_delay(), || {
        timeout_call(timeout, f())
    })
    .await
}

fn trace_entry(stage: &str, status: TraceStatus, note: Option<String>) -> ExecutionTraceEntry {
    ExecutionTraceEntry {
        stage: stage.to_string(),
        status,
        at: Utc::now(),
        note,
        meta: None,
    }
}

/// Derive `spendAmount`/`actionTokens`/`amountIn`/`minOut`/`target` from
/// the plan's params, per §4.2 stage 5's "derive ... from the action's
/// params/payload" — a small, well-known-keys convention so the guard
/// stage doesn't need to know each action's internal shape.
fn derive_execution_context(agent: &Agent, plan: &ExecutionPlan, now: DateTime<Utc>) -> ExecutionContext {
    let params = &plan.params;
    ExecutionContext {
        token_id: agent.identity.token_id,
        agent_type: agent.identity.agent_type.clone(),
        vault: agent.identity.vault.clone(),
        timestamp: now,
        action_name: plan.action_name.clone(),
        spend_amount: bigint_field(params, "spendAmount"),
        action_tokens: string_array_field(params, "actionTokens"),
        min_out: bigint_field(params, "minOut"),
        amount_in: bigint_field(params, "amountIn"),
        target: params.get("target").and_then(|v| v.as_str()).map(|s| s.to_string()),
    }
}

fn bigint_field(params: &JsonValue, key: &str) -> Option<BigInt> {
    params
        .get(key)
        .and_then(|v| v.as_str().map(str::to_string).or_else(|| v.as_i64().map(|n| n.to_string())))
        .and_then(|s| s.parse::<BigInt>().ok())
}

fn string_array_field(params: &JsonValue, key: &str) -> Option<Vec<String>> {
    params.get(key).and_then(|v| v.as_array()).map(|arr| {
        arr.iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    })
}

/// A tripped circuit breaker, carrying the real repeating action so the
/// run `terminate()` records for this cycle keeps the streak intact on
/// the *next* `check_circuit_breaker` call instead of resetting it under
/// a synthetic `"unknown"` action (no decision is ever proposed during a
/// breaker-tripped cycle, so there is no `Decision` to read it from).
struct TrippedBreaker {
    reason: String,
    action: String,
}

/// Checks the last `circuit_breaker_threshold` runs for this agent: if
/// all of them share the same `action_type` and all failed, the cycle is
/// short-circuited (§4.1). Returns `Some(..)` when tripped.
async fn check_circuit_breaker(
    agent: &Agent,
    strategy: &StrategyConfig,
    deps: &CycleDeps,
) -> Option<TrippedBreaker> {
    let threshold = deps.config.circuit_breaker_threshold as usize;
    if threshold == 0 {
        return None;
    }
    let runs = deps
        .store
        .list_runs(agent.identity.token_id, threshold)
        .await
        .ok()?;
    if runs.len() < threshold {
        return None;
    }
    let first_action = runs[0].action_type.clone();
    let all_same_action_failed = runs.iter().all(|r| {
        r.action_type == first_action && r.tx_hash.is_none() && r.error.is_some()
    });
    if all_same_action_failed && strategy.enabled {
        Some(TrippedBreaker {
            reason: format!(
                "circuit breaker tripped: last {threshold} runs of `{first_action}` all failed"
            ),
            action: first_action,
        })
    } else {
        None
    }
}

struct FinalOutcome<'a> {
    plan: &'a ExecutionPlan,
    decision: Option<Decision>,
    simulate_ok: bool,
    tx_hash: Option<String>,
    gas_used: Option<BigInt>,
    error: Option<String>,
    failure_category: Option<FailureCategory>,
    error_code: Option<ErrorCode>,
    violation_code: Option<String>,
    /// `Some(success)` when an execution/readonly memory entry should be
    /// recorded; `None` for a bare `wait`.
    execution_success: Option<bool>,
}

/// Stage 9 ("record"): persist the `RunRecord` and the updated strategy
/// counters as one transaction, then append the memory entry — ordered
/// after `recordRun` per §4.5's invariant.
async fn finalize(
    trace: &mut Vec<ExecutionTraceEntry>,
    agent: &Agent,
    strategy: &mut StrategyConfig,
    deps: &CycleDeps,
    now: DateTime<Utc>,
    outcome: FinalOutcome<'_>,
) -> RunRecord {
    trace.push(trace_entry("record", TraceStatus::Ok, None));

    let action_name = outcome
        .plan
        .action_name
        .clone()
        .unwrap_or_else(|| match outcome.plan.kind {
            PlanKind::Wait => "wait".to_string(),
            _ => "unknown".to_string(),
        });
    let action_hash = hash_action(&action_name, &outcome.plan.params);

    let success = outcome.execution_success.unwrap_or(true) && outcome.error.is_none();

    if success {
        strategy.record_success();
        let advance_ms = outcome
            .decision
            .as_ref()
            .and_then(|d| d.next_check_ms)
            .unwrap_or(0)
            .max(strategy.min_interval_ms);
        strategy.next_check_at = now + chrono::Duration::milliseconds(advance_ms);
    } else {
        strategy.record_failure(outcome.error.clone().unwrap_or_default());
        strategy.next_check_at = now + chrono::Duration::milliseconds(strategy.min_interval_ms);
    }
    strategy.last_run_at = Some(now);
    strategy.updated_at = now;
    if outcome.execution_success == Some(true) {
        if let Some(spend) = outcome
            .plan
            .params
            .get("spendAmount")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<BigInt>().ok())
        {
            strategy.daily_value_used += spend;
            strategy.daily_runs_used += 1;
        }
    }

    let run = RunRecord {
        id: None,
        chain_id: strategy.chain_id,
        token_id: agent.identity.token_id,
        action_type: action_name,
        action_hash,
        simulate_ok: outcome.simulate_ok,
        tx_hash: outcome.tx_hash.clone(),
        error: outcome.error.clone(),
        error_code: outcome.error_code,
        failure_category: outcome.failure_category,
        violation_code: outcome.violation_code,
        brain_type: None,
        intent_type: Some(match outcome.plan.kind {
            PlanKind::Wait => "wait".to_string(),
            PlanKind::Readonly => "read".to_string(),
            PlanKind::Write => "swap".to_string(),
            PlanKind::Blocked => "blocked".to_string(),
        }),
        decision_reason: outcome.decision.as_ref().map(|d| d.reasoning.clone()),
        decision_message: outcome.decision.as_ref().and_then(|d| d.message.clone()),
        execution_trace: trace.clone(),
        run_mode: RunMode::Primary,
        shadow_compare: shadow_compare_if_enabled(deps, outcome.decision.as_ref(), &agent.actions),
        gas_used: outcome.gas_used.clone(),
        pnl_usd: None,
        created_at: now,
    };

    persist(agent, strategy, deps, run.clone(), outcome.execution_success).await;
    run
}

/// Builds the `RunRecord` for a terminated (errored/blocked) cycle and
/// persists it, symmetric to `finalize` but driven from a `RunnerError`.
async fn terminate(
    trace: &mut Vec<ExecutionTraceEntry>,
    agent: &Agent,
    strategy: &mut StrategyConfig,
    deps: &CycleDeps,
    now: DateTime<Utc>,
    err: RunnerError,
    decision: Option<Decision>,
    action_hint: Option<String>,
) -> RunRecord {
    trace.push(trace_entry(
        "error",
        TraceStatus::Error,
        Some(err.user_message.clone()),
    ));

    // `decision` wins when a plan was actually proposed; `action_hint`
    // carries the repeating action name through paths (the circuit
    // breaker pre-check) that terminate before any decision exists, so a
    // blocked cycle doesn't get recorded under a throwaway "unknown" that
    // would reset `check_circuit_breaker`'s same-action streak.
    let action_name = decision
        .as_ref()
        .map(|d| d.action.clone())
        .or(action_hint)
        .unwrap_or_else(|| "unknown".to_string());
    let action_hash = hash_action(&action_name, &decision.as_ref().map(|d| d.params.clone()).unwrap_or(JsonValue::Null));

    strategy.record_failure(err.detail.clone().unwrap_or_else(|| err.user_message.clone()));
    let backoff_ms = backoff_delay_ms(strategy.failure_count, deps.config.max_backoff_ms);
    strategy.next_check_at = now + chrono::Duration::milliseconds(strategy.min_interval_ms + backoff_ms);
    strategy.last_run_at = Some(now);
    strategy.updated_at = now;

    let violation_code = err.detail.clone().filter(|d| d.starts_with("SOFT_") || d.starts_with("HARD_"));

    let run = RunRecord {
        id: None,
        chain_id: strategy.chain_id,
        token_id: agent.identity.token_id,
        action_type: action_name,
        action_hash,
        simulate_ok: false,
        tx_hash: None,
        error: Some(err.user_message.clone()),
        error_code: Some(err.code),
        failure_category: Some(err.category),
        violation_code,
        brain_type: None,
        intent_type: decision.as_ref().map(|_| "blocked".to_string()),
        decision_reason: decision.as_ref().map(|d| d.reasoning.clone()),
        decision_message: decision.as_ref().and_then(|d| d.message.clone()),
        execution_trace: trace.clone(),
        run_mode: RunMode::Primary,
        shadow_compare: shadow_compare_if_enabled(deps, decision.as_ref(), &agent.actions),
        gas_used: None,
        pnl_usd: None,
        created_at: now,
    };

    persist(agent, strategy, deps, run.clone(), Some(false)).await;
    run
}

/// Runs the canonical-vs-legacy divergence check alongside the primary
/// plan when shadow mode is on (§4.7), never affecting the primary
/// outcome — a blocked/wait decision has nothing to compare either.
fn shadow_compare_if_enabled(
    deps: &CycleDeps,
    decision: Option<&Decision>,
    actions: &[Arc<dyn crate::capability::Action>],
) -> Option<crate::models::ShadowCompare> {
    if !deps.config.shadow_mode_default {
        return None;
    }
    decision.map(|d| crate::shadow::compare(d, actions))
}

/// Exponential backoff on consecutive failures, capped at `max_backoff_ms`
/// (§4.1: "on transient failure by minIntervalMs plus exponential backoff
/// capped at maxBackoffMs").
fn backoff_delay_ms(failure_count: u32, max_backoff_ms: u64) -> i64 {
    let shift = failure_count.saturating_sub(1).min(20);
    let delay = 1_000u64.saturating_mul(1u64 << shift);
    delay.min(max_backoff_ms) as i64
}

async fn persist(
    agent: &Agent,
    strategy: &StrategyConfig,
    deps: &CycleDeps,
    run: RunRecord,
    execution_success: Option<bool>,
) {
    let chain_id = run.chain_id;
    if let Err(e) = deps
        .store
        .record_run_and_update_strategy(&run, strategy, deps.config.max_run_records)
        .await
    {
        tracing::warn!(error = %e, chain_id, "failed to persist run record");
    }

    if let Some(success) = execution_success {
        let entry = MemoryEntry {
            token_id: agent.identity.token_id,
            entry_type: MemoryEntryType::Execution,
            action: Some(run.action_type.clone()),
            params: None,
            result: Some(ExecutionResult {
                success,
                tx_hash: run.tx_hash.clone(),
                error: run.error.clone(),
            }),
            reasoning: run.decision_reason.clone(),
            timestamp: run.created_at,
        };
        if let Err(e) = agent.memory.append(entry).await {
            tracing::warn!(error = %e, "failed to append execution memory entry");
        }
    } else {
        let entry = MemoryEntry {
            token_id: agent.identity.token_id,
            entry_type: MemoryEntryType::Blocked,
            action: Some(run.action_type.clone()),
            params: None,
            result: None,
            reasoning: run.error.clone(),
            timestamp: run.created_at,
        };
        if let Err(e) = agent.memory.append(entry).await {
            tracing::warn!(error = %e, "failed to append blocked memory entry");
        }
    }
}

fn hash_action(name: &str, params: &JsonValue) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    name.hash(&mut hasher);
    params.to_string().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::actions::mock::EchoAction;
    use crate::capability::actions::{ActionField, ActionSchema, FieldKind};
    use crate::capability::brain::mock::ScriptedBrain;
    use crate::capability::memory::StoreMemory;
    use crate::capability::perception::mock::StaticPerception;
    use crate::capability::Agent;
    use crate::chain::mock::MockChain;
    use crate::models::{AgentIdentity, Observation, TokenBalance};
    use crate::persistence::sqlite::SqliteStore;
    use crate::planner::CanonicalPlanner;
    use serde_json::json;

    fn observation() -> Observation {
        Observation {
            vault: "0xvault".to_string(),
            vault_token_balances: vec![TokenBalance {
                token: "0xusdc".to_string(),
                balance: BigInt::from(1_000_000),
            }],
            native_balance: BigInt::from(0),
            prices: Default::default(),
            gas_price: BigInt::from(1),
            block_number: 1,
            timestamp: Utc::now(),
            paused: false,
        }
    }

    fn deps(store: Arc<dyn PersistenceStore>, chain: Arc<dyn Chain>) -> CycleDeps {
        CycleDeps {
            store,
            chain,
            planner: Arc::new(CanonicalPlanner),
            config: Arc::new(test_config()),
        }
    }

    fn test_config() -> RunnerConfig {
        RunnerConfig {
            database_path: ":memory:".to_string(),
            http_host: "127.0.0.1".to_string(),
            http_port: 0,
            api_key: None,
            poll_interval_ms: 1_000,
            max_concurrent_cycles: 4,
            max_backoff_ms: 60_000,
            graceful_shutdown_ms: 1_000,
            max_run_records: 500,
            circuit_breaker_threshold: 3,
            shadow_mode_default: false,
            shadow_execute_tx: false,
            hard_validator_address: crate::chain::ZERO_ADDRESS.to_string(),
            chain_id: 1,
            default_timeout_ms: 5_000,
            rpc_timeout_ms: 5_000,
            llm_timeout_ms: 5_000,
            db_timeout_ms: 5_000,
            memory_recall_limit: 20,
            retry_max_attempts: 3,
            retry_base_delay_ms: 1,
        }
    }

    fn strategy() -> StrategyConfig {
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

    fn agent_with_brain(brain: Arc<dyn crate::capability::Brain>, store: Arc<dyn PersistenceStore>) -> Agent {
        Agent {
            identity: AgentIdentity {
                token_id: 1,
                agent_type: "trader".to_string(),
                owner: "0xowner".to_string(),
                renter: None,
                vault: "0xvault".to_string(),
            },
            perception: Arc::new(StaticPerception::new(observation())),
            memory: Arc::new(StoreMemory::new(store, 1)),
            brain,
            actions: vec![Arc::new(EchoAction::new(
                "swap",
                false,
                ActionSchema {
                    fields: vec![ActionField {
                        name: "tokenIn".to_string(),
                        kind: FieldKind::String,
                        required: true,
                        r#enum: None,
                    }],
                },
            ))],
            guardrails: vec![],
        }
    }

    #[tokio::test]
    async fn wait_decision_produces_wait_run_record() {
        let store: Arc<dyn PersistenceStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let chain: Arc<dyn Chain> = Arc::new(MockChain::default());
        let brain = Arc::new(ScriptedBrain::new(vec![Decision::wait("nothing to do")]));
        let agent = agent_with_brain(brain, store.clone());
        let mut strat = strategy();
        let d = deps(store, chain);

        let run = run_cycle(&agent, &mut strat, &d, Utc::now(), &CancelToken::new()).await;
        assert_eq!(run.intent_type.as_deref(), Some("wait"));
        assert!(run.error.is_none());
    }

    #[tokio::test]
    async fn unknown_action_is_recorded_as_model_output_error() {
        let store: Arc<dyn PersistenceStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let chain: Arc<dyn Chain> = Arc::new(MockChain::default());
        let brain = Arc::new(ScriptedBrain::new(vec![Decision {
            action: "magicSwap".to_string(),
            params: json!({}),
            reasoning: "because".to_string(),
            confidence: 0.9,
            message: None,
            done: None,
            next_check_ms: None,
            blocked: None,
            block_reason: None,
        }]));
        let agent = agent_with_brain(brain, store.clone());
        let mut strat = strategy();
        let d = deps(store, chain);

        let run = run_cycle(&agent, &mut strat, &d, Utc::now(), &CancelToken::new()).await;
        assert_eq!(run.failure_category, Some(FailureCategory::ModelOutputError));
        assert_eq!(run.error_code, Some(ErrorCode::ModelUnknownAction));
        assert_eq!(strat.failure_count, 1);
    }

    #[tokio::test]
    async fn successful_write_submits_and_records_tx_hash() {
        let store: Arc<dyn PersistenceStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let chain: Arc<dyn Chain> = Arc::new(MockChain::default());
        let brain = Arc::new(ScriptedBrain::new(vec![Decision {
            action: "swap".to_string(),
            params: json!({"tokenIn": "0xabc"}),
            reasoning: "signal fired".to_string(),
            confidence: 0.95,
            message: None,
            done: None,
            next_check_ms: None,
            blocked: None,
            block_reason: None,
        }]));
        let agent = agent_with_brain(brain, store.clone());
        let mut strat = strategy();
        let d = deps(store, chain);

        let run = run_cycle(&agent, &mut strat, &d, Utc::now(), &CancelToken::new()).await;
        assert!(run.tx_hash.is_some());
        assert!(run.simulate_ok);
        assert_eq!(strat.failure_count, 0);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_to_infra_error() {
        let store: Arc<dyn PersistenceStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let chain: Arc<dyn Chain> = Arc::new(MockChain::default());
        let brain = Arc::new(ScriptedBrain::new(vec![Decision::wait("n/a")]));
        let agent = agent_with_brain(brain, store.clone());
        let mut strat = strategy();
        let d = deps(store, chain);
        let cancel = CancelToken::new();
        cancel.cancel();

        let run = run_cycle(&agent, &mut strat, &d, Utc::now(), &cancel).await;
        assert_eq!(run.failure_category, Some(FailureCategory::InfrastructureError));
        assert_eq!(run.error_code, Some(ErrorCode::InfraRuntimeException));
    }
}
