//! `rusqlite` implementation of `PersistenceStore`, built on the same
//! WAL-mode + `parking_lot::Mutex<Connection>` idiom as `DbSignalStorage`
//! in the teacher codebase. Every public method takes the lock for the
//! duration of one statement or one transaction and releases it before
//! returning — nothing here holds the lock across an `.await`.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use num_bigint::BigInt;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value as JsonValue;

use crate::errors::{ErrorCode, FailureCategory, RunnerError};
use crate::models::{
    AgentIdentity, Blueprint, ChainId, ExecutionTraceEntry, MarketSignal, MemoryEntry,
    MemoryEntryType, RunMode, RunRecord, SafetyConfig, ShadowCompare, StrategyConfig, TokenId,
};
use crate::persistence::schema::SCHEMA_SQL;
use crate::persistence::{
    PersistenceStore, SafetyMetrics, SafetyTimelineEntry, SafetyViolationEntry, ShadowMetrics,
};

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(db_path: &str) -> Result<Self, RunnerError> {
        let conn = Connection::open(db_path).map_err(|e| RunnerError::storage_error(e.to_string()))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| RunnerError::storage_error(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests; same schema, no file on disk.
    pub fn open_in_memory() -> Result<Self, RunnerError> {
        let conn =
            Connection::open_in_memory().map_err(|e| RunnerError::storage_error(e.to_string()))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| RunnerError::storage_error(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn bigint_to_text(v: &BigInt) -> String {
    v.to_string()
}

fn bigint_from_text(s: &str) -> Result<BigInt, RunnerError> {
    BigInt::from_str(s).map_err(|e| RunnerError::storage_error(format!("bad BigInt column: {e}")))
}

fn opt_bigint_from_text(s: Option<String>) -> Result<Option<BigInt>, RunnerError> {
    s.map(|s| bigint_from_text(&s)).transpose()
}

fn to_json<T: serde::Serialize>(v: &T) -> Result<String, RunnerError> {
    serde_json::to_string(v).map_err(|e| RunnerError::storage_error(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, RunnerError> {
    serde_json::from_str(s).map_err(|e| RunnerError::storage_error(e.to_string()))
}

fn opt_from_json<T: serde::de::DeserializeOwned>(
    s: Option<String>,
) -> Result<Option<T>, RunnerError> {
    s.map(|s| from_json(&s)).transpose()
}

fn json_list_to_text(v: &[String]) -> String {
    serde_json::to_string(v).unwrap_or_else(|_| "[]".to_string())
}

fn text_to_json_list(s: &str) -> Vec<String> {
    serde_json::from_str(s).unwrap_or_default()
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>, RunnerError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RunnerError::storage_error(format!("bad timestamp column: {e}")))
}

fn parse_date(s: &str) -> Result<NaiveDate, RunnerError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| RunnerError::storage_error(format!("bad date column: {e}")))
}

fn sql_err(e: rusqlite::Error) -> RunnerError {
    RunnerError::storage_error(e.to_string())
}

fn strategy_from_row(row: &rusqlite::Row) -> rusqlite::Result<RawStrategy> {
    Ok(RawStrategy {
        token_id: row.get(0)?,
        chain_id: row.get(1)?,
        strategy_type: row.get(2)?,
        target: row.get(3)?,
        data: row.get(4)?,
        value: row.get(5)?,
        strategy_params: row.get(6)?,
        min_interval_ms: row.get(7)?,
        require_positive_balance: row.get(8)?,
        max_failures: row.get(9)?,
        failure_count: row.get(10)?,
        enabled: row.get(11)?,
        last_run_at: row.get(12)?,
        last_error: row.get(13)?,
        next_check_at: row.get(14)?,
        budget_day: row.get(15)?,
        daily_runs_used: row.get(16)?,
        daily_value_used: row.get(17)?,
        created_at: row.get(18)?,
        updated_at: row.get(19)?,
    })
}

/// Plain column tuple, decoded into `StrategyConfig` outside the lock
/// (BigInt/DateTime parsing can fail and we want that as a `RunnerError`,
/// not a `rusqlite::Error`).
struct RawStrategy {
    token_id: TokenId,
    chain_id: ChainId,
    strategy_type: String,
    target: String,
    data: String,
    value: String,
    strategy_params: Option<String>,
    min_interval_ms: i64,
    require_positive_balance: bool,
    max_failures: u32,
    failure_count: u32,
    enabled: bool,
    last_run_at: Option<String>,
    last_error: Option<String>,
    next_check_at: String,
    budget_day: String,
    daily_runs_used: u32,
    daily_value_used: String,
    created_at: String,
    updated_at: String,
}

impl RawStrategy {
    fn into_strategy(self) -> Result<StrategyConfig, RunnerError> {
        Ok(StrategyConfig {
            token_id: self.token_id,
            chain_id: self.chain_id,
            strategy_type: self.strategy_type,
            target: self.target,
            data: self.data,
            value: bigint_from_text(&self.value)?,
            strategy_params: self
                .strategy_params
                .map(|s| from_json(&s))
                .transpose()?,
            min_interval_ms: self.min_interval_ms,
            require_positive_balance: self.require_positive_balance,
            max_failures: self.max_failures,
            failure_count: self.failure_count,
            enabled: self.enabled,
            last_run_at: self.last_run_at.map(|s| parse_rfc3339(&s)).transpose()?,
            last_error: self.last_error,
            next_check_at: parse_rfc3339(&self.next_check_at)?,
            budget_day: parse_date(&self.budget_day)?,
            daily_runs_used: self.daily_runs_used,
            daily_value_used: bigint_from_text(&self.daily_value_used)?,
            created_at: parse_rfc3339(&self.created_at)?,
            updated_at: parse_rfc3339(&self.updated_at)?,
        })
    }
}

const STRATEGY_COLUMNS: &str = "token_id, chain_id, strategy_type, target, data, value, \
    strategy_params, min_interval_ms, require_positive_balance, max_failures, failure_count, \
    enabled, last_run_at, last_error, next_check_at, budget_day, daily_runs_used, \
    daily_value_used, created_at, updated_at";

#[async_trait]
impl PersistenceStore for SqliteStore {
    async fn upsert_agent(&self, identity: &AgentIdentity) -> Result<(), RunnerError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO autopilots (token_id, agent_type, owner, renter, vault) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(token_id) DO UPDATE SET \
                agent_type=excluded.agent_type, owner=excluded.owner, \
                renter=excluded.renter, vault=excluded.vault",
            params![
                identity.token_id,
                identity.agent_type,
                identity.owner,
                identity.renter,
                identity.vault
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn get_agent(&self, token_id: TokenId) -> Result<Option<AgentIdentity>, RunnerError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT token_id, agent_type, owner, renter, vault FROM autopilots WHERE token_id = ?1",
            [token_id],
            |row| {
                Ok(AgentIdentity {
                    token_id: row.get(0)?,
                    agent_type: row.get(1)?,
                    owner: row.get(2)?,
                    renter: row.get(3)?,
                    vault: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(sql_err)
    }

    async fn list_agents(&self) -> Result<Vec<AgentIdentity>, RunnerError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT token_id, agent_type, owner, renter, vault FROM autopilots")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(AgentIdentity {
                    token_id: row.get(0)?,
                    agent_type: row.get(1)?,
                    owner: row.get(2)?,
                    renter: row.get(3)?,
                    vault: row.get(4)?,
                })
            })
            .map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    async fn remove_agent(&self, token_id: TokenId) -> Result<(), RunnerError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM autopilots WHERE token_id = ?1", [token_id])
            .map_err(sql_err)?;
        Ok(())
    }

    async fn select_runnable(&self, now: DateTime<Utc>) -> Result<Vec<TokenId>, RunnerError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT token_id FROM token_strategies \
                 WHERE enabled = 1 AND next_check_at <= ?1 \
                 ORDER BY next_check_at ASC",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([now.to_rfc3339()], |row| row.get(0))
            .map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    async fn get_strategy(&self, token_id: TokenId) -> Result<Option<StrategyConfig>, RunnerError> {
        let raw = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!("SELECT {STRATEGY_COLUMNS} FROM token_strategies WHERE token_id = ?1"),
                [token_id],
                strategy_from_row,
            )
            .optional()
            .map_err(sql_err)?
        };
        raw.map(RawStrategy::into_strategy).transpose()
    }

    async fn upsert_strategy(&self, s: &StrategyConfig) -> Result<(), RunnerError> {
        let strategy_params = s
            .strategy_params
            .as_ref()
            .map(to_json)
            .transpose()?;
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO token_strategies ({STRATEGY_COLUMNS}) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20) \
                 ON CONFLICT(token_id) DO UPDATE SET \
                    chain_id=excluded.chain_id, strategy_type=excluded.strategy_type, \
                    target=excluded.target, data=excluded.data, value=excluded.value, \
                    strategy_params=excluded.strategy_params, min_interval_ms=excluded.min_interval_ms, \
                    require_positive_balance=excluded.require_positive_balance, \
                    max_failures=excluded.max_failures, failure_count=excluded.failure_count, \
                    enabled=excluded.enabled, last_run_at=excluded.last_run_at, \
                    last_error=excluded.last_error, next_check_at=excluded.next_check_at, \
                    budget_day=excluded.budget_day, daily_runs_used=excluded.daily_runs_used, \
                    daily_value_used=excluded.daily_value_used, updated_at=excluded.updated_at"
            ),
            params![
                s.token_id,
                s.chain_id,
                s.strategy_type,
                s.target,
                s.data,
                bigint_to_text(&s.value),
                strategy_params,
                s.min_interval_ms,
                s.require_positive_balance,
                s.max_failures,
                s.failure_count,
                s.enabled,
                s.last_run_at.map(|t| t.to_rfc3339()),
                s.last_error,
                s.next_check_at.to_rfc3339(),
                s.budget_day.format("%Y-%m-%d").to_string(),
                s.daily_runs_used,
                bigint_to_text(&s.daily_value_used),
                s.created_at.to_rfc3339(),
                s.updated_at.to_rfc3339(),
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn record_run_and_update_strategy(
        &self,
        run: &RunRecord,
        strategy: &StrategyConfig,
        max_run_records: usize,
    ) -> Result<i64, RunnerError> {
        let execution_trace = to_json(&run.execution_trace)?;
        let shadow_compare = run.shadow_compare.as_ref().map(to_json).transpose()?;
        let strategy_params = strategy
            .strategy_params
            .as_ref()
            .map(to_json)
            .transpose()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(sql_err)?;

        tx.execute(
            "INSERT INTO runs (chain_id, token_id, action_type, action_hash, simulate_ok, \
                tx_hash, error, error_code, failure_category, violation_code, brain_type, \
                intent_type, decision_reason, decision_message, execution_trace, run_mode, \
                shadow_compare, gas_used, pnl_usd, created_at) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20)",
            params![
                run.chain_id,
                run.token_id,
                run.action_type,
                run.action_hash,
                run.simulate_ok,
                run.tx_hash,
                run.error,
                run.error_code.map(|c| c.to_string()),
                run.failure_category.map(|c| c.to_string()),
                run.violation_code,
                run.brain_type,
                run.intent_type,
                run.decision_reason,
                run.decision_message,
                execution_trace,
                run_mode_str(run.run_mode),
                shadow_compare,
                run.gas_used.as_ref().map(bigint_to_text),
                run.pnl_usd,
                run.created_at.to_rfc3339(),
            ],
        )
        .map_err(sql_err)?;
        let run_id = tx.last_insert_rowid();

        tx.execute(
            &format!(
                "UPDATE token_strategies SET \
                    value=?2, strategy_params=?3, min_interval_ms=?4, \
                    require_positive_balance=?5, max_failures=?6, failure_count=?7, \
                    enabled=?8, last_run_at=?9, last_error=?10, next_check_at=?11, \
                    budget_day=?12, daily_runs_used=?13, daily_value_used=?14, updated_at=?15 \
                 WHERE token_id=?1"
            ),
            params![
                strategy.token_id,
                bigint_to_text(&strategy.value),
                strategy_params,
                strategy.min_interval_ms,
                strategy.require_positive_balance,
                strategy.max_failures,
                strategy.failure_count,
                strategy.enabled,
                strategy.last_run_at.map(|t| t.to_rfc3339()),
                strategy.last_error,
                strategy.next_check_at.to_rfc3339(),
                strategy.budget_day.format("%Y-%m-%d").to_string(),
                strategy.daily_runs_used,
                bigint_to_text(&strategy.daily_value_used),
                strategy.updated_at.to_rfc3339(),
            ],
        )
        .map_err(sql_err)?;

        // Trim to max_run_records, oldest first, scoped to this chain.
        let total: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM runs WHERE chain_id = ?1",
                [run.chain_id],
                |r| r.get(0),
            )
            .map_err(sql_err)?;
        let overflow = total - max_run_records as i64;
        if overflow > 0 {
            tx.execute(
                "DELETE FROM runs WHERE id IN (\
                    SELECT id FROM runs WHERE chain_id = ?1 ORDER BY created_at ASC, id ASC LIMIT ?2)",
                params![run.chain_id, overflow],
            )
            .map_err(sql_err)?;
        }

        tx.commit().map_err(sql_err)?;
        Ok(run_id)
    }

    async fn list_runs(&self, token_id: TokenId, limit: usize) -> Result<Vec<RunRecord>, RunnerError> {
        let rows: Vec<(
            Option<i64>,
            ChainId,
            TokenId,
            String,
            String,
            bool,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            String,
            String,
            Option<String>,
            Option<String>,
            Option<f64>,
            String,
        )> = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare_cached(
                    "SELECT id, chain_id, token_id, action_type, action_hash, simulate_ok, \
                        tx_hash, error, error_code, failure_category, violation_code, brain_type, \
                        intent_type, decision_reason, decision_message, execution_trace, run_mode, \
                        shadow_compare, gas_used, pnl_usd, created_at \
                     FROM runs WHERE token_id = ?1 ORDER BY created_at DESC LIMIT ?2",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![token_id, limit as i64], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                        row.get(9)?,
                        row.get(10)?,
                        row.get(11)?,
                        row.get(12)?,
                        row.get(13)?,
                        row.get(14)?,
                        row.get(15)?,
                        row.get(16)?,
                        row.get(17)?,
                        row.get(18)?,
                        row.get(19)?,
                        row.get(20)?,
                    ))
                })
                .map_err(sql_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)?
        };

        rows.into_iter()
            .map(
                |(
                    id,
                    chain_id,
                    token_id,
                    action_type,
                    action_hash,
                    simulate_ok,
                    tx_hash,
                    error,
                    error_code,
                    failure_category,
                    violation_code,
                    brain_type,
                    intent_type,
                    decision_reason,
                    decision_message,
                    execution_trace,
                    run_mode,
                    shadow_compare,
                    gas_used,
                    pnl_usd,
                    created_at,
                )| {
                    Ok(RunRecord {
                        id,
                        chain_id,
                        token_id,
                        action_type,
                        action_hash,
                        simulate_ok,
                        tx_hash,
                        error,
                        error_code: error_code.map(|s| error_code_from_str(&s)).transpose()?,
                        failure_category: failure_category
                            .map(|s| failure_category_from_str(&s))
                            .transpose()?,
                        violation_code,
                        brain_type,
                        intent_type,
                        decision_reason,
                        decision_message,
                        execution_trace: from_json::<Vec<ExecutionTraceEntry>>(&execution_trace)?,
                        run_mode: run_mode_from_str(&run_mode)?,
                        shadow_compare: opt_from_json::<ShadowCompare>(shadow_compare)?,
                        gas_used: opt_bigint_from_text(gas_used)?,
                        pnl_usd,
                        created_at: parse_rfc3339(&created_at)?,
                    })
                },
            )
            .collect()
    }

    async fn count_runs_for_chain(&self, chain_id: ChainId) -> Result<u64, RunnerError> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM runs WHERE chain_id = ?1", [chain_id], |r| r.get(0))
            .map_err(sql_err)?;
        Ok(count.max(0) as u64)
    }

    async fn append_memory(&self, entry: MemoryEntry) -> Result<(), RunnerError> {
        let params_json = entry.params.as_ref().map(to_json).transpose()?;
        let result_json = entry.result.as_ref().map(to_json).transpose()?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agent_memory (token_id, entry_type, action, params, result, reasoning, timestamp) \
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                entry.token_id,
                memory_type_str(entry.entry_type),
                entry.action,
                params_json,
                result_json,
                entry.reasoning,
                entry.timestamp.to_rfc3339(),
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn recall_memory(
        &self,
        token_id: TokenId,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, RunnerError> {
        let rows: Vec<(String, Option<String>, Option<String>, Option<String>, Option<String>, String)> = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare_cached(
                    "SELECT entry_type, action, params, result, reasoning, timestamp \
                     FROM agent_memory WHERE token_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![token_id, limit as i64], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                })
                .map_err(sql_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)?
        };

        rows.into_iter()
            .map(|(entry_type, action, params_json, result_json, reasoning, ts)| {
                Ok(MemoryEntry {
                    token_id,
                    entry_type: memory_type_from_str(&entry_type)?,
                    action,
                    params: opt_from_json::<JsonValue>(params_json)?,
                    result: opt_from_json(result_json)?,
                    reasoning,
                    timestamp: parse_rfc3339(&ts)?,
                })
            })
            .collect()
    }

    async fn upsert_market_signal(&self, signal: MarketSignal) -> Result<(), RunnerError> {
        let conn = self.conn.lock();
        insert_market_signal(&conn, &signal)
    }

    async fn batch_upsert_market_signals(
        &self,
        signals: Vec<MarketSignal>,
    ) -> Result<(), RunnerError> {
        if signals.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(sql_err)?;
        for signal in &signals {
            insert_market_signal(&tx, signal)?;
        }
        tx.commit().map_err(sql_err)?;
        Ok(())
    }

    async fn get_market_signal(
        &self,
        chain_id: ChainId,
        pair: &str,
    ) -> Result<Option<MarketSignal>, RunnerError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT chain_id, pair, price_change_bps, volume_5m, unique_traders_5m, sampled_at, source \
             FROM market_signals WHERE chain_id = ?1 AND pair = ?2",
            params![chain_id, pair],
            |row| {
                let volume_5m: String = row.get(3)?;
                let sampled_at: String = row.get(5)?;
                Ok((row.get::<_, ChainId>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?, volume_5m, row.get::<_, u32>(4)?, sampled_at, row.get::<_, String>(6)?))
            },
        )
        .optional()
        .map_err(sql_err)?
        .map(|(chain_id, pair, price_change_bps, volume_5m, unique_traders_5m, sampled_at, source)| {
            Ok(MarketSignal {
                chain_id,
                pair,
                price_change_bps,
                volume_5m: bigint_from_text(&volume_5m)?,
                unique_traders_5m,
                sampled_at: parse_rfc3339(&sampled_at)?,
                source,
            })
        })
        .transpose()
    }

    async fn get_shadow_metrics(
        &self,
        since: DateTime<Utc>,
        token_id: Option<TokenId>,
    ) -> Result<ShadowMetrics, RunnerError> {
        let rows: Vec<(bool, Option<String>)> = {
            let conn = self.conn.lock();
            let (sql, token_filter) = match token_id {
                Some(id) => (
                    "SELECT simulate_ok, shadow_compare FROM runs \
                     WHERE run_mode = 'primary' AND created_at >= ?1 AND token_id = ?2",
                    Some(id),
                ),
                None => (
                    "SELECT simulate_ok, shadow_compare FROM runs \
                     WHERE run_mode = 'primary' AND created_at >= ?1",
                    None,
                ),
            };
            let mut stmt = conn.prepare_cached(sql).map_err(sql_err)?;
            let rows = if let Some(id) = token_filter {
                stmt.query_map(params![since.to_rfc3339(), id], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
            } else {
                stmt.query_map(params![since.to_rfc3339()], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
            }
            .map_err(sql_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)?
        };

        let mut metrics = ShadowMetrics::default();
        let mut primary_successes = 0u64;
        let mut shadow_successes = 0u64;
        for (simulate_ok, shadow_json) in &rows {
            metrics.total_runs += 1;
            if *simulate_ok {
                primary_successes += 1;
            }
            if let Some(json) = shadow_json {
                let compare: ShadowCompare = from_json(json)?;
                if compare.diverged {
                    metrics.diverged_runs += 1;
                }
                if compare.legacy_kind != crate::models::PlanKind::Blocked {
                    shadow_successes += 1;
                }
            }
        }
        if metrics.total_runs > 0 {
            metrics.primary_success_rate = primary_successes as f64 / metrics.total_runs as f64;
            metrics.shadow_would_have_succeeded_rate =
                shadow_successes as f64 / metrics.total_runs as f64;
        }
        Ok(metrics)
    }

    async fn get_safety_config(&self, token_id: TokenId) -> Result<Option<SafetyConfig>, RunnerError> {
        let row: Option<(String, String, String, String, u32, i64, u32, String)> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT allowed_tokens, blocked_tokens, max_trade_amount, max_daily_amount, \
                    max_slippage_bps, cooldown_seconds, max_runs_per_day, allowed_dexes \
                 FROM user_safety_configs WHERE token_id = ?1",
                [token_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                },
            )
            .optional()
            .map_err(sql_err)?
        };

        row.map(
            |(
                allowed_tokens,
                blocked_tokens,
                max_trade_amount,
                max_daily_amount,
                max_slippage_bps,
                cooldown_seconds,
                max_runs_per_day,
                allowed_dexes,
            )| {
                Ok(SafetyConfig {
                    token_id,
                    allowed_tokens: text_to_json_list(&allowed_tokens),
                    blocked_tokens: text_to_json_list(&blocked_tokens),
                    max_trade_amount: bigint_from_text(&max_trade_amount)?,
                    max_daily_amount: bigint_from_text(&max_daily_amount)?,
                    max_slippage_bps,
                    cooldown_seconds,
                    max_runs_per_day,
                    allowed_dexes: text_to_json_list(&allowed_dexes),
                })
            },
        )
        .transpose()
    }

    async fn upsert_safety_config(&self, cfg: SafetyConfig) -> Result<(), RunnerError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO user_safety_configs (token_id, allowed_tokens, blocked_tokens, \
                max_trade_amount, max_daily_amount, max_slippage_bps, cooldown_seconds, \
                max_runs_per_day, allowed_dexes) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9) \
             ON CONFLICT(token_id) DO UPDATE SET \
                allowed_tokens=excluded.allowed_tokens, blocked_tokens=excluded.blocked_tokens, \
                max_trade_amount=excluded.max_trade_amount, max_daily_amount=excluded.max_daily_amount, \
                max_slippage_bps=excluded.max_slippage_bps, cooldown_seconds=excluded.cooldown_seconds, \
                max_runs_per_day=excluded.max_runs_per_day, allowed_dexes=excluded.allowed_dexes",
            params![
                cfg.token_id,
                json_list_to_text(&cfg.allowed_tokens),
                json_list_to_text(&cfg.blocked_tokens),
                bigint_to_text(&cfg.max_trade_amount),
                bigint_to_text(&cfg.max_daily_amount),
                cfg.max_slippage_bps,
                cfg.cooldown_seconds,
                cfg.max_runs_per_day,
                json_list_to_text(&cfg.allowed_dexes),
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn get_safety_metrics(&self, token_id: TokenId) -> Result<SafetyMetrics, RunnerError> {
        let conn = self.conn.lock();
        let total_runs: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM runs WHERE token_id = ?1",
                [token_id],
                |r| r.get(0),
            )
            .map_err(sql_err)?;
        let blocked_runs: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM runs WHERE token_id = ?1 AND violation_code IS NOT NULL",
                [token_id],
                |r| r.get(0),
            )
            .map_err(sql_err)?;

        let mut stmt = conn
            .prepare_cached(
                "SELECT violation_code, COUNT(*) FROM runs \
                 WHERE token_id = ?1 AND violation_code IS NOT NULL \
                 GROUP BY violation_code ORDER BY COUNT(*) DESC",
            )
            .map_err(sql_err)?;
        let violations_by_code = stmt
            .query_map([token_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;

        Ok(SafetyMetrics {
            total_runs: total_runs.max(0) as u64,
            blocked_runs: blocked_runs.max(0) as u64,
            violations_by_code,
        })
    }

    async fn get_safety_timeline(
        &self,
        token_id: TokenId,
        limit: usize,
    ) -> Result<Vec<SafetyTimelineEntry>, RunnerError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT created_at, violation_code FROM runs \
                 WHERE token_id = ?1 ORDER BY created_at DESC LIMIT ?2",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![token_id, limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;

        rows.into_iter()
            .map(|(at, violation_code)| {
                Ok(SafetyTimelineEntry {
                    at: parse_rfc3339(&at)?,
                    blocked: violation_code.is_some(),
                    violation_code,
                })
            })
            .collect()
    }

    async fn get_safety_violations(
        &self,
        token_id: TokenId,
        limit: usize,
    ) -> Result<Vec<SafetyViolationEntry>, RunnerError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT created_at, violation_code, error_code, action_type FROM runs \
                 WHERE token_id = ?1 AND violation_code IS NOT NULL \
                 ORDER BY created_at DESC LIMIT ?2",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![token_id, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;

        rows.into_iter()
            .map(|(at, violation_code, error_code, action_type)| {
                Ok(SafetyViolationEntry {
                    at: parse_rfc3339(&at)?,
                    violation_code,
                    error_code,
                    action_type,
                })
            })
            .collect()
    }

    async fn get_blueprint(&self, agent_type: &str) -> Result<Option<Blueprint>, RunnerError> {
        let row: Option<(String, String, String, String, String, String, Option<String>)> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT agent_type, brain, perception, actions, guardrails, memory, llm_config \
                 FROM agent_blueprints WHERE agent_type = ?1",
                [agent_type],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()
            .map_err(sql_err)?
        };
        row.map(blueprint_from_row).transpose()
    }

    async fn list_blueprints(&self) -> Result<Vec<Blueprint>, RunnerError> {
        let rows: Vec<(String, String, String, String, String, String, Option<String>)> = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare_cached(
                    "SELECT agent_type, brain, perception, actions, guardrails, memory, llm_config \
                     FROM agent_blueprints",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                })
                .map_err(sql_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)?
        };
        rows.into_iter().map(blueprint_from_row).collect()
    }

    async fn upsert_blueprint(&self, b: &Blueprint) -> Result<(), RunnerError> {
        let actions = json_list_to_text(&b.actions);
        let guardrails = json_list_to_text(&b.guardrails);
        let llm_config = b.llm_config.as_ref().map(to_json).transpose()?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agent_blueprints (agent_type, brain, perception, actions, guardrails, memory, llm_config) \
             VALUES (?1,?2,?3,?4,?5,?6,?7) \
             ON CONFLICT(agent_type) DO UPDATE SET \
                brain=excluded.brain, perception=excluded.perception, actions=excluded.actions, \
                guardrails=excluded.guardrails, memory=excluded.memory, llm_config=excluded.llm_config",
            params![b.agent_type, b.brain, b.perception, actions, guardrails, b.memory, llm_config],
        )
        .map_err(sql_err)?;
        Ok(())
    }
}

fn blueprint_from_row(
    row: (String, String, String, String, String, String, Option<String>),
) -> Result<Blueprint, RunnerError> {
    let (agent_type, brain, perception, actions, guardrails, memory, llm_config) = row;
    Ok(Blueprint {
        agent_type,
        brain,
        perception,
        actions: text_to_json_list(&actions),
        guardrails: text_to_json_list(&guardrails),
        memory,
        llm_config: opt_from_json(llm_config)?,
    })
}

fn insert_market_signal(conn: &Connection, signal: &MarketSignal) -> Result<(), RunnerError> {
    // A row is only as fresh as its `sampled_at`: an out-of-order upsert
    // (a late signal arriving after a newer one was already stored) must
    // not regress it, so every column that describes that sample is only
    // applied when the incoming row is newer than what's stored (§8
    // "idempotent market upsert... sampledAt is monotone non-decreasing").
    conn.execute(
        "INSERT INTO market_signals (chain_id, pair, price_change_bps, volume_5m, \
            unique_traders_5m, sampled_at, source) \
         VALUES (?1,?2,?3,?4,?5,?6,?7) \
         ON CONFLICT(chain_id, pair) DO UPDATE SET \
            price_change_bps=CASE WHEN excluded.sampled_at > market_signals.sampled_at \
                THEN excluded.price_change_bps ELSE market_signals.price_change_bps END, \
            volume_5m=CASE WHEN excluded.sampled_at > market_signals.sampled_at \
                THEN excluded.volume_5m ELSE market_signals.volume_5m END, \
            unique_traders_5m=CASE WHEN excluded.sampled_at > market_signals.sampled_at \
                THEN excluded.unique_traders_5m ELSE market_signals.unique_traders_5m END, \
            source=CASE WHEN excluded.sampled_at > market_signals.sampled_at \
                THEN excluded.source ELSE market_signals.source END, \
            sampled_at=CASE WHEN excluded.sampled_at > market_signals.sampled_at \
                THEN excluded.sampled_at ELSE market_signals.sampled_at END",
        params![
            signal.chain_id,
            signal.pair,
            signal.price_change_bps,
            bigint_to_text(&signal.volume_5m),
            signal.unique_traders_5m,
            signal.sampled_at.to_rfc3339(),
            signal.source,
        ],
    )
    .map_err(sql_err)?;
    Ok(())
}

fn memory_type_str(t: MemoryEntryType) -> &'static str {
    match t {
        MemoryEntryType::Execution => "execution",
        MemoryEntryType::Decision => "decision",
        MemoryEntryType::Blocked => "blocked",
        MemoryEntryType::Observation => "observation",
        MemoryEntryType::Goal => "goal",
        MemoryEntryType::UserMessage => "user_message",
        MemoryEntryType::AgentReply => "agent_reply",
    }
}

fn memory_type_from_str(s: &str) -> Result<MemoryEntryType, RunnerError> {
    Ok(match s {
        "execution" => MemoryEntryType::Execution,
        "decision" => MemoryEntryType::Decision,
        "blocked" => MemoryEntryType::Blocked,
        "observation" => MemoryEntryType::Observation,
        "goal" => MemoryEntryType::Goal,
        "user_message" => MemoryEntryType::UserMessage,
        "agent_reply" => MemoryEntryType::AgentReply,
        other => return Err(RunnerError::storage_error(format!("unknown memory entry_type: {other}"))),
    })
}

fn run_mode_str(m: RunMode) -> &'static str {
    match m {
        RunMode::Primary => "primary",
        RunMode::Shadow => "shadow",
    }
}

fn run_mode_from_str(s: &str) -> Result<RunMode, RunnerError> {
    Ok(match s {
        "primary" => RunMode::Primary,
        "shadow" => RunMode::Shadow,
        other => return Err(RunnerError::storage_error(format!("unknown run_mode: {other}"))),
    })
}

fn error_code_from_str(s: &str) -> Result<ErrorCode, RunnerError> {
    // Stored via Display (SCREAMING_SNAKE_CASE); round-trip through the
    // same table `from_violation_code`/`from_error_message` use.
    Ok(match s {
        "MODEL_UNKNOWN_ACTION" => ErrorCode::ModelUnknownAction,
        "MODEL_SCHEMA_VALIDATION_FAILED" => ErrorCode::ModelSchemaValidationFailed,
        "MODEL_LOW_CONFIDENCE" => ErrorCode::ModelLowConfidence,
        "BUSINESS_POLICY_ALLOWED_DEX" => ErrorCode::BusinessPolicyAllowedDex,
        "BUSINESS_POLICY_MAX_TRADE_AMOUNT" => ErrorCode::BusinessPolicyMaxTradeAmount,
        "BUSINESS_POLICY_COOLDOWN" => ErrorCode::BusinessPolicyCooldown,
        "BUSINESS_POLICY_MAX_RUNS_PER_DAY" => ErrorCode::BusinessPolicyMaxRunsPerDay,
        "BUSINESS_POLICY_MAX_DAILY_AMOUNT" => ErrorCode::BusinessPolicyMaxDailyAmount,
        "BUSINESS_POLICY_ALLOWED_TOKENS" => ErrorCode::BusinessPolicyAllowedTokens,
        "BUSINESS_POLICY_BLOCKED_TOKENS" => ErrorCode::BusinessPolicyBlockedTokens,
        "BUSINESS_POLICY_MAX_SLIPPAGE_BPS" => ErrorCode::BusinessPolicyMaxSlippageBps,
        "BUSINESS_POLICY_HARD_REJECTED" => ErrorCode::BusinessPolicyHardRejected,
        "BUSINESS_POLICY_HARD_SIMULATION_REVERTED" => ErrorCode::BusinessPolicyHardSimulationReverted,
        "BUSINESS_AGENT_PAUSED" => ErrorCode::BusinessAgentPaused,
        "BUSINESS_CIRCUIT_BREAKER" => ErrorCode::BusinessCircuitBreaker,
        "BUSINESS_CHAIN_REVERTED" => ErrorCode::BusinessChainReverted,
        "BUSINESS_UNAUTHORIZED" => ErrorCode::BusinessUnauthorized,
        "BUSINESS_INSUFFICIENT_GAS" => ErrorCode::BusinessInsufficientGas,
        "BUSINESS_INSUFFICIENT_FUNDS" => ErrorCode::BusinessInsufficientFunds,
        "INFRA_RATE_LIMIT" => ErrorCode::InfraRateLimit,
        "INFRA_TIMEOUT" => ErrorCode::InfraTimeout,
        "INFRA_NETWORK" => ErrorCode::InfraNetwork,
        "INFRA_RUNTIME_EXCEPTION" => ErrorCode::InfraRuntimeException,
        other => return Err(RunnerError::storage_error(format!("unknown error_code: {other}"))),
    })
}

fn failure_category_from_str(s: &str) -> Result<FailureCategory, RunnerError> {
    Ok(match s {
        "model_output_error" => FailureCategory::ModelOutputError,
        "business_rejected" => FailureCategory::BusinessRejected,
        "infrastructure_error" => FailureCategory::InfrastructureError,
        other => {
            return Err(RunnerError::storage_error(format!(
                "unknown failure_category: {other}"
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExecutionTraceEntry;
    use crate::models::{PlanKind, TraceStatus};
    use num_traits::Zero;

    fn sample_strategy(token_id: TokenId) -> StrategyConfig {
        let now = Utc::now();
        StrategyConfig {
            token_id,
            chain_id: 1,
            strategy_type: "hotpump_watchlist".to_string(),
            target: "0xdex".to_string(),
            data: "0x".to_string(),
            value: BigInt::zero(),
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
            daily_value_used: BigInt::zero(),
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_run(token_id: TokenId) -> RunRecord {
        RunRecord {
            id: None,
            chain_id: 1,
            token_id,
            action_type: "swap".to_string(),
            action_hash: "abc123".to_string(),
            simulate_ok: true,
            tx_hash: Some("0xtx".to_string()),
            error: None,
            error_code: None,
            failure_category: None,
            violation_code: None,
            brain_type: Some("llm".to_string()),
            intent_type: Some("swap".to_string()),
            decision_reason: Some("good entry".to_string()),
            decision_message: None,
            execution_trace: vec![ExecutionTraceEntry {
                stage: "observe".to_string(),
                status: TraceStatus::Ok,
                at: Utc::now(),
                note: None,
                meta: None,
            }],
            run_mode: RunMode::Primary,
            shadow_compare: None,
            gas_used: Some(BigInt::from(21000)),
            pnl_usd: Some(1.5),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn strategy_round_trips_through_upsert_and_get() {
        let store = SqliteStore::open_in_memory().unwrap();
        let strategy = sample_strategy(1);
        store.upsert_strategy(&strategy).await.unwrap();
        let fetched = store.get_strategy(1).await.unwrap().unwrap();
        assert_eq!(fetched.token_id, 1);
        assert_eq!(fetched.value, BigInt::zero());
        assert_eq!(fetched.strategy_type, "hotpump_watchlist");
    }

    #[tokio::test]
    async fn select_runnable_respects_next_check_at_and_enabled() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();

        let mut runnable = sample_strategy(1);
        runnable.next_check_at = now - chrono::Duration::seconds(1);
        store.upsert_strategy(&runnable).await.unwrap();

        let mut not_yet = sample_strategy(2);
        not_yet.next_check_at = now + chrono::Duration::hours(1);
        store.upsert_strategy(&not_yet).await.unwrap();

        let mut disabled = sample_strategy(3);
        disabled.enabled = false;
        disabled.next_check_at = now - chrono::Duration::seconds(1);
        store.upsert_strategy(&disabled).await.unwrap();

        let ids = store.select_runnable(now).await.unwrap();
        assert_eq!(ids, vec![1]);
    }

    #[tokio::test]
    async fn record_run_trims_to_max_run_records() {
        let store = SqliteStore::open_in_memory().unwrap();
        let strategy = sample_strategy(1);
        store.upsert_strategy(&strategy).await.unwrap();

        for _ in 0..5 {
            store
                .record_run_and_update_strategy(&sample_run(1), &strategy, 3)
                .await
                .unwrap();
        }

        let count = store.count_runs_for_chain(1).await.unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn memory_recall_orders_newest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        for i in 0..3 {
            store
                .append_memory(MemoryEntry {
                    token_id: 1,
                    entry_type: MemoryEntryType::Decision,
                    action: Some(format!("action-{i}")),
                    params: None,
                    result: None,
                    reasoning: None,
                    timestamp: Utc::now() + chrono::Duration::seconds(i),
                })
                .await
                .unwrap();
        }
        let recalled = store.recall_memory(1, 10).await.unwrap();
        assert_eq!(recalled.len(), 3);
        assert_eq!(recalled[0].action.as_deref(), Some("action-2"));
    }

    #[tokio::test]
    async fn shadow_metrics_counts_divergence() {
        let store = SqliteStore::open_in_memory().unwrap();
        let strategy = sample_strategy(1);
        store.upsert_strategy(&strategy).await.unwrap();

        let mut run = sample_run(1);
        run.shadow_compare = Some(ShadowCompare {
            primary_kind: PlanKind::Write,
            legacy_kind: PlanKind::Blocked,
            primary_action: Some("swap".to_string()),
            legacy_action: None,
            primary_error_code: None,
            legacy_error_code: None,
            diverged: true,
            reason: Some("legacy lacked schema validation".to_string()),
            at: Utc::now(),
        });
        store
            .record_run_and_update_strategy(&run, &strategy, 100)
            .await
            .unwrap();

        let metrics = store
            .get_shadow_metrics(Utc::now() - chrono::Duration::hours(1), None)
            .await
            .unwrap();
        assert_eq!(metrics.total_runs, 1);
        assert_eq!(metrics.diverged_runs, 1);
    }

    fn sample_market_signal(sampled_at: DateTime<Utc>, price_change_bps: i64) -> MarketSignal {
        MarketSignal {
            chain_id: 1,
            pair: "ETH/USDC".to_string(),
            price_change_bps,
            volume_5m: BigInt::from(1_000_000),
            unique_traders_5m: 10,
            sampled_at,
            source: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn market_signal_upsert_keeps_sampled_at_monotone_non_decreasing() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();

        store
            .upsert_market_signal(sample_market_signal(now, 100))
            .await
            .unwrap();

        // A late, out-of-order signal arrives with an older sampled_at:
        // it must not regress the stored row at all.
        store
            .upsert_market_signal(sample_market_signal(
                now - chrono::Duration::seconds(30),
                -500,
            ))
            .await
            .unwrap();

        let stored = store.get_market_signal(1, "ETH/USDC").await.unwrap().unwrap();
        assert_eq!(stored.sampled_at, now);
        assert_eq!(stored.price_change_bps, 100);

        // A genuinely newer signal still updates everything, including
        // sampled_at.
        let later = now + chrono::Duration::seconds(30);
        store
            .upsert_market_signal(sample_market_signal(later, 250))
            .await
            .unwrap();

        let stored = store.get_market_signal(1, "ETH/USDC").await.unwrap().unwrap();
        assert_eq!(stored.sampled_at, later);
        assert_eq!(stored.price_change_bps, 250);
    }
}
