//! Control-plane HTTP surface (§6): thin axum handlers delegating to the
//! persistence contract and scheduler. No business logic lives here —
//! this binds the administrative operations spec.md calls "out of
//! scope" to a concrete, runnable surface, the same way the teacher's
//! `api` module is a thin layer over its storage/engine types.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::errors::{FailureCategory, RunnerError};
use crate::middleware::rate_limit::{rate_limit_middleware, RateLimitConfig, RateLimitLayer};
use crate::models::{AgentIdentity, MarketSignal, StrategyConfig, TokenId};
use crate::persistence::PersistenceStore;
use crate::scheduler::ShutdownHandle;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PersistenceStore>,
    pub api_key: Option<String>,
    pub prometheus_handle: PrometheusHandle,
    pub shutdown: Option<ShutdownHandle>,
}

impl IntoResponse for RunnerError {
    fn into_response(self) -> Response {
        let status = match self.category {
            FailureCategory::ModelOutputError => StatusCode::UNPROCESSABLE_ENTITY,
            FailureCategory::BusinessRejected => StatusCode::BAD_REQUEST,
            FailureCategory::InfrastructureError => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = json!({
            "error": self.code.to_string(),
            "category": self.category.to_string(),
            "message": self.user_message,
            "retryable": self.retryable,
        });
        (status, Json(body)).into_response()
    }
}

/// Build the full router: public surface, then the API-key-gated
/// surface merged on top, mirroring the teacher's
/// `public_routes`/`protected_routes` split in `main.rs`.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/status/all", get(status_all))
        .route("/autopilots", get(autopilots))
        .route("/shadow/metrics", get(shadow_metrics))
        .route("/v3/safety/:token_id/metrics", get(safety_metrics))
        .route("/v3/safety/:token_id/timeline", get(safety_timeline))
        .route("/v3/safety/:token_id/violations", get(safety_violations))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/enable", post(enable))
        .route("/disable", post(disable))
        .route("/strategy/upsert", post(strategy_upsert))
        .route("/market/signal", post(market_signal))
        .route("/market/signal/batch", post(market_signal_batch))
        .route("/market/signal/sync", post(market_signal_batch))
        .route("/metrics", get(metrics))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            api_key_middleware,
        ))
        .with_state(state);

    let limiter = RateLimitLayer::new(RateLimitConfig::default());

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(
            crate::middleware::logging::request_logging_simple,
        ))
        .layer(axum::middleware::from_fn_with_state(
            limiter,
            rate_limit_middleware,
        ))
}

/// Single shared-secret check (`x-api-key` header) — simplified relative
/// to the teacher's three-role JWT RBAC since this system has one
/// operator persona (SPEC_FULL §6). A no-op when no key is configured.
async fn api_key_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let Some(expected) = &state.api_key else {
        return next.run(req).await;
    };
    let provided = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    if provided == Some(expected.as_str()) {
        next.run(req).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "UNAUTHORIZED", "message": "missing or invalid x-api-key"})),
        )
            .into_response()
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.prometheus_handle.render()
}

#[derive(Debug, Deserialize)]
struct Permit {
    #[serde(rename = "tokenId")]
    token_id: TokenId,
    #[allow(dead_code)]
    renter: Option<String>,
    #[allow(dead_code)]
    operator: Option<String>,
    #[allow(dead_code)]
    expires: Option<i64>,
    #[allow(dead_code)]
    nonce: Option<i64>,
    #[allow(dead_code)]
    deadline: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct EnableRequest {
    permit: Permit,
    #[allow(dead_code)]
    sig: Option<String>,
    #[allow(dead_code)]
    chain_id: Option<i64>,
    #[allow(dead_code)]
    nfa_address: Option<String>,
    #[allow(dead_code)]
    wait_for_receipt: Option<bool>,
}

/// Verifying the permit signature against the NFA contract is chain I/O,
/// out of scope for this core (`spec.md` §1); this handler performs the
/// local state transition the scheduler depends on — the signature check
/// belongs to whatever process fronts this core with real RPC access.
async fn enable(
    State(state): State<AppState>,
    Json(req): Json<EnableRequest>,
) -> Result<impl IntoResponse, RunnerError> {
    let token_id = req.permit.token_id;
    let mut strategy = state
        .store
        .get_strategy(token_id)
        .await?
        .ok_or_else(|| RunnerError::storage_error(format!("no strategy for token {token_id}")))?;
    strategy.enabled = true;
    strategy.failure_count = 0;
    strategy.last_error = None;
    strategy.updated_at = Utc::now();
    state.store.upsert_strategy(&strategy).await?;
    Ok(Json(json!({"tokenId": token_id, "enabled": true})))
}

#[derive(Debug, Deserialize)]
struct DisableRequest {
    #[serde(rename = "tokenId")]
    token_id: TokenId,
    #[allow(dead_code)]
    mode: Option<String>,
    #[allow(dead_code)]
    wait_for_receipt: Option<bool>,
    reason: Option<String>,
}

async fn disable(
    State(state): State<AppState>,
    Json(req): Json<DisableRequest>,
) -> Result<impl IntoResponse, RunnerError> {
    let mut strategy = state
        .store
        .get_strategy(req.token_id)
        .await?
        .ok_or_else(|| RunnerError::storage_error(format!("no strategy for token {}", req.token_id)))?;
    strategy.enabled = false;
    strategy.last_error = req.reason.clone();
    strategy.updated_at = Utc::now();
    state.store.upsert_strategy(&strategy).await?;
    Ok(Json(json!({"tokenId": req.token_id, "enabled": false})))
}

async fn strategy_upsert(
    State(state): State<AppState>,
    Json(strategy): Json<StrategyConfig>,
) -> Result<impl IntoResponse, RunnerError> {
    state.store.upsert_strategy(&strategy).await?;
    let identity = AgentIdentity {
        token_id: strategy.token_id,
        agent_type: strategy.strategy_type.clone(),
        owner: String::new(),
        renter: None,
        vault: strategy.target.clone(),
    };
    if state.store.get_agent(strategy.token_id).await?.is_none() {
        state.store.upsert_agent(&identity).await?;
    }
    Ok(Json(json!({"tokenId": strategy.token_id, "upserted": true})))
}

async fn market_signal(
    State(state): State<AppState>,
    Json(signal): Json<MarketSignal>,
) -> Result<impl IntoResponse, RunnerError> {
    state.store.upsert_market_signal(signal).await?;
    Ok(Json(json!({"upserted": 1})))
}

async fn market_signal_batch(
    State(state): State<AppState>,
    Json(signals): Json<Vec<MarketSignal>>,
) -> Result<impl IntoResponse, RunnerError> {
    let n = signals.len();
    state.store.batch_upsert_market_signals(signals).await?;
    Ok(Json(json!({"upserted": n})))
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    #[serde(rename = "tokenId")]
    token_id: TokenId,
    #[serde(rename = "runsLimit")]
    runs_limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    identity: Option<AgentIdentity>,
    strategy: Option<StrategyConfig>,
    recent_runs: JsonValue,
}

async fn status(
    State(state): State<AppState>,
    Query(q): Query<StatusQuery>,
) -> Result<impl IntoResponse, RunnerError> {
    let identity = state.store.get_agent(q.token_id).await?;
    let strategy = state.store.get_strategy(q.token_id).await?;
    let runs = state
        .store
        .list_runs(q.token_id, q.runs_limit.unwrap_or(20))
        .await?;
    Ok(Json(StatusResponse {
        identity,
        strategy,
        recent_runs: serde_json::to_value(runs).unwrap_or(JsonValue::Null),
    }))
}

async fn status_all(State(state): State<AppState>) -> Result<impl IntoResponse, RunnerError> {
    let agents = state.store.list_agents().await?;
    let mut out = Vec::with_capacity(agents.len());
    for agent in agents {
        let strategy = state.store.get_strategy(agent.token_id).await?;
        out.push(json!({"identity": agent, "strategy": strategy}));
    }
    Ok(Json(out))
}

async fn autopilots(State(state): State<AppState>) -> Result<impl IntoResponse, RunnerError> {
    let agents = state.store.list_agents().await?;
    Ok(Json(agents))
}

#[derive(Debug, Deserialize)]
struct ShadowMetricsQuery {
    #[serde(rename = "tokenId")]
    token_id: Option<TokenId>,
    #[serde(rename = "sinceHours")]
    since_hours: Option<i64>,
}

async fn shadow_metrics(
    State(state): State<AppState>,
    Query(q): Query<ShadowMetricsQuery>,
) -> Result<impl IntoResponse, RunnerError> {
    let since: DateTime<Utc> = Utc::now() - chrono::Duration::hours(q.since_hours.unwrap_or(24));
    let metrics = state.store.get_shadow_metrics(since, q.token_id).await?;
    Ok(Json(metrics))
}

#[derive(Debug, Deserialize)]
struct SafetyQuery {
    limit: Option<usize>,
}

async fn safety_metrics(
    State(state): State<AppState>,
    Path(token_id): Path<TokenId>,
) -> Result<impl IntoResponse, RunnerError> {
    let metrics = state.store.get_safety_metrics(token_id).await?;
    Ok(Json(metrics))
}

async fn safety_timeline(
    State(state): State<AppState>,
    Path(token_id): Path<TokenId>,
    Query(q): Query<SafetyQuery>,
) -> Result<impl IntoResponse, RunnerError> {
    let timeline = state
        .store
        .get_safety_timeline(token_id, q.limit.unwrap_or(100))
        .await?;
    Ok(Json(timeline))
}

async fn safety_violations(
    State(state): State<AppState>,
    Path(token_id): Path<TokenId>,
    Query(q): Query<SafetyQuery>,
) -> Result<impl IntoResponse, RunnerError> {
    let violations = state
        .store
        .get_safety_violations(token_id, q.limit.unwrap_or(100))
        .await?;
    Ok(Json(violations))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::sqlite::SqliteStore;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use num_bigint::BigInt;
    use tower::ServiceExt;

    /// The rate-limit layer needs `ConnectInfo`, which `axum::serve` only
    /// injects via `into_make_service_with_connect_info`; tests exercise
    /// the router directly with `oneshot`, so they must stand one up.
    fn with_peer(mut req: Request<Body>) -> Request<Body> {
        let addr: std::net::SocketAddr = "127.0.0.1:9999".parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(addr));
        req
    }

    fn state(api_key: Option<&str>) -> AppState {
        let store: Arc<dyn PersistenceStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        AppState {
            store,
            api_key: api_key.map(str::to_string),
            prometheus_handle: handle,
            shutdown: None,
        }
    }

    #[tokio::test]
    async fn health_is_always_public() {
        let app = router(state(Some("secret")));
        let resp = app
            .oneshot(with_peer(
                Request::builder().uri("/health").body(Body::empty()).unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn protected_route_rejects_missing_key() {
        let app = router(state(Some("secret")));
        let body = Body::from(
            r#"{"token_id":1,"chain_id":1,"strategy_type":"x","target":"0x","data":"0x","value":"0","min_interval_ms":1000,"require_positive_balance":false,"max_failures":5,"failure_count":0,"enabled":true,"next_check_at":"2026-01-01T00:00:00Z","budget_day":"2026-01-01","daily_runs_used":0,"daily_value_used":"0","created_at":"2026-01-01T00:00:00Z","updated_at":"2026-01-01T00:00:00Z"}"#
                .to_string(),
        );
        let req = Request::builder()
            .method("POST")
            .uri("/strategy/upsert")
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let resp = app.oneshot(with_peer(req)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn market_signal_round_trips_through_the_store() {
        let s = state(None);
        let store = s.store.clone();
        let app = router(s);
        let body = json!({
            "chain_id": 1,
            "pair": "WETH/USDC",
            "price_change_bps": 120,
            "volume_5m": "500000",
            "unique_traders_5m": 4,
            "sampled_at": "2026-01-01T00:00:00Z",
            "source": "test",
        });
        let req = Request::builder()
            .method("POST")
            .uri("/market/signal")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.oneshot(with_peer(req)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let stored = store.get_market_signal(1, "WETH/USDC").await.unwrap();
        assert!(stored.is_some());
        assert_eq!(stored.unwrap().volume_5m, BigInt::from(500_000));
    }
}
