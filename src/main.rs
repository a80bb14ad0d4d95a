//! Autopilot runner: boots the scheduler, the background market-signal
//! sync loop, and the control-plane HTTP surface, then waits for a
//! shutdown signal.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use autopilot_runner::api::{self, AppState};
use autopilot_runner::background_sync::{BackgroundSync, MarketSignalSource};
use autopilot_runner::chain::{mock::MockChain, Chain};
use autopilot_runner::cognitive_cycle::CycleDeps;
use autopilot_runner::config::RunnerConfig;
use autopilot_runner::errors::RunnerError;
use autopilot_runner::factory::{AgentFactory, BlueprintCache, Registries};
use autopilot_runner::models::{ChainAgentData, MarketSignal};
use autopilot_runner::persistence::sqlite::SqliteStore;
use autopilot_runner::persistence::PersistenceStore;
use autopilot_runner::planner::CanonicalPlanner;
use autopilot_runner::scheduler::{AgentDirectory, Scheduler};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Reads the agent fleet's identity rows straight from the persistence
/// store. Real on-chain discovery (reading NFA token metadata) is chain
/// I/O and out of scope for this core (`spec.md` §1); operators populate
/// `autopilots` via `POST /strategy/upsert`.
struct StoreBackedDirectory {
    store: Arc<dyn PersistenceStore>,
}

#[async_trait]
impl AgentDirectory for StoreBackedDirectory {
    async fn list_agents(&self) -> Result<Vec<ChainAgentData>, RunnerError> {
        let agents = self.store.list_agents().await?;
        Ok(agents
            .into_iter()
            .map(|a| ChainAgentData {
                token_id: a.token_id,
                agent_type: a.agent_type,
                owner: a.owner,
                renter: a.renter,
                vault: a.vault,
                strategy_params: None,
            })
            .collect())
    }
}

/// Market-signal ingestion is out of scope for this core (`spec.md` §1,
/// "Market signal ingestion"); this stub keeps the background sync loop
/// running harmlessly until a real feed is wired in via `/market/signal`.
struct NullMarketSignalSource;

#[async_trait]
impl MarketSignalSource for NullMarketSignalSource {
    async fn fetch(&self) -> Result<Vec<MarketSignal>, RunnerError> {
        Ok(Vec::new())
    }
}

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = RunnerConfig::from_env().context("loading runner configuration")?;
    tracing::info!(
        chain_id = config.chain_id,
        poll_interval_ms = config.poll_interval_ms,
        "starting autopilot-runner"
    );

    let store: Arc<dyn PersistenceStore> =
        Arc::new(SqliteStore::open(&config.database_path).context("opening persistence store")?);

    let chain: Arc<dyn Chain> = Arc::new(MockChain {
        validator_address: config.hard_validator_address.clone(),
        ..MockChain::default()
    });

    let blueprints = Arc::new(
        BlueprintCache::load(store.clone())
            .await
            .context("loading agent blueprints")?,
    );
    let registries = Arc::new(Registries::with_defaults(store.clone(), chain.clone()));
    let factory = Arc::new(AgentFactory::new(blueprints, registries));

    let deps = Arc::new(CycleDeps {
        store: store.clone(),
        chain: chain.clone(),
        planner: Arc::new(CanonicalPlanner),
        config: Arc::new(config.clone()),
    });

    let directory: Arc<dyn AgentDirectory> = Arc::new(StoreBackedDirectory {
        store: store.clone(),
    });

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        directory,
        factory,
        deps,
        config.max_concurrent_cycles,
        config.poll_interval(),
    ));
    let shutdown = scheduler.shutdown_handle();

    let background_sync = BackgroundSync::new(
        Arc::new(NullMarketSignalSource),
        store.clone(),
        config.poll_interval(),
    );
    let background_cancel = autopilot_runner::cognitive_cycle::CancelToken::new();

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("installing prometheus recorder")?;
    let app_state = AppState {
        store: store.clone(),
        api_key: config.api_key.clone(),
        prometheus_handle,
        shutdown: Some(shutdown.clone()),
    };
    let router = api::router(app_state);

    let listener = tokio::net::TcpListener::bind((config.http_host.as_str(), config.http_port))
        .await
        .with_context(|| format!("binding {}:{}", config.http_host, config.http_port))?;
    tracing::info!(addr = %listener.local_addr().unwrap(), "control plane listening");

    let scheduler_task = tokio::spawn(scheduler.clone().run());
    let sync_cancel_for_task = background_cancel.clone();
    let sync_task = tokio::spawn(background_sync.run(sync_cancel_for_task));
    let http_task = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        res = scheduler_task => {
            tracing::warn!(?res, "scheduler task ended unexpectedly");
        }
        res = http_task => {
            tracing::warn!(?res, "http task ended unexpectedly");
        }
    }

    shutdown.trigger();
    background_cancel.cancel();
    tokio::time::sleep(config.graceful_shutdown()).await;
    sync_task.abort();

    tracing::info!("autopilot-runner stopped");
    Ok(())
}
