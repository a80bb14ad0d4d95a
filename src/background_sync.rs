//! Background market-signal sync (§4.1 "isolated from the scheduler's
//! singleflight/concurrency machinery"; SPEC_FULL ambient-stack note on
//! decoupling slow upstream polls from the cognitive cycle). Mirrors the
//! teacher's scraper-loop shape: an isolated `tokio::time::interval` task
//! that never blocks agent cycles.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;

use crate::errors::RunnerError;
use crate::models::MarketSignal;
use crate::persistence::PersistenceStore;

/// Out of scope for this core to implement concretely (`spec.md` §1):
/// pulling real market data is external I/O. Only the contract the
/// background sync loop depends on lives here.
#[async_trait]
pub trait MarketSignalSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<MarketSignal>, RunnerError>;
}

pub struct BackgroundSync {
    source: Arc<dyn MarketSignalSource>,
    store: Arc<dyn PersistenceStore>,
    interval: std::time::Duration,
}

impl BackgroundSync {
    pub fn new(
        source: Arc<dyn MarketSignalSource>,
        store: Arc<dyn PersistenceStore>,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            source,
            store,
            interval,
        }
    }

    /// Runs until cancelled. A fetch failure is logged and skipped — the
    /// next tick tries again; it never propagates into the scheduler.
    pub async fn run(self, cancel: crate::cognitive_cycle::CancelToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if cancel.is_cancelled() {
                tracing::info!("background sync cancelled, exiting");
                break;
            }
            if let Err(e) = self.sync_once().await {
                tracing::warn!(error = %e, "market signal sync failed");
            }
        }
    }

    async fn sync_once(&self) -> Result<(), RunnerError> {
        let signals = self.source.fetch().await?;
        if signals.is_empty() {
            return Ok(());
        }
        let n = signals.len();
        self.store.batch_upsert_market_signals(signals).await?;
        tracing::debug!(count = n, "synced market signals");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::sqlite::SqliteStore;
    use num_bigint::BigInt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedSource {
        pair: String,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MarketSignalSource for FixedSource {
        async fn fetch(&self) -> Result<Vec<MarketSignal>, RunnerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![MarketSignal {
                chain_id: 1,
                pair: self.pair.clone(),
                price_change_bps: 250,
                volume_5m: BigInt::from(1_000_000),
                unique_traders_5m: 12,
                sampled_at: chrono::Utc::now(),
                source: "test".to_string(),
            }])
        }
    }

    #[tokio::test]
    async fn sync_once_persists_fetched_signals() {
        let store: Arc<dyn PersistenceStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let source = Arc::new(FixedSource {
            pair: "WETH/USDC".to_string(),
            calls: AtomicUsize::new(0),
        });
        let sync = BackgroundSync::new(source, store.clone(), std::time::Duration::from_millis(1));

        sync.sync_once().await.unwrap();

        let signal = store.get_market_signal(1, "WETH/USDC").await.unwrap();
        assert!(signal.is_some());
        assert_eq!(signal.unwrap().price_change_bps, 250);
    }

    #[tokio::test]
    async fn run_exits_promptly_after_cancellation() {
        let store: Arc<dyn PersistenceStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let source = Arc::new(FixedSource {
            pair: "WETH/USDC".to_string(),
            calls: AtomicUsize::new(0),
        });
        let sync = BackgroundSync::new(source, store, std::time::Duration::from_millis(5));
        let cancel = crate::cognitive_cycle::CancelToken::new();
        let cancel2 = cancel.clone();

        let handle = tokio::spawn(sync.run(cancel2));
        tokio::time::sleep(std::time::Duration::from_millis(15)).await;
        cancel.cancel();

        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("background sync should exit promptly after cancellation")
            .unwrap();
    }
}
