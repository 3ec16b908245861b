//! # Strategy Manager
//!
//! Runs loads through the active strategy and keeps their metrics.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::CacheResult;
use crate::fetch::FetchFuture;
use crate::identity::PiletMetadata;
use crate::store::PiletStore;

use super::metrics::{MetricsSnapshot, StrategyMetrics};
use super::{CacheStrategy, StrategyKind};

#[derive(Debug)]
pub struct StrategyManager {
    strategy: RwLock<Arc<dyn CacheStrategy>>,
    metrics: Mutex<StrategyMetrics>,
    store: Arc<PiletStore>,
}

impl StrategyManager {
    pub fn new(store: Arc<PiletStore>, strategy: Arc<dyn CacheStrategy>) -> Self {
        Self {
            strategy: RwLock::new(strategy),
            metrics: Mutex::new(StrategyMetrics::new()),
            store,
        }
    }

    pub fn with_kind(store: Arc<PiletStore>, kind: StrategyKind) -> Self {
        Self::new(store, kind.into_strategy())
    }

    /// Manager over a strategy named leniently; unknown names use cache-first
    pub fn from_name(store: Arc<PiletStore>, name: &str) -> Self {
        Self::with_kind(store, StrategyKind::select(name))
    }

    /// Cache-first
    pub fn production(store: Arc<PiletStore>) -> Self {
        Self::with_kind(store, StrategyKind::CacheFirst)
    }

    /// Network-first
    pub fn development(store: Arc<PiletStore>) -> Self {
        Self::with_kind(store, StrategyKind::NetworkFirst)
    }

    /// Cache-only
    pub fn offline(store: Arc<PiletStore>) -> Self {
        Self::with_kind(store, StrategyKind::CacheOnly)
    }

    pub fn store(&self) -> &Arc<PiletStore> {
        &self.store
    }

    /// Load a pilet through the active strategy, recording the outcome.
    /// Errors are returned unchanged.
    pub async fn load(&self, pilet: &PiletMetadata, fetcher: FetchFuture) -> CacheResult<Bytes> {
        let strategy = self.strategy.read().clone();
        let started = Instant::now();

        match strategy.retrieve(&self.store, pilet, fetcher).await {
            Ok(retrieval) => {
                let elapsed = started.elapsed();
                self.metrics
                    .lock()
                    .record_success(elapsed, retrieval.source);
                debug!(
                    pilet = %pilet.identity(),
                    strategy = strategy.name(),
                    cache_hit = retrieval.is_cache_hit(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Pilet loaded"
                );
                Ok(retrieval.content)
            }
            Err(e) => {
                self.metrics.lock().record_error();
                Err(e)
            }
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.lock().snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.lock().reset();
    }

    /// Swap the active strategy. Metrics are kept.
    pub fn set_strategy(&self, strategy: Arc<dyn CacheStrategy>) {
        info!(strategy = strategy.name(), "Cache strategy changed");
        *self.strategy.write() = strategy;
    }

    pub fn set_kind(&self, kind: StrategyKind) {
        self.set_strategy(kind.into_strategy());
    }

    /// Swap the active strategy by name; unknown names use cache-first
    pub fn set_strategy_name(&self, name: &str) {
        self.set_kind(StrategyKind::select(name));
    }

    pub fn strategy_name(&self) -> String {
        self.strategy.read().name().to_owned()
    }
}
