//! # Cache Manager
//!
//! Top-level entry point of the caching core. Coordinates the strategy
//! manager, the pilet store, and the network fetcher: loads go through the
//! active strategy with retried fetches, critical pilets are preloaded in
//! bounded batches, and maintenance keeps the store lean.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::CacheManagerConfig;
use crate::error::CacheResult;
use crate::fetch::{FetchFuture, PiletFetcher, RetryPolicy};
use crate::identity::{PiletIdentity, PiletMetadata};
use crate::store::{PiletStore, StoreStats};
use crate::strategy::{MetricsSnapshot, StrategyKind, StrategyManager};

/// Interval of the periodic `optimize` sweep
pub const OPTIMIZE_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Interval of the periodic health check
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Non-critical entries older than this are removed by `optimize`
const STALE_ENTRY_AGE: Duration = Duration::from_secs(24 * 60 * 60);
/// Entries older than this are reported by the health check
const VERY_OLD_ENTRY_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Loads needed before the hit rate is judged
const MIN_HEALTH_SAMPLES: u64 = 10;

type PreloadFuture = Shared<BoxFuture<'static, PreloadReport>>;

/// Outcome of a preload run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreloadReport {
    /// Critical pilets among the requested ones
    pub requested: usize,
    pub loaded: usize,
    /// Identities that failed to load
    pub failed: Vec<String>,
    /// True when preloading is disabled
    pub skipped: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub cache: StoreStats,
    pub strategy: MetricsSnapshot,
    pub config: CacheManagerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub issues: Vec<String>,
}

/// Metrics formatted for monitoring
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsExport {
    /// Milliseconds since the epoch
    pub timestamp: u64,
    pub cache: StoreStats,
    pub performance: PerformanceExport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceExport {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub samples: usize,
    /// e.g. `"12.34ms"`
    pub avg_load_time: String,
    /// e.g. `"29.4%"`
    pub hit_rate: String,
    pub error_rate: String,
}

struct ManagerInner {
    store: Arc<PiletStore>,
    strategies: StrategyManager,
    fetcher: Arc<dyn PiletFetcher>,
    config: RwLock<CacheManagerConfig>,
    preload: Mutex<Option<PreloadFuture>>,
}

/// Cache manager handling strategy-driven pilet loads
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("store", &self.inner.store)
            .field("strategy", &self.inner.strategies.strategy_name())
            .field("config", &*self.inner.config.read())
            .finish()
    }
}

impl CacheManager {
    pub fn new(
        config: CacheManagerConfig,
        store: Arc<PiletStore>,
        fetcher: Arc<dyn PiletFetcher>,
    ) -> Self {
        let strategies = StrategyManager::with_kind(store.clone(), config.strategy_kind());
        info!(
            strategy = %strategies.strategy_name(),
            preloading = config.preloading_enabled,
            critical = ?config.critical_pilets,
            "Cache manager initialized"
        );
        Self {
            inner: Arc::new(ManagerInner {
                store,
                strategies,
                fetcher,
                config: RwLock::new(config),
                preload: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &Arc<PiletStore> {
        &self.inner.store
    }

    pub fn strategies(&self) -> &StrategyManager {
        &self.inner.strategies
    }

    /// Snapshot of the runtime configuration
    pub fn config(&self) -> CacheManagerConfig {
        self.inner.config.read().clone()
    }

    fn retry_policy(&self) -> RetryPolicy {
        let config = self.inner.config.read();
        RetryPolicy::new(config.max_retries, config.retry_base_delay)
    }

    /// Network retrieval of `pilet` with retries, not started until polled
    fn fetch_with_retry(&self, pilet: &PiletMetadata) -> FetchFuture {
        let fetcher = self.inner.fetcher.clone();
        let policy = self.retry_policy();
        let pilet = pilet.clone();
        async move {
            let label = pilet.identity().to_string();
            policy.run(&label, || fetcher.fetch(&pilet)).await
        }
        .boxed()
    }

    /// Load a pilet through the active strategy
    pub async fn load_pilet(&self, pilet: &PiletMetadata) -> CacheResult<Bytes> {
        let fetcher = self.fetch_with_retry(pilet);
        self.inner.strategies.load(pilet, fetcher).await
    }

    /// Load the critical pilets among `pilets`.
    ///
    /// A call made while a preload is running waits for that run and returns
    /// its report instead of starting another.
    pub async fn preload_critical(&self, pilets: &[PiletMetadata]) -> PreloadReport {
        if !self.inner.config.read().preloading_enabled {
            info!("Preloading disabled");
            return PreloadReport {
                skipped: true,
                ..PreloadReport::default()
            };
        }

        let run = {
            let mut slot = self.inner.preload.lock();
            match slot.as_ref() {
                Some(in_flight) => {
                    debug!("Preload already in flight, joining it");
                    in_flight.clone()
                }
                None => {
                    let this = self.clone();
                    let pilets = pilets.to_vec();
                    let run = async move { this.run_preload(pilets).await }
                        .boxed()
                        .shared();
                    *slot = Some(run.clone());
                    run
                }
            }
        };

        let report = run.clone().await;

        let mut slot = self.inner.preload.lock();
        if slot.as_ref().is_some_and(|current| current.ptr_eq(&run)) {
            *slot = None;
        }
        report
    }

    async fn run_preload(&self, pilets: Vec<PiletMetadata>) -> PreloadReport {
        let (critical, batch_size) = {
            let config = self.inner.config.read();
            let critical: Vec<_> = pilets
                .into_iter()
                .filter(|p| config.is_critical(&p.name))
                .collect();
            (critical, config.preload_concurrency.max(1))
        };

        let mut report = PreloadReport {
            requested: critical.len(),
            ..PreloadReport::default()
        };

        if critical.is_empty() {
            info!("No critical pilets to preload");
            return report;
        }

        info!(count = critical.len(), "Preloading critical pilets");
        for batch in critical.chunks(batch_size) {
            let results =
                futures::future::join_all(batch.iter().map(|pilet| self.load_pilet(pilet))).await;
            for (pilet, result) in batch.iter().zip(results) {
                match result {
                    Ok(_) => report.loaded += 1,
                    Err(e) => {
                        warn!(pilet = %pilet.identity(), error = %e, "Failed to preload pilet");
                        report.failed.push(pilet.identity().to_string());
                    }
                }
            }
        }

        info!(
            loaded = report.loaded,
            failed = report.failed.len(),
            "Critical pilets preloaded"
        );
        report
    }

    /// Remove cached versions of a pilet: one version when given, every
    /// cached version of the name otherwise. Returns the number removed.
    pub async fn invalidate(&self, name: &str, version: Option<&str>) -> CacheResult<usize> {
        let store = &self.inner.store;
        let removed = match version {
            Some(version) => {
                let identity = PiletIdentity::new(name, version);
                let existed = store.contains(&identity).await?;
                store.remove(&identity).await?;
                usize::from(existed)
            }
            None => {
                let mut removed = 0;
                for entry in store.get_all().await? {
                    if entry.identity.name() == name {
                        store.remove(&entry.identity).await?;
                        removed += 1;
                    }
                }
                removed
            }
        };

        info!(pilet = name, version = ?version, removed, "Invalidated cached pilet");
        Ok(removed)
    }

    /// Clear the store and reset the strategy metrics
    pub async fn invalidate_all(&self) -> CacheResult<()> {
        self.inner.store.clear().await?;
        self.inner.strategies.reset_metrics();
        info!("All cached pilets invalidated");
        Ok(())
    }

    pub async fn stats(&self) -> CacheResult<CacheStats> {
        Ok(CacheStats {
            cache: self.inner.store.stats().await?,
            strategy: self.inner.strategies.metrics(),
            config: self.config(),
        })
    }

    /// Report conditions worth an operator's attention
    pub async fn health_check(&self) -> HealthReport {
        let issues = match self.collect_health_issues().await {
            Ok(issues) => issues,
            Err(e) => {
                error!(error = %e, "Health check failed");
                vec!["Failed to access cache storage".to_owned()]
            }
        };
        HealthReport {
            healthy: issues.is_empty(),
            issues,
        }
    }

    async fn collect_health_issues(&self) -> CacheResult<Vec<String>> {
        let store = &self.inner.store;
        let stats = store.stats().await?;
        let metrics = self.inner.strategies.metrics();
        let mut issues = Vec::new();

        if stats.total_size_bytes as f64 > store.max_size_bytes() as f64 * 0.9 {
            issues.push("Cache size approaching limit (>90%)".to_owned());
        }

        let hit_rate = metrics.served_from_cache_rate();
        if metrics.total_loads() >= MIN_HEALTH_SAMPLES && hit_rate < 50.0 {
            issues.push(format!("Low cache hit rate: {hit_rate:.1}%"));
        }

        if metrics.error_rate > 10.0 {
            issues.push(format!("High error rate: {:.1}%", metrics.error_rate));
        }

        if let Some(oldest) = stats.oldest_entry {
            let age = store.clock().now_millis().saturating_sub(oldest);
            if u128::from(age) > VERY_OLD_ENTRY_AGE.as_millis() {
                issues.push("Cache contains very old entries (>7 days)".to_owned());
            }
        }

        Ok(issues)
    }

    /// Remove non-critical entries older than a day. Returns the number removed.
    pub async fn optimize(&self) -> CacheResult<usize> {
        info!("Starting cache optimization");
        let store = &self.inner.store;
        let now = store.clock().now_millis();
        let mut removed = 0;

        for entry in store.get_all().await? {
            let critical = self.inner.config.read().is_critical(entry.identity.name());
            if !critical && u128::from(entry.age_millis(now)) > STALE_ENTRY_AGE.as_millis() {
                store.remove(&entry.identity).await?;
                removed += 1;
            }
        }

        info!(removed, "Cache optimization complete");
        Ok(removed)
    }

    /// Switch strategy by name; unknown names use cache-first
    pub fn set_strategy(&self, name: &str) {
        let kind = {
            let mut config = self.inner.config.write();
            config.strategy = name.to_owned();
            StrategyKind::select_with_timeout(name, config.network_timeout)
        };
        self.inner.strategies.set_kind(kind);
    }

    pub fn set_preloading(&self, enabled: bool) {
        self.inner.config.write().preloading_enabled = enabled;
        info!(enabled, "Preloading toggled");
    }

    pub async fn export_metrics(&self) -> CacheResult<MetricsExport> {
        let stats = self.stats().await?;
        let m = stats.strategy;
        Ok(MetricsExport {
            timestamp: self.inner.store.clock().now_millis(),
            cache: stats.cache,
            performance: PerformanceExport {
                hits: m.hits,
                misses: m.misses,
                errors: m.errors,
                samples: m.samples,
                avg_load_time: format!("{:.2}ms", m.avg_load_time_ms),
                hit_rate: format!("{:.1}%", m.hit_rate),
                error_rate: format!("{:.1}%", m.error_rate),
            },
        })
    }

    /// Start a background task running `optimize` hourly and a health check
    /// every five minutes
    pub fn start_maintenance_task(&self) -> tokio::task::JoinHandle<()> {
        self.start_maintenance_task_with(OPTIMIZE_INTERVAL, HEALTH_CHECK_INTERVAL)
    }

    pub fn start_maintenance_task_with(
        &self,
        optimize_every: Duration,
        health_every: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            let mut optimize_tick = tokio::time::interval_at(start + optimize_every, optimize_every);
            let mut health_tick = tokio::time::interval_at(start + health_every, health_every);
            loop {
                tokio::select! {
                    _ = optimize_tick.tick() => {
                        if let Err(e) = this.optimize().await {
                            warn!(error = %e, "Cache optimization failed");
                        }
                    }
                    _ = health_tick.tick() => {
                        let report = this.health_check().await;
                        if !report.healthy {
                            warn!(issues = ?report.issues, "Cache health issues detected");
                        }
                    }
                }
            }
        })
    }
}
