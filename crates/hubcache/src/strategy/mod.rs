//! # Retrieval Strategies
//!
//! Policies deciding the precedence between the pilet store and the network.
//! [`StrategyKind`] is the closed set of built-in policies; anything else
//! implementing [`CacheStrategy`] can be installed on a
//! [`StrategyManager`](manager::StrategyManager) as well.

pub mod manager;
pub mod metrics;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::error::{CacheError, CacheResult};
use crate::fetch::FetchFuture;
use crate::identity::{PiletIdentity, PiletMetadata};
use crate::store::PiletStore;

pub use manager::StrategyManager;
pub use metrics::{MetricsSnapshot, StrategyMetrics};

/// Where the content of a retrieval came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalSource {
    Cache,
    Network,
}

/// Content returned by a strategy
#[derive(Debug, Clone, PartialEq)]
pub struct Retrieval {
    pub content: Bytes,
    pub source: RetrievalSource,
}

impl Retrieval {
    pub fn cached(content: Bytes) -> Self {
        Self {
            content,
            source: RetrievalSource::Cache,
        }
    }

    pub fn fetched(content: Bytes) -> Self {
        Self {
            content,
            source: RetrievalSource::Network,
        }
    }

    pub fn is_cache_hit(&self) -> bool {
        self.source == RetrievalSource::Cache
    }
}

/// A retrieval policy.
///
/// `fetcher` is lazy: a strategy that answers from the store drops it
/// without polling, so no request is made.
#[async_trait]
pub trait CacheStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    async fn retrieve(
        &self,
        store: &Arc<PiletStore>,
        pilet: &PiletMetadata,
        fetcher: FetchFuture,
    ) -> CacheResult<Retrieval>;
}

/// The built-in strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    CacheFirst,
    NetworkFirst,
    CacheOnly,
    NetworkOnly,
    StaleWhileRevalidate,
    NetworkFirstWithTimeout(Duration),
}

impl StrategyKind {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);

    /// Resolve a strategy name, `None` if it is not recognized
    pub fn parse(name: &str) -> Option<Self> {
        let kind = match name {
            "cache-first" => Self::CacheFirst,
            "network-first" => Self::NetworkFirst,
            "cache-only" => Self::CacheOnly,
            "network-only" => Self::NetworkOnly,
            "stale-while-revalidate" | "swr" => Self::StaleWhileRevalidate,
            "network-first-timeout" => Self::NetworkFirstWithTimeout(Self::DEFAULT_TIMEOUT),
            _ => return None,
        };
        Some(kind)
    }

    /// Resolve a strategy name, falling back to cache-first
    pub fn select(name: &str) -> Self {
        Self::select_with_timeout(name, Self::DEFAULT_TIMEOUT)
    }

    /// Like [`select`](Self::select), with the deadline used when the name
    /// resolves to the timeout-bounded strategy
    pub fn select_with_timeout(name: &str, timeout: Duration) -> Self {
        match Self::parse(name) {
            Some(Self::NetworkFirstWithTimeout(_)) => Self::NetworkFirstWithTimeout(timeout),
            Some(kind) => kind,
            None => {
                warn!(strategy = name, "Unknown cache strategy, using cache-first");
                Self::CacheFirst
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheFirst => "cache-first",
            Self::NetworkFirst => "network-first",
            Self::CacheOnly => "cache-only",
            Self::NetworkOnly => "network-only",
            Self::StaleWhileRevalidate => "stale-while-revalidate",
            Self::NetworkFirstWithTimeout(_) => "network-first-timeout",
        }
    }

    pub fn into_strategy(self) -> Arc<dyn CacheStrategy> {
        Arc::new(self)
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| CacheError::Config(format!("Unknown cache strategy: {s}")))
    }
}

#[async_trait]
impl CacheStrategy for StrategyKind {
    fn name(&self) -> &str {
        self.as_str()
    }

    async fn retrieve(
        &self,
        store: &Arc<PiletStore>,
        pilet: &PiletMetadata,
        fetcher: FetchFuture,
    ) -> CacheResult<Retrieval> {
        let identity = pilet.identity();
        match *self {
            Self::CacheFirst => cache_first(store, pilet, &identity, fetcher).await,
            Self::NetworkFirst => network_first(store, pilet, &identity, fetcher).await,
            Self::CacheOnly => cache_only(store, &identity).await,
            Self::NetworkOnly => network_only(store, pilet, &identity, fetcher).await,
            Self::StaleWhileRevalidate => {
                stale_while_revalidate(store, pilet, &identity, fetcher).await
            }
            Self::NetworkFirstWithTimeout(timeout) => {
                network_first_with_timeout(store, pilet, &identity, fetcher, timeout).await
            }
        }
    }
}

/// Store lookup where a failing store counts as a miss
async fn lookup(store: &PiletStore, identity: &PiletIdentity) -> Option<Bytes> {
    match store.get(identity).await {
        Ok(entry) => entry.map(|e| e.content),
        Err(e) => {
            warn!(pilet = %identity, error = %e, "Cache lookup failed, treating as miss");
            None
        }
    }
}

/// Write fetched content through to the store. The content is served even
/// when the write fails.
async fn write_through(store: &PiletStore, pilet: &PiletMetadata, content: &Bytes) {
    if let Err(e) = store.set(pilet, content.clone()).await {
        warn!(pilet = %pilet.identity(), error = %e, "Failed to cache fetched pilet");
    }
}

async fn cache_first(
    store: &PiletStore,
    pilet: &PiletMetadata,
    identity: &PiletIdentity,
    fetcher: FetchFuture,
) -> CacheResult<Retrieval> {
    if let Some(content) = lookup(store, identity).await {
        debug!(pilet = %identity, "Cache hit");
        return Ok(Retrieval::cached(content));
    }

    debug!(pilet = %identity, "Cache miss, fetching from network");
    let content = fetcher.await.inspect_err(|e| {
        warn!(pilet = %identity, error = %e, "Failed to fetch pilet");
    })?;
    write_through(store, pilet, &content).await;
    Ok(Retrieval::fetched(content))
}

async fn network_first(
    store: &PiletStore,
    pilet: &PiletMetadata,
    identity: &PiletIdentity,
    fetcher: FetchFuture,
) -> CacheResult<Retrieval> {
    debug!(pilet = %identity, "Fetching from network");
    match fetcher.await {
        Ok(content) => {
            write_through(store, pilet, &content).await;
            Ok(Retrieval::fetched(content))
        }
        Err(e) => fall_back_to_cache(store, identity, e).await,
    }
}

async fn fall_back_to_cache(
    store: &PiletStore,
    identity: &PiletIdentity,
    error: CacheError,
) -> CacheResult<Retrieval> {
    warn!(pilet = %identity, error = %error, "Network failed, trying cache");
    match lookup(store, identity).await {
        Some(content) => {
            info!(pilet = %identity, "Using cached version");
            Ok(Retrieval::cached(content))
        }
        None => Err(error),
    }
}

async fn cache_only(store: &PiletStore, identity: &PiletIdentity) -> CacheResult<Retrieval> {
    store
        .get(identity)
        .await?
        .map(|entry| Retrieval::cached(entry.content))
        .ok_or_else(|| CacheError::NotFound(identity.to_string()))
}

async fn network_only(
    store: &PiletStore,
    pilet: &PiletMetadata,
    identity: &PiletIdentity,
    fetcher: FetchFuture,
) -> CacheResult<Retrieval> {
    debug!(pilet = %identity, "Fetching from network, bypassing cache");
    let content = fetcher.await?;
    write_through(store, pilet, &content).await;
    Ok(Retrieval::fetched(content))
}

async fn stale_while_revalidate(
    store: &Arc<PiletStore>,
    pilet: &PiletMetadata,
    identity: &PiletIdentity,
    fetcher: FetchFuture,
) -> CacheResult<Retrieval> {
    let Some(content) = lookup(store, identity).await else {
        debug!(pilet = %identity, "No cached copy, fetching synchronously");
        let content = fetcher.await?;
        write_through(store, pilet, &content).await;
        return Ok(Retrieval::fetched(content));
    };

    debug!(pilet = %identity, "Serving stale content, revalidating in background");
    let store = Arc::clone(store);
    let pilet = pilet.clone();
    tokio::spawn(async move {
        match fetcher.await {
            Ok(fresh) => {
                write_through(&store, &pilet, &fresh).await;
                debug!(pilet = %pilet.identity(), "Revalidated cached pilet");
            }
            Err(e) => {
                warn!(pilet = %pilet.identity(), error = %e, "Failed to revalidate pilet");
            }
        }
    });

    Ok(Retrieval::cached(content))
}

async fn network_first_with_timeout(
    store: &PiletStore,
    pilet: &PiletMetadata,
    identity: &PiletIdentity,
    fetcher: FetchFuture,
    timeout: Duration,
) -> CacheResult<Retrieval> {
    debug!(
        pilet = %identity,
        timeout_ms = timeout.as_millis() as u64,
        "Fetching from network with deadline"
    );
    let outcome = match tokio::time::timeout(timeout, fetcher).await {
        Ok(result) => result,
        Err(_) => Err(CacheError::Timeout(timeout)),
    };

    match outcome {
        Ok(content) => {
            write_through(store, pilet, &content).await;
            Ok(Retrieval::fetched(content))
        }
        Err(e) => fall_back_to_cache(store, identity, e).await,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::test_utils::init_tracing;
    use crate::clock::ManualClock;
    use crate::config::StoreConfig;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn memory_store() -> Arc<PiletStore> {
        Arc::new(PiletStore::memory_only(
            StoreConfig::default(),
            Arc::new(ManualClock::new(1_000)),
        ))
    }

    fn counted(calls: &Arc<AtomicUsize>, result: CacheResult<&'static str>) -> FetchFuture {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            result.map(|s| Bytes::from_static(s.as_bytes()))
        }
        .boxed()
    }

    fn pilet() -> PiletMetadata {
        PiletMetadata::new("dashboard", "1.2.0").with_link("https://cdn.example.com/dashboard.js")
    }

    fn offline() -> CacheResult<&'static str> {
        Err(CacheError::Transport("offline".into()))
    }

    #[test]
    fn test_parse_names_and_aliases() {
        assert_eq!(StrategyKind::parse("cache-first"), Some(StrategyKind::CacheFirst));
        assert_eq!(StrategyKind::parse("swr"), Some(StrategyKind::StaleWhileRevalidate));
        assert_eq!(
            StrategyKind::parse("network-first-timeout"),
            Some(StrategyKind::NetworkFirstWithTimeout(StrategyKind::DEFAULT_TIMEOUT))
        );
        assert_eq!(StrategyKind::parse("bogus"), None);
        assert!("bogus".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn test_unknown_strategy_selects_cache_first() {
        assert_eq!(StrategyKind::select("bogus"), StrategyKind::select("cache-first"));
        assert_eq!(
            StrategyKind::select_with_timeout("network-first-timeout", Duration::from_millis(50)),
            StrategyKind::NetworkFirstWithTimeout(Duration::from_millis(50))
        );
    }

    #[tokio::test]
    async fn test_cache_first_never_fetches_on_hit() {
        let store = memory_store();
        store.set(&pilet(), Bytes::from_static(b"cached")).await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let got = StrategyKind::CacheFirst
            .retrieve(&store, &pilet(), counted(&calls, Ok("fresh")))
            .await
            .unwrap();

        assert_eq!(got, Retrieval::cached(Bytes::from_static(b"cached")));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cache_first_miss_fetches_and_stores() {
        let store = memory_store();
        let calls = Arc::new(AtomicUsize::new(0));

        let got = StrategyKind::CacheFirst
            .retrieve(&store, &pilet(), counted(&calls, Ok("fresh")))
            .await
            .unwrap();

        assert_eq!(got.source, RetrievalSource::Network);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stored = store.get(&pilet().identity()).await.unwrap().unwrap();
        assert_eq!(stored.content, Bytes::from_static(b"fresh"));
    }

    #[tokio::test]
    async fn test_network_first_falls_back_to_cache() {
        let store = memory_store();
        store.set(&pilet(), Bytes::from_static(b"cached")).await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let got = StrategyKind::NetworkFirst
            .retrieve(&store, &pilet(), counted(&calls, offline()))
            .await
            .unwrap();

        assert_eq!(got, Retrieval::cached(Bytes::from_static(b"cached")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_network_first_propagates_without_cache() {
        let store = memory_store();
        let calls = Arc::new(AtomicUsize::new(0));

        let err = StrategyKind::NetworkFirst
            .retrieve(&store, &pilet(), counted(&calls, offline()))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Transport(_)));
    }

    #[tokio::test]
    async fn test_network_first_prefers_fresh_content() {
        let store = memory_store();
        store.set(&pilet(), Bytes::from_static(b"old")).await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let got = StrategyKind::NetworkFirst
            .retrieve(&store, &pilet(), counted(&calls, Ok("new")))
            .await
            .unwrap();

        assert_eq!(got, Retrieval::fetched(Bytes::from_static(b"new")));
        let stored = store.get(&pilet().identity()).await.unwrap().unwrap();
        assert_eq!(stored.content, Bytes::from_static(b"new"));
    }

    #[tokio::test]
    async fn test_cache_only_reports_not_found() {
        let store = memory_store();
        let calls = Arc::new(AtomicUsize::new(0));

        let err = StrategyKind::CacheOnly
            .retrieve(&store, &pilet(), counted(&calls, Ok("fresh")))
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::NotFound(ref id) if id == "dashboard@1.2.0"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_network_only_ignores_cached_copy() {
        let store = memory_store();
        store.set(&pilet(), Bytes::from_static(b"cached")).await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let err = StrategyKind::NetworkOnly
            .retrieve(&store, &pilet(), counted(&calls, offline()))
            .await
            .unwrap_err();
        assert!(err.is_network());
    }

    #[tokio::test]
    async fn test_swr_does_not_wait_for_fetcher() {
        let store = memory_store();
        store.set(&pilet(), Bytes::from_static(b"stale")).await.unwrap();

        let never = futures::future::pending::<CacheResult<Bytes>>().boxed();
        let got = StrategyKind::StaleWhileRevalidate
            .retrieve(&store, &pilet(), never)
            .await
            .unwrap();

        assert_eq!(got, Retrieval::cached(Bytes::from_static(b"stale")));
    }

    #[tokio::test]
    async fn test_swr_revalidates_in_background() {
        init_tracing();
        let store = memory_store();
        store.set(&pilet(), Bytes::from_static(b"stale")).await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let got = StrategyKind::StaleWhileRevalidate
            .retrieve(&store, &pilet(), counted(&calls, Ok("fresh")))
            .await
            .unwrap();
        assert_eq!(got.content, Bytes::from_static(b"stale"));

        let mut refreshed = false;
        for _ in 0..100 {
            let entry = store.get(&pilet().identity()).await.unwrap().unwrap();
            if entry.content == Bytes::from_static(b"fresh") {
                refreshed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(refreshed);
    }

    #[tokio::test]
    async fn test_swr_background_failure_keeps_stale_copy() {
        let store = memory_store();
        store.set(&pilet(), Bytes::from_static(b"stale")).await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let got = StrategyKind::StaleWhileRevalidate
            .retrieve(&store, &pilet(), counted(&calls, offline()))
            .await
            .unwrap();
        assert_eq!(got.content, Bytes::from_static(b"stale"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let entry = store.get(&pilet().identity()).await.unwrap().unwrap();
        assert_eq!(entry.content, Bytes::from_static(b"stale"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_falls_back_to_cache() {
        let store = memory_store();
        store.set(&pilet(), Bytes::from_static(b"cached")).await.unwrap();

        let slow = futures::future::pending::<CacheResult<Bytes>>().boxed();
        let got = StrategyKind::NetworkFirstWithTimeout(Duration::from_millis(100))
            .retrieve(&store, &pilet(), slow)
            .await
            .unwrap();

        assert_eq!(got, Retrieval::cached(Bytes::from_static(b"cached")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_cache_is_timeout_error() {
        let store = memory_store();
        let slow = futures::future::pending::<CacheResult<Bytes>>().boxed();

        let err = StrategyKind::NetworkFirstWithTimeout(Duration::from_millis(100))
            .retrieve(&store, &pilet(), slow)
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::Timeout(d) if d == Duration::from_millis(100)));
    }
}
