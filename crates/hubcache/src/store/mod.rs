//! # Pilet Store
//!
//! Two-tier persistent store for pilet bundles: a Moka in-memory shadow in
//! front of a [`DurableBackend`]. Entries expire after `max_age`; the summed
//! size of all entries is kept under `max_size_bytes` by evicting the oldest
//! entries before a write lands.

mod backend;
mod file;

use std::sync::Arc;

use bytes::Bytes;
use moka::future::Cache as MokaCache;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

pub use backend::{DurableBackend, EntryRecord, MemoryBackend};
pub use file::FileBackend;

use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::error::CacheResult;
use crate::fetch::PiletFetcher;
use crate::identity::{CachedEntry, PiletIdentity, PiletMetadata};

/// Aggregate figures over the valid entries of the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub count: usize,
    pub total_size_bytes: u64,
    /// `created_at` of the oldest entry, if any
    pub oldest_entry: Option<u64>,
}

pub struct PiletStore {
    shadow: MokaCache<PiletIdentity, CachedEntry>,
    durable: RwLock<Arc<dyn DurableBackend>>,
    persistent: RwLock<bool>,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PiletStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PiletStore")
            .field("backend", &self.backend().kind())
            .field("config", &self.config)
            .finish()
    }
}

impl PiletStore {
    /// Create a store over an explicit backend
    pub fn with_backend(
        config: StoreConfig,
        backend: Arc<dyn DurableBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let persistent = backend.is_persistent();
        debug!(
            backend = backend.kind(),
            max_size = config.max_size_bytes,
            max_age_ms = config.max_age.as_millis() as u64,
            "Pilet store created"
        );
        Self {
            shadow: MokaCache::builder().name("pilet-shadow").build(),
            durable: RwLock::new(backend),
            persistent: RwLock::new(persistent),
            config,
            clock,
        }
    }

    /// Create a store that keeps everything in memory
    pub fn memory_only(config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_backend(config, Arc::new(MemoryBackend::new()), clock)
    }

    /// Open the store over a file backend in `config.cache_dir` (or the system
    /// temp dir). If the directory is unusable the store runs memory-only.
    pub async fn open(mut config: StoreConfig) -> Self {
        let cache_dir = config
            .cache_dir
            .get_or_insert_with(|| std::env::temp_dir().join("hubcache"))
            .clone();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        match FileBackend::open(&cache_dir).await {
            Ok(backend) => {
                info!(dir = ?cache_dir, "Persistent pilet store initialized");
                Self::with_backend(config, Arc::new(backend), clock)
            }
            Err(e) => {
                warn!(
                    dir = ?cache_dir,
                    error = %e,
                    "Durable pilet storage unavailable, running memory-only"
                );
                Self::memory_only(config, clock)
            }
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.config.max_size_bytes
    }

    /// Whether entries survive the process
    pub fn is_persistent(&self) -> bool {
        *self.persistent.read()
    }

    fn backend(&self) -> Arc<dyn DurableBackend> {
        self.durable.read().clone()
    }

    fn is_valid(&self, created_at: u64) -> bool {
        let age = self.clock.now_millis().saturating_sub(created_at);
        u128::from(age) < self.config.max_age.as_millis()
    }

    /// Get a valid entry. Expired entries are removed from both tiers.
    pub async fn get(&self, identity: &PiletIdentity) -> CacheResult<Option<CachedEntry>> {
        if let Some(entry) = self.shadow.get(identity).await {
            if self.is_valid(entry.created_at) {
                return Ok(Some(entry));
            }
            self.shadow.invalidate(identity).await;
        }

        match self.backend().get(identity).await? {
            Some(entry) if self.is_valid(entry.created_at) => {
                self.shadow.insert(identity.clone(), entry.clone()).await;
                Ok(Some(entry))
            }
            Some(_) => {
                debug!(pilet = %identity, "Cached pilet expired, removing");
                self.remove(identity).await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub async fn contains(&self, identity: &PiletIdentity) -> CacheResult<bool> {
        Ok(self.get(identity).await?.is_some())
    }

    /// Store `content` for the pilet, superseding any previous entry.
    ///
    /// If the write would push the store over its size limit, the oldest
    /// entries are evicted first. An entry larger than the whole store is not
    /// cached.
    pub async fn set(&self, metadata: &PiletMetadata, content: Bytes) -> CacheResult<()> {
        let entry = CachedEntry::new(metadata.clone(), content, self.clock.now_millis());

        if entry.size_bytes > self.config.max_size_bytes {
            warn!(
                pilet = %entry.identity,
                size = entry.size_bytes,
                max_size = self.config.max_size_bytes,
                "Pilet too large for the cache, skipping"
            );
            return Ok(());
        }

        self.make_room(&entry).await?;

        // A rejected durable write must not leave an untracked shadow copy
        if let Err(e) = self.backend().put(&entry).await {
            self.shadow.invalidate(&entry.identity).await;
            return Err(e);
        }
        self.shadow
            .insert(entry.identity.clone(), entry.clone())
            .await;

        debug!(pilet = %entry.identity, size = entry.size_bytes, "Cached pilet");
        Ok(())
    }

    /// Evict oldest entries until `incoming` fits, freeing at least
    /// `eviction_ratio` of the maximum size once eviction is needed.
    async fn make_room(&self, incoming: &CachedEntry) -> CacheResult<()> {
        let records = self.valid_records().await?;
        let current: u64 = records
            .iter()
            .filter(|r| r.identity != incoming.identity)
            .map(|r| r.size_bytes)
            .sum();

        let projected = current + incoming.size_bytes;
        if projected <= self.config.max_size_bytes {
            return Ok(());
        }

        let needed = projected - self.config.max_size_bytes;
        let target = ((self.config.max_size_bytes as f64 * self.config.eviction_ratio) as u64)
            .max(needed);

        let mut freed = 0u64;
        let mut evicted = 0usize;
        let mut candidates: Vec<_> = records
            .into_iter()
            .filter(|r| r.identity != incoming.identity)
            .collect();
        candidates.sort_by_key(|r| r.created_at);

        for record in candidates {
            if freed >= target {
                break;
            }
            self.remove(&record.identity).await?;
            freed += record.size_bytes;
            evicted += 1;
        }

        info!(
            evicted,
            freed_bytes = freed,
            target_bytes = target,
            "Evicted oldest pilets to stay under the size limit"
        );
        Ok(())
    }

    /// Remove an entry from both tiers
    pub async fn remove(&self, identity: &PiletIdentity) -> CacheResult<()> {
        self.shadow.invalidate(identity).await;
        self.backend().delete(identity).await?;
        debug!(pilet = %identity, "Removed pilet from cache");
        Ok(())
    }

    /// Remove every entry from both tiers
    pub async fn clear(&self) -> CacheResult<()> {
        self.shadow.invalidate_all();
        self.backend().clear().await?;
        info!("Pilet cache cleared");
        Ok(())
    }

    /// All valid entries. Expired entries found along the way are deleted.
    pub async fn get_all(&self) -> CacheResult<Vec<CachedEntry>> {
        let (valid, expired): (Vec<_>, Vec<_>) = self
            .backend()
            .entries()
            .await?
            .into_iter()
            .partition(|e| self.is_valid(e.created_at));

        for entry in &expired {
            self.remove(&entry.identity).await?;
        }
        Ok(valid)
    }

    /// Records of all valid entries, deleting expired ones
    async fn valid_records(&self) -> CacheResult<Vec<EntryRecord>> {
        let (valid, expired): (Vec<_>, Vec<_>) = self
            .backend()
            .records_oldest_first()
            .await?
            .into_iter()
            .partition(|r| self.is_valid(r.created_at));

        for record in &expired {
            self.remove(&record.identity).await?;
        }
        Ok(valid)
    }

    pub async fn stats(&self) -> CacheResult<StoreStats> {
        let records = self.valid_records().await?;
        Ok(StoreStats {
            count: records.len(),
            total_size_bytes: records.iter().map(|r| r.size_bytes).sum(),
            oldest_entry: records.iter().map(|r| r.created_at).min(),
        })
    }

    /// Fetch and store every pilet that has a link but no valid entry.
    /// Failures are logged per pilet and never returned.
    pub async fn preload(&self, pilets: &[PiletMetadata], fetcher: &dyn PiletFetcher) {
        let loads = pilets.iter().map(|pilet| async move {
            let identity = pilet.identity();
            match self.get(&identity).await {
                Ok(Some(_)) => return,
                Ok(None) => {}
                Err(e) => debug!(pilet = %identity, error = %e, "Lookup failed before preload"),
            }
            if pilet.link.is_none() {
                return;
            }
            match fetcher.fetch(pilet).await {
                Ok(content) => {
                    if let Err(e) = self.set(pilet, content).await {
                        warn!(pilet = %identity, error = %e, "Failed to store preloaded pilet");
                    }
                }
                Err(e) => warn!(pilet = %identity, error = %e, "Failed to preload pilet"),
            }
        });
        futures::future::join_all(loads).await;
        info!(count = pilets.len(), "Preloaded pilets");
    }

    /// Detach the durable tier and drop the shadow. The store keeps working
    /// memory-only afterwards.
    pub fn close(&self) {
        *self.durable.write() = Arc::new(MemoryBackend::new());
        *self.persistent.write() = false;
        self.shadow.invalidate_all();
        debug!("Pilet store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_tracing;
    use crate::clock::ManualClock;
    use crate::error::CacheError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    const HOUR_MS: u64 = 60 * 60 * 1000;

    fn config(max_size_bytes: u64) -> StoreConfig {
        StoreConfig {
            cache_dir: None,
            max_age: Duration::from_millis(HOUR_MS),
            max_size_bytes,
            eviction_ratio: 0.2,
        }
    }

    fn meta(name: &str) -> PiletMetadata {
        PiletMetadata::new(name, "1.0.0").with_link(format!("https://cdn.example.com/{name}.js"))
    }

    fn store_at(clock: &Arc<ManualClock>, max_size_bytes: u64) -> PiletStore {
        PiletStore::memory_only(config(max_size_bytes), clock.clone())
    }

    #[tokio::test]
    async fn test_overwrite_keeps_single_latest_entry() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = store_at(&clock, 1024);
        let m = meta("dashboard");

        store.set(&m, Bytes::from_static(b"A")).await.unwrap();
        clock.advance(Duration::from_millis(5));
        store.set(&m, Bytes::from_static(b"B")).await.unwrap();

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].content, Bytes::from_static(b"B"));
        let got = store.get(&m.identity()).await.unwrap().unwrap();
        assert_eq!(got.content, Bytes::from_static(b"B"));
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent_and_removed() {
        let clock = Arc::new(ManualClock::new(10_000));
        let store = store_at(&clock, 1024);
        let m = meta("sidebar");
        store.set(&m, Bytes::from_static(b"bundle")).await.unwrap();

        clock.advance(Duration::from_millis(HOUR_MS + 1));
        assert!(store.get(&m.identity()).await.unwrap().is_none());
        assert!(store.get_all().await.unwrap().is_empty());
        assert_eq!(store.stats().await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_entry_valid_just_before_max_age() {
        let clock = Arc::new(ManualClock::new(10_000));
        let store = store_at(&clock, 1024);
        let m = meta("sidebar");
        store.set(&m, Bytes::from_static(b"bundle")).await.unwrap();

        clock.advance(Duration::from_millis(HOUR_MS - 1));
        assert!(store.get(&m.identity()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_total_size_never_exceeds_limit() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store_at(&clock, 100);

        for i in 0..25 {
            clock.advance(Duration::from_millis(1));
            let content = Bytes::from(vec![b'x'; 7 + (i % 5) * 6]);
            store.set(&meta(&format!("p{i}")), content).await.unwrap();
            let stats = store.stats().await.unwrap();
            assert!(
                stats.total_size_bytes <= 100,
                "size {} exceeded limit after write {i}",
                stats.total_size_bytes
            );
        }
    }

    #[tokio::test]
    async fn test_eviction_removes_oldest_first_and_frees_twenty_percent() {
        init_tracing();
        let clock = Arc::new(ManualClock::new(0));
        let store = store_at(&clock, 100);

        for name in ["a", "b", "c", "d", "e"] {
            clock.advance(Duration::from_millis(10));
            store
                .set(&meta(name), Bytes::from(vec![0u8; 20]))
                .await
                .unwrap();
        }
        assert_eq!(store.stats().await.unwrap().total_size_bytes, 100);

        clock.advance(Duration::from_millis(10));
        store
            .set(&meta("f"), Bytes::from(vec![0u8; 10]))
            .await
            .unwrap();

        // needing 10 bytes still frees the 20% target (one 20-byte entry)
        assert!(store.get(&meta("a").identity()).await.unwrap().is_none());
        assert!(store.get(&meta("b").identity()).await.unwrap().is_some());
        assert!(store.get(&meta("f").identity()).await.unwrap().is_some());
        assert_eq!(store.stats().await.unwrap().total_size_bytes, 90);
    }

    #[tokio::test]
    async fn test_oversized_entry_is_skipped() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store_at(&clock, 8);
        let m = meta("huge");
        store
            .set(&m, Bytes::from_static(b"definitely more than eight bytes"))
            .await
            .unwrap();
        assert!(store.get(&m.identity()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats_report_oldest_entry() {
        let clock = Arc::new(ManualClock::new(500));
        let store = store_at(&clock, 1024);
        store.set(&meta("one"), Bytes::from_static(b"1234")).await.unwrap();
        clock.advance(Duration::from_millis(100));
        store.set(&meta("two"), Bytes::from_static(b"56")).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(
            stats,
            StoreStats {
                count: 2,
                total_size_bytes: 6,
                oldest_entry: Some(500),
            }
        );
    }

    #[tokio::test]
    async fn test_remove_and_clear_both_tiers() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store_at(&clock, 1024);
        store.set(&meta("a"), Bytes::from_static(b"a")).await.unwrap();
        store.set(&meta("b"), Bytes::from_static(b"b")).await.unwrap();

        store.remove(&meta("a").identity()).await.unwrap();
        assert!(!store.contains(&meta("a").identity()).await.unwrap());
        assert!(store.contains(&meta("b").identity()).await.unwrap());

        store.clear().await.unwrap();
        assert!(!store.contains(&meta("b").identity()).await.unwrap());
        assert_eq!(store.stats().await.unwrap(), StoreStats::default());
    }

    #[tokio::test]
    async fn test_file_backed_entries_visible_to_second_store() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let backend = Arc::new(FileBackend::open(dir.path()).await.unwrap());
        let store = PiletStore::with_backend(config(1024), backend.clone(), clock.clone());
        assert!(store.is_persistent());

        store.set(&meta("nav"), Bytes::from_static(b"nav")).await.unwrap();

        // a fresh store over the same directory sees the entry
        let second = PiletStore::with_backend(config(1024), backend, clock.clone());
        let got = second.get(&meta("nav").identity()).await.unwrap().unwrap();
        assert_eq!(got.content, Bytes::from_static(b"nav"));
    }

    #[tokio::test]
    async fn test_open_falls_back_to_memory_only() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file").unwrap();

        let store = PiletStore::open(StoreConfig {
            cache_dir: Some(blocker.join("cache")),
            ..config(1024)
        })
        .await;
        assert!(!store.is_persistent());

        store.set(&meta("x"), Bytes::from_static(b"x")).await.unwrap();
        assert!(store.contains(&meta("x").identity()).await.unwrap());
    }

    #[derive(Debug, Default)]
    struct FailingBackend {
        fail_puts: AtomicBool,
    }

    #[async_trait]
    impl DurableBackend for FailingBackend {
        async fn get(&self, _identity: &PiletIdentity) -> CacheResult<Option<CachedEntry>> {
            Ok(None)
        }
        async fn put(&self, _entry: &CachedEntry) -> CacheResult<()> {
            if self.fail_puts.load(Ordering::SeqCst) {
                return Err(std::io::Error::other("quota exceeded").into());
            }
            Ok(())
        }
        async fn delete(&self, _identity: &PiletIdentity) -> CacheResult<()> {
            Ok(())
        }
        async fn clear(&self) -> CacheResult<()> {
            Ok(())
        }
        async fn entries(&self) -> CacheResult<Vec<CachedEntry>> {
            Ok(Vec::new())
        }
        fn kind(&self) -> &'static str {
            "failing"
        }
    }

    #[tokio::test]
    async fn test_rejected_durable_write_is_not_served() {
        let clock = Arc::new(ManualClock::new(0));
        let backend = Arc::new(FailingBackend::default());
        backend.fail_puts.store(true, Ordering::SeqCst);
        let store = PiletStore::with_backend(config(100), backend.clone(), clock);

        for i in 0..10 {
            let err = store
                .set(&meta(&format!("p{i}")), Bytes::from(vec![b'x'; 60]))
                .await
                .unwrap_err();
            assert!(matches!(err, CacheError::Storage { .. }));
        }

        for i in 0..10 {
            let identity = meta(&format!("p{i}")).identity();
            assert!(store.get(&identity).await.unwrap().is_none());
        }
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.count, 0);
        assert_eq!(stats.total_size_bytes, 0);

        // Writes go through again once the durable tier recovers
        backend.fail_puts.store(false, Ordering::SeqCst);
        store
            .set(&meta("p0"), Bytes::from_static(b"content"))
            .await
            .unwrap();
        let entry = store.get(&meta("p0").identity()).await.unwrap().unwrap();
        assert_eq!(entry.content, Bytes::from_static(b"content"));
    }

    #[tokio::test]
    async fn test_close_detaches_durable_tier() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let backend = Arc::new(FileBackend::open(dir.path()).await.unwrap());
        let store = PiletStore::with_backend(config(1024), backend, clock);
        store.set(&meta("a"), Bytes::from_static(b"a")).await.unwrap();

        store.close();
        assert!(!store.is_persistent());
        assert!(store.get(&meta("a").identity()).await.unwrap().is_none());
    }
}
