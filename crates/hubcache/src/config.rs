//! # Configuration
//!
//! Configuration for the persistent store, the cache manager and the pilet
//! feed, with environment-style loading and validation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Serialize, Serializer};
use tracing::warn;

use crate::error::{CacheError, CacheResult};
use crate::strategy::StrategyKind;

pub const ENV_STRATEGY: &str = "HUBCACHE_STRATEGY";
pub const ENV_TTL_MS: &str = "HUBCACHE_TTL_MS";
pub const ENV_MAX_SIZE_MB: &str = "HUBCACHE_MAX_SIZE_MB";
pub const ENV_CRITICAL: &str = "HUBCACHE_CRITICAL";
pub const ENV_PRELOAD: &str = "HUBCACHE_PRELOAD";
pub const ENV_MAX_RETRIES: &str = "HUBCACHE_MAX_RETRIES";
pub const ENV_RETRY_DELAY_MS: &str = "HUBCACHE_RETRY_DELAY_MS";
pub const ENV_TIMEOUT_MS: &str = "HUBCACHE_TIMEOUT_MS";
pub const ENV_CACHE_DIR: &str = "HUBCACHE_CACHE_DIR";
pub const ENV_FEED_URL: &str = "HUBCACHE_FEED_URL";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "HUBCACHE_REQUEST_TIMEOUT_MS";

/// Pilets preloaded eagerly unless configured otherwise
pub const DEFAULT_CRITICAL_PILETS: [&str; 3] = ["sidebar", "dashboard", "navigation"];

const MB: u64 = 1024 * 1024;

/// Configuration for the persistent pilet store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory of the durable tier. If None, the system temp dir is used.
    pub cache_dir: Option<PathBuf>,
    /// Entries older than this are never served
    pub max_age: Duration,
    /// Upper bound on the summed size of all entries
    pub max_size_bytes: u64,
    /// Share of `max_size_bytes` an eviction sweep frees at minimum
    pub eviction_ratio: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            max_age: Duration::from_secs(60 * 60), // 1 hour
            max_size_bytes: 50 * MB,
            eviction_ratio: 0.2,
        }
    }
}

/// Runtime configuration of the cache manager
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheManagerConfig {
    /// Strategy name, resolved leniently
    pub strategy: String,
    pub preloading_enabled: bool,
    /// Names of pilets that are preloaded and exempt from optimization
    pub critical_pilets: Vec<String>,
    /// Total fetch attempts per load
    pub max_retries: u32,
    #[serde(serialize_with = "as_millis")]
    pub retry_base_delay: Duration,
    /// Deadline used by the network-first-timeout strategy
    #[serde(serialize_with = "as_millis")]
    pub network_timeout: Duration,
    /// Pilets loaded concurrently per preload batch
    pub preload_concurrency: usize,
}

impl Default for CacheManagerConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::CacheFirst.as_str().to_owned(),
            preloading_enabled: true,
            critical_pilets: DEFAULT_CRITICAL_PILETS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1000),
            network_timeout: StrategyKind::DEFAULT_TIMEOUT,
            preload_concurrency: 3,
        }
    }
}

impl CacheManagerConfig {
    pub fn is_critical(&self, name: &str) -> bool {
        self.critical_pilets.iter().any(|c| c == name)
    }

    /// The configured strategy, falling back to cache-first for unknown names
    pub fn strategy_kind(&self) -> StrategyKind {
        StrategyKind::select_with_timeout(&self.strategy, self.network_timeout)
    }
}

/// Configuration of the pilet feed client
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub url: Option<String>,
    /// Extra headers sent with every feed request
    pub headers: HashMap<String, String>,
    /// Timeout for feed and bundle requests
    pub request_timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: None,
            headers: HashMap::new(),
            request_timeout: Duration::from_secs(15),
        }
    }
}

/// Complete configuration of the caching core
#[derive(Debug, Clone, Default)]
pub struct HubCacheConfig {
    pub store: StoreConfig,
    pub manager: CacheManagerConfig,
    pub feed: FeedConfig,
}

impl HubCacheConfig {
    pub fn builder() -> crate::builder::HubCacheConfigBuilder {
        crate::builder::HubCacheConfigBuilder::new()
    }

    /// Load configuration from process environment variables
    pub fn from_env() -> CacheResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup, applying defaults for
    /// missing keys, then validate it.
    pub fn from_lookup<F>(lookup: F) -> CacheResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };

        if let Some(strategy) = get(ENV_STRATEGY) {
            config.manager.strategy = strategy;
        }
        if let Some(ttl) = get(ENV_TTL_MS) {
            config.store.max_age = Duration::from_millis(parse_number(ENV_TTL_MS, &ttl)?);
        }
        if let Some(size) = get(ENV_MAX_SIZE_MB) {
            config.store.max_size_bytes = parse_number(ENV_MAX_SIZE_MB, &size)?.saturating_mul(MB);
        }
        if let Some(critical) = get(ENV_CRITICAL) {
            config.manager.critical_pilets = critical
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect();
        }
        if let Some(preload) = get(ENV_PRELOAD) {
            config.manager.preloading_enabled = parse_bool(ENV_PRELOAD, &preload)?;
        }
        if let Some(retries) = get(ENV_MAX_RETRIES) {
            config.manager.max_retries = u32::try_from(parse_number(ENV_MAX_RETRIES, &retries)?)
                .map_err(|e| {
                    CacheError::Config(format!("Invalid value '{retries}' for {ENV_MAX_RETRIES}: {e}"))
                })?;
        }
        if let Some(delay) = get(ENV_RETRY_DELAY_MS) {
            config.manager.retry_base_delay =
                Duration::from_millis(parse_number(ENV_RETRY_DELAY_MS, &delay)?);
        }
        if let Some(timeout) = get(ENV_TIMEOUT_MS) {
            config.manager.network_timeout =
                Duration::from_millis(parse_number(ENV_TIMEOUT_MS, &timeout)?);
        }
        if let Some(dir) = get(ENV_CACHE_DIR) {
            config.store.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(url) = get(ENV_FEED_URL) {
            config.feed.url = Some(url);
        }
        if let Some(timeout) = get(ENV_REQUEST_TIMEOUT_MS) {
            config.feed.request_timeout =
                Duration::from_millis(parse_number(ENV_REQUEST_TIMEOUT_MS, &timeout)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the cache cannot run with. Unknown strategy names are
    /// only warned about; they resolve to cache-first.
    pub fn validate(&self) -> CacheResult<()> {
        if self.store.max_age.is_zero() {
            return Err(CacheError::Config("Cache TTL must be positive".into()));
        }
        if self.store.max_size_bytes == 0 {
            return Err(CacheError::Config("Cache size must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.store.eviction_ratio) {
            return Err(CacheError::Config(
                "Eviction ratio must be between 0 and 1".into(),
            ));
        }
        if self.manager.max_retries == 0 {
            return Err(CacheError::Config(
                "Retry count must be at least 1".into(),
            ));
        }
        if self.manager.preload_concurrency == 0 {
            return Err(CacheError::Config(
                "Preload concurrency must be at least 1".into(),
            ));
        }

        if StrategyKind::parse(&self.manager.strategy).is_none() {
            warn!(
                strategy = %self.manager.strategy,
                "Unknown cache strategy, cache-first will be used"
            );
        }
        if self.store.max_size_bytes < 10 * MB {
            warn!(
                max_size_bytes = self.store.max_size_bytes,
                "Cache size is very small, consider increasing it"
            );
        }
        if self.feed.request_timeout < Duration::from_secs(1) {
            warn!(
                timeout_ms = self.feed.request_timeout.as_millis() as u64,
                "Request timeout is very low, consider increasing it"
            );
        }
        Ok(())
    }
}

fn parse_number(key: &str, value: &str) -> CacheResult<u64> {
    value
        .parse::<u64>()
        .map_err(|e| CacheError::Config(format!("Invalid value '{value}' for {key}: {e}")))
}

fn parse_bool(key: &str, value: &str) -> CacheResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(CacheError::Config(format!(
            "Invalid boolean '{value}' for {key}"
        ))),
    }
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}
