//! # Builder for HubCacheConfig
//!
//! Fluent construction of [`HubCacheConfig`] instances.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use hubcache_engine::HubCacheConfig;
//!
//! let config = HubCacheConfig::builder()
//!     .with_strategy("stale-while-revalidate")
//!     .with_max_age(Duration::from_secs(600))
//!     .with_max_size_mb(20)
//!     .with_critical_pilets(["sidebar", "dashboard"])
//!     .with_retries(3, Duration::from_millis(500))
//!     .with_feed_url("https://feed.example.com/api/v1/pilets")
//!     .build();
//!
//! assert!(config.validate().is_ok());
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::HubCacheConfig;

/// Builder for creating HubCacheConfig instances with a fluent API
#[derive(Debug, Clone, Default)]
pub struct HubCacheConfigBuilder {
    config: HubCacheConfig,
}

impl HubCacheConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration, e.g. one loaded from the environment
    pub fn from_config(config: HubCacheConfig) -> Self {
        Self { config }
    }

    /// Set the strategy by name
    pub fn with_strategy(mut self, name: impl Into<String>) -> Self {
        self.config.manager.strategy = name.into();
        self
    }

    /// Set the entry TTL
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.config.store.max_age = max_age;
        self
    }

    /// Set the maximum store size in bytes
    pub fn with_max_size_bytes(mut self, bytes: u64) -> Self {
        self.config.store.max_size_bytes = bytes;
        self
    }

    /// Set the maximum store size in megabytes
    pub fn with_max_size_mb(self, mb: u64) -> Self {
        self.with_max_size_bytes(mb.saturating_mul(1024 * 1024))
    }

    /// Set the durable store directory
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.store.cache_dir = Some(dir.into());
        self
    }

    /// Replace the critical pilet set
    pub fn with_critical_pilets<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.manager.critical_pilets = names.into_iter().map(Into::into).collect();
        self
    }

    /// Enable or disable preloading
    pub fn with_preloading(mut self, enabled: bool) -> Self {
        self.config.manager.preloading_enabled = enabled;
        self
    }

    /// Set the attempt count and backoff base of network fetches
    pub fn with_retries(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.config.manager.max_retries = max_retries;
        self.config.manager.retry_base_delay = base_delay;
        self
    }

    /// Set the deadline of the network-first-timeout strategy
    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.config.manager.network_timeout = timeout;
        self
    }

    /// Set the feed URL
    pub fn with_feed_url(mut self, url: impl Into<String>) -> Self {
        self.config.feed.url = Some(url.into());
        self
    }

    /// Add a header sent with every feed request
    pub fn with_feed_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.feed.headers.insert(name.into(), value.into());
        self
    }

    /// Set the HTTP request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.feed.request_timeout = timeout;
        self
    }

    /// Build the configuration
    pub fn build(self) -> HubCacheConfig {
        self.config
    }
}
