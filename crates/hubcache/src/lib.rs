//! # HubCache Engine
//!
//! Caching core for pilets, the independently deployed frontend bundles a
//! MainHub shell loads at runtime.
//!
//! ## Layers
//!
//! - [`PiletStore`]: size-bounded persistent store with TTL expiry, a Moka
//!   shadow in front of a durable backend
//! - [`strategy`]: retrieval policies (cache-first, network-first,
//!   stale-while-revalidate, ...) and the metrics-keeping [`StrategyManager`]
//! - [`CacheManager`]: retried network fetches, critical preloads, health
//!   checks and maintenance
//! - [`intercept`]: an independent HTTP-level cache tier classifying requests
//!   by URL

pub mod builder;
pub mod clock;
pub mod config;
pub mod error;
pub mod feed;
pub mod fetch;
pub mod identity;
pub mod intercept;
pub mod manager;
pub mod store;
pub mod strategy;

#[cfg(test)]
mod test_utils;

pub use builder::HubCacheConfigBuilder;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheManagerConfig, FeedConfig, HubCacheConfig, StoreConfig};
pub use error::{CacheError, CacheResult};
pub use feed::{HttpFeed, PiletFeed, StaticFeed};
pub use fetch::{HttpFetcher, PiletFetcher, RetryPolicy, create_client};
pub use identity::{CachedEntry, PiletIdentity, PiletMetadata};
pub use intercept::{Interceptor, InterceptorConfig, RouteStrategy};
pub use manager::{CacheManager, CacheStats, HealthReport, MetricsExport, PreloadReport};
pub use store::{DurableBackend, FileBackend, MemoryBackend, PiletStore, StoreStats};
pub use strategy::{CacheStrategy, MetricsSnapshot, StrategyKind, StrategyManager};
