//! # Pilet Fetching
//!
//! Network retrieval of pilet bundles and the retry policy wrapped around it.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::Client;
use reqwest::header::{ACCEPT, CACHE_CONTROL, HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, error, warn};

use crate::config::FeedConfig;
use crate::error::{CacheError, CacheResult};
use crate::identity::PiletMetadata;

/// A one-shot network retrieval handed to a strategy.
///
/// Strategies poll it at most once; stale-while-revalidate moves it into a
/// detached task, hence `'static`.
pub type FetchFuture = BoxFuture<'static, CacheResult<Bytes>>;

/// Retrieves the bundle bytes of a pilet from the network
#[async_trait]
pub trait PiletFetcher: Send + Sync {
    async fn fetch(&self, pilet: &PiletMetadata) -> CacheResult<Bytes>;
}

/// Create a reqwest Client for feed and bundle requests
pub fn create_client(config: &FeedConfig) -> CacheResult<Client> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
        match (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "Ignoring invalid request header"),
        }
    }

    let mut builder = Client::builder()
        .pool_max_idle_per_host(5)
        .default_headers(headers)
        .redirect(reqwest::redirect::Policy::limited(10));

    if !config.request_timeout.is_zero() {
        builder = builder.timeout(config.request_timeout);
    }

    builder.build().map_err(CacheError::from)
}

/// Fetches pilet bundles over HTTP from their feed link
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PiletFetcher for HttpFetcher {
    async fn fetch(&self, pilet: &PiletMetadata) -> CacheResult<Bytes> {
        let link = pilet
            .link
            .as_deref()
            .ok_or_else(|| CacheError::MissingLink(pilet.identity().to_string()))?;

        let response = self
            .client
            .get(link)
            .header(ACCEPT, "application/javascript")
            // freshness is decided by the pilet cache, not the HTTP layer
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CacheError::HttpStatus {
                status,
                url: link.to_owned(),
            });
        }

        let bytes = response.bytes().await?;
        debug!(pilet = %pilet.identity(), size = bytes.len(), "Fetched pilet bundle");
        Ok(bytes)
    }
}

/// Bounded attempts with exponential backoff between them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_retries: u32,
    /// Delay before the first retry; doubled for each further retry
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay after the failed attempt number `attempt` (zero-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Every backoff delay the policy can apply, in order
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_retries.saturating_sub(1))
            .map(|attempt| self.delay_for(attempt))
            .collect()
    }

    /// Run `operation` until it succeeds or attempts run out.
    ///
    /// Only network failures are retried; other errors return immediately.
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> CacheResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        let attempts = self.max_retries.max(1);
        let mut attempt = 0u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    error!(
                        pilet = label,
                        attempt = attempt + 1,
                        error = %e,
                        "Failed to fetch pilet"
                    );
                    if !e.is_network() || attempt + 1 >= attempts {
                        return Err(e);
                    }

                    let delay = self.delay_for(attempt);
                    warn!(
                        pilet = label,
                        retry = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying pilet fetch after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
