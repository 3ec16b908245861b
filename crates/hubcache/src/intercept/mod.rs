//! # Interception Layer
//!
//! An HTTP-level cache tier in front of the network. Requests are classified
//! by URL into the same strategy taxonomy the pilet cache uses and answered
//! from versioned response buckets or the upstream. This tier keeps its own
//! state and does not share entries with the [`PiletStore`](crate::PiletStore).

pub mod buckets;
pub mod messages;
pub mod router;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::clock::{Clock, SystemClock};
use crate::error::{CacheError, CacheResult};
use crate::feed::PiletFeed;
use crate::identity::PiletMetadata;

pub use buckets::{BucketClass, BucketNames, CacheBuckets, StorageEstimate, StoredResponse};
pub use messages::{WorkerMessage, WorkerReply};
pub use router::{RouteStrategy, classify, is_pilet_url};

/// Header carrying the time a response was stored, in epoch milliseconds
pub const CACHE_TIME_HEADER: &str = "sw-cache-time";
const OFFLINE_PAGE: &str = "/offline.html";
const OFFLINE_BODY: &str = "Offline - Content not available";

/// An HTTP request seen by the interception layer
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub method: Method,
    pub url: String,
    /// Top-level page navigation
    pub navigate: bool,
}

impl InterceptedRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            navigate: false,
        }
    }

    pub fn navigation(url: impl Into<String>) -> Self {
        Self {
            navigate: true,
            ..Self::get(url)
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }
}

/// Response type of the interception layer
pub type InterceptedResponse = StoredResponse;

impl StoredResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    fn cached_at(&self) -> Option<u64> {
        self.headers
            .get(CACHE_TIME_HEADER)?
            .to_str()
            .ok()?
            .parse()
            .ok()
    }

    fn stamped(mut self, now: u64) -> Self {
        self.headers
            .insert(CACHE_TIME_HEADER, HeaderValue::from(now));
        self
    }
}

/// Transport used for requests the buckets cannot answer
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch(&self, request: &InterceptedRequest) -> CacheResult<InterceptedResponse>;
}

/// Upstream over a reqwest client
#[derive(Debug, Clone)]
pub struct ReqwestUpstream {
    client: Client,
}

impl ReqwestUpstream {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Upstream for ReqwestUpstream {
    async fn fetch(&self, request: &InterceptedRequest) -> CacheResult<InterceptedResponse> {
        let response = self
            .client
            .request(request.method.clone(), &request.url)
            .send()
            .await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok(StoredResponse {
            status,
            headers,
            body,
        })
    }
}

/// Configuration of the interception layer
#[derive(Debug, Clone)]
pub struct InterceptorConfig {
    /// Origin of the hosting application
    pub origin: Url,
    pub bucket_prefix: String,
    pub cache_version: String,
    /// Cross-origin URL prefixes that are intercepted as well
    pub allowed_cdns: Vec<String>,
    /// Paths stored at install time
    pub precache: Vec<String>,
    /// Lifetime of cache-first entries
    pub static_max_age: Duration,
    /// Deadline of network-first upstream requests
    pub network_timeout: Duration,
    /// Storage budget reported with the usage estimate
    pub quota_bytes: u64,
}

impl InterceptorConfig {
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            bucket_prefix: "hubcache".to_owned(),
            cache_version: "v1.0.0".to_owned(),
            allowed_cdns: [
                "https://cdn.jsdelivr.net",
                "https://unpkg.com",
                "https://cdnjs.cloudflare.com",
                "https://fonts.googleapis.com",
                "https://fonts.gstatic.com",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            precache: ["/", "/index.html", "/manifest.json", "/favicon.ico"]
                .into_iter()
                .map(String::from)
                .collect(),
            static_max_age: Duration::from_secs(7 * 24 * 60 * 60),
            network_timeout: Duration::from_secs(5),
            quota_bytes: 100 * 1024 * 1024,
        }
    }

    pub fn names(&self) -> BucketNames {
        BucketNames::new(&self.bucket_prefix, &self.cache_version)
    }
}

/// Lifecycle of the interception layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Parsed,
    Installed,
    Activated,
}

pub struct Interceptor {
    config: InterceptorConfig,
    names: BucketNames,
    buckets: Arc<CacheBuckets>,
    upstream: Arc<dyn Upstream>,
    clock: Arc<dyn Clock>,
    state: RwLock<WorkerState>,
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("origin", &self.config.origin.as_str())
            .field("version", &self.config.cache_version)
            .field("state", &*self.state.read())
            .finish()
    }
}

impl Interceptor {
    pub fn new(config: InterceptorConfig, upstream: Arc<dyn Upstream>) -> Self {
        Self::with_parts(config, upstream, Arc::new(CacheBuckets::new()), Arc::new(SystemClock))
    }

    /// Create an interceptor over existing buckets, e.g. those of a
    /// previous version
    pub fn with_parts(
        config: InterceptorConfig,
        upstream: Arc<dyn Upstream>,
        buckets: Arc<CacheBuckets>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            names: config.names(),
            config,
            buckets,
            upstream,
            clock,
            state: RwLock::new(WorkerState::Parsed),
        }
    }

    pub fn buckets(&self) -> &Arc<CacheBuckets> {
        &self.buckets
    }

    pub fn state(&self) -> WorkerState {
        *self.state.read()
    }

    pub fn bucket_name(&self, class: BucketClass) -> String {
        self.names.name(class)
    }

    fn absolute(&self, path: &str) -> CacheResult<String> {
        self.config
            .origin
            .join(path)
            .map(String::from)
            .map_err(|e| CacheError::Config(format!("Invalid URL '{path}': {e}")))
    }

    /// Precache the static assets, then take over without waiting.
    /// A failed precache is logged and leaves the layer installed.
    pub async fn install(&self) {
        info!(version = %self.config.cache_version, "Installing interception layer");
        if let Err(e) = self.precache().await {
            error!(error = %e, "Install failed");
        }
        *self.state.write() = WorkerState::Installed;
        self.skip_waiting().await;
    }

    async fn precache(&self) -> CacheResult<()> {
        let bucket = self.bucket_name(BucketClass::Static);
        // all or nothing
        let mut fetched = Vec::with_capacity(self.config.precache.len());
        for path in &self.config.precache {
            let url = self.absolute(path)?;
            let response = self.upstream.fetch(&InterceptedRequest::get(&url)).await?;
            if !response.is_success() {
                return Err(CacheError::HttpStatus {
                    status: response.status,
                    url,
                });
            }
            fetched.push((url, response));
        }
        for (url, response) in fetched {
            self.buckets.put(&bucket, &url, response);
        }
        debug!(count = self.config.precache.len(), "Precached static assets");
        Ok(())
    }

    /// Drop buckets of other versions and start serving
    pub async fn activate(&self) {
        info!(version = %self.config.cache_version, "Activating interception layer");
        let current = self.names.current();
        for name in self.buckets.names() {
            if !current.contains(&name) {
                info!(bucket = %name, "Deleting old cache");
                self.buckets.delete(&name);
            }
        }
        *self.state.write() = WorkerState::Activated;
    }

    /// Activate an installed layer immediately
    pub async fn skip_waiting(&self) {
        if self.state() == WorkerState::Installed {
            self.activate().await;
        }
    }

    /// Whether a request to `url` is handled by this layer: http(s) only,
    /// same origin or an allowed CDN
    pub fn should_intercept(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return false;
        }
        parsed.origin() == self.config.origin.origin()
            || self
                .config
                .allowed_cdns
                .iter()
                .any(|cdn| parsed.as_str().starts_with(cdn.as_str()))
    }

    /// Answer a request. Requests outside the layer's scope go straight to
    /// the upstream; intercepted ones never fail and degrade to an offline
    /// response instead.
    pub async fn handle(&self, request: &InterceptedRequest) -> CacheResult<InterceptedResponse> {
        if !self.should_intercept(&request.url) {
            return self.upstream.fetch(request).await;
        }

        let strategy = classify(&request.method, &request.url);
        debug!(url = %request.url, strategy = %strategy, "Intercepted request");

        match self.execute(strategy, request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(url = %request.url, error = %e, "Fetch failed, serving offline fallback");
                Ok(self.offline_response(request))
            }
        }
    }

    async fn execute(
        &self,
        strategy: RouteStrategy,
        request: &InterceptedRequest,
    ) -> CacheResult<InterceptedResponse> {
        match strategy {
            RouteStrategy::CacheFirst => self.cache_first(request).await,
            RouteStrategy::NetworkFirst => self.network_first(request).await,
            RouteStrategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
            RouteStrategy::CacheOnly => self
                .buckets
                .match_url(&request.url)
                .ok_or_else(|| CacheError::NotFound(request.url.clone())),
            RouteStrategy::NetworkOnly => self.upstream.fetch(request).await,
        }
    }

    fn store_response(&self, url: &str, response: &InterceptedResponse) {
        let bucket = self.bucket_name(BucketClass::for_url(url));
        self.buckets.put(&bucket, url, response.clone());
    }

    fn is_fresh(&self, response: &StoredResponse) -> bool {
        response.cached_at().is_some_and(|at| {
            let age = self.clock.now_millis().saturating_sub(at);
            u128::from(age) <= self.config.static_max_age.as_millis()
        })
    }

    async fn cache_first(&self, request: &InterceptedRequest) -> CacheResult<InterceptedResponse> {
        if let Some(cached) = self.buckets.match_url(&request.url) {
            if self.is_fresh(&cached) {
                return Ok(cached);
            }
        }

        let response = self.upstream.fetch(request).await?;
        if response.is_success() {
            let stamped = response.clone().stamped(self.clock.now_millis());
            self.store_response(&request.url, &stamped);
        }
        Ok(response)
    }

    async fn network_first(
        &self,
        request: &InterceptedRequest,
    ) -> CacheResult<InterceptedResponse> {
        let timeout = self.config.network_timeout;
        let outcome = match tokio::time::timeout(timeout, self.upstream.fetch(request)).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(timeout)),
        };

        match outcome {
            Ok(response) => {
                if response.is_success() {
                    self.store_response(&request.url, &response);
                }
                Ok(response)
            }
            Err(e) => self.buckets.match_url(&request.url).ok_or(e),
        }
    }

    async fn stale_while_revalidate(
        &self,
        request: &InterceptedRequest,
    ) -> CacheResult<InterceptedResponse> {
        let Some(cached) = self.buckets.match_url(&request.url) else {
            let response = self.upstream.fetch(request).await?;
            if response.is_success() {
                self.store_response(&request.url, &response);
            }
            return Ok(response);
        };

        let upstream = self.upstream.clone();
        let buckets = self.buckets.clone();
        let bucket = self.bucket_name(BucketClass::for_url(&request.url));
        let request = request.clone();
        tokio::spawn(async move {
            match upstream.fetch(&request).await {
                Ok(response) if response.is_success() => {
                    buckets.put(&bucket, &request.url, response);
                }
                Ok(response) => {
                    debug!(url = %request.url, status = %response.status, "Revalidation not stored");
                }
                Err(e) => warn!(url = %request.url, error = %e, "Failed to revalidate response"),
            }
        });

        Ok(cached)
    }

    fn offline_response(&self, request: &InterceptedRequest) -> InterceptedResponse {
        if let Some(cached) = self.buckets.match_url(&request.url) {
            return cached;
        }

        if request.navigate {
            let page = self
                .absolute(OFFLINE_PAGE)
                .ok()
                .and_then(|url| self.buckets.match_url(&url));
            if let Some(page) = page {
                return page;
            }
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        StoredResponse {
            status: StatusCode::SERVICE_UNAVAILABLE,
            headers,
            body: Bytes::from_static(OFFLINE_BODY.as_bytes()),
        }
    }

    /// Answer a control message; `None` for messages without a reply
    pub async fn handle_message(&self, message: WorkerMessage) -> Option<WorkerReply> {
        match message {
            WorkerMessage::SkipWaiting => {
                self.skip_waiting().await;
                None
            }
            WorkerMessage::CachePilet { pilet, content } => Some(
                match self.cache_pilet(&pilet, Bytes::from(content)) {
                    Ok(()) => WorkerReply::ok(),
                    Err(e) => WorkerReply::failed(e),
                },
            ),
            WorkerMessage::ClearCache { cache_name } => {
                self.clear_cache(cache_name.as_deref());
                Some(WorkerReply::ok())
            }
            WorkerMessage::GetCacheSize => Some(WorkerReply::Size {
                size: self.cache_size(),
            }),
        }
    }

    /// Put a pilet bundle into the pilet bucket under its link, or
    /// `/pilets/<name>@<version>` without one
    pub fn cache_pilet(&self, pilet: &PiletMetadata, content: Bytes) -> CacheResult<()> {
        let path = match &pilet.link {
            Some(link) => link.clone(),
            None => format!("/pilets/{}", pilet.identity()),
        };
        let url = self.absolute(&path)?;

        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/javascript"),
        );
        headers.insert(
            HeaderName::from_static("x-pilet-name"),
            header_value(&pilet.name)?,
        );
        headers.insert(
            HeaderName::from_static("x-pilet-version"),
            header_value(&pilet.version)?,
        );

        let response = StoredResponse {
            status: StatusCode::OK,
            headers,
            body: content,
        }
        .stamped(self.clock.now_millis());

        self.buckets
            .put(&self.bucket_name(BucketClass::Pilets), &url, response);
        info!(pilet = %pilet.identity(), "Cached pilet");
        Ok(())
    }

    /// Delete one bucket by class key, or every current bucket without one.
    /// Unknown keys are ignored.
    pub fn clear_cache(&self, class_key: Option<&str>) {
        match class_key {
            Some(key) => match BucketClass::from_key(key) {
                Some(class) => {
                    self.buckets.delete(&self.bucket_name(class));
                    info!(bucket = key, "Cleared cache");
                }
                None => debug!(bucket = key, "Unknown cache, nothing cleared"),
            },
            None => {
                for name in self.names.current() {
                    self.buckets.delete(&name);
                }
                info!("Cleared all caches");
            }
        }
    }

    pub fn cache_size(&self) -> StorageEstimate {
        self.buckets.estimate(self.config.quota_bytes)
    }

    /// Re-fetch every pilet bundle listed by the feed into the pilet bucket.
    /// Returns the number of bundles stored.
    pub async fn sync_pilets(&self, feed: &dyn PiletFeed) -> usize {
        let pilets = feed.available_pilets().await;
        let bucket = self.bucket_name(BucketClass::Pilets);
        let mut synced = 0;

        for pilet in &pilets {
            let Some(link) = pilet.link.as_deref() else {
                continue;
            };
            let url = match self.absolute(link) {
                Ok(url) => url,
                Err(e) => {
                    warn!(pilet = %pilet.identity(), error = %e, "Skipping pilet with bad link");
                    continue;
                }
            };
            match self.upstream.fetch(&InterceptedRequest::get(&url)).await {
                Ok(response) if response.is_success() => {
                    self.buckets.put(&bucket, &url, response);
                    synced += 1;
                }
                Ok(response) => {
                    warn!(pilet = %pilet.identity(), status = %response.status, "Pilet sync rejected")
                }
                Err(e) => warn!(pilet = %pilet.identity(), error = %e, "Pilet sync failed"),
            }
        }

        info!(listed = pilets.len(), synced, "Synced pilets");
        synced
    }
}

fn header_value(value: &str) -> CacheResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| CacheError::Internal(format!("Invalid header value '{value}': {e}")))
}
