//! # Pilet Feed
//!
//! Sources of pilet metadata. [`HttpFeed`] reads the feed service and
//! remembers what it has seen; [`StaticFeed`] serves a fixed list.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{CacheError, CacheResult};
use crate::identity::{PiletIdentity, PiletMetadata};

/// Decides whether the current user may load a pilet
pub type AccessFilter = Arc<dyn Fn(&PiletMetadata) -> bool + Send + Sync>;

#[async_trait]
pub trait PiletFeed: Send + Sync {
    /// Every pilet the user has access to. Feed failures yield an empty list.
    async fn available_pilets(&self) -> Vec<PiletMetadata>;

    /// A pilet by name, optionally pinned to a version
    async fn pilet(&self, name: &str, version: Option<&str>) -> Option<PiletMetadata> {
        self.available_pilets()
            .await
            .into_iter()
            .find(|p| matches_request(p, name, version))
    }
}

fn matches_request(pilet: &PiletMetadata, name: &str, version: Option<&str>) -> bool {
    pilet.name == name && version.is_none_or(|v| pilet.version == v)
}

#[derive(Debug, Deserialize)]
struct FeedResponse {
    #[serde(default)]
    items: Vec<PiletMetadata>,
}

/// Feed service client
pub struct HttpFeed {
    client: Client,
    url: Url,
    access: AccessFilter,
    known: RwLock<HashMap<PiletIdentity, PiletMetadata>>,
}

impl std::fmt::Debug for HttpFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFeed")
            .field("url", &self.url.as_str())
            .field("known", &self.known.read().len())
            .finish()
    }
}

impl HttpFeed {
    /// Create a feed client. The client carries the configured headers and
    /// timeout.
    pub fn new(client: Client, url: &str) -> CacheResult<Self> {
        let url = Url::parse(url)
            .map_err(|e| CacheError::Config(format!("Invalid feed URL '{url}': {e}")))?;
        Ok(Self {
            client,
            url,
            access: Arc::new(|_: &PiletMetadata| true),
            known: RwLock::new(HashMap::new()),
        })
    }

    pub fn with_access_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&PiletMetadata) -> bool + Send + Sync + 'static,
    {
        self.access = Arc::new(filter);
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Forget every remembered pilet
    pub fn clear(&self) {
        self.known.write().clear();
        debug!("Feed metadata cleared");
    }

    async fn fetch_feed(&self) -> CacheResult<Vec<PiletMetadata>> {
        let response = self
            .client
            .get(self.url.clone())
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CacheError::HttpStatus {
                status,
                url: self.url.to_string(),
            });
        }

        let body = response.bytes().await?;
        self.ingest(&body)
    }

    /// Decode a feed body: resolve relative links against the feed URL,
    /// drop pilets the user cannot access, and remember the rest.
    fn ingest(&self, body: &[u8]) -> CacheResult<Vec<PiletMetadata>> {
        let response: FeedResponse = serde_json::from_slice(body)?;
        let mut pilets = Vec::with_capacity(response.items.len());

        for mut pilet in response.items {
            if !(self.access)(&pilet) {
                debug!(pilet = %pilet.identity(), "Pilet filtered out by access rules");
                continue;
            }
            if let Some(link) = pilet.link.as_deref() {
                match self.url.join(link) {
                    Ok(resolved) => pilet.link = Some(resolved.into()),
                    Err(e) => warn!(pilet = %pilet.identity(), link, error = %e, "Unusable pilet link"),
                }
            }
            pilets.push(pilet);
        }

        let mut known = self.known.write();
        for pilet in &pilets {
            known.insert(pilet.identity(), pilet.clone());
        }
        Ok(pilets)
    }
}

#[async_trait]
impl PiletFeed for HttpFeed {
    async fn available_pilets(&self) -> Vec<PiletMetadata> {
        info!(url = %self.url, "Fetching pilets from feed");
        match self.fetch_feed().await {
            Ok(pilets) => {
                debug!(count = pilets.len(), "Feed returned pilets");
                pilets
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "Failed to fetch pilets");
                Vec::new()
            }
        }
    }

    async fn pilet(&self, name: &str, version: Option<&str>) -> Option<PiletMetadata> {
        let remembered = self
            .known
            .read()
            .values()
            .find(|p| matches_request(p, name, version))
            .cloned();
        if remembered.is_some() {
            return remembered;
        }

        self.available_pilets()
            .await
            .into_iter()
            .find(|p| matches_request(p, name, version))
    }
}

/// A feed over a fixed list
#[derive(Debug, Clone, Default)]
pub struct StaticFeed {
    pilets: Vec<PiletMetadata>,
}

impl StaticFeed {
    pub fn new(pilets: Vec<PiletMetadata>) -> Self {
        Self { pilets }
    }
}

#[async_trait]
impl PiletFeed for StaticFeed {
    async fn available_pilets(&self) -> Vec<PiletMetadata> {
        self.pilets.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = r#"{
        "items": [
            {"name": "@acme/dashboard", "version": "1.0.0", "link": "/pilets/dashboard.js", "spec": "v2",
             "requireRef": "dashboardPilet", "config": {"permissions": ["USER"]}},
            {"name": "@acme/admin", "version": "2.1.0", "link": "https://cdn.example.com/admin.js",
             "custom": {"requiredRole": "ADMIN"}},
            {"name": "@acme/dashboard", "version": "0.9.0"}
        ],
        "timestamp": 1700000000000,
        "version": "1"
    }"#;

    fn feed() -> HttpFeed {
        HttpFeed::new(Client::new(), "https://hub.example.com/api/v1/pilets").unwrap()
    }

    #[test]
    fn test_ingest_resolves_links_and_remembers() {
        let feed = feed();
        let pilets = feed.ingest(BODY.as_bytes()).unwrap();

        assert_eq!(pilets.len(), 3);
        assert_eq!(
            pilets[0].link.as_deref(),
            Some("https://hub.example.com/pilets/dashboard.js")
        );
        assert_eq!(pilets[0].require_ref.as_deref(), Some("dashboardPilet"));
        assert_eq!(pilets[1].link.as_deref(), Some("https://cdn.example.com/admin.js"));
        assert_eq!(feed.known.read().len(), 3);

        feed.clear();
        assert!(feed.known.read().is_empty());
    }

    #[test]
    fn test_access_filter_drops_pilets() {
        let feed = feed().with_access_filter(|p| p.custom.is_none());
        let names: Vec<_> = feed
            .ingest(BODY.as_bytes())
            .unwrap()
            .into_iter()
            .map(|p| p.identity().to_string())
            .collect();
        assert_eq!(names, vec!["@acme/dashboard@1.0.0", "@acme/dashboard@0.9.0"]);
    }

    #[test]
    fn test_missing_items_is_empty() {
        assert!(feed().ingest(b"{}").unwrap().is_empty());
        assert!(feed().ingest(b"not json").is_err());
    }

    #[tokio::test]
    async fn test_remembered_pilets_answer_lookups() {
        let feed = feed();
        feed.ingest(BODY.as_bytes()).unwrap();

        let pinned = feed.pilet("@acme/dashboard", Some("0.9.0")).await.unwrap();
        assert_eq!(pinned.version, "0.9.0");
        let any = feed.pilet("@acme/admin", None).await.unwrap();
        assert_eq!(any.version, "2.1.0");
    }

    #[tokio::test]
    async fn test_unreachable_feed_yields_empty_list() {
        let feed = HttpFeed::new(Client::new(), "http://127.0.0.1:1/pilets").unwrap();
        assert!(feed.available_pilets().await.is_empty());
        assert!(feed.pilet("anything", None).await.is_none());
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        assert!(matches!(
            HttpFeed::new(Client::new(), "not a url"),
            Err(CacheError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_static_feed_lookup() {
        let feed = StaticFeed::new(vec![
            PiletMetadata::new("sidebar", "1.0.0"),
            PiletMetadata::new("sidebar", "1.1.0"),
        ]);
        assert_eq!(feed.available_pilets().await.len(), 2);
        assert_eq!(feed.pilet("sidebar", Some("1.1.0")).await.unwrap().version, "1.1.0");
        assert_eq!(feed.pilet("sidebar", None).await.unwrap().version, "1.0.0");
        assert!(feed.pilet("sidebar", Some("9.9.9")).await.is_none());
    }
}
