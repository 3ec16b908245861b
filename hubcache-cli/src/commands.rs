use std::io::Write;
use std::sync::Arc;

use hubcache_engine::intercept::{BucketClass, classify};
use hubcache_engine::{CacheManager, PiletFeed, PiletMetadata};
use reqwest::Method;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::cli::Command;
use crate::error::AppError;

/// Everything a subcommand runs against
pub struct Session {
    pub manager: CacheManager,
    pub feed: Option<Arc<dyn PiletFeed>>,
}

impl Session {
    pub async fn run(&self, command: Command) -> Result<(), AppError> {
        match command {
            Command::Load {
                name,
                version,
                link,
                output,
            } => {
                let pilet = self
                    .resolve_pilet(&name, version.as_deref(), link)
                    .await?;
                let content = self.manager.load_pilet(&pilet).await?;
                info!(
                    pilet = %pilet.identity(),
                    bytes = content.len(),
                    strategy = %self.manager.strategies().strategy_name(),
                    "Pilet loaded"
                );
                match output {
                    Some(path) => tokio::fs::write(&path, &content).await?,
                    None => std::io::stdout().write_all(&content)?,
                }
            }
            Command::Preload => {
                let Some(feed) = &self.feed else {
                    return Err(AppError::InvalidInput(
                        "preloading needs a feed URL (--feed-url or HUBCACHE_FEED_URL)".into(),
                    ));
                };
                let pilets = feed.available_pilets().await;
                if pilets.is_empty() {
                    warn!("Feed returned no pilets");
                }
                let report = self.manager.preload_critical(&pilets).await;
                print_json(&serde_json::to_value(report)?)?;
            }
            Command::Stats => print_json(&serde_json::to_value(self.manager.stats().await?)?)?,
            Command::Health => {
                print_json(&serde_json::to_value(self.manager.health_check().await)?)?
            }
            Command::Metrics => {
                print_json(&serde_json::to_value(self.manager.export_metrics().await?)?)?
            }
            Command::Optimize => {
                let removed = self.manager.optimize().await?;
                print_json(&json!({ "removed": removed }))?;
            }
            Command::Invalidate { name, version } => {
                let removed = self.manager.invalidate(&name, version.as_deref()).await?;
                print_json(&json!({ "removed": removed }))?;
            }
            Command::Clear => {
                self.manager.invalidate_all().await?;
                info!("Pilet cache cleared");
            }
            Command::Route { url, method } => print_json(&describe_route(&method, &url)?)?,
        }
        Ok(())
    }

    /// Metadata for `name`, from the feed when one is configured
    async fn resolve_pilet(
        &self,
        name: &str,
        version: Option<&str>,
        link: Option<String>,
    ) -> Result<PiletMetadata, AppError> {
        if let Some(feed) = &self.feed {
            return feed.pilet(name, version).await.ok_or_else(|| {
                AppError::InvalidInput(format!("pilet '{name}' is not listed by the feed"))
            });
        }

        let version = version.ok_or_else(|| {
            AppError::InvalidInput("a version is required when no feed is configured".into())
        })?;
        let pilet = PiletMetadata::new(name, version);
        Ok(match link {
            Some(link) => pilet.with_link(link),
            None => pilet,
        })
    }
}

/// How the interception layer treats `method url`
pub fn describe_route(method: &str, url: &str) -> Result<Value, AppError> {
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| AppError::InvalidInput(format!("invalid HTTP method '{method}'")))?;
    let strategy = classify(&method, url);
    Ok(json!({
        "method": method.as_str(),
        "url": url,
        "strategy": strategy.as_str(),
        "bucket": BucketClass::for_url(url).key(),
    }))
}

fn print_json(value: &Value) -> Result<(), AppError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubcache_engine::{
        CacheManagerConfig, HttpFetcher, PiletStore, StaticFeed, StoreConfig, SystemClock,
    };

    fn session(feed: Option<Arc<dyn PiletFeed>>) -> Session {
        let store = Arc::new(PiletStore::memory_only(
            StoreConfig::default(),
            Arc::new(SystemClock),
        ));
        let fetcher = Arc::new(HttpFetcher::new(reqwest::Client::new()));
        Session {
            manager: CacheManager::new(CacheManagerConfig::default(), store, fetcher),
            feed,
        }
    }

    #[test]
    fn test_describe_route() {
        let route = describe_route("get", "https://hub.example.com/pilets/sidebar.js").unwrap();
        assert_eq!(route["method"], "GET");
        assert_eq!(route["strategy"], "cache-first");
        assert_eq!(route["bucket"], "pilets");

        let route = describe_route("POST", "https://hub.example.com/api/v1/pilets").unwrap();
        assert_eq!(route["strategy"], "network-only");
        assert_eq!(route["bucket"], "api");

        assert!(describe_route("NOT A METHOD", "https://hub.example.com/").is_err());
    }

    #[tokio::test]
    async fn test_resolve_without_feed_needs_version() {
        let session = session(None);
        assert!(matches!(
            session.resolve_pilet("sidebar", None, None).await,
            Err(AppError::InvalidInput(_))
        ));

        let pilet = session
            .resolve_pilet("sidebar", Some("1.0.0"), Some("https://cdn/s.js".into()))
            .await
            .unwrap();
        assert_eq!(pilet.identity().to_string(), "sidebar@1.0.0");
        assert_eq!(pilet.link.as_deref(), Some("https://cdn/s.js"));
    }

    #[tokio::test]
    async fn test_resolve_from_feed() {
        let feed: Arc<dyn PiletFeed> = Arc::new(StaticFeed::new(vec![
            PiletMetadata::new("sidebar", "1.0.0"),
            PiletMetadata::new("sidebar", "2.0.0"),
        ]));
        let session = session(Some(feed));

        let first = session.resolve_pilet("sidebar", None, None).await.unwrap();
        assert_eq!(first.version, "1.0.0");
        let pinned = session
            .resolve_pilet("sidebar", Some("2.0.0"), None)
            .await
            .unwrap();
        assert_eq!(pinned.version, "2.0.0");
        assert!(session.resolve_pilet("dashboard", None, None).await.is_err());
    }
}
