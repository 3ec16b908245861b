//! Request classification for the interception layer.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use reqwest::Method;

use crate::strategy::StrategyKind;

/// Strategies available to intercepted HTTP requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteStrategy {
    NetworkFirst,
    CacheFirst,
    StaleWhileRevalidate,
    CacheOnly,
    NetworkOnly,
}

impl RouteStrategy {
    pub fn as_str(&self) -> &'static str {
        StrategyKind::from(*self).as_str()
    }
}

impl fmt::Display for RouteStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Both tiers name their strategies the same way
impl From<RouteStrategy> for StrategyKind {
    fn from(strategy: RouteStrategy) -> Self {
        match strategy {
            RouteStrategy::NetworkFirst => StrategyKind::NetworkFirst,
            RouteStrategy::CacheFirst => StrategyKind::CacheFirst,
            RouteStrategy::StaleWhileRevalidate => StrategyKind::StaleWhileRevalidate,
            RouteStrategy::CacheOnly => StrategyKind::CacheOnly,
            RouteStrategy::NetworkOnly => StrategyKind::NetworkOnly,
        }
    }
}

/// URL patterns in match order; the first hit decides
static ROUTES: LazyLock<Vec<(Regex, RouteStrategy)>> = LazyLock::new(|| {
    [
        (r"/api/", RouteStrategy::NetworkFirst),
        (r"/auth/", RouteStrategy::NetworkFirst),
        (r"\.(?:js|css|woff2?|ttf|otf|eot)$", RouteStrategy::CacheFirst),
        (r"/assets/", RouteStrategy::CacheFirst),
        (r"/static/", RouteStrategy::CacheFirst),
        (r"\.(?:png|jpg|jpeg|svg|gif|webp|ico)$", RouteStrategy::StaleWhileRevalidate),
        (r"/images/", RouteStrategy::StaleWhileRevalidate),
        (r"/offline/", RouteStrategy::CacheOnly),
    ]
    .into_iter()
    .map(|(pattern, strategy)| (Regex::new(pattern).unwrap(), strategy))
    .collect()
});

/// Whether the URL addresses a pilet bundle
pub fn is_pilet_url(url: &str) -> bool {
    url.contains("/pilets/") || url.contains('@')
}

/// Choose the strategy for a request.
///
/// Anything but GET goes to the network untouched. GET requests take the
/// first matching pattern, then pilet URLs are cache-first, and everything
/// else is network-first.
pub fn classify(method: &Method, url: &str) -> RouteStrategy {
    if *method != Method::GET {
        return RouteStrategy::NetworkOnly;
    }

    if let Some((_, strategy)) = ROUTES.iter().find(|(pattern, _)| pattern.is_match(url)) {
        return *strategy;
    }

    if is_pilet_url(url) {
        RouteStrategy::CacheFirst
    } else {
        RouteStrategy::NetworkFirst
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGIN: &str = "https://hub.example.com";

    fn get(path: &str) -> RouteStrategy {
        classify(&Method::GET, &format!("{ORIGIN}{path}"))
    }

    #[test]
    fn test_pattern_table() {
        assert_eq!(get("/api/v1/users"), RouteStrategy::NetworkFirst);
        assert_eq!(get("/auth/login"), RouteStrategy::NetworkFirst);
        assert_eq!(get("/main.js"), RouteStrategy::CacheFirst);
        assert_eq!(get("/fonts/inter.woff2"), RouteStrategy::CacheFirst);
        assert_eq!(get("/assets/logo"), RouteStrategy::CacheFirst);
        assert_eq!(get("/logo.svg"), RouteStrategy::StaleWhileRevalidate);
        assert_eq!(get("/images/banner"), RouteStrategy::StaleWhileRevalidate);
        assert_eq!(get("/offline/page"), RouteStrategy::CacheOnly);
        assert_eq!(get("/settings"), RouteStrategy::NetworkFirst);
    }

    #[test]
    fn test_first_match_wins() {
        // /api/ precedes the .js extension
        assert_eq!(get("/api/bundle.js"), RouteStrategy::NetworkFirst);
        // the image extension precedes /offline/
        assert_eq!(get("/offline/banner.png"), RouteStrategy::StaleWhileRevalidate);
    }

    #[test]
    fn test_pilet_urls_are_cache_first() {
        assert_eq!(get("/pilets/dashboard"), RouteStrategy::CacheFirst);
        assert_eq!(get("/bundles/@acme/sidebar@1.0.0"), RouteStrategy::CacheFirst);
    }

    #[test]
    fn test_non_get_is_network_only() {
        let url = format!("{ORIGIN}/main.js");
        assert_eq!(classify(&Method::POST, &url), RouteStrategy::NetworkOnly);
        assert_eq!(
            classify(&Method::DELETE, &format!("{ORIGIN}/api/items/1")),
            RouteStrategy::NetworkOnly
        );
    }

    #[test]
    fn test_names_match_pilet_strategies() {
        assert_eq!(RouteStrategy::StaleWhileRevalidate.as_str(), "stale-while-revalidate");
        assert_eq!(
            StrategyKind::from(RouteStrategy::CacheOnly),
            StrategyKind::CacheOnly
        );
    }
}
