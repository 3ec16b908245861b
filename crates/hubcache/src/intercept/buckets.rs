//! Named response buckets of the interception layer.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use bytes::Bytes;
use parking_lot::RwLock;
use regex::Regex;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use serde::Serialize;
use tracing::debug;

use super::router::is_pilet_url;

static STATIC_ASSET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.(js|css|woff2?|ttf|otf|eot)$").unwrap());

/// Content classes, one bucket each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketClass {
    Static,
    Runtime,
    Pilets,
    Api,
}

impl BucketClass {
    pub const ALL: [BucketClass; 4] = [Self::Static, Self::Runtime, Self::Pilets, Self::Api];

    pub fn key(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Runtime => "runtime",
            Self::Pilets => "pilets",
            Self::Api => "api",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|class| class.key() == key)
    }

    /// Bucket a response for `url` is stored in
    pub fn for_url(url: &str) -> Self {
        if url.contains("/api/") {
            Self::Api
        } else if is_pilet_url(url) {
            Self::Pilets
        } else if STATIC_ASSET.is_match(url) {
            Self::Static
        } else {
            Self::Runtime
        }
    }
}

impl fmt::Display for BucketClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Versioned bucket names, `<prefix>-<class>-<version>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketNames {
    prefix: String,
    version: String,
}

impl BucketNames {
    pub fn new(prefix: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            version: version.into(),
        }
    }

    pub fn name(&self, class: BucketClass) -> String {
        format!("{}-{}-{}", self.prefix, class.key(), self.version)
    }

    pub fn current(&self) -> Vec<String> {
        BucketClass::ALL.iter().map(|c| self.name(*c)).collect()
    }
}

/// A response held in a bucket
#[derive(Debug, Clone)]
pub struct StoredResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

type Bucket = HashMap<String, StoredResponse>;

/// The set of named buckets, keyed by absolute URL within each bucket
#[derive(Debug, Default)]
pub struct CacheBuckets {
    buckets: RwLock<HashMap<String, Bucket>>,
}

/// Storage usage of the buckets
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StorageEstimate {
    pub usage: u64,
    pub quota: u64,
    pub percentage: f64,
}

impl CacheBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a response, creating the bucket on first use
    pub fn put(&self, bucket: &str, url: &str, response: StoredResponse) {
        self.buckets
            .write()
            .entry(bucket.to_owned())
            .or_default()
            .insert(url.to_owned(), response);
        debug!(bucket, url, "Stored response");
    }

    /// Look a URL up across every bucket
    pub fn match_url(&self, url: &str) -> Option<StoredResponse> {
        self.buckets
            .read()
            .values()
            .find_map(|bucket| bucket.get(url).cloned())
    }

    pub fn get(&self, bucket: &str, url: &str) -> Option<StoredResponse> {
        self.buckets.read().get(bucket)?.get(url).cloned()
    }

    /// Delete a bucket; false if it did not exist
    pub fn delete(&self, bucket: &str) -> bool {
        self.buckets.write().remove(bucket).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.buckets.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self, bucket: &str) -> usize {
        self.buckets.read().get(bucket).map_or(0, HashMap::len)
    }

    /// Summed body size of every stored response
    pub fn usage(&self) -> u64 {
        self.buckets
            .read()
            .values()
            .flat_map(HashMap::values)
            .map(|r| r.body.len() as u64)
            .sum()
    }

    pub fn estimate(&self, quota: u64) -> StorageEstimate {
        let usage = self.usage();
        let percentage = if quota == 0 {
            0.0
        } else {
            usage as f64 * 100.0 / quota as f64
        };
        StorageEstimate {
            usage,
            quota,
            percentage,
        }
    }
}
