//! # Pilet Identity
//!
//! Identity, metadata, and cached-entry types shared by every cache tier.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Unique key of a cached pilet artifact, rendered as `name@version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PiletIdentity {
    name: String,
    version: String,
}

impl PiletIdentity {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Convert to a filename-safe string
    pub fn to_filename(&self) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update("@");
        hasher.update(self.version.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Display for PiletIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

impl FromStr for PiletIdentity {
    type Err = CacheError;

    /// Splits on the last `@`, so scoped names such as `@scope/pilet@1.0.0` parse.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('@') {
            Some((name, version)) if !name.is_empty() && !version.is_empty() => {
                Ok(Self::new(name, version))
            }
            _ => Err(CacheError::Config(format!(
                "Invalid pilet identity '{s}', expected name@version"
            ))),
        }
    }
}

/// Descriptive record of a pilet as delivered by the feed.
///
/// The cache only interprets `name`, `version` and `link`; every other field
/// is carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PiletMetadata {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub config: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<serde_json::Value>,
}

impl PiletMetadata {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            link: None,
            spec: None,
            require_ref: None,
            integrity: None,
            config: serde_json::Map::new(),
            custom: None,
        }
    }

    /// Set the retrieval link
    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn identity(&self) -> PiletIdentity {
        PiletIdentity::new(&self.name, &self.version)
    }
}

/// A pilet bundle held by the persistent store.
#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub identity: PiletIdentity,
    pub content: Bytes,
    pub metadata: PiletMetadata,
    /// Milliseconds since the Unix epoch at write time
    pub created_at: u64,
    /// Byte length of `content` measured at write time
    pub size_bytes: u64,
}

impl CachedEntry {
    pub fn new(metadata: PiletMetadata, content: Bytes, created_at: u64) -> Self {
        Self {
            identity: metadata.identity(),
            size_bytes: content.len() as u64,
            content,
            metadata,
            created_at,
        }
    }

    /// Age of the entry relative to `now` (both in epoch milliseconds)
    pub fn age_millis(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_at)
    }
}
