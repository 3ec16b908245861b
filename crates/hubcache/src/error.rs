use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;

/// Errors raised by the pilet cache.
///
/// Sources are wrapped in `Arc` so the error stays `Clone`; a single failure
/// can be observed by every waiter of a shared preload.
#[derive(Debug, thiserror::Error, Clone)]
pub enum CacheError {
    #[error("No cached copy of {0}")]
    NotFound(String),

    #[error("Pilet {0} has no retrieval link")]
    MissingLink(String),

    #[error("Network error: {source}")]
    Network {
        #[from]
        source: Arc<reqwest::Error>,
    },

    #[error("Server returned status code {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Storage error: {source}")]
    Storage {
        #[from]
        source: Arc<std::io::Error>,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// True for failures of the network retrieval step, timeouts included.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            CacheError::Network { .. }
                | CacheError::HttpStatus { .. }
                | CacheError::Transport(_)
                | CacheError::Timeout(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound(_))
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, CacheError::Storage { .. } | CacheError::Serialization(_))
    }
}

// Manual implementation of From<reqwest::Error> because of the Arc wrapping.
impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        CacheError::Network {
            source: Arc::new(err),
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Storage {
            source: Arc::new(err),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

/// Result of a cache operation
pub type CacheResult<T> = std::result::Result<T, CacheError>;
