//! Control messages exchanged between the page and the interception layer.

use serde::{Deserialize, Serialize};

use crate::error::CacheResult;
use crate::identity::PiletMetadata;

use super::buckets::StorageEstimate;

/// A control message sent by the page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    SkipWaiting,
    CachePilet {
        pilet: PiletMetadata,
        content: String,
    },
    ClearCache {
        #[serde(default, rename = "cacheName", skip_serializing_if = "Option::is_none")]
        cache_name: Option<String>,
    },
    GetCacheSize,
}

impl WorkerMessage {
    pub fn from_json(json: &str) -> CacheResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Answer to a control message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum WorkerReply {
    Done {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Size {
        size: StorageEstimate,
    },
}

impl WorkerReply {
    pub fn ok() -> Self {
        Self::Done {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self::Done {
            success: false,
            error: Some(error.to_string()),
        }
    }
}
