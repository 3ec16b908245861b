//! # Durable Backend
//!
//! The trait every durable tier of the pilet store implements, plus the
//! in-memory backend used when no durable tier is available.

use std::collections::HashMap;
use std::fmt::Debug;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::CacheResult;
use crate::identity::{CachedEntry, PiletIdentity, PiletMetadata};

/// Metadata of a stored entry without its content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryRecord {
    pub identity: PiletIdentity,
    pub metadata: PiletMetadata,
    pub created_at: u64,
    pub size_bytes: u64,
}

impl From<&CachedEntry> for EntryRecord {
    fn from(entry: &CachedEntry) -> Self {
        Self {
            identity: entry.identity.clone(),
            metadata: entry.metadata.clone(),
            created_at: entry.created_at,
            size_bytes: entry.size_bytes,
        }
    }
}

/// A transactional key-value store for pilet entries keyed by identity.
///
/// Backends do not interpret TTLs; expiry is decided by the store.
#[async_trait]
pub trait DurableBackend: Send + Sync + Debug {
    /// Get an entry
    async fn get(&self, identity: &PiletIdentity) -> CacheResult<Option<CachedEntry>>;

    /// Insert or replace an entry
    async fn put(&self, entry: &CachedEntry) -> CacheResult<()>;

    /// Remove an entry; removing an absent entry is not an error
    async fn delete(&self, identity: &PiletIdentity) -> CacheResult<()>;

    /// Remove every entry
    async fn clear(&self) -> CacheResult<()>;

    /// Enumerate every entry with its content
    async fn entries(&self) -> CacheResult<Vec<CachedEntry>>;

    /// Enumerate the records of every entry
    async fn records(&self) -> CacheResult<Vec<EntryRecord>> {
        Ok(self.entries().await?.iter().map(EntryRecord::from).collect())
    }

    /// Records ordered by `created_at`, oldest first
    async fn records_oldest_first(&self) -> CacheResult<Vec<EntryRecord>> {
        let mut records = self.records().await?;
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    /// Short name used in logs
    fn kind(&self) -> &'static str;

    /// Whether entries outlive the process
    fn is_persistent(&self) -> bool {
        true
    }
}

/// Backend holding everything in process memory
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<PiletIdentity, CachedEntry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableBackend for MemoryBackend {
    async fn get(&self, identity: &PiletIdentity) -> CacheResult<Option<CachedEntry>> {
        Ok(self.entries.read().get(identity).cloned())
    }

    async fn put(&self, entry: &CachedEntry) -> CacheResult<()> {
        self.entries
            .write()
            .insert(entry.identity.clone(), entry.clone());
        Ok(())
    }

    async fn delete(&self, identity: &PiletIdentity) -> CacheResult<()> {
        self.entries.write().remove(identity);
        Ok(())
    }

    async fn clear(&self) -> CacheResult<()> {
        self.entries.write().clear();
        Ok(())
    }

    async fn entries(&self) -> CacheResult<Vec<CachedEntry>> {
        Ok(self.entries.read().values().cloned().collect())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }

    fn is_persistent(&self) -> bool {
        false
    }
}
