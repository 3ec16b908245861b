//! # File Backend
//!
//! Durable pilet storage on the local filesystem. Each entry is a content
//! file plus a JSON metadata sidecar, both written through a temporary file
//! and renamed into place.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io;
use tracing::{debug, warn};

use crate::error::CacheResult;
use crate::identity::{CachedEntry, PiletIdentity};

use super::backend::{DurableBackend, EntryRecord};

const DATA_EXTENSION: &str = "bundle";
const META_EXTENSION: &str = "meta";

#[derive(Debug, Clone)]
pub struct FileBackend {
    cache_dir: PathBuf,
    initialized: Arc<AtomicBool>,
}

impl FileBackend {
    /// Open the backend, creating the directory if needed.
    ///
    /// Fails when the directory cannot be created; callers fall back to a
    /// memory-only store in that case.
    pub async fn open(cache_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let backend = Self {
            cache_dir: cache_dir.into(),
            initialized: Arc::new(AtomicBool::new(false)),
        };
        backend.ensure_initialized().await?;
        Ok(backend)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    async fn ensure_initialized(&self) -> io::Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        fs::create_dir_all(&self.cache_dir).await?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn data_path(&self, identity: &PiletIdentity) -> PathBuf {
        self.cache_dir
            .join(identity.to_filename())
            .with_extension(DATA_EXTENSION)
    }

    fn meta_path(&self, identity: &PiletIdentity) -> PathBuf {
        self.cache_dir
            .join(identity.to_filename())
            .with_extension(META_EXTENSION)
    }

    /// Read a metadata sidecar. A vanished file is `None`; an unparseable one
    /// is discarded together with its data file.
    async fn read_record(path: &Path) -> io::Result<Option<EntryRecord>> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to read pilet metadata file");
                return Err(e);
            }
        };

        match serde_json::from_slice::<EntryRecord>(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to parse pilet metadata, discarding entry");
                let meta_path = path.to_path_buf();
                let data_path = path.with_extension(DATA_EXTENSION);
                tokio::spawn(async move {
                    let _ = fs::remove_file(&data_path).await;
                    let _ = fs::remove_file(&meta_path).await;
                });
                Ok(None)
            }
        }
    }

    async fn remove_quietly(path: &Path) -> io::Result<()> {
        match fs::remove_file(path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                warn!(path = ?path, error = %e, "Failed to remove pilet cache file");
                Err(e)
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl DurableBackend for FileBackend {
    async fn get(&self, identity: &PiletIdentity) -> CacheResult<Option<CachedEntry>> {
        self.ensure_initialized().await?;

        let data_path = self.data_path(identity);
        let meta_path = self.meta_path(identity);

        if !fs::try_exists(&data_path).await? || !fs::try_exists(&meta_path).await? {
            return Ok(None);
        }

        let Some(record) = Self::read_record(&meta_path).await? else {
            return Ok(None);
        };

        let content = fs::read(&data_path).await?;

        Ok(Some(CachedEntry {
            identity: record.identity,
            content: Bytes::from(content),
            metadata: record.metadata,
            created_at: record.created_at,
            size_bytes: record.size_bytes,
        }))
    }

    async fn put(&self, entry: &CachedEntry) -> CacheResult<()> {
        self.ensure_initialized().await?;

        let data_path = self.data_path(&entry.identity);
        let meta_path = self.meta_path(&entry.identity);
        let metadata_json = serde_json::to_vec(&EntryRecord::from(entry))?;

        let temp_data_path = data_path.with_extension("bundle.tmp");
        let temp_meta_path = meta_path.with_extension("meta.tmp");

        if let Err(e) = fs::write(&temp_data_path, &entry.content).await {
            warn!(path = ?temp_data_path, error = %e, "Failed to write pilet data file");
            return Err(e.into());
        }

        if let Err(e) = fs::write(&temp_meta_path, &metadata_json).await {
            warn!(path = ?temp_meta_path, error = %e, "Failed to write pilet metadata file");
            let _ = fs::remove_file(&temp_data_path).await;
            return Err(e.into());
        }

        if let Err(e) = fs::rename(&temp_data_path, &data_path).await {
            warn!(from = ?temp_data_path, to = ?data_path, error = %e, "Failed to rename temporary data file");
            let _ = fs::remove_file(&temp_data_path).await;
            let _ = fs::remove_file(&temp_meta_path).await;
            return Err(e.into());
        }

        if let Err(e) = fs::rename(&temp_meta_path, &meta_path).await {
            warn!(from = ?temp_meta_path, to = ?meta_path, error = %e, "Failed to rename temporary metadata file");
            // data without metadata is unreadable, drop both
            let _ = fs::remove_file(&data_path).await;
            let _ = fs::remove_file(&temp_meta_path).await;
            return Err(e.into());
        }

        debug!(pilet = %entry.identity, size = entry.size_bytes, "Persisted pilet to disk");
        Ok(())
    }

    async fn delete(&self, identity: &PiletIdentity) -> CacheResult<()> {
        self.ensure_initialized().await?;

        let data_result = Self::remove_quietly(&self.data_path(identity)).await;
        let meta_result = Self::remove_quietly(&self.meta_path(identity)).await;
        data_result.and(meta_result)?;
        Ok(())
    }

    async fn clear(&self) -> CacheResult<()> {
        self.ensure_initialized().await?;

        let mut entries = fs::read_dir(&self.cache_dir).await?;
        let mut removed = 0usize;
        let mut first_error = None;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                continue;
            }
            match Self::remove_quietly(&entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        // Keep going past failures, then report the first one
        if let Some(e) = first_error {
            return Err(e.into());
        }

        debug!(count = removed, dir = ?self.cache_dir, "Cleared pilet cache directory");
        Ok(())
    }

    async fn entries(&self) -> CacheResult<Vec<CachedEntry>> {
        let records = self.records().await?;
        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            match fs::read(self.data_path(&record.identity)).await {
                Ok(content) => entries.push(CachedEntry {
                    identity: record.identity,
                    content: Bytes::from(content),
                    metadata: record.metadata,
                    created_at: record.created_at,
                    size_bytes: record.size_bytes,
                }),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(pilet = %record.identity, "Metadata without data file, skipping");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(entries)
    }

    async fn records(&self) -> CacheResult<Vec<EntryRecord>> {
        self.ensure_initialized().await?;

        let mut dir = fs::read_dir(&self.cache_dir).await?;
        let mut records = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(META_EXTENSION) {
                continue;
            }
            if let Some(record) = Self::read_record(&path).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn kind(&self) -> &'static str {
        "file"
    }
}
