//! Content-addressed transfer cache
//!
//! Consulted before a download is executed; a hit short-circuits the
//! network entirely. Keys are source URLs, stored content is addressed
//! by the SHA-256 of the key.

use crate::error::Result;
use crate::utils::sha256_hex;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Mutex;

/// A cache hit
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub size: u64,
    pub checksum: String,
}

/// Store consulted to skip redundant transfers
pub trait CacheManager: Send + Sync {
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<CacheEntry>> + Send + 'a>>;

    fn put<'a>(
        &'a self,
        key: &'a str,
        path: &'a Path,
        checksum: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Default: never hits, never stores
pub struct NoopCache;

impl CacheManager for NoopCache {
    fn get<'a>(
        &'a self,
        _key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<CacheEntry>> + Send + 'a>> {
        Box::pin(async { None })
    }

    fn put<'a>(
        &'a self,
        _key: &'a str,
        _path: &'a Path,
        _checksum: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }
}

/// Simple on-disk cache with an in-memory index
pub struct DiskCache {
    root: PathBuf,
    index: Mutex<HashMap<String, CacheEntry>>,
}

impl DiskCache {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            index: Mutex::new(HashMap::new()),
        })
    }

    pub fn len(&self) -> usize {
        self.index.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheManager for DiskCache {
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<CacheEntry>> + Send + 'a>> {
        Box::pin(async move {
            let entry = self.index.lock().unwrap().get(key).cloned()?;
            // The backing file may have been evicted behind our back
            match tokio::fs::metadata(&entry.path).await {
                Ok(meta) if meta.len() == entry.size => Some(entry),
                _ => {
                    log::warn!("cache entry for {} vanished, dropping from index", key);
                    self.index.lock().unwrap().remove(key);
                    None
                }
            }
        })
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        path: &'a Path,
        checksum: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let target = self.root.join(sha256_hex(key.as_bytes()));
            let size = tokio::fs::copy(path, &target).await?;
            self.index.lock().unwrap().insert(
                key.to_string(),
                CacheEntry {
                    path: target,
                    size,
                    checksum: checksum.to_string(),
                },
            );
            Ok(())
        })
    }
}
