pub mod memory;
pub mod sqlite;

use crate::core::fingerprint::Fingerprint;
use crate::core::hash::{HashConfig, PerceptualHash};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Cache file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not find home directory")]
    NoHomeDir,
}

/// One stored hash, keyed by fingerprint and hash config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub path: PathBuf,
    pub config: HashConfig,
    pub hash: PerceptualHash,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub degraded: bool,
}

/// Persistent map from (fingerprint, hash config) to a perceptual hash.
///
/// Every method takes `&self`; implementations serialize writes internally so
/// one handle can be shared across hashing workers. Storage failures never
/// surface from `lookup` or `store`: the cache just misses.
pub trait HashCache: Send + Sync {
    fn lookup(&self, fingerprint: &Fingerprint, config: HashConfig) -> Option<PerceptualHash>;

    fn entry(&self, fingerprint: &Fingerprint, config: HashConfig) -> Option<CacheEntry>;

    /// Insert or replace. Older entries for `path` under `config` with a
    /// different fingerprint are removed.
    fn store(
        &self,
        fingerprint: &Fingerprint,
        path: &Path,
        config: HashConfig,
        hash: &PerceptualHash,
    );

    /// Drop every entry for `fingerprint`, under any config.
    fn invalidate(&self, fingerprint: &Fingerprint);

    /// Drop every entry recorded for `path`. Returns how many were removed.
    fn invalidate_path(&self, path: &Path) -> usize;

    /// Drop entries whose recorded path no longer exists on disk. Returns how
    /// many were removed.
    ///
    /// A content-keyed entry shared by several copies is dropped when the last
    /// path it was stored under is gone; the surviving copies rehash once.
    fn prune_missing(&self) -> usize;

    fn clear(&self) -> Result<(), CacheError>;

    fn stats(&self) -> CacheStats;

    fn is_degraded(&self) -> bool {
        false
    }

    /// Flush pending writes. The handle stays usable afterwards.
    fn close(&self) {}
}

/// Hit/miss/store counters shared by the cache implementations.
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
}

impl CacheCounters {
    pub(crate) fn record_lookup<T>(&self, found: Option<T>) -> Option<T> {
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    pub(crate) fn record_store(&self) {
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, entries: u64, degraded: bool) -> CacheStats {
        CacheStats {
            entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            degraded,
        }
    }
}

/// `~/.unique_image_finder/hash_cache.db`
pub fn default_cache_path() -> Result<PathBuf, CacheError> {
    let home_dir = dirs::home_dir().ok_or(CacheError::NoHomeDir)?;
    Ok(home_dir.join(".unique_image_finder").join("hash_cache.db"))
}
