use crate::core::fingerprint::Fingerprint;
use crate::core::hash::{HashConfig, PerceptualHash};
use crate::database::{CacheCounters, CacheEntry, CacheError, CacheStats, HashCache};
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

/// Process-local cache. Used by tests and `--no-cache` runs.
#[derive(Debug, Default)]
pub struct MemoryHashCache {
    entries: RwLock<HashMap<(String, HashConfig), CacheEntry>>,
    counters: CacheCounters,
}

impl MemoryHashCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HashCache for MemoryHashCache {
    fn lookup(&self, fingerprint: &Fingerprint, config: HashConfig) -> Option<PerceptualHash> {
        let found = self.entry(fingerprint, config).map(|entry| entry.hash);
        self.counters.record_lookup(found)
    }

    fn entry(&self, fingerprint: &Fingerprint, config: HashConfig) -> Option<CacheEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(fingerprint.cache_key(), config))
            .cloned()
    }

    fn store(
        &self,
        fingerprint: &Fingerprint,
        path: &Path,
        config: HashConfig,
        hash: &PerceptualHash,
    ) {
        let key = fingerprint.cache_key();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|(stored_key, stored_config), entry| {
            *stored_config != config || entry.path != path || *stored_key == key
        });
        entries.insert(
            (key.clone(), config),
            CacheEntry {
                fingerprint: key,
                path: path.to_path_buf(),
                config,
                hash: hash.clone(),
                computed_at: Utc::now(),
            },
        );
        self.counters.record_store();
    }

    fn invalidate(&self, fingerprint: &Fingerprint) {
        let key = fingerprint.cache_key();
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(stored_key, _), _| *stored_key != key);
    }

    fn invalidate_path(&self, path: &Path) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.path != path);
        before - entries.len()
    }

    fn prune_missing(&self) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.path.exists());
        before - entries.len()
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        self.counters.snapshot(self.len() as u64, false)
    }
}
