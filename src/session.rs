//! One engine run: a config, an owned cache handle and a worker pool.
//!
//! `Session` wires scan → hash → compare for callers that do not want to
//! assemble the scanner, hashing service and comparator themselves.

use crate::config::{AppConfig, ConfigError};
use crate::core::compare::{Comparator, ComparisonResult, ImageRef};
use crate::core::criteria::MatchCriteria;
use crate::core::hash::HashConfig;
use crate::core::image::ImageRecord;
use crate::core::perceptual::HashComputer;
use crate::core::progress::ProgressSender;
use crate::core::scanner::{ScanError, ScanOutcome, ScanWarning, Scanner};
use crate::database::memory::MemoryHashCache;
use crate::database::sqlite::SqliteHashCache;
use crate::database::{CacheError, HashCache, default_cache_path};
use crate::services::hashing::{HashingReport, HashingService};
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Could not start worker pool: {0}")]
    Pool(#[from] ThreadPoolBuildError),
}

/// A scanned directory with hashes attached.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImageSet {
    pub records: Vec<ImageRecord>,
    pub warnings: Vec<ScanWarning>,
    pub hashing: HashingReport,
}

pub struct Session {
    config: AppConfig,
    cache: Arc<dyn HashCache>,
    pool: Arc<ThreadPool>,
    hashing: HashingService,
    progress_sender: Option<ProgressSender>,
    cancellation_token: Arc<AtomicBool>,
}

impl Session {
    /// Open a session with the cache the config asks for: SQLite at
    /// `cache_path` (or the default location), or in-memory when disabled.
    pub fn open(config: AppConfig) -> Result<Self, SessionError> {
        config.validate()?;
        let cache: Arc<dyn HashCache> = if config.cache_enabled {
            let path = match &config.cache_path {
                Some(path) => path.clone(),
                None => default_cache_path()?,
            };
            Arc::new(SqliteHashCache::open(path))
        } else {
            Arc::new(MemoryHashCache::new())
        };
        Self::with_cache(config, cache)
    }

    /// Open a session around an existing cache handle.
    pub fn with_cache(
        config: AppConfig,
        cache: Arc<dyn HashCache>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let pool = Arc::new(
            ThreadPoolBuilder::new()
                .num_threads(config.parallel_workers)
                .thread_name(|index| format!("uif-worker-{index}"))
                .build()?,
        );
        let cancellation_token = Arc::new(AtomicBool::new(false));
        let hashing = HashingService::new(
            cache.clone(),
            HashComputer::new(config.decode_limits),
            config.fingerprint_mode,
        )
        .with_thread_pool(pool.clone())
        .with_cancellation_token(cancellation_token.clone());

        log::debug!(
            "Session ready: {} workers, cache degraded: {}",
            config.parallel_workers,
            cache.is_degraded()
        );

        Ok(Self {
            config,
            cache,
            pool,
            hashing,
            progress_sender: None,
            cancellation_token,
        })
    }

    pub fn with_progress_sender(mut self, sender: ProgressSender) -> Self {
        self.hashing = self.hashing.with_progress_sender(sender.clone());
        self.progress_sender = Some(sender);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<dyn HashCache> {
        &self.cache
    }

    pub fn get_cancellation_token(&self) -> Arc<AtomicBool> {
        self.cancellation_token.clone()
    }

    /// Stop scanning and hashing new items. Finished work is kept.
    pub fn cancel(&self) {
        self.cancellation_token.store(true, Ordering::Relaxed);
    }

    pub fn scan(&self, root: impl AsRef<Path>) -> Result<ScanOutcome, ScanError> {
        let mut scanner = Scanner::new(self.config.scan_options())?
            .with_cancellation_token(self.cancellation_token.clone());
        if let Some(sender) = &self.progress_sender {
            scanner = scanner.with_progress_sender(sender.clone());
        }
        let root = root.as_ref();
        self.pool.install(|| scanner.scan_all(root))
    }

    pub fn ensure_hashes(&self, records: &mut [ImageRecord], config: HashConfig) -> HashingReport {
        self.hashing.ensure_hashes(records, config)
    }

    /// Scan `root` and attach the hash `criteria` scores with, if any.
    ///
    /// `criteria` is validated before anything is read from disk.
    pub fn load_set(
        &self,
        root: impl AsRef<Path>,
        criteria: &MatchCriteria,
    ) -> Result<ImageSet, SessionError> {
        criteria.validate()?;
        let ScanOutcome {
            mut records,
            warnings,
        } = self.scan(root)?;
        let hashing = match criteria.hash_config {
            Some(config) => self.ensure_hashes(&mut records, config),
            None => HashingReport::default(),
        };
        Ok(ImageSet {
            records,
            warnings,
            hashing,
        })
    }

    pub fn compare(
        &self,
        reference: &[ImageRecord],
        working: &[ImageRecord],
        criteria: &MatchCriteria,
    ) -> Result<ComparisonResult, ConfigError> {
        self.pool
            .install(|| self.comparator().compare(reference, working, criteria))
    }

    pub fn find_uniques(
        &self,
        reference: &[ImageRecord],
        working: &[ImageRecord],
        criteria: &MatchCriteria,
    ) -> Result<Vec<ImageRef>, ConfigError> {
        self.pool
            .install(|| self.comparator().find_uniques(reference, working, criteria))
    }

    pub fn compare_within(
        &self,
        working: &[ImageRecord],
        criteria: &MatchCriteria,
    ) -> Result<ComparisonResult, ConfigError> {
        self.pool
            .install(|| self.comparator().compare_within(working, criteria))
    }

    /// Flush the cache. Dropping the session without calling this only risks
    /// leaving WAL pages unmerged.
    pub fn close(self) {
        self.cache.close();
        log::debug!("Session closed");
    }

    fn comparator(&self) -> Comparator {
        let comparator = Comparator::new(self.config.compare_strategy);
        match &self.progress_sender {
            Some(sender) => comparator.with_progress_sender(sender.clone()),
            None => comparator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::HashAlgorithm;
    use image::{ImageBuffer, Rgb};
    use tempfile::TempDir;

    fn config() -> AppConfig {
        AppConfig {
            cache_enabled: false,
            parallel_workers: 2,
            ..AppConfig::default()
        }
    }

    fn write_gradient(path: &Path) {
        let img = ImageBuffer::from_fn(80, 60, |x, _| {
            let v = (x * 3) as u8;
            Rgb([v, v, v])
        });
        img.save(path).unwrap();
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let config = AppConfig {
            parallel_workers: 0,
            ..config()
        };
        assert!(matches!(
            Session::open(config),
            Err(SessionError::Config(ConfigError::InvalidWorkers))
        ));
    }

    #[test]
    fn test_open_sqlite_cache_at_configured_path() {
        let temp_dir = TempDir::new().unwrap();
        let cache_path = temp_dir.path().join("cache").join("hashes.db");
        let session = Session::open(AppConfig {
            cache_enabled: true,
            cache_path: Some(cache_path.clone()),
            ..config()
        })
        .unwrap();

        assert!(!session.cache().is_degraded());
        session.close();
        assert!(cache_path.exists());
    }

    #[test]
    fn test_load_set_scans_and_hashes() {
        let temp_dir = TempDir::new().unwrap();
        write_gradient(&temp_dir.path().join("a.png"));
        write_gradient(&temp_dir.path().join("b.png"));

        let session = Session::open(config()).unwrap();
        let hash_config = HashConfig::new(HashAlgorithm::Average, 8).unwrap();
        let criteria = MatchCriteria::none().with_hash(hash_config, 0.9);
        let set = session.load_set(temp_dir.path(), &criteria).unwrap();

        assert_eq!(set.records.len(), 2);
        assert_eq!(set.hashing.computed + set.hashing.cached, 2);

        let within = session.compare_within(&set.records, &criteria).unwrap();
        assert_eq!(within.clusters.len(), 1);
        assert_eq!(within.duplicate_count(), 1);
    }

    #[test]
    fn test_load_set_rejects_invalid_criteria_before_scanning() {
        let temp_dir = TempDir::new().unwrap();
        write_gradient(&temp_dir.path().join("a.png"));

        let session = Session::open(config()).unwrap();
        let criteria = MatchCriteria::none().with_hash(HashConfig::default(), 1.5);
        let result = session.load_set(temp_dir.path(), &criteria);

        assert!(matches!(
            result,
            Err(SessionError::Config(ConfigError::InvalidThreshold(_)))
        ));
        assert_eq!(session.cache().stats().stores, 0);
        assert_eq!(session.cache().stats().misses, 0);

        // A missing root is still reported as a scan error once criteria pass.
        let criteria = MatchCriteria::none().with_size();
        let result = session.load_set(temp_dir.path().join("missing"), &criteria);
        assert!(matches!(result, Err(SessionError::Scan(_))));
    }

    #[test]
    fn test_cancelled_session_hashes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        write_gradient(&temp_dir.path().join("a.png"));

        let session = Session::open(config()).unwrap();
        let mut records = session.scan(temp_dir.path()).unwrap().records;
        session.cancel();

        let report = session.ensure_hashes(&mut records, HashConfig::default());
        assert_eq!(report.cancelled, 1);
        assert!(session.scan(temp_dir.path()).unwrap().records.is_empty());
    }
}
