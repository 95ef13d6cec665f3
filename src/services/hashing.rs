use crate::core::fingerprint::{Fingerprint, FingerprintMode};
use crate::core::hash::{HashConfig, PerceptualHash};
use crate::core::image::ImageRecord;
use crate::core::perceptual::{HashComputer, HashError};
use crate::core::progress::{Phase, ProgressSender, ProgressTracker, send_complete};
use crate::database::HashCache;
use crate::services::single_flight::SingleFlight;
use rayon::ThreadPool;
use rayon::prelude::*;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HashFailure {
    pub path: PathBuf,
    pub error: HashError,
}

/// What one `ensure_hashes` call did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HashingReport {
    /// Hashes decoded and computed by this call.
    pub computed: usize,
    /// Hashes served from the cache or from a concurrent computation.
    pub cached: usize,
    /// Records that already carried the hash.
    pub skipped: usize,
    /// Records left unhashed because the run was cancelled.
    pub cancelled: usize,
    pub failures: Vec<HashFailure>,
}

impl HashingReport {
    pub fn total(&self) -> usize {
        self.computed + self.cached + self.skipped + self.cancelled + self.failures.len()
    }
}

/// Cache-or-compute result shared between callers of one flight.
type FlightResult = Result<(PerceptualHash, Source), HashError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Cache,
    Computed,
}

enum Outcome {
    Present,
    Cancelled,
    Cached,
    Computed,
    Failed(HashFailure),
}

/// Attaches perceptual hashes to records, consulting the cache first.
pub struct HashingService {
    cache: Arc<dyn HashCache>,
    computer: HashComputer,
    fingerprint_mode: FingerprintMode,
    pool: Option<Arc<ThreadPool>>,
    flights: SingleFlight<(String, HashConfig), FlightResult>,
    progress_sender: Option<ProgressSender>,
    cancellation_token: Arc<AtomicBool>,
}

impl HashingService {
    pub fn new(
        cache: Arc<dyn HashCache>,
        computer: HashComputer,
        fingerprint_mode: FingerprintMode,
    ) -> Self {
        Self {
            cache,
            computer,
            fingerprint_mode,
            pool: None,
            flights: SingleFlight::new(),
            progress_sender: None,
            cancellation_token: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run on `pool` instead of the global rayon pool.
    pub fn with_thread_pool(mut self, pool: Arc<ThreadPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_progress_sender(mut self, sender: ProgressSender) -> Self {
        self.progress_sender = Some(sender);
        self
    }

    pub fn with_cancellation_token(mut self, token: Arc<AtomicBool>) -> Self {
        self.cancellation_token = token;
        self
    }

    pub fn get_cancellation_token(&self) -> Arc<AtomicBool> {
        self.cancellation_token.clone()
    }

    pub fn cancel(&self) {
        self.cancellation_token.store(true, Ordering::Relaxed);
    }

    pub fn cache(&self) -> &Arc<dyn HashCache> {
        &self.cache
    }

    /// Attach the `config` hash to every record that lacks it.
    ///
    /// Records are updated in place. Failures are collected in the report and
    /// leave the record without a hash; they never abort the batch.
    pub fn ensure_hashes(&self, records: &mut [ImageRecord], config: HashConfig) -> HashingReport {
        match &self.pool {
            Some(pool) => pool.install(|| self.hash_records(records, config)),
            None => self.hash_records(records, config),
        }
    }

    fn hash_records(&self, records: &mut [ImageRecord], config: HashConfig) -> HashingReport {
        let tracker =
            ProgressTracker::new(self.progress_sender.clone(), Phase::Hashing, records.len());

        let outcomes: Vec<Outcome> = records
            .par_iter_mut()
            .map(|record| {
                let outcome = self.hash_record(record, config);
                tracker.advance(&record.path);
                outcome
            })
            .collect();

        let mut report = HashingReport::default();
        for outcome in outcomes {
            match outcome {
                Outcome::Present => report.skipped += 1,
                Outcome::Cancelled => report.cancelled += 1,
                Outcome::Cached => report.cached += 1,
                Outcome::Computed => report.computed += 1,
                Outcome::Failed(failure) => report.failures.push(failure),
            }
        }

        send_complete(self.progress_sender.as_ref(), records.len());
        log::info!(
            "Hashed {} images with {}: {} computed, {} cached, {} already present, {} failed",
            records.len(),
            config,
            report.computed,
            report.cached,
            report.skipped,
            report.failures.len()
        );
        report
    }

    fn hash_record(&self, record: &mut ImageRecord, config: HashConfig) -> Outcome {
        if record.hash(&config).is_some() {
            return Outcome::Present;
        }
        if self.cancellation_token.load(Ordering::Relaxed) {
            return Outcome::Cancelled;
        }

        let fingerprint = match Fingerprint::for_record(record, self.fingerprint_mode) {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                return self.failed(HashError::Unreadable {
                    path: record.path.clone(),
                    reason: e.to_string(),
                });
            }
        };

        let path = record.path.clone();
        let (result, leader) = self.flights.run((fingerprint.cache_key(), config), || {
            if let Some(hash) = self.cache.lookup(&fingerprint, config) {
                return Ok((hash, Source::Cache));
            }
            let hash = self.computer.compute(&path, config)?;
            self.cache.store(&fingerprint, &path, config, &hash);
            Ok((hash, Source::Computed))
        });

        match result {
            Ok((hash, source)) => {
                record.set_hash(config, hash);
                if leader && source == Source::Computed {
                    Outcome::Computed
                } else {
                    Outcome::Cached
                }
            }
            Err(error) => self.failed(error),
        }
    }

    fn failed(&self, error: HashError) -> Outcome {
        log::warn!("Skipping hash for {}: {}", error.path().display(), error);
        Outcome::Failed(HashFailure {
            path: error.path().to_path_buf(),
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecodeLimits;
    use crate::core::hash::HashAlgorithm;
    use crate::database::memory::MemoryHashCache;
    use chrono::{DateTime, Utc};
    use image::{ImageBuffer, Rgb};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn config() -> HashConfig {
        HashConfig::new(HashAlgorithm::Difference, 8).unwrap()
    }

    fn write_image(dir: &Path, name: &str, seed: u32) -> ImageRecord {
        let path = dir.join(name);
        let img = ImageBuffer::from_fn(64, 48, |x, y| {
            let v = ((x * 3 + y * seed) % 256) as u8;
            Rgb([v, v.wrapping_add(40), 255 - v])
        });
        img.save(&path).unwrap();

        let metadata = fs::metadata(&path).unwrap();
        let modified: DateTime<Utc> = metadata.modified().unwrap().into();
        ImageRecord::new(path, metadata.len(), modified)
    }

    fn service(cache: Arc<MemoryHashCache>) -> HashingService {
        HashingService::new(cache, HashComputer::default(), FingerprintMode::Stat)
    }

    #[test]
    fn test_second_run_is_served_from_cache() {
        let temp_dir = TempDir::new().unwrap();
        let records = vec![
            write_image(temp_dir.path(), "a.png", 1),
            write_image(temp_dir.path(), "b.png", 5),
        ];
        let cache = Arc::new(MemoryHashCache::new());
        let hashing = service(cache.clone());

        let mut first = records.clone();
        let report = hashing.ensure_hashes(&mut first, config());
        assert_eq!(report.computed, 2);
        assert!(report.failures.is_empty());

        let mut second = records.clone();
        let report = hashing.ensure_hashes(&mut second, config());
        assert_eq!(report.computed, 0);
        assert_eq!(report.cached, 2);
        assert_eq!(first, second);

        let report = hashing.ensure_hashes(&mut second, config());
        assert_eq!(report.skipped, 2);
        assert_eq!(cache.stats().stores, 2);
    }

    #[test]
    fn test_failures_are_reported_not_raised() {
        let temp_dir = TempDir::new().unwrap();
        let good = write_image(temp_dir.path(), "good.png", 2);
        let broken_path = temp_dir.path().join("broken.jpg");
        fs::write(&broken_path, b"definitely not a jpeg").unwrap();
        let broken = ImageRecord::new(&broken_path, 21, Utc::now());

        let cache = Arc::new(MemoryHashCache::new());
        let mut records = vec![good, broken];
        let report = service(cache.clone()).ensure_hashes(&mut records, config());

        assert_eq!(report.computed, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, broken_path);
        assert!(matches!(report.failures[0].error, HashError::Decode { .. }));
        assert!(records[0].hash(&config()).is_some());
        assert!(records[1].hash(&config()).is_none());
        // Failures are not cached.
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_oversized_image_is_too_large() {
        let temp_dir = TempDir::new().unwrap();
        let mut records = vec![write_image(temp_dir.path(), "big.png", 3)];
        let computer = HashComputer::new(DecodeLimits {
            max_pixels: 100,
            ..DecodeLimits::default()
        });
        let cache = Arc::new(MemoryHashCache::new());
        let hashing = HashingService::new(cache, computer, FingerprintMode::Stat);

        let report = hashing.ensure_hashes(&mut records, config());
        assert!(matches!(report.failures[0].error, HashError::TooLarge { .. }));
    }

    #[test]
    fn test_content_fingerprint_shares_hash_across_copies() {
        let temp_dir = TempDir::new().unwrap();
        let original = write_image(temp_dir.path(), "a.png", 4);
        let copy_path = temp_dir.path().join("copy.png");
        fs::copy(&original.path, &copy_path).unwrap();
        let copy = ImageRecord::new(&copy_path, original.size, Utc::now());

        let cache = Arc::new(MemoryHashCache::new());
        let hashing =
            HashingService::new(cache.clone(), HashComputer::default(), FingerprintMode::Content);

        let mut first = vec![original];
        assert_eq!(hashing.ensure_hashes(&mut first, config()).computed, 1);
        let mut second = vec![copy];
        let report = hashing.ensure_hashes(&mut second, config());
        assert_eq!(report.cached, 1);
        assert_eq!(first[0].hash(&config()), second[0].hash(&config()));
    }

    #[test]
    fn test_cancelled_run_leaves_records_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let mut records = vec![write_image(temp_dir.path(), "a.png", 1)];
        let hashing = service(Arc::new(MemoryHashCache::new()));
        hashing.cancel();

        let report = hashing.ensure_hashes(&mut records, config());
        assert_eq!(report.cancelled, 1);
        assert!(records[0].hash(&config()).is_none());
    }

    #[test]
    fn test_runs_on_dedicated_pool() {
        let temp_dir = TempDir::new().unwrap();
        let mut records: Vec<ImageRecord> = (0..4)
            .map(|i| write_image(temp_dir.path(), &format!("{i}.png"), i + 1))
            .collect();
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let hashing = service(Arc::new(MemoryHashCache::new())).with_thread_pool(Arc::new(pool));

        let report = hashing.ensure_hashes(&mut records, config());
        assert_eq!(report.computed, 4);
        assert_eq!(report.total(), 4);
    }

    #[tokio::test]
    async fn test_progress_events() {
        let temp_dir = TempDir::new().unwrap();
        let mut records = vec![write_image(temp_dir.path(), "a.png", 1)];
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let hashing = service(Arc::new(MemoryHashCache::new())).with_progress_sender(tx);

        hashing.ensure_hashes(&mut records, config());
        drop(hashing);

        let mut phases = Vec::new();
        while let Some(event) = rx.recv().await {
            phases.push(event.phase);
        }
        assert_eq!(phases.first(), Some(&Phase::Hashing));
        assert_eq!(phases.last(), Some(&Phase::Complete));
    }
}
