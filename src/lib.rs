pub mod config;
pub mod core;
pub mod database;
pub mod services;
pub mod session;

pub use crate::config::{AppConfig, ConfigError, DecodeLimits};
pub use crate::core::compare::{
    ClusterAnchor, ClusterMember, CompareStrategy, Comparator, ComparisonResult,
    DuplicateCluster, ImageRef, compare, find_uniques,
};
pub use crate::core::criteria::{CombineMode, Criterion, MatchCriteria, NameNormalization};
pub use crate::core::fingerprint::{Fingerprint, FingerprintMode};
pub use crate::core::hash::{HashAlgorithm, HashConfig, PerceptualHash};
pub use crate::core::image::{ImageMetadata, ImageRecord, MetadataField};
pub use crate::core::perceptual::{HashComputer, HashError};
pub use crate::core::progress::{Phase, Progress};
pub use crate::core::scanner::{Scan, ScanError, ScanOptions, ScanOutcome, ScanWarning, Scanner};
pub use crate::database::{CacheEntry, CacheError, CacheStats, HashCache};
pub use crate::database::memory::MemoryHashCache;
pub use crate::database::sqlite::SqliteHashCache;
pub use crate::services::hashing::{HashFailure, HashingReport, HashingService};
pub use crate::session::{ImageSet, Session, SessionError};
