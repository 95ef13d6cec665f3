use crate::core::compare::CompareStrategy;
use crate::core::criteria::MatchCriteria;
use crate::core::fingerprint::FingerprintMode;
use crate::core::scanner::{DEFAULT_EXTENSIONS, ScanOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Unsupported hash size {0}: expected one of 4, 8, 16, 32")]
    InvalidHashSize(u32),

    #[error("Malformed hash size {0:?}: expected one of 4, 8, 16, 32")]
    MalformedHashSize(String),

    #[error("Unknown hash algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("Unknown metadata field: {0}")]
    UnknownMetadataField(String),

    #[error("Similarity threshold must be between 0 and 1, got {0}")]
    InvalidThreshold(f64),

    #[error("No match criteria enabled")]
    NoCriteria,

    #[error("Hash similarity is enabled but no hash configuration was given")]
    MissingHashConfig,

    #[error("Metadata matching is enabled but no metadata fields were selected")]
    NoMetadataFields,

    #[error("Parallel workers must be at least 1")]
    InvalidWorkers,

    #[error("Invalid decode limits: {0}")]
    InvalidLimits(String),

    #[error("Could not load config {path}: {reason}")]
    Load { path: String, reason: String },
}

/// Ceilings applied whenever pixel data is decoded.
///
/// The decoder's default allocation cap is too strict for large local photos,
/// so it is relaxed here, but a hard pixel-count ceiling still applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeLimits {
    pub max_pixels: u64,
    pub max_alloc_bytes: u64,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_pixels: 16_384 * 16_384,
            max_alloc_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub supported_formats: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub max_scan_depth: Option<usize>,
    pub follow_links: bool,
    pub read_metadata: bool,
    pub parallel_workers: usize,
    pub cache_enabled: bool,
    pub cache_path: Option<PathBuf>,
    pub fingerprint_mode: FingerprintMode,
    pub decode_limits: DecodeLimits,
    pub compare_strategy: CompareStrategy,
    pub criteria: MatchCriteria,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            supported_formats: DEFAULT_EXTENSIONS.iter().map(|ext| ext.to_string()).collect(),
            exclude_patterns: Vec::new(),
            max_scan_depth: None,
            follow_links: false,
            read_metadata: true,
            parallel_workers: num_cpus::get(),
            cache_enabled: true,
            cache_path: None,
            fingerprint_mode: FingerprintMode::default(),
            decode_limits: DecodeLimits::default(),
            compare_strategy: CompareStrategy::default(),
            criteria: MatchCriteria::default(),
        }
    }
}

impl AppConfig {
    /// Load a JSON config file. Fields that are absent keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let load_error = |reason: String| ConfigError::Load {
            path: path.display().to_string(),
            reason,
        };

        let contents = fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;
        let config: AppConfig =
            serde_json::from_str(&contents).map_err(|e| load_error(e.to_string()))?;
        config.validate()?;

        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallel_workers == 0 {
            return Err(ConfigError::InvalidWorkers);
        }
        if self.decode_limits.max_pixels == 0 {
            return Err(ConfigError::InvalidLimits(
                "max_pixels must be greater than zero".to_string(),
            ));
        }
        if self.decode_limits.max_alloc_bytes == 0 {
            return Err(ConfigError::InvalidLimits(
                "max_alloc_bytes must be greater than zero".to_string(),
            ));
        }
        self.criteria.validate()?;
        Ok(())
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            extensions: self.supported_formats.clone(),
            exclude_patterns: self.exclude_patterns.clone(),
            follow_links: self.follow_links,
            max_depth: self.max_scan_depth,
            read_metadata: self.read_metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::{HashAlgorithm, HashConfig};
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.parallel_workers >= 1);
        assert!(config.supported_formats.contains(&"jpg".to_string()));
        assert!(config.criteria.hash_similarity);
    }

    #[test]
    fn test_load_partial_config_keeps_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "parallel_workers": 2,
                "criteria": {
                    "hash_similarity": true,
                    "hash_config": "wavelet:8",
                    "similarity_threshold": 0.8
                }
            }"#,
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.parallel_workers, 2);
        assert_eq!(
            config.criteria.hash_config,
            Some(HashConfig::new(HashAlgorithm::Wavelet, 8).unwrap())
        );
        assert_eq!(config.criteria.similarity_threshold, 0.8);
        assert!(config.cache_enabled);
        assert_eq!(config.decode_limits, DecodeLimits::default());
    }

    #[test]
    fn test_load_rejects_invalid_hash_size() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, r#"{ "criteria": { "hash_config": "average:12" } }"#).unwrap();

        let result = AppConfig::load(&path);
        assert!(matches!(result, Err(ConfigError::Load { .. })));
    }

    #[test]
    fn test_load_rejects_zero_workers() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, r#"{ "parallel_workers": 0 }"#).unwrap();

        assert_eq!(AppConfig::load(&path), Err(ConfigError::InvalidWorkers));
    }

    #[test]
    fn test_load_missing_file() {
        let result = AppConfig::load(Path::new("/non/existent/config.json"));
        assert!(matches!(result, Err(ConfigError::Load { .. })));
    }
}
