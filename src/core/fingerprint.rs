use crate::core::image::ImageRecord;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// How a file's identity is derived for cache lookups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintMode {
    /// Path, size and modification time. No file read required.
    #[default]
    Stat,
    /// BLAKE3 checksum of the file contents. Survives renames and moves.
    Content,
}

/// Content identity of a file at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fingerprint {
    Stat {
        path: PathBuf,
        size: u64,
        modified_ns: i64,
    },
    Content {
        checksum: String,
    },
}

impl Fingerprint {
    pub fn stat(record: &ImageRecord) -> Self {
        let modified_ns = record
            .modified
            .timestamp_nanos_opt()
            .unwrap_or_else(|| record.modified.timestamp_micros().saturating_mul(1_000));

        Fingerprint::Stat {
            path: record.path.clone(),
            size: record.size,
            modified_ns,
        }
    }

    pub fn content(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(Fingerprint::Content {
                checksum: blake3::hash(&[]).to_hex().to_string(),
            });
        }

        // The mapping is only read for the lifetime of this call.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Fingerprint::Content {
            checksum: blake3::hash(&mmap).to_hex().to_string(),
        })
    }

    pub fn for_record(record: &ImageRecord, mode: FingerprintMode) -> io::Result<Self> {
        match mode {
            FingerprintMode::Stat => Ok(Fingerprint::stat(record)),
            FingerprintMode::Content => Fingerprint::content(&record.path),
        }
    }

    /// Stable string form used as the persistent cache key.
    pub fn cache_key(&self) -> String {
        match self {
            Fingerprint::Stat {
                path,
                size,
                modified_ns,
            } => format!("stat:{}|{}|{}", path.to_string_lossy(), size, modified_ns),
            Fingerprint::Content { checksum } => format!("blake3:{checksum}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_stat_fingerprint_changes_with_mtime() {
        let now = Utc::now();
        let record = ImageRecord::new("/photos/a.jpg", 100, now);
        let touched = ImageRecord::new("/photos/a.jpg", 100, now + Duration::seconds(1));

        assert_eq!(Fingerprint::stat(&record), Fingerprint::stat(&record));
        assert_ne!(
            Fingerprint::stat(&record).cache_key(),
            Fingerprint::stat(&touched).cache_key()
        );
    }

    #[test]
    fn test_content_fingerprint_ignores_location() {
        let temp_dir = TempDir::new().unwrap();
        let first = temp_dir.path().join("first.jpg");
        let second = temp_dir.path().join("second.jpg");
        let other = temp_dir.path().join("other.jpg");
        fs::write(&first, b"same bytes").unwrap();
        fs::write(&second, b"same bytes").unwrap();
        fs::write(&other, b"other bytes").unwrap();

        let first = Fingerprint::content(&first).unwrap();
        assert_eq!(first, Fingerprint::content(&second).unwrap());
        assert_ne!(first, Fingerprint::content(&other).unwrap());
        assert!(first.cache_key().starts_with("blake3:"));
    }

    #[test]
    fn test_content_fingerprint_of_empty_file() {
        let temp_dir = TempDir::new().unwrap();
        let empty = temp_dir.path().join("empty.jpg");
        fs::write(&empty, b"").unwrap();
        assert!(Fingerprint::content(&empty).is_ok());
    }

    #[test]
    fn test_content_fingerprint_missing_file() {
        assert!(Fingerprint::content(Path::new("/non/existent/file.jpg")).is_err());
    }
}
