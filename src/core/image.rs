use crate::config::ConfigError;
use crate::core::hash::{HashConfig, PerceptualHash};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Structured attributes read from an image header, EXIF and XMP.
///
/// Every field is optional; extraction is best-effort.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<String>,
    pub captured_at: Option<DateTime<Utc>>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub artist: Option<String>,
    pub copyright: Option<String>,
    pub description: Option<String>,
    pub origin: Option<String>,
}

impl ImageMetadata {
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        Some((self.width?, self.height?))
    }

    pub fn is_empty(&self) -> bool {
        *self == ImageMetadata::default()
    }
}

/// One image discovered by the scanner.
///
/// Only `hashes` changes after the scan, as hashes are attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub path: PathBuf,
    pub size: u64,
    pub name: String,
    pub modified: DateTime<Utc>,
    pub metadata: ImageMetadata,
    #[serde(default)]
    pub hashes: BTreeMap<HashConfig, PerceptualHash>,
}

impl ImageRecord {
    pub fn new(path: impl Into<PathBuf>, size: u64, modified: DateTime<Utc>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            path,
            size,
            name,
            modified,
            metadata: ImageMetadata::default(),
            hashes: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn hash(&self, config: &HashConfig) -> Option<&PerceptualHash> {
        self.hashes.get(config)
    }

    pub fn set_hash(&mut self, config: HashConfig, hash: PerceptualHash) {
        debug_assert_eq!(hash.bit_length(), config.bit_length(), "hash width for {config}");
        self.hashes.insert(config, hash);
    }
}

/// Metadata attributes that can take part in equality matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataField {
    Dimensions,
    Format,
    CapturedAt,
    Modified,
    Make,
    Model,
    Artist,
    Copyright,
    Description,
    Origin,
}

impl MetadataField {
    pub const ALL: [MetadataField; 10] = [
        MetadataField::Dimensions,
        MetadataField::Format,
        MetadataField::CapturedAt,
        MetadataField::Modified,
        MetadataField::Make,
        MetadataField::Model,
        MetadataField::Artist,
        MetadataField::Copyright,
        MetadataField::Description,
        MetadataField::Origin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataField::Dimensions => "dimensions",
            MetadataField::Format => "format",
            MetadataField::CapturedAt => "captured_at",
            MetadataField::Modified => "modified",
            MetadataField::Make => "make",
            MetadataField::Model => "model",
            MetadataField::Artist => "artist",
            MetadataField::Copyright => "copyright",
            MetadataField::Description => "description",
            MetadataField::Origin => "origin",
        }
    }

    /// Comparable form of this field for `record`, or `None` when absent.
    ///
    /// Free-text fields compare case-insensitively with surrounding
    /// whitespace ignored. Timestamps compare at whole-second precision.
    pub fn value(&self, record: &ImageRecord) -> Option<String> {
        let metadata = &record.metadata;
        match self {
            MetadataField::Dimensions => metadata
                .dimensions()
                .map(|(width, height)| format!("{width}x{height}")),
            MetadataField::Format => metadata.format.as_deref().and_then(normalize_text),
            MetadataField::CapturedAt => metadata
                .captured_at
                .map(|captured| captured.timestamp().to_string()),
            MetadataField::Modified => Some(record.modified.timestamp().to_string()),
            MetadataField::Make => metadata.make.as_deref().and_then(normalize_text),
            MetadataField::Model => metadata.model.as_deref().and_then(normalize_text),
            MetadataField::Artist => metadata.artist.as_deref().and_then(normalize_text),
            MetadataField::Copyright => metadata.copyright.as_deref().and_then(normalize_text),
            MetadataField::Description => {
                metadata.description.as_deref().and_then(normalize_text)
            }
            MetadataField::Origin => metadata.origin.as_deref().and_then(normalize_text),
        }
    }
}

impl fmt::Display for MetadataField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetadataField {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dimensions" | "size_px" | "resolution" => Ok(MetadataField::Dimensions),
            "format" | "mode" => Ok(MetadataField::Format),
            "captured_at" | "datetime_original" | "taken_at" => Ok(MetadataField::CapturedAt),
            "modified" | "mtime" => Ok(MetadataField::Modified),
            "make" => Ok(MetadataField::Make),
            "model" => Ok(MetadataField::Model),
            "artist" => Ok(MetadataField::Artist),
            "copyright" => Ok(MetadataField::Copyright),
            "description" => Ok(MetadataField::Description),
            "origin" | "source" => Ok(MetadataField::Origin),
            other => Err(ConfigError::UnknownMetadataField(other.to_string())),
        }
    }
}

fn normalize_text(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> ImageRecord {
        let modified = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        ImageRecord::new("/photos/IMG_0001.JPG", 2048, modified)
    }

    #[test]
    fn test_new_record_derives_name() {
        let record = record();
        assert_eq!(record.name, "IMG_0001.JPG");
        assert!(record.metadata.is_empty());
        assert!(record.hashes.is_empty());
    }

    #[test]
    fn test_text_fields_are_normalized() {
        let mut record = record();
        record.metadata.make = Some("  Canon ".to_string());
        record.metadata.artist = Some("   ".to_string());

        assert_eq!(MetadataField::Make.value(&record), Some("canon".to_string()));
        assert_eq!(MetadataField::Artist.value(&record), None);
        assert_eq!(MetadataField::Model.value(&record), None);
    }

    #[test]
    fn test_dimensions_require_both_sides() {
        let mut record = record();
        record.metadata.width = Some(640);
        assert_eq!(MetadataField::Dimensions.value(&record), None);

        record.metadata.height = Some(480);
        assert_eq!(
            MetadataField::Dimensions.value(&record),
            Some("640x480".to_string())
        );
    }

    #[test]
    fn test_modified_is_always_present() {
        let record = record();
        assert!(MetadataField::Modified.value(&record).is_some());
    }

    #[test]
    fn test_parse_metadata_field_aliases() {
        assert_eq!(
            "datetime_original".parse::<MetadataField>().unwrap(),
            MetadataField::CapturedAt
        );
        assert_eq!("ORIGIN".parse::<MetadataField>().unwrap(), MetadataField::Origin);
        assert!("lens".parse::<MetadataField>().is_err());
    }
}
