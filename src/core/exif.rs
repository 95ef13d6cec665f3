use chrono::{DateTime, NaiveDateTime, Utc};
use exif::{Field, In, Reader, Tag, Value};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExifError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("EXIF parsing error: {0}")]
    Parse(#[from] exif::Error),
}

/// EXIF attributes that feed [`ImageMetadata`](crate::core::image::ImageMetadata).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExifMetadata {
    pub captured_at: Option<DateTime<Utc>>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub artist: Option<String>,
    pub copyright: Option<String>,
    pub description: Option<String>,
}

impl ExifMetadata {
    fn is_empty(&self) -> bool {
        *self == ExifMetadata::default()
    }
}

/// Service for extracting EXIF metadata from image files
#[derive(Debug, Clone, Copy, Default)]
pub struct ExifService;

impl ExifService {
    pub fn new() -> Self {
        Self
    }

    /// Read EXIF attributes from `file_path`.
    ///
    /// Files without an EXIF block yield `Ok(None)`; only I/O failures and
    /// malformed EXIF data are errors.
    pub fn extract(&self, file_path: &Path) -> Result<Option<ExifMetadata>, ExifError> {
        let file = File::open(file_path)?;
        let mut buf_reader = BufReader::new(file);

        let exif_reader = match Reader::new().read_from_container(&mut buf_reader) {
            Ok(reader) => reader,
            Err(exif::Error::NotFound(_)) | Err(exif::Error::NotSupported(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let text = |tag: Tag| {
            exif_reader
                .get_field(tag, In::PRIMARY)
                .and_then(field_to_string)
        };

        let metadata = ExifMetadata {
            captured_at: text(Tag::DateTimeOriginal)
                .or_else(|| text(Tag::DateTime))
                .and_then(|value| parse_exif_datetime(&value)),
            make: text(Tag::Make),
            model: text(Tag::Model),
            artist: text(Tag::Artist),
            copyright: text(Tag::Copyright),
            description: text(Tag::ImageDescription),
        };

        if metadata.is_empty() {
            Ok(None)
        } else {
            Ok(Some(metadata))
        }
    }
}

fn field_to_string(field: &Field) -> Option<String> {
    let raw = match &field.value {
        Value::Ascii(values) => values
            .iter()
            .map(|value| String::from_utf8_lossy(value).into_owned())
            .collect::<Vec<_>>()
            .join(" "),
        Value::Undefined(data, _) => String::from_utf8_lossy(data).into_owned(),
        _ => field.display_value().to_string(),
    };

    let trimmed = raw.trim_end_matches('\0').trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parse an EXIF `YYYY:MM:DD HH:MM:SS` timestamp as UTC.
fn parse_exif_datetime(datetime_str: &str) -> Option<DateTime<Utc>> {
    match NaiveDateTime::parse_from_str(datetime_str.trim(), "%Y:%m:%d %H:%M:%S") {
        Ok(dt) => Some(dt.and_utc()),
        Err(_) => {
            log::debug!("Failed to parse EXIF datetime: {}", datetime_str);
            None
        }
    }
}
