use crate::core::exif::ExifService;
use crate::core::image::{ImageMetadata, ImageRecord};
use crate::core::progress::{Phase, ProgressSender, ProgressTracker, send_complete};
use crate::core::xmp;
use chrono::{DateTime, Utc};
use glob::Pattern;
use image::ImageReader;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use walkdir::{DirEntry, WalkDir};

pub const DEFAULT_EXTENSIONS: [&str; 10] = [
    "jpg", "jpeg", "png", "tiff", "tif", "bmp", "gif", "webp", "heic", "heif",
];

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    #[error("Invalid exclude pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    Unreadable,
    EmptyFile,
}

/// An entry the scan skipped. The scan itself carries on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanWarning {
    pub path: PathBuf,
    pub kind: WarningKind,
    pub message: String,
}

impl ScanWarning {
    fn new(path: &Path, kind: WarningKind, message: impl Into<String>) -> Self {
        let warning = Self {
            path: path.to_path_buf(),
            kind,
            message: message.into(),
        };
        log::warn!("Skipping {}: {}", warning.path.display(), warning.message);
        warning
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOptions {
    pub extensions: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub follow_links: bool,
    pub max_depth: Option<usize>,
    pub read_metadata: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            extensions: DEFAULT_EXTENSIONS.iter().map(|ext| ext.to_string()).collect(),
            exclude_patterns: Vec::new(),
            follow_links: false,
            max_depth: None,
            read_metadata: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub records: Vec<ImageRecord>,
    pub warnings: Vec<ScanWarning>,
}

pub struct Scanner {
    options: ScanOptions,
    extensions: HashSet<String>,
    exclude_patterns: Vec<Pattern>,
    progress_sender: Option<ProgressSender>,
    cancellation_token: Arc<AtomicBool>,
    exif_service: ExifService,
}

impl Scanner {
    pub fn new(options: ScanOptions) -> Result<Self, ScanError> {
        let exclude_patterns = options
            .exclude_patterns
            .iter()
            .map(|pattern| {
                Pattern::new(pattern).map_err(|e| ScanError::InvalidPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let extensions = options
            .extensions
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();

        Ok(Self {
            options,
            extensions,
            exclude_patterns,
            progress_sender: None,
            cancellation_token: Arc::new(AtomicBool::new(false)),
            exif_service: ExifService::new(),
        })
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

    pub fn cancel_scan(&self) {
        self.cancellation_token.store(true, Ordering::Relaxed);
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    pub fn is_supported_format(&self, file_path: &Path) -> bool {
        file_path
            .extension()
            .map(|ext| self.extensions.contains(&ext.to_string_lossy().to_lowercase()))
            .unwrap_or(false)
    }

    /// Lazily walk `root`, yielding one record per accepted image.
    ///
    /// Only a missing or non-directory root is an error. Everything else that
    /// goes wrong is collected in [`Scan::warnings`].
    pub fn scan(&self, root: impl AsRef<Path>) -> Result<Scan<'_>, ScanError> {
        let root = self.resolve_root(root.as_ref())?;
        Ok(Scan {
            scanner: self,
            walker: self.walker(&root).into_iter(),
            root,
            warnings: Vec::new(),
        })
    }

    /// Discover every candidate first, then read metadata in parallel.
    /// Records keep discovery order.
    pub fn scan_all(&self, root: impl AsRef<Path>) -> Result<ScanOutcome, ScanError> {
        let root = self.resolve_root(root.as_ref())?;
        let (paths, mut warnings) = self.discover_files(&root);

        if self.is_cancelled() {
            return Ok(ScanOutcome {
                records: Vec::new(),
                warnings,
            });
        }

        let tracker =
            ProgressTracker::new(self.progress_sender.clone(), Phase::Metadata, paths.len());
        let results: Vec<Option<Result<ImageRecord, ScanWarning>>> = paths
            .par_iter()
            .map(|path| {
                if self.is_cancelled() {
                    return None;
                }
                let result = self.build_record(path);
                tracker.advance(path);
                Some(result)
            })
            .collect();

        let mut records = Vec::with_capacity(results.len());
        for result in results.into_iter().flatten() {
            match result {
                Ok(record) => records.push(record),
                Err(warning) => warnings.push(warning),
            }
        }

        send_complete(self.progress_sender.as_ref(), records.len());
        log::info!(
            "Scanned {}: {} images, {} warnings",
            root.display(),
            records.len(),
            warnings.len()
        );

        Ok(ScanOutcome { records, warnings })
    }

    fn resolve_root(&self, root: &Path) -> Result<PathBuf, ScanError> {
        let resolved = fs::canonicalize(root).map_err(|_| ScanError::InvalidPath {
            path: root.to_string_lossy().to_string(),
        })?;

        if !resolved.is_dir() {
            return Err(ScanError::InvalidPath {
                path: format!("{} is not a directory", root.to_string_lossy()),
            });
        }

        Ok(resolved)
    }

    fn walker(&self, root: &Path) -> WalkDir {
        let mut walker = WalkDir::new(root)
            .follow_links(self.options.follow_links)
            .sort_by_file_name();
        if let Some(depth) = self.options.max_depth {
            walker = walker.max_depth(depth);
        }
        walker
    }

    fn discover_files(&self, root: &Path) -> (Vec<PathBuf>, Vec<ScanWarning>) {
        let mut discovered_files = Vec::new();
        let mut warnings = Vec::new();

        for entry in self.walker(root) {
            if self.is_cancelled() {
                break;
            }
            match entry {
                Ok(entry) => {
                    if self.accepts(&entry) {
                        discovered_files.push(entry.into_path());
                    }
                }
                Err(e) => warnings.push(walk_warning(root, &e)),
            }
        }

        log::debug!(
            "Discovered {} candidate images under {}",
            discovered_files.len(),
            root.display()
        );
        (discovered_files, warnings)
    }

    fn accepts(&self, entry: &DirEntry) -> bool {
        if !entry.file_type().is_file() {
            return false;
        }

        let name = entry.file_name().to_string_lossy();
        if is_junk(&name) {
            return false;
        }

        let path = entry.path();
        if !self.is_supported_format(path) {
            return false;
        }

        let path_str = path.to_string_lossy();
        !self
            .exclude_patterns
            .iter()
            .any(|pattern| pattern.matches(&path_str) || pattern.matches(&name))
    }

    fn build_record(&self, path: &Path) -> Result<ImageRecord, ScanWarning> {
        let metadata = fs::metadata(path)
            .map_err(|e| ScanWarning::new(path, WarningKind::Unreadable, e.to_string()))?;

        if metadata.len() == 0 {
            return Err(ScanWarning::new(path, WarningKind::EmptyFile, "file is empty"));
        }

        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or(DateTime::UNIX_EPOCH);

        let mut record = ImageRecord::new(path, metadata.len(), modified);
        if self.options.read_metadata {
            record.metadata = self.read_metadata(path);
        }
        Ok(record)
    }

    /// Header, EXIF and XMP attributes. Pixel data is never decoded here.
    fn read_metadata(&self, path: &Path) -> ImageMetadata {
        let mut metadata = ImageMetadata::default();

        match ImageReader::open(path).and_then(|reader| reader.with_guessed_format()) {
            Ok(reader) => {
                metadata.format = reader
                    .format()
                    .map(|format| format!("{format:?}").to_lowercase());
                match reader.into_dimensions() {
                    Ok((width, height)) => {
                        metadata.width = Some(width);
                        metadata.height = Some(height);
                    }
                    Err(e) => {
                        log::debug!("Could not read dimensions for {}: {}", path.display(), e)
                    }
                }
            }
            Err(e) => log::debug!("Could not open {}: {}", path.display(), e),
        }

        match self.exif_service.extract(path) {
            Ok(Some(exif)) => {
                metadata.captured_at = exif.captured_at;
                metadata.make = exif.make;
                metadata.model = exif.model;
                metadata.artist = exif.artist;
                metadata.copyright = exif.copyright;
                metadata.description = exif.description;
            }
            Ok(None) => {}
            Err(e) => log::debug!("Failed to extract EXIF from {}: {}", path.display(), e),
        }

        match xmp::read_origin(path) {
            Ok(origin) => metadata.origin = origin,
            Err(e) => log::debug!("Failed to read XMP from {}: {}", path.display(), e),
        }

        metadata
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation_token.load(Ordering::Relaxed)
    }
}

/// Lazy scan over one root. Created by [`Scanner::scan`].
pub struct Scan<'a> {
    scanner: &'a Scanner,
    walker: walkdir::IntoIter,
    root: PathBuf,
    warnings: Vec<ScanWarning>,
}

impl Scan<'_> {
    /// The canonical root being walked.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn warnings(&self) -> &[ScanWarning] {
        &self.warnings
    }

    pub fn into_warnings(self) -> Vec<ScanWarning> {
        self.warnings
    }
}

impl Iterator for Scan<'_> {
    type Item = ImageRecord;

    fn next(&mut self) -> Option<ImageRecord> {
        loop {
            if self.scanner.is_cancelled() {
                return None;
            }

            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    self.warnings.push(walk_warning(&self.root, &e));
                    continue;
                }
            };

            if !self.scanner.accepts(&entry) {
                continue;
            }

            match self.scanner.build_record(entry.path()) {
                Ok(record) => return Some(record),
                Err(warning) => self.warnings.push(warning),
            }
        }
    }
}

fn walk_warning(fallback: &Path, error: &walkdir::Error) -> ScanWarning {
    let path = error.path().unwrap_or(fallback);
    ScanWarning::new(path, WarningKind::Unreadable, error.to_string())
}

/// OS and sidecar files that are never images.
fn is_junk(name: &str) -> bool {
    name.starts_with("._") || name.eq_ignore_ascii_case("thumbs.db") || name == ".DS_Store"
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn create_test_image(path: &Path, width: u32, height: u32) {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            let intensity = ((x + y) % 256) as u8;
            Rgb([intensity, intensity, intensity])
        });
        img.save(path).unwrap();
    }

    fn scanner() -> Scanner {
        Scanner::new(ScanOptions::default()).unwrap()
    }

    #[test]
    fn test_scan_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        let scanner = scanner();
        let mut scan = scanner.scan(temp_dir.path()).unwrap();
        assert!(scan.next().is_none());
        assert!(scan.warnings().is_empty());
    }

    #[test]
    fn test_scan_missing_root_is_error() {
        let scanner = scanner();
        let result = scanner.scan("/non/existent/dir");
        assert!(matches!(result, Err(ScanError::InvalidPath { .. })));
    }

    #[test]
    fn test_scan_file_root_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("a.png");
        create_test_image(&file, 4, 4);
        assert!(matches!(
            scanner().scan_all(&file),
            Err(ScanError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_file_type_filtering() {
        let temp_dir = TempDir::new().unwrap();
        create_test_image(&temp_dir.path().join("test.jpg"), 16, 16);
        create_test_image(&temp_dir.path().join("test.PNG"), 16, 16);
        fs::write(temp_dir.path().join("test.txt"), b"text content").unwrap();

        let names: Vec<String> = scanner()
            .scan(temp_dir.path())
            .unwrap()
            .map(|record| record.name)
            .collect();
        assert_eq!(names, vec!["test.PNG", "test.jpg"]);
    }

    #[test]
    fn test_junk_and_empty_files() {
        let temp_dir = TempDir::new().unwrap();
        create_test_image(&temp_dir.path().join("keep.png"), 8, 8);
        create_test_image(&temp_dir.path().join("._keep.png"), 8, 8);
        fs::write(temp_dir.path().join("empty.jpg"), b"").unwrap();

        let scanner = scanner();
        let mut scan = scanner.scan(temp_dir.path()).unwrap();
        let records: Vec<ImageRecord> = scan.by_ref().collect();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "keep.png");
        assert_eq!(scan.warnings().len(), 1);
        assert_eq!(scan.warnings()[0].kind, WarningKind::EmptyFile);
    }

    #[cfg(unix)]
    #[test]
    fn test_lazy_walk_errors_are_reported_under_root() {
        let temp_dir = TempDir::new().unwrap();
        create_test_image(&temp_dir.path().join("keep.png"), 8, 8);
        std::os::unix::fs::symlink(
            temp_dir.path().join("missing.png"),
            temp_dir.path().join("dangling.png"),
        )
        .unwrap();

        let scanner = Scanner::new(ScanOptions {
            follow_links: true,
            ..ScanOptions::default()
        })
        .unwrap();
        let mut scan = scanner.scan(temp_dir.path()).unwrap();
        let records: Vec<ImageRecord> = scan.by_ref().collect();

        assert_eq!(records.len(), 1);
        assert_eq!(scan.root(), fs::canonicalize(temp_dir.path()).unwrap());
        let warnings = scan.into_warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, WarningKind::Unreadable);
        assert!(warnings[0].path.starts_with(fs::canonicalize(temp_dir.path()).unwrap()));
    }

    #[test]
    fn test_unreadable_image_is_still_emitted() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("broken.jpg"), b"not really a jpeg").unwrap();

        let outcome = scanner().scan_all(temp_dir.path()).unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert!(outcome.warnings.is_empty());
        assert_eq!(outcome.records[0].metadata.width, None);
    }

    #[test]
    fn test_scan_with_exclude_patterns() {
        let temp_dir = TempDir::new().unwrap();
        create_test_image(&temp_dir.path().join("included.jpg"), 8, 8);
        create_test_image(&temp_dir.path().join("excluded.tmp.jpg"), 8, 8);

        let scanner = Scanner::new(ScanOptions {
            exclude_patterns: vec!["*.tmp.*".to_string()],
            ..ScanOptions::default()
        })
        .unwrap();

        let outcome = scanner.scan_all(temp_dir.path()).unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].name, "included.jpg");
    }

    #[test]
    fn test_invalid_exclude_pattern() {
        let result = Scanner::new(ScanOptions {
            exclude_patterns: vec!["[".to_string()],
            ..ScanOptions::default()
        });
        assert!(matches!(result, Err(ScanError::InvalidPattern { .. })));
    }

    #[test]
    fn test_metadata_is_header_only() {
        let temp_dir = TempDir::new().unwrap();
        create_test_image(&temp_dir.path().join("wide.png"), 40, 10);

        let outcome = scanner().scan_all(temp_dir.path()).unwrap();
        let record = &outcome.records[0];
        assert_eq!(record.metadata.dimensions(), Some((40, 10)));
        assert_eq!(record.metadata.format.as_deref(), Some("png"));
        assert!(record.path.is_absolute());
        assert!(record.size > 0);
    }

    #[test]
    fn test_scan_all_matches_lazy_scan() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("nested");
        fs::create_dir(&nested).unwrap();
        for i in 0..4 {
            create_test_image(&temp_dir.path().join(format!("top_{i}.png")), 8, 8);
            create_test_image(&nested.join(format!("inner_{i}.png")), 8, 8);
        }

        let scanner = scanner();
        let lazy: Vec<PathBuf> = scanner
            .scan(temp_dir.path())
            .unwrap()
            .map(|record| record.path)
            .collect();
        let eager: Vec<PathBuf> = scanner
            .scan_all(temp_dir.path())
            .unwrap()
            .records
            .into_iter()
            .map(|record| record.path)
            .collect();

        assert_eq!(lazy.len(), 8);
        assert_eq!(lazy, eager);
    }

    #[test]
    fn test_max_depth() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("nested");
        fs::create_dir(&nested).unwrap();
        create_test_image(&temp_dir.path().join("top.png"), 8, 8);
        create_test_image(&nested.join("inner.png"), 8, 8);

        let scanner = Scanner::new(ScanOptions {
            max_depth: Some(1),
            ..ScanOptions::default()
        })
        .unwrap();
        let outcome = scanner.scan_all(temp_dir.path()).unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].name, "top.png");
    }

    #[test]
    fn test_cancelled_scan_yields_nothing() {
        let temp_dir = TempDir::new().unwrap();
        for i in 0..5 {
            create_test_image(&temp_dir.path().join(format!("test_{i}.png")), 8, 8);
        }

        let scanner = scanner();
        scanner.cancel_scan();
        assert_eq!(scanner.scan(temp_dir.path()).unwrap().count(), 0);
        assert!(scanner.scan_all(temp_dir.path()).unwrap().records.is_empty());
    }

    #[test]
    fn test_supported_format_detection() {
        let scanner = Scanner::new(ScanOptions {
            extensions: vec![".JPG".to_string(), "png".to_string()],
            ..ScanOptions::default()
        })
        .unwrap();

        assert!(scanner.is_supported_format(Path::new("test.jpg")));
        assert!(scanner.is_supported_format(Path::new("test.PNG")));
        assert!(!scanner.is_supported_format(Path::new("test.jpeg")));
        assert!(!scanner.is_supported_format(Path::new("test")));
    }

    #[tokio::test]
    async fn test_progress_events() {
        let temp_dir = TempDir::new().unwrap();
        for i in 0..3 {
            create_test_image(&temp_dir.path().join(format!("test_{i}.png")), 8, 8);
        }

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let scanner = scanner().with_progress_sender(progress_tx);
        let outcome = scanner.scan_all(temp_dir.path()).unwrap();
        assert_eq!(outcome.records.len(), 3);
        drop(scanner);

        let mut events = Vec::new();
        while let Some(event) = progress_rx.recv().await {
            events.push(event);
        }

        let last = events.last().unwrap();
        assert_eq!(last.phase, Phase::Complete);
        assert_eq!(last.processed, 3);
        assert!(events.iter().any(|event| event.phase == Phase::Metadata));
    }
}
