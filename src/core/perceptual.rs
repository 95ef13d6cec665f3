use crate::config::DecodeLimits;
use crate::core::hash::{HashAlgorithm, HashConfig, PerceptualHash};
use image::imageops::FilterType;
use image::{DynamicImage, ImageError, ImageReader, Limits};
use image_hasher::{HashAlg, HasherConfig};
use serde::Serialize;
use std::f64::consts::SQRT_2;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Haar decomposition depth for the wavelet hash.
const WAVELET_LEVELS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HashError {
    #[error("Could not read {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("Failed to decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error("Image {path} is too large ({width}x{height}, limit {max_pixels} pixels)")]
    TooLarge {
        path: PathBuf,
        width: u32,
        height: u32,
        max_pixels: u64,
    },
}

impl HashError {
    pub fn path(&self) -> &Path {
        match self {
            HashError::Unreadable { path, .. }
            | HashError::Decode { path, .. }
            | HashError::TooLarge { path, .. } => path,
        }
    }
}

/// Decodes images within [`DecodeLimits`] and computes perceptual hashes.
#[derive(Debug, Clone, Default)]
pub struct HashComputer {
    limits: DecodeLimits,
}

impl HashComputer {
    pub fn new(limits: DecodeLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> DecodeLimits {
        self.limits
    }

    pub fn compute(&self, path: &Path, config: HashConfig) -> Result<PerceptualHash, HashError> {
        let image = self.decode(path)?;
        let hash = hash_image(&image, config);
        log::debug!("Computed {} hash for {}: {}", config, path.display(), hash);
        Ok(hash)
    }

    /// Decode `path`, checking the pixel count from the header before any
    /// pixel data is read.
    pub fn decode(&self, path: &Path) -> Result<DynamicImage, HashError> {
        let (width, height) = open_reader(path)?
            .into_dimensions()
            .map_err(|e| decode_error(path, e))?;

        if width == 0 || height == 0 {
            return Err(HashError::Decode {
                path: path.to_path_buf(),
                reason: "image has no pixels".to_string(),
            });
        }

        let too_large = || HashError::TooLarge {
            path: path.to_path_buf(),
            width,
            height,
            max_pixels: self.limits.max_pixels,
        };

        if u64::from(width) * u64::from(height) > self.limits.max_pixels {
            return Err(too_large());
        }

        let mut limits = Limits::default();
        limits.max_alloc = Some(self.limits.max_alloc_bytes);

        let mut reader = open_reader(path)?;
        reader.limits(limits);
        reader.decode().map_err(|e| match e {
            ImageError::Limits(_) => too_large(),
            other => decode_error(path, other),
        })
    }
}

fn open_reader(path: &Path) -> Result<ImageReader<std::io::BufReader<std::fs::File>>, HashError> {
    ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(|e| HashError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

fn decode_error(path: &Path, error: ImageError) -> HashError {
    HashError::Decode {
        path: path.to_path_buf(),
        reason: error.to_string(),
    }
}

/// Hash an already decoded image.
pub fn hash_image(image: &DynamicImage, config: HashConfig) -> PerceptualHash {
    let size = config.bit_size();
    let builder = HasherConfig::new().hash_size(size, size);

    let hasher = match config.algorithm() {
        HashAlgorithm::Average => builder.hash_alg(HashAlg::Mean),
        HashAlgorithm::Perceptual => builder.hash_alg(HashAlg::Median).preproc_dct(),
        HashAlgorithm::Difference => builder.hash_alg(HashAlg::Gradient),
        HashAlgorithm::Wavelet => return wavelet_hash(image, size),
    }
    .to_hasher();

    let hash = hasher.hash_image(image);
    PerceptualHash::from_packed(hash.as_bytes().to_vec(), config.bit_length())
}

/// Haar wavelet hash: the low-frequency band after three analysis levels,
/// thresholded against its median.
fn wavelet_hash(image: &DynamicImage, bit_size: u32) -> PerceptualHash {
    let side = bit_size << WAVELET_LEVELS;
    let gray = image
        .resize_exact(side, side, FilterType::Triangle)
        .to_luma8();

    let stride = side as usize;
    let mut coefficients: Vec<f64> = gray.pixels().map(|p| f64::from(p.0[0]) / 255.0).collect();

    // Drop the DC term so only relative brightness remains.
    let mean = coefficients.iter().sum::<f64>() / coefficients.len() as f64;
    coefficients.iter_mut().for_each(|c| *c -= mean);

    let mut extent = stride;
    for _ in 0..WAVELET_LEVELS {
        haar_level(&mut coefficients, stride, extent);
        extent /= 2;
    }

    let approximation: Vec<f64> = (0..extent)
        .flat_map(|row| coefficients[row * stride..row * stride + extent].iter().copied())
        .collect();
    let threshold = median(&approximation);

    PerceptualHash::from_bits(approximation.iter().map(|&c| c > threshold))
}

/// One 2-D Haar analysis step over the top-left `extent` square.
/// Averages land in the top-left quadrant, details in the other three.
fn haar_level(data: &mut [f64], stride: usize, extent: usize) {
    let half = extent / 2;
    let mut scratch = vec![0.0; extent];

    for row in 0..extent {
        let line = &mut data[row * stride..row * stride + extent];
        for i in 0..half {
            let (a, b) = (line[2 * i], line[2 * i + 1]);
            scratch[i] = (a + b) / SQRT_2;
            scratch[half + i] = (a - b) / SQRT_2;
        }
        line.copy_from_slice(&scratch);
    }

    for column in 0..extent {
        for i in 0..half {
            let a = data[2 * i * stride + column];
            let b = data[(2 * i + 1) * stride + column];
            scratch[i] = (a + b) / SQRT_2;
            scratch[half + i] = (a - b) / SQRT_2;
        }
        for (row, value) in scratch.iter().enumerate() {
            data[row * stride + column] = *value;
        }
    }
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
