use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Grid sizes accepted for perceptual hashing.
pub const SUPPORTED_BIT_SIZES: [u32; 4] = [4, 8, 16, 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    Average,
    Perceptual,
    Difference,
    Wavelet,
}

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 4] = [
        HashAlgorithm::Average,
        HashAlgorithm::Perceptual,
        HashAlgorithm::Difference,
        HashAlgorithm::Wavelet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Average => "average",
            HashAlgorithm::Perceptual => "perceptual",
            HashAlgorithm::Difference => "difference",
            HashAlgorithm::Wavelet => "wavelet",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "average" | "ahash" | "mean" => Ok(HashAlgorithm::Average),
            "perceptual" | "phash" | "dct" => Ok(HashAlgorithm::Perceptual),
            "difference" | "dhash" | "gradient" => Ok(HashAlgorithm::Difference),
            "wavelet" | "whash" | "haar" => Ok(HashAlgorithm::Wavelet),
            other => Err(ConfigError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Algorithm plus grid size. Part of every cache key.
///
/// Serialized as `"<algorithm>:<bit_size>"` so it can key JSON maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct HashConfig {
    algorithm: HashAlgorithm,
    bit_size: u32,
}

impl HashConfig {
    pub fn new(algorithm: HashAlgorithm, bit_size: u32) -> Result<Self, ConfigError> {
        if !SUPPORTED_BIT_SIZES.contains(&bit_size) {
            return Err(ConfigError::InvalidHashSize(bit_size));
        }
        Ok(Self {
            algorithm,
            bit_size,
        })
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn bit_size(&self) -> u32 {
        self.bit_size
    }

    /// Number of bits in a hash produced under this config.
    pub fn bit_length(&self) -> u32 {
        self.bit_size * self.bit_size
    }
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            algorithm: HashAlgorithm::Difference,
            bit_size: 16,
        }
    }
}

impl fmt::Display for HashConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.bit_size)
    }
}

impl FromStr for HashConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, bit_size) = match s.split_once(':') {
            Some((algorithm, size)) => {
                let size = size
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| ConfigError::MalformedHashSize(size.trim().to_string()))?;
                (algorithm, size)
            }
            None => (s, HashConfig::default().bit_size),
        };
        HashConfig::new(algorithm.parse()?, bit_size)
    }
}

impl From<HashConfig> for String {
    fn from(config: HashConfig) -> Self {
        config.to_string()
    }
}

impl TryFrom<String> for HashConfig {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseHashError {
    #[error("Invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("Expected {expected} bytes for a {bits}-bit hash, got {actual}")]
    Length {
        bits: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Hash length must be non-zero")]
    Empty,
}

/// Fixed-width bit string, packed most significant bit first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "HashRepr", try_from = "HashRepr")]
pub struct PerceptualHash {
    bits: u32,
    bytes: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct HashRepr {
    bits: u32,
    hex: String,
}

impl PerceptualHash {
    pub fn from_bytes(bytes: Vec<u8>, bits: u32) -> Result<Self, ParseHashError> {
        if bits == 0 {
            return Err(ParseHashError::Empty);
        }
        let expected = byte_len(bits);
        if bytes.len() != expected {
            return Err(ParseHashError::Length {
                bits,
                expected,
                actual: bytes.len(),
            });
        }
        Ok(Self::from_packed(bytes, bits))
    }

    pub fn from_hex(hex_str: &str, bits: u32) -> Result<Self, ParseHashError> {
        Self::from_bytes(hex::decode(hex_str.trim())?, bits)
    }

    /// Pack an ordered bit sequence.
    pub fn from_bits<I: IntoIterator<Item = bool>>(bits: I) -> Self {
        let mut bytes = Vec::new();
        let mut count = 0u32;
        for bit in bits {
            if count % 8 == 0 {
                bytes.push(0);
            }
            if bit {
                if let Some(last) = bytes.last_mut() {
                    *last |= 0x80 >> (count % 8);
                }
            }
            count += 1;
        }
        Self::from_packed(bytes, count)
    }

    /// Accept hasher output as-is, padding or truncating to the expected width.
    pub(crate) fn from_packed(mut bytes: Vec<u8>, bits: u32) -> Self {
        bytes.resize(byte_len(bits), 0);
        let spare = (bytes.len() as u32 * 8).saturating_sub(bits);
        if spare > 0 {
            if let Some(last) = bytes.last_mut() {
                *last &= 0xFFu8 << spare;
            }
        }
        Self { bits, bytes }
    }

    pub fn bit_length(&self) -> u32 {
        self.bits
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    pub fn bit(&self, index: u32) -> bool {
        if index >= self.bits {
            return false;
        }
        let byte = self.bytes[(index / 8) as usize];
        byte & (0x80 >> (index % 8)) != 0
    }

    /// Number of differing bits, or `None` when the widths differ.
    pub fn hamming_distance(&self, other: &PerceptualHash) -> Option<u32> {
        if self.bits != other.bits {
            return None;
        }
        Some(
            self.bytes
                .iter()
                .zip(&other.bytes)
                .map(|(a, b)| (a ^ b).count_ones())
                .sum(),
        )
    }

    /// Fraction of matching bits, `1 - distance / bit_length`.
    pub fn similarity(&self, other: &PerceptualHash) -> Option<f64> {
        self.hamming_distance(other)
            .map(|distance| 1.0 - distance as f64 / self.bits as f64)
    }
}

impl fmt::Display for PerceptualHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<PerceptualHash> for HashRepr {
    fn from(hash: PerceptualHash) -> Self {
        HashRepr {
            bits: hash.bits,
            hex: hash.to_hex(),
        }
    }
}

impl TryFrom<HashRepr> for PerceptualHash {
    type Error = ParseHashError;

    fn try_from(repr: HashRepr) -> Result<Self, Self::Error> {
        PerceptualHash::from_hex(&repr.hex, repr.bits)
    }
}

/// Largest Hamming distance that still satisfies `1 - d / bits >= threshold`.
pub fn max_distance(bits: u32, threshold: f64) -> u32 {
    let allowed = (1.0 - threshold) * bits as f64;
    // Absorb float noise so thresholds like 0.875 on 8 bits allow exactly 1.
    (allowed + 1e-9).floor().clamp(0.0, bits as f64) as u32
}

fn byte_len(bits: u32) -> usize {
    bits.div_ceil(8) as usize
}
