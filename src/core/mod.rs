pub mod compare;
pub mod criteria;
pub mod exif;
pub mod fingerprint;
pub mod hash;
pub mod image;
pub mod index;
pub mod perceptual;
pub mod progress;
pub mod scanner;
pub mod xmp;
