//! Error types for zenpng

use std::fmt;

/// Result type for zenpng operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for zenpng operations
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Invalid image dimensions
    InvalidDimensions {
        width: usize,
        height: usize,
        reason: &'static str,
    },
    /// Pixel buffer length does not match the declared dimensions
    InvalidPixelData {
        expected: usize,
        actual: usize,
    },
    /// A tuning parameter is outside its valid range
    InvalidParameter {
        name: &'static str,
        reason: String,
    },
    /// File I/O failure (cache file, input image, output file)
    Io(std::io::Error),
    /// Input image decode failure
    ImageDecode(image::ImageError),
    /// The LZ4 payload of a container failed to decompress
    Lz4Decode(String),
    /// A container stream was structurally invalid
    InvalidContainer {
        format: &'static str,
        reason: &'static str,
    },
    /// Encoding failed
    EncodingFailed {
        stage: &'static str,
        reason: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidDimensions { width, height, reason } => {
                write!(f, "Invalid dimensions {}x{}: {}", width, height, reason)
            }
            Error::InvalidPixelData { expected, actual } => {
                write!(f, "Expected {} bytes of pixel data, got {}", expected, actual)
            }
            Error::InvalidParameter { name, reason } => {
                write!(f, "Invalid parameter {}: {}", name, reason)
            }
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::ImageDecode(e) => write!(f, "Image decode error: {}", e),
            Error::Lz4Decode(msg) => write!(f, "LZ4 decode error: {}", msg),
            Error::InvalidContainer { format, reason } => {
                write!(f, "Invalid {} container: {}", format, reason)
            }
            Error::EncodingFailed { stage, reason } => {
                write!(f, "Encoding failed at {}: {}", stage, reason)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::ImageDecode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        Error::ImageDecode(e)
    }
}
