//! # zenpng - Rate-Distortion Optimized Lossy Recompressor
//!
//! zenpng re-encodes a source raster image into one of three lossless
//! containers - PNG, QOI, or an LZ4-framed raw-pixel format - choosing
//! pixel values that the container's own compression machinery likes,
//! trading quality for size through a single lambda knob.
//!
//! ## Key ideas
//!
//! - **Perceptual error model**: candidate pixels are scored in OkLab
//!   through a precomputed 16.7M-entry lookup table, with hard reject
//!   thresholds bounding worst-case error per pixel
//! - **Masking map**: squared error is scaled per pixel by local activity
//!   statistics, spending the error budget where texture hides it
//! - **Container-aware RDO parsers**: each container gets its own parser
//!   that enumerates literal-like and match-like encodings per pixel (or
//!   byte) and minimizes `D * mse_scale + bits * lambda`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use zenpng::{Encoder, Image, OutputFormat};
//!
//! let img = Image::from_rgba8(&pixels, width, height)?;
//! let out = Encoder::new()
//!     .lambda(300.0)
//!     .level(6)
//!     .format(OutputFormat::Png)
//!     .encode(&img)?;
//! std::fs::write("out_rdo.png", &out.data)?;
//! ```
//!
//! Higher lambda favors cheaper encodings: smaller files, more
//! distortion. Lambda 0 falls back to effectively lossless output.

// Shared models
pub mod color;
pub mod masking;
pub mod normal_map;

mod consts;
mod error;
mod types;

// PNG pipeline
mod deflate;
pub mod entropy;
mod filters;
mod huffman;
pub mod png;

// Byte-stream containers
pub mod lz4i;
pub mod qoi;

// Driver
mod encode;
pub mod metrics;

// Public API
pub use encode::{encode_with_params, Encoder};
pub use error::Error;
pub use types::{
    AngularStats, Encoded, EncodeStats, ErrorMetric, Image, OutputFormat, RdoParams, Rgba,
    SpeedMode,
};

/// Result type for zenpng operations
pub type Result<T> = std::result::Result<T, Error>;
