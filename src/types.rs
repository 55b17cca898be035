//! Core types for zenpng

use crate::error::{Error, Result};

/// An 8-bit RGBA pixel.
///
/// Three-channel images carry alpha = 255 everywhere so the hot paths can
/// treat every pixel uniformly and index channels 0..num_comps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rgba(pub [u8; 4]);

impl Rgba {
    /// The clear/edge color: opaque black.
    pub const BLACK: Rgba = Rgba([0, 0, 0, 255]);

    #[inline]
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Rgba([r, g, b, a])
    }

    #[inline]
    pub const fn r(self) -> u8 {
        self.0[0]
    }

    #[inline]
    pub const fn g(self) -> u8 {
        self.0[1]
    }

    #[inline]
    pub const fn b(self) -> u8 {
        self.0[2]
    }

    #[inline]
    pub const fn a(self) -> u8 {
        self.0[3]
    }
}

impl std::ops::Index<usize> for Rgba {
    type Output = u8;

    #[inline]
    fn index(&self, c: usize) -> &u8 {
        &self.0[c]
    }
}

impl std::ops::IndexMut<usize> for Rgba {
    #[inline]
    fn index_mut(&mut self, c: usize) -> &mut u8 {
        &mut self.0[c]
    }
}

/// A rectangular RGBA raster with row-contiguous pixel-major storage.
///
/// The source image is read-only once parsing starts; the delta and coded
/// planes reuse the same type with interior mutability via `set`.
#[derive(Debug, Clone)]
pub struct Image {
    width: usize,
    height: usize,
    has_alpha: bool,
    pixels: Vec<Rgba>,
}

impl Image {
    /// Create an image cleared to opaque black.
    pub fn new(width: usize, height: usize, has_alpha: bool) -> Self {
        Self {
            width,
            height,
            has_alpha,
            pixels: vec![Rgba::BLACK; width * height],
        }
    }

    /// Build from an interleaved RGBA8 buffer.
    pub fn from_rgba8(pixels: &[u8], width: usize, height: usize) -> Result<Self> {
        let expected = width * height * 4;
        if pixels.len() != expected {
            return Err(Error::InvalidPixelData { expected, actual: pixels.len() });
        }

        let mut img = Image::new(width, height, true);
        for (dst, src) in img.pixels.iter_mut().zip(pixels.chunks_exact(4)) {
            *dst = Rgba([src[0], src[1], src[2], src[3]]);
        }
        Ok(img)
    }

    /// Build from an interleaved RGB8 buffer; alpha is forced to 255.
    pub fn from_rgb8(pixels: &[u8], width: usize, height: usize) -> Result<Self> {
        let expected = width * height * 3;
        if pixels.len() != expected {
            return Err(Error::InvalidPixelData { expected, actual: pixels.len() });
        }

        let mut img = Image::new(width, height, false);
        for (dst, src) in img.pixels.iter_mut().zip(pixels.chunks_exact(3)) {
            *dst = Rgba([src[0], src[1], src[2], 255]);
        }
        Ok(img)
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn total_pixels(&self) -> usize {
        self.width * self.height
    }

    #[inline]
    pub fn has_alpha(&self) -> bool {
        self.has_alpha
    }

    /// 4 for RGBA inputs, 3 otherwise.
    #[inline]
    pub fn num_comps(&self) -> usize {
        if self.has_alpha {
            4
        } else {
            3
        }
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> Rgba {
        debug_assert!(x < self.width && y < self.height);
        self.pixels[y * self.width + x]
    }

    /// Edge-clamped read; coordinates may be outside the image.
    #[inline]
    pub fn get_clamped(&self, x: i32, y: i32) -> Rgba {
        let cx = x.clamp(0, self.width as i32 - 1) as usize;
        let cy = y.clamp(0, self.height as i32 - 1) as usize;
        self.pixels[cy * self.width + cx]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, p: Rgba) {
        debug_assert!(x < self.width && y < self.height);
        self.pixels[y * self.width + x] = p;
    }

    /// One full row of pixels.
    #[inline]
    pub fn row(&self, y: usize) -> &[Rgba] {
        &self.pixels[y * self.width..(y + 1) * self.width]
    }

    #[inline]
    pub fn row_mut(&mut self, y: usize) -> &mut [Rgba] {
        &mut self.pixels[y * self.width..(y + 1) * self.width]
    }

    /// Reset every pixel to opaque black (pass-2 scratch reuse).
    pub fn clear(&mut self) {
        self.pixels.fill(Rgba::BLACK);
    }
}

/// Which container the encoder emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// DEFLATE-based scanline-filtered container (PNG)
    #[default]
    Png,
    /// Fixed-opcode byte-stream container (QOI)
    Qoi,
    /// LZ4 block-compressed raw-pixel container
    Lz4i,
}

impl OutputFormat {
    /// Conventional file extension for the container.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Qoi => "qoi",
            OutputFormat::Lz4i => "lz4i",
        }
    }
}

/// Search effort for the QOI and LZ4 parsers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpeedMode {
    /// Full searches (all 16,384 LUMA combinations; 8 lookback rows / 64 bytes)
    Uber,
    /// Reduced searches (23 preferred green deltas; 4 rows / 16 bytes)
    #[default]
    Better,
    /// Lossless-only fast paths (2 rows / 8 bytes)
    Fastest,
}

/// How candidate distortion is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorMetric {
    /// OkLab-weighted perceptual squared error (default)
    #[default]
    Perceptual,
    /// Linear RGB(A) squared error, optionally channel-weighted
    Linear,
    /// Angular error between decoded unit vectors (normal maps)
    NormalMap,
}

/// Reject threshold value treated as "disabled" for u8 channel deltas.
pub const REJECT_DISABLED: u32 = 256;

/// Encoder tuning parameters.
///
/// The CLI maps its flags onto this struct; library users fill it through
/// [`crate::Encoder`]'s builder methods.
#[derive(Debug, Clone)]
pub struct RdoParams {
    /// Rate-distortion weight; 0 is effectively lossless. Range [0, 250000].
    pub lambda: f32,
    /// PNG parsing level, row index into the level table. Range [0, 29].
    pub level: usize,
    pub format: OutputFormat,
    pub speed_mode: SpeedMode,
    pub metric: ErrorMetric,
    /// Normal-map channels are snorm8 instead of unorm8.
    pub snorm: bool,
    /// Re-project source pixels to the closest encodable unit vector.
    pub normalize: bool,

    /// Linear-mode channel weights, each in [0, 256].
    pub chan_weights: [u32; 4],
    pub use_chan_weights: bool,
    /// OkLab (L, a, b, alpha) weights; (L,a,b) normalized to unit length.
    pub chan_weights_lab: [f32; 4],

    /// Linear-mode per-channel reject thresholds; >= 256 disables a channel.
    pub reject_thresholds: [u32; 4],
    /// OkLab reject thresholds: [0] max |dL|, [1] max (da,db) distance.
    pub reject_thresholds_lab: [f32; 2],
    pub use_reject_thresholds: bool,
    /// Opaque pixels must stay opaque and transparent pixels transparent.
    pub transparent_reject_test: bool,
    /// Alpha encodes coverage, so RGB quality near alpha edges is boosted.
    pub alpha_is_opacity: bool,

    /// Only try LZ matches, never cheaper-to-code literal deltas.
    pub match_only: bool,
    /// Re-freeze the PNG cost tables from the pass-1 tokenization.
    pub two_pass: bool,

    pub no_mse_scaling: bool,
    pub max_smooth_std_dev: f32,
    /// None picks the per-format default (PNG 250, QOI 2500, LZ4 8000).
    pub smooth_max_mse_scale: Option<f32>,
    pub max_ultra_smooth_std_dev: f32,
    /// None picks the per-format default (PNG 1500, QOI 5000, LZ4 10000).
    pub ultra_smooth_max_mse_scale: Option<f32>,

    pub print_progress: bool,
    pub print_stats: bool,
    pub print_debug_output: bool,
}

impl Default for RdoParams {
    fn default() -> Self {
        let lab = {
            let (lw, aw, bw) = (2.0f32, 1.5f32, 1.0f32);
            let len = (lw * lw + aw * aw + bw * bw).sqrt();
            [lw / len, aw / len, bw / len, 1.0]
        };

        Self {
            lambda: 300.0,
            level: 0,
            format: OutputFormat::Png,
            speed_mode: SpeedMode::default(),
            metric: ErrorMetric::Perceptual,
            snorm: false,
            normalize: false,

            chan_weights: [1, 1, 1, 1],
            use_chan_weights: false,
            chan_weights_lab: lab,

            reject_thresholds: [32, 32, 32, 32],
            reject_thresholds_lab: [0.05, 0.05],
            use_reject_thresholds: true,
            transparent_reject_test: false,
            alpha_is_opacity: true,

            match_only: false,
            two_pass: false,

            no_mse_scaling: false,
            max_smooth_std_dev: 35.0,
            smooth_max_mse_scale: None,
            max_ultra_smooth_std_dev: 5.0,
            ultra_smooth_max_mse_scale: None,

            print_progress: false,
            print_stats: false,
            print_debug_output: false,
        }
    }
}

impl RdoParams {
    /// Smooth-region MSE scale ceiling, defaulted per container.
    #[must_use]
    pub fn smooth_max_scale(&self) -> f32 {
        self.smooth_max_mse_scale.unwrap_or(match self.format {
            OutputFormat::Png => 250.0,
            OutputFormat::Qoi => 2500.0,
            OutputFormat::Lz4i => 8000.0,
        })
    }

    /// Ultra-smooth MSE scale ceiling, defaulted per container.
    #[must_use]
    pub fn ultra_smooth_max_scale(&self) -> f32 {
        self.ultra_smooth_max_mse_scale.unwrap_or(match self.format {
            OutputFormat::Png => 1500.0,
            OutputFormat::Qoi => 5000.0,
            OutputFormat::Lz4i => 10000.0,
        })
    }

    /// True when the perceptual OkLab metric drives distortion and reject.
    #[inline]
    #[must_use]
    pub fn perceptual(&self) -> bool {
        self.metric == ErrorMetric::Perceptual
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(0.0..=250_000.0).contains(&self.lambda) {
            return Err(Error::InvalidParameter {
                name: "lambda",
                reason: format!("{} outside [0, 250000]", self.lambda),
            });
        }
        if self.level >= crate::consts::LEVELS.len() {
            return Err(Error::InvalidParameter {
                name: "level",
                reason: format!("{} outside [0, {}]", self.level, crate::consts::LEVELS.len() - 1),
            });
        }
        Ok(())
    }
}

/// Angular-error statistics for normal-map encodes, in degrees.
#[derive(Debug, Clone, Copy, Default)]
pub struct AngularStats {
    pub min_deg: f32,
    pub mean_deg: f32,
    pub std_deg: f32,
    pub max_deg: f32,
    pub rms_deg: f32,
    /// Source pixels whose decoded length falls outside [0.4, 1.4].
    pub invalid_src_len: usize,
    /// Coded pixels whose decoded length falls outside [0.4, 1.4].
    pub invalid_coded_len: usize,
}

/// Quality/size report for one encode.
#[derive(Debug, Clone, Default)]
pub struct EncodeStats {
    /// RGB PSNR, or RGBA PSNR for 4-channel inputs. Capped at 100 dB.
    pub psnr: f32,
    /// Rec.709 luma PSNR. Capped at 100 dB.
    pub y_psnr: f32,
    /// Compressed bits per pixel.
    pub bpp: f32,
    pub compressed_size: usize,
    pub angular: Option<AngularStats>,
}

/// One encode's output: the container bytes, the pixels the external
/// decoder will reconstruct from them, and the quality report.
#[derive(Debug, Clone)]
pub struct Encoded {
    pub data: Vec<u8>,
    pub coded: Image,
    pub stats: EncodeStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_edge_clamp() {
        let mut img = Image::new(4, 3, false);
        img.set(0, 0, Rgba::new(10, 20, 30, 255));
        img.set(3, 2, Rgba::new(1, 2, 3, 255));

        assert_eq!(img.get_clamped(-5, -5), img.get(0, 0));
        assert_eq!(img.get_clamped(100, 100), img.get(3, 2));
        assert_eq!(img.get_clamped(2, 1), img.get(2, 1));
    }

    #[test]
    fn test_rgb8_forces_alpha() {
        let img = Image::from_rgb8(&[1, 2, 3, 4, 5, 6], 2, 1).unwrap();
        assert!(!img.has_alpha());
        assert_eq!(img.num_comps(), 3);
        assert_eq!(img.get(0, 0), Rgba::new(1, 2, 3, 255));
        assert_eq!(img.get(1, 0), Rgba::new(4, 5, 6, 255));
    }

    #[test]
    fn test_bad_buffer_len_rejected() {
        assert!(Image::from_rgba8(&[0; 15], 2, 2).is_err());
        assert!(Image::from_rgb8(&[0; 11], 2, 2).is_err());
    }

    #[test]
    fn test_default_lab_weights_unit_length() {
        let p = RdoParams::default();
        let [l, a, b, _] = p.chan_weights_lab;
        let len = (l * l + a * a + b * b).sqrt();
        assert!((len - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_masking_defaults_per_format() {
        let mut p = RdoParams::default();
        assert_eq!(p.smooth_max_scale(), 250.0);
        p.format = OutputFormat::Qoi;
        assert_eq!(p.smooth_max_scale(), 2500.0);
        p.format = OutputFormat::Lz4i;
        assert_eq!(p.ultra_smooth_max_scale(), 10000.0);
        p.smooth_max_mse_scale = Some(42.0);
        assert_eq!(p.smooth_max_scale(), 42.0);
    }
}
