//! Encoder driver: parameter handling, table initialization, masking-map
//! construction, per-format dispatch, and quality reporting.

use crate::color;
use crate::lz4i;
use crate::masking::build_masking_map;
use crate::metrics;
use crate::normal_map;
use crate::png;
use crate::qoi;
use crate::types::{Encoded, EncodeStats, ErrorMetric, Image, OutputFormat, RdoParams, SpeedMode};
use crate::Result;

/// Rate-distortion optimizing recompressor with configurable container,
/// error metric, and effort level.
#[derive(Clone, Default)]
pub struct Encoder {
    params: RdoParams,
}

impl Encoder {
    /// Create an encoder with default settings: PNG output, perceptual
    /// metric, lambda 300, level 0.
    pub fn new() -> Self {
        Self { params: RdoParams::default() }
    }

    /// Create an encoder from a fully prepared parameter set.
    pub fn with_params(params: RdoParams) -> Self {
        Self { params }
    }

    /// Rate-distortion weight; 0 is effectively lossless.
    pub fn lambda(mut self, lambda: f32) -> Self {
        self.params.lambda = lambda;
        self
    }

    /// PNG parsing effort, 0 (fastest) to 29 (exhaustive).
    pub fn level(mut self, level: usize) -> Self {
        self.params.level = level;
        self
    }

    /// Which container to emit.
    pub fn format(mut self, format: OutputFormat) -> Self {
        self.params.format = format;
        self
    }

    /// Search effort for the QOI and LZ4 parsers.
    pub fn speed_mode(mut self, speed: SpeedMode) -> Self {
        self.params.speed_mode = speed;
        self
    }

    /// Switch from the perceptual OkLab metric to linear RGB(A) error.
    pub fn linear_metric(mut self) -> Self {
        self.params.metric = ErrorMetric::Linear;
        self
    }

    /// Treat the input as a normal map: angular error metric, tighter
    /// per-channel reject defaults, optional snorm8 channel coding.
    pub fn normal_map(mut self, snorm: bool) -> Self {
        self.params.metric = ErrorMetric::NormalMap;
        self.params.snorm = snorm;
        self.params.reject_thresholds[0] = 20;
        self.params.reject_thresholds[1] = 20;
        self.params.reject_thresholds[2] = 20;
        self
    }

    /// Re-project source pixels to the closest encodable unit vector
    /// before parsing (normal-map mode).
    pub fn normalize(mut self, normalize: bool) -> Self {
        self.params.normalize = normalize;
        self
    }

    /// Two-pass PNG encoding: refreeze the cost tables from the first
    /// pass's actual tokenization.
    pub fn two_pass(mut self, two_pass: bool) -> Self {
        self.params.two_pass = two_pass;
        self
    }

    /// Keep fully transparent pixels transparent and fully opaque pixels
    /// opaque.
    pub fn transparent_reject_test(mut self, enabled: bool) -> Self {
        self.params.transparent_reject_test = enabled;
        self
    }

    /// Only consider LZ matches, never cheaper-to-code literal deltas.
    pub fn match_only(mut self, match_only: bool) -> Self {
        self.params.match_only = match_only;
        self
    }

    pub fn params(&self) -> &RdoParams {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut RdoParams {
        &mut self.params
    }

    /// Encode one image into the configured container.
    pub fn encode(&self, img: &Image) -> Result<Encoded> {
        encode_with_params(img, &self.params)
    }
}

/// Run one encode under explicit parameters.
pub fn encode_with_params(orig: &Image, params: &RdoParams) -> Result<Encoded> {
    params.validate()?;

    // The process-wide lookup tables are built up front regardless of the
    // active metric, so no scoring path ever hits a cold table.
    let _ = color::oklab_table();

    let mut src = orig.clone();
    if params.metric == ErrorMetric::NormalMap && params.normalize {
        normal_map::normalize_image(&mut src, params.snorm);
    }

    let masking = build_masking_map(&src, params);

    let (data, coded) = match params.format {
        OutputFormat::Png => {
            let r = png::encode(&src, &masking, params);
            (r.file, r.coded)
        }
        OutputFormat::Qoi => {
            let r = qoi::encode(&src, &masking, params);
            (r.file, r.coded)
        }
        OutputFormat::Lz4i => {
            let r = lz4i::encode(&src, &masking, params);
            (r.file, r.coded)
        }
    };

    let num_comps = src.num_comps();
    let (psnr, y_psnr) = metrics::report(&coded, &src, num_comps, params.print_stats);
    let bpp = (data.len() as f32 * 8.0) / src.total_pixels() as f32;

    let angular = if params.metric == ErrorMetric::NormalMap {
        let stats = metrics::angular_stats(&src, &coded, params.snorm);
        if params.print_stats {
            println!(
                "Angular error degrees: min {:.4} avg {:.4} std {:.4} max {:.4} rms {:.4}",
                stats.min_deg, stats.mean_deg, stats.std_deg, stats.max_deg, stats.rms_deg
            );
            println!(
                "Apparently invalid normals: {} source, {} coded",
                stats.invalid_src_len, stats.invalid_coded_len
            );
        }
        Some(stats)
    } else {
        None
    };

    if params.print_stats {
        println!(
            "Compressed file size: {}, Bitrate: {:.3} bits/pixel",
            data.len(),
            bpp
        );
    }

    let stats = EncodeStats { psnr, y_psnr, bpp, compressed_size: data.len(), angular };
    Ok(Encoded { data, coded, stats })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Rgba;

    fn test_image() -> Image {
        let mut img = Image::new(10, 10, false);
        for y in 0..10 {
            for x in 0..10 {
                img.set(x, y, Rgba::new((x * 20) as u8, (y * 20) as u8, 128, 255));
            }
        }
        img
    }

    #[test]
    fn test_builder_chain() {
        let enc = Encoder::new()
            .lambda(500.0)
            .level(3)
            .format(OutputFormat::Qoi)
            .speed_mode(SpeedMode::Fastest)
            .linear_metric()
            .two_pass(true);
        assert_eq!(enc.params().lambda, 500.0);
        assert_eq!(enc.params().level, 3);
        assert_eq!(enc.params().format, OutputFormat::Qoi);
        assert!(enc.params().two_pass);
    }

    #[test]
    fn test_normal_map_builder_tightens_reject() {
        let enc = Encoder::new().normal_map(true);
        assert_eq!(enc.params().metric, ErrorMetric::NormalMap);
        assert!(enc.params().snorm);
        assert_eq!(&enc.params().reject_thresholds[..3], &[20, 20, 20]);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let img = test_image();
        assert!(Encoder::new().lambda(1e9).encode(&img).is_err());
        assert!(Encoder::new().level(30).encode(&img).is_err());
    }

    #[test]
    fn test_qoi_dispatch_end_to_end() {
        let img = test_image();
        let out = Encoder::new()
            .format(OutputFormat::Qoi)
            .linear_metric()
            .lambda(0.0)
            .encode(&img)
            .unwrap();
        assert_eq!(&out.data[..4], b"qoif");
        assert_eq!(out.stats.psnr, 100.0);
        let decoded = crate::qoi::decode(&out.data).unwrap();
        for y in 0..10 {
            for x in 0..10 {
                assert_eq!(decoded.get(x, y), img.get(x, y));
            }
        }
    }

    #[test]
    fn test_lambda_monotonicity_qoi() {
        let img = test_image();
        let at = |lambda: f32| {
            Encoder::new()
                .format(OutputFormat::Qoi)
                .linear_metric()
                .lambda(lambda)
                .encode(&img)
                .unwrap()
        };
        let lossless = at(0.0);
        let mid = at(400.0);
        let heavy = at(4000.0);
        assert!(lossless.stats.psnr >= mid.stats.psnr);
        assert!(mid.stats.psnr >= heavy.stats.psnr);
    }

    #[test]
    fn test_determinism() {
        let img = test_image();
        let enc = Encoder::new().format(OutputFormat::Lz4i).linear_metric().lambda(700.0);
        let a = enc.encode(&img).unwrap();
        let b = enc.encode(&img).unwrap();
        assert_eq!(a.data, b.data);
    }
}
