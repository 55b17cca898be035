//! Color model: sRGB transfer, OkLab lookup table, squared-error metrics,
//! and the candidate reject predicate.
//!
//! The OkLab table maps every 24-bit RGB value to quantized 16-bit (L, a, b)
//! and weighs ~96 MiB, so it is computed once per process and optionally
//! persisted next to the executable (`oklab.bin`) and memory-mapped on warm
//! starts. All scoring reads the *normalized* table values (all three
//! channels scaled by 1/65535) so per-channel deltas share one scale.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::Result;
use crate::types::{ErrorMetric, RdoParams, Rgba, REJECT_DISABLED};

/// Distortion scale that makes perceptual-mode lambdas comparable to
/// linear-mode lambdas.
const PERCEPTUAL_SCALE: f32 = 350_000.0;

/// OkLab component value ranges used by the quantizer.
const MIN_L: f32 = 0.0;
const MAX_L: f32 = 1.0;
const MIN_A: f32 = -0.233888;
const MAX_A: f32 = 0.276217;
const MIN_B: f32 = -0.311529;
const MAX_B: f32 = 0.198570;

/// Dequantization constants for the natural-range lookup.
const SCALE_L: f32 = 1.0 / 65535.0;
const SCALE_A: f32 = (1.0 / 65535.0) * (0.276216 - (-0.233887));
const OFS_A: f32 = -0.233887;
const SCALE_B: f32 = (1.0 / 65535.0) * (0.198570 - (-0.311528));
const OFS_B: f32 = -0.311528;

/// Table size on disk: 256^3 entries of three u16s, host-native, no header.
pub const OKLAB_TABLE_BYTES: usize = 256 * 256 * 256 * 6;

/// An OkLab triple.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Lab {
    pub l: f32,
    pub a: f32,
    pub b: f32,
}

#[inline]
fn square(f: f32) -> f32 {
    f * f
}

fn srgb_to_linear_table() -> &'static [f32; 256] {
    static TABLE: OnceLock<[f32; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut t = [0.0f32; 256];
        for (i, v) in t.iter_mut().enumerate() {
            *v = f_inv(i as f32 / 255.0);
        }
        t
    })
}

/// Inverse sRGB transfer function.
fn f_inv(x: f32) -> f32 {
    if x <= 0.04045 {
        x / 12.92
    } else {
        ((x + 0.055) / 1.055).powf(2.4)
    }
}

/// sRGB byte to linear intensity, via the process-wide table.
#[inline]
pub fn srgb_to_linear(c: u8) -> f32 {
    srgb_to_linear_table()[c as usize]
}

/// Reference OkLab conversion over linear sRGB.
pub fn linear_srgb_to_oklab(r: f32, g: f32, b: f32) -> Lab {
    let l = 0.4122214708 * r + 0.5363325363 * g + 0.0514459929 * b;
    let m = 0.2119034982 * r + 0.6806995451 * g + 0.1073969566 * b;
    let s = 0.0883024619 * r + 0.2817188376 * g + 0.6299787005 * b;

    let l_ = l.cbrt();
    let m_ = m.cbrt();
    let s_ = s.cbrt();

    Lab {
        l: 0.2104542553 * l_ + 0.7936177850 * m_ - 0.0040720468 * s_,
        a: 1.9779984951 * l_ - 2.4285922050 * m_ + 0.4505937099 * s_,
        b: 0.0259040371 * l_ + 0.7827717662 * m_ - 0.8086757660 * s_,
    }
}

/// Quantize one OkLab triple to the table's three u16 lanes.
fn quantize_lab(l: Lab) -> [u16; 3] {
    let ql = (((l.l - MIN_L) / (MAX_L - MIN_L)) * 65535.0).round().clamp(0.0, 65535.0);
    let qa = (((l.a - MIN_A) / (MAX_A - MIN_A)) * 65535.0).round().clamp(0.0, 65535.0);
    let qb = (((l.b - MIN_B) / (MAX_B - MIN_B)) * 65535.0).round().clamp(0.0, 65535.0);
    [ql as u16, qa as u16, qb as u16]
}

enum TableStorage {
    Mapped(memmap2::Mmap),
    Owned(Vec<u8>),
}

/// The process-wide sRGB -> quantized-OkLab lookup table.
pub struct OklabTable {
    storage: TableStorage,
}

impl OklabTable {
    fn bytes(&self) -> &[u8] {
        match &self.storage {
            TableStorage::Mapped(m) => &m[..],
            TableStorage::Owned(v) => &v[..],
        }
    }

    #[inline]
    fn raw(&self, c: Rgba) -> [u16; 3] {
        let idx = 6 * (c.r() as usize + c.g() as usize * 256 + c.b() as usize * 65536);
        let b = &self.bytes()[idx..idx + 6];
        [
            u16::from_ne_bytes([b[0], b[1]]),
            u16::from_ne_bytes([b[2], b[3]]),
            u16::from_ne_bytes([b[4], b[5]]),
        ]
    }

    /// Natural-range OkLab for an sRGB color.
    #[inline]
    pub fn lookup(&self, c: Rgba) -> Lab {
        let [l, a, b] = self.raw(c);
        Lab {
            l: l as f32 * SCALE_L,
            a: a as f32 * SCALE_A + OFS_A,
            b: b as f32 * SCALE_B + OFS_B,
        }
    }

    /// Normalized lookup: every lane scaled to [0, 1] of its quantized
    /// range. The scoring and reject paths work in these units.
    #[inline]
    pub fn lookup_norm(&self, c: Rgba) -> Lab {
        let [l, a, b] = self.raw(c);
        Lab {
            l: l as f32 * SCALE_L,
            a: a as f32 * SCALE_L,
            b: b as f32 * SCALE_L,
        }
    }

    fn compute() -> Vec<u8> {
        let lin = srgb_to_linear_table();
        let mut bytes = vec![0u8; OKLAB_TABLE_BYTES];

        for b in 0..256usize {
            for g in 0..256usize {
                let base = 6 * (g * 256 + b * 65536);
                for r in 0..256usize {
                    let lab = linear_srgb_to_oklab(lin[r], lin[g], lin[b]);
                    let q = quantize_lab(lab);
                    let at = base + 6 * r;
                    bytes[at..at + 2].copy_from_slice(&q[0].to_ne_bytes());
                    bytes[at + 2..at + 4].copy_from_slice(&q[1].to_ne_bytes());
                    bytes[at + 4..at + 6].copy_from_slice(&q[2].to_ne_bytes());
                }
            }
        }

        bytes
    }
}

static OKLAB: OnceLock<OklabTable> = OnceLock::new();

fn cache_file(dir: &Path) -> PathBuf {
    dir.join("oklab.bin")
}

fn try_map_cache(path: &Path) -> Option<memmap2::Mmap> {
    let file = fs::File::open(path).ok()?;
    let len = file.metadata().ok()?.len();
    if len != OKLAB_TABLE_BYTES as u64 {
        return None;
    }
    // Safety: the mapping is read-only and the file is treated as
    // regenerable scratch; a concurrent rewrite only degrades scores.
    unsafe { memmap2::Mmap::map(&file) }.ok()
}

/// Initialize the OkLab table, loading `oklab.bin` from `cache_dir` when it
/// exists with the exact expected size, computing (and persisting, if a
/// cache dir is given) otherwise. Safe to call more than once.
pub fn init_oklab_table(cache_dir: Option<&Path>, quiet: bool) -> Result<()> {
    if OKLAB.get().is_some() {
        return Ok(());
    }

    if let Some(dir) = cache_dir {
        let path = cache_file(dir);
        if let Some(map) = try_map_cache(&path) {
            if !quiet {
                println!("Read Oklab table data from file {}", path.display());
            }
            let _ = OKLAB.set(OklabTable { storage: TableStorage::Mapped(map) });
            return Ok(());
        }
    }

    if !quiet {
        println!("Computing Oklab table");
    }
    let bytes = OklabTable::compute();

    if let Some(dir) = cache_dir {
        let path = cache_file(dir);
        match fs::File::create(&path).and_then(|mut f| f.write_all(&bytes)) {
            Ok(()) => {
                if !quiet {
                    println!("Wrote oklab lookup table to file {}", path.display());
                }
            }
            Err(e) => {
                eprintln!("Failed writing oklab lookup table to file {}: {}", path.display(), e);
            }
        }
    }

    let _ = OKLAB.set(OklabTable { storage: TableStorage::Owned(bytes) });
    Ok(())
}

/// The table, computing it in RAM on first use if `init_oklab_table` was
/// never called (library and test entry point).
pub fn oklab_table() -> &'static OklabTable {
    OKLAB.get_or_init(|| OklabTable { storage: TableStorage::Owned(OklabTable::compute()) })
}

/// Squared error between two pixels under the active metric.
#[inline]
pub fn compute_se(a: Rgba, b: Rgba, num_comps: usize, params: &RdoParams) -> f32 {
    match params.metric {
        ErrorMetric::Perceptual => perceptual_se(a, b, num_comps, params),
        ErrorMetric::Linear => linear_se(a, b, num_comps, params),
        ErrorMetric::NormalMap => crate::normal_map::normal_se(a, b, num_comps, params),
    }
}

/// Weighted OkLab squared error, plus a weighted alpha term for 4-channel.
pub fn perceptual_se(a: Rgba, b: Rgba, num_comps: usize, params: &RdoParams) -> f32 {
    let t = oklab_table();
    let la = t.lookup_norm(a);
    let lb = t.lookup_norm(b);

    let dl = square(la.l - lb.l) * params.chan_weights_lab[0];
    let da = square(la.a - lb.a) * params.chan_weights_lab[1];
    let db = square(la.b - lb.b) * params.chan_weights_lab[2];

    let mut dist = (dl + da + db) * PERCEPTUAL_SCALE;

    if num_comps == 4 {
        let dalpha = a.a() as i32 - b.a() as i32;
        dist += params.chan_weights_lab[3] * square(dalpha as f32);
    }

    dist
}

/// Linear RGB(A) sum of squared differences, channel-weighted when enabled.
pub fn linear_se(a: Rgba, b: Rgba, num_comps: usize, params: &RdoParams) -> f32 {
    let dr = a.r() as i32 - b.r() as i32;
    let dg = a.g() as i32 - b.g() as i32;
    let db = a.b() as i32 - b.b() as i32;

    let mut dist: u32 = if params.use_chan_weights {
        params.chan_weights[0] * (dr * dr) as u32
            + params.chan_weights[1] * (dg * dg) as u32
            + params.chan_weights[2] * (db * db) as u32
    } else {
        (dr * dr + dg * dg + db * db) as u32
    };

    if num_comps == 4 {
        let da = (a.a() as i32 - b.a() as i32).unsigned_abs();
        let w = if params.use_chan_weights { params.chan_weights[3] } else { 1 };
        dist += w * da * da;
    }

    dist as f32
}

/// Hard admissibility test for a trial pixel against the source pixel.
///
/// Returns true when the candidate must be discarded regardless of its RD
/// score. The bitwise-lossless baseline never rejects.
pub fn should_reject(trial: Rgba, orig: Rgba, num_comps: usize, params: &RdoParams) -> bool {
    if params.transparent_reject_test && num_comps == 4 {
        if orig.a() == 0 && trial.a() > 0 {
            return true;
        }
        if orig.a() == 255 && trial.a() < 255 {
            return true;
        }
    }

    if !params.use_reject_thresholds {
        return false;
    }

    if params.perceptual() {
        let tab = oklab_table();
        let t = tab.lookup_norm(trial);
        let o = tab.lookup_norm(orig);

        if (t.l - o.l).abs() > params.reject_thresholds_lab[0] {
            return true;
        }

        let ab_dist = square(t.a - o.a) + square(t.b - o.b);
        if ab_dist > square(params.reject_thresholds_lab[1]) {
            return true;
        }

        if num_comps == 4 {
            let da = (trial.a() as i32 - orig.a() as i32).unsigned_abs();
            if da > params.reject_thresholds[3] {
                return true;
            }
        }
    } else {
        for c in 0..num_comps {
            let thresh = params.reject_thresholds[c];
            if thresh >= REJECT_DISABLED {
                continue;
            }
            let delta = (trial[c] as i32 - orig[c] as i32).unsigned_abs();
            if delta > thresh {
                return true;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorMetric;

    #[test]
    fn test_srgb_linear_endpoints() {
        assert_eq!(srgb_to_linear(0), 0.0);
        assert!((srgb_to_linear(255) - 1.0).abs() < 1e-6);
        // The transfer function is monotone
        for i in 1..256 {
            assert!(srgb_to_linear(i as u8) > srgb_to_linear((i - 1) as u8));
        }
    }

    #[test]
    fn test_oklab_reference_white_and_black() {
        let white = linear_srgb_to_oklab(1.0, 1.0, 1.0);
        assert!((white.l - 1.0).abs() < 1e-3);
        assert!(white.a.abs() < 1e-3 && white.b.abs() < 1e-3);

        let black = linear_srgb_to_oklab(0.0, 0.0, 0.0);
        assert!(black.l.abs() < 1e-6);
    }

    #[test]
    fn test_oklab_in_quantizer_range() {
        // Sample the RGB cube coarsely; every value must quantize in-range
        // without clipping more than the rounding margin.
        for r in (0..256).step_by(51) {
            for g in (0..256).step_by(51) {
                for b in (0..256).step_by(51) {
                    let lab = linear_srgb_to_oklab(
                        srgb_to_linear(r as u8),
                        srgb_to_linear(g as u8),
                        srgb_to_linear(b as u8),
                    );
                    assert!(lab.l >= MIN_L - 1e-5 && lab.l <= MAX_L + 1e-5);
                    assert!(lab.a >= MIN_A - 1e-5 && lab.a <= MAX_A + 1e-5);
                    assert!(lab.b >= MIN_B - 1e-5 && lab.b <= MAX_B + 1e-5);
                }
            }
        }
    }

    #[test]
    fn test_linear_se_weights() {
        let mut params = RdoParams { metric: ErrorMetric::Linear, ..Default::default() };
        let a = Rgba::new(10, 20, 30, 255);
        let b = Rgba::new(12, 20, 30, 255);
        assert_eq!(linear_se(a, b, 4, &params), 4.0);

        params.use_chan_weights = true;
        params.chan_weights = [3, 1, 1, 1];
        assert_eq!(linear_se(a, b, 4, &params), 12.0);
    }

    #[test]
    fn test_reject_identity_never_fires() {
        let params = RdoParams { metric: ErrorMetric::Linear, ..Default::default() };
        let p = Rgba::new(1, 2, 3, 200);
        assert!(!should_reject(p, p, 4, &params));
    }

    #[test]
    fn test_reject_linear_thresholds() {
        let mut params = RdoParams {
            metric: ErrorMetric::Linear,
            reject_thresholds: [4, 4, 4, 4],
            ..Default::default()
        };
        let orig = Rgba::new(100, 100, 100, 255);
        assert!(!should_reject(Rgba::new(104, 100, 100, 255), orig, 4, &params));
        assert!(should_reject(Rgba::new(105, 100, 100, 255), orig, 4, &params));

        // 256 is the disabled sentinel; u8 deltas can never exceed it
        params.reject_thresholds = [REJECT_DISABLED; 4];
        assert!(!should_reject(Rgba::new(255, 0, 255, 0), orig, 4, &params));
    }

    #[test]
    fn test_cache_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oklab.bin");

        // A wrong-size file is ignored, which is what sends the
        // initializer down the recompute-and-overwrite path.
        std::fs::write(&path, vec![0u8; 1234]).unwrap();
        assert!(try_map_cache(&path).is_none());

        // An exact-size file memory-maps and feeds the lookups directly.
        // Stamp the entry for RGB (1, 0, 0) with a recognizable triple.
        let mut bytes = vec![0u8; OKLAB_TABLE_BYTES];
        bytes[6..8].copy_from_slice(&500u16.to_ne_bytes());
        bytes[8..10].copy_from_slice(&600u16.to_ne_bytes());
        bytes[10..12].copy_from_slice(&700u16.to_ne_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let map = try_map_cache(&path).expect("exact-size cache must map");
        let table = OklabTable { storage: TableStorage::Mapped(map) };

        let lab = table.lookup_norm(Rgba::new(1, 0, 0, 255));
        assert!((lab.l - 500.0 / 65535.0).abs() < 1e-6);
        assert!((lab.a - 600.0 / 65535.0).abs() < 1e-6);
        assert!((lab.b - 700.0 / 65535.0).abs() < 1e-6);

        let zero = table.lookup_norm(Rgba::new(0, 0, 0, 255));
        assert_eq!(zero.l, 0.0);
    }

    #[test]
    fn test_reject_opacity_boundary() {
        let params = RdoParams {
            metric: ErrorMetric::Linear,
            transparent_reject_test: true,
            reject_thresholds: [REJECT_DISABLED; 4],
            ..Default::default()
        };
        let transparent = Rgba::new(0, 0, 0, 0);
        let opaque = Rgba::new(0, 0, 0, 255);
        assert!(should_reject(Rgba::new(0, 0, 0, 1), transparent, 4, &params));
        assert!(should_reject(Rgba::new(0, 0, 0, 254), opaque, 4, &params));
        assert!(!should_reject(opaque, opaque, 4, &params));
    }
}
