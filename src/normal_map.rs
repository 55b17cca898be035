//! Normal-map error model: unorm8/snorm8 vector codecs, the fast arccos
//! approximation, the angular squared-error metric, and the exhaustive
//! closest-encodable-vector search.

use std::sync::OnceLock;

use crate::types::{Image, RdoParams, Rgba};

const RAD_TO_DEG: f32 = 180.0 / std::f32::consts::PI;

/// Above this |cos| the table is too coarse; a Taylor tail takes over.
const ACOS_TABLE_CUTOFF: f32 = 0.95;

/// Lengths outside this band are reported as apparently-invalid normals.
pub const VALID_LEN_MIN: f32 = 0.4;
pub const VALID_LEN_MAX: f32 = 1.4;

#[inline]
fn square(f: f32) -> f32 {
    f * f
}

/// Decode one unorm8 channel to [-1, 1].
#[inline]
pub fn decode_unorm8(c: u8) -> f32 {
    2.0 * (c as f32 / 255.0) - 1.0
}

/// Decode one snorm8 channel to [-1, 1].
#[inline]
pub fn decode_snorm8(c: u8) -> f32 {
    ((c as f32 - 128.0) / 127.0).clamp(-1.0, 1.0)
}

#[inline]
fn encode_real(n: f32, snorm: bool) -> f32 {
    if snorm {
        n * 127.0 + 128.0
    } else {
        (n + 1.0) * 0.5 * 255.0
    }
}

/// Decode a pixel's RGB channels to a (not necessarily unit) vector.
#[inline]
pub fn decode_normal(c: Rgba, snorm: bool) -> [f32; 3] {
    if snorm {
        [decode_snorm8(c.r()), decode_snorm8(c.g()), decode_snorm8(c.b())]
    } else {
        [decode_unorm8(c.r()), decode_unorm8(c.g()), decode_unorm8(c.b())]
    }
}

#[inline]
fn dot(a: [f32; 3], b: [f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
pub fn length(v: [f32; 3]) -> f32 {
    dot(v, v).sqrt()
}

fn acos_table() -> &'static [f32; 1025] {
    static TABLE: OnceLock<[f32; 1025]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut t = [0.0f32; 1025];
        for (i, v) in t.iter_mut().enumerate() {
            *v = (i as f32 / 1024.0).acos() * RAD_TO_DEG;
        }
        t
    })
}

/// Approximate arccos in degrees, within 0.1 degrees of the exact value.
///
/// |f| >= 0.95 uses the series tail sqrt(2(1-|f|)); smaller magnitudes
/// interpolate the 1025-entry table. Negative inputs mirror to 180 - r.
#[inline]
pub fn approx_acos_deg(f: f32) -> f32 {
    let af = f.abs().min(1.0);

    let r = if af >= ACOS_TABLE_CUTOFF {
        (2.0 * (1.0 - af)).sqrt() * RAD_TO_DEG
    } else {
        let x = af * 1024.0;
        let i = x as usize;
        let frac = x - i as f32;
        let t = acos_table();
        t[i] * (1.0 - frac) + t[i + 1] * frac
    };

    if f < 0.0 {
        180.0 - r
    } else {
        r
    }
}

/// Angle between two (possibly non-unit) vectors, in degrees.
pub fn angular_error_deg(a: [f32; 3], b: [f32; 3], approx: bool) -> f32 {
    let la = length(a);
    let lb = length(b);
    if la < 1e-12 || lb < 1e-12 {
        // A zero vector has no direction; count it as maximally wrong
        // unless both are degenerate.
        return if la < 1e-12 && lb < 1e-12 { 0.0 } else { 180.0 };
    }

    let f = (dot(a, b) / (la * lb)).clamp(-1.0, 1.0);
    if approx {
        approx_acos_deg(f)
    } else {
        f.acos() * RAD_TO_DEG
    }
}

/// Squared error for normal-map content: the angular term dominates, with
/// a length-deviation penalty that keeps the parse from drifting toward
/// short vectors, plus the alpha term for 4-channel inputs.
pub fn normal_se(trial: Rgba, orig: Rgba, num_comps: usize, params: &RdoParams) -> f32 {
    let vt = decode_normal(trial, params.snorm);
    let vo = decode_normal(orig, params.snorm);

    let ang = angular_error_deg(vt, vo, true);
    let mut se = 4.0 * ang * ang;

    let len_dev = (length(vt) - 1.0).abs();
    if len_dev > 0.1 {
        se += 0.1 * square(255.0 * len_dev);
    }

    if num_comps == 4 {
        let da = (trial.a() as i32 - orig.a() as i32) as f32;
        let w = if params.use_chan_weights { params.chan_weights[3] as f32 } else { 1.0 };
        se += w * square(da);
    }

    se
}

/// Find the encoded RGB triple whose decoded, normalized vector is closest
/// in direction to `v`, over the 8 floor/ceil corners of the per-channel
/// quantization lattice.
pub fn encode_closest(v: [f32; 3], snorm: bool) -> [u8; 3] {
    let reals = [
        encode_real(v[0], snorm),
        encode_real(v[1], snorm),
        encode_real(v[2], snorm),
    ];

    let mut best = [0u8; 3];
    let mut best_dot = f32::NEG_INFINITY;

    for corner in 0..8u32 {
        let mut trial = [0u8; 3];
        for c in 0..3 {
            let r = if corner & (1 << c) != 0 { reals[c].ceil() } else { reals[c].floor() };
            trial[c] = r.clamp(0.0, 255.0) as u8;
        }

        let dec = decode_normal(Rgba::new(trial[0], trial[1], trial[2], 255), snorm);
        let len = length(dec);
        if len < 1e-12 {
            continue;
        }

        let d = dot(dec, v) / len;
        if d > best_dot {
            best_dot = d;
            best = trial;
        }
    }

    best
}

/// Re-project every source pixel onto the closest encodable unit vector,
/// preserving alpha. Applied before parsing when normalization is on.
pub fn normalize_image(img: &mut Image, snorm: bool) {
    for y in 0..img.height() {
        for x in 0..img.width() {
            let p = img.get(x, y);
            let v = decode_normal(p, snorm);
            let len = length(v);
            if len < 1e-12 {
                continue;
            }

            let unit = [v[0] / len, v[1] / len, v[2] / len];
            let enc = encode_closest(unit, snorm);
            img.set(x, y, Rgba::new(enc[0], enc[1], enc[2], p.a()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoders() {
        assert!((decode_unorm8(0) + 1.0).abs() < 1e-6);
        assert!((decode_unorm8(255) - 1.0).abs() < 1e-6);
        assert!(decode_unorm8(128) > 0.0);

        assert_eq!(decode_snorm8(128), 0.0);
        assert_eq!(decode_snorm8(255), 1.0);
        assert_eq!(decode_snorm8(1), -1.0);
        // 0 clamps to the same value as 1
        assert_eq!(decode_snorm8(0), -1.0);
    }

    #[test]
    fn test_approx_acos_accuracy() {
        // Bound against the exact arccos over the full input domain.
        let mut max_err = 0.0f32;
        let mut f = -1.0f32;
        while f <= 1.0 {
            let exact = f.acos() * RAD_TO_DEG;
            let approx = approx_acos_deg(f);
            max_err = max_err.max((exact - approx).abs());
            f += 1.0 / 4096.0;
        }
        assert!(max_err <= 0.2, "max acos error {} deg", max_err);
    }

    #[test]
    fn test_angular_error_basics() {
        let x = [1.0, 0.0, 0.0];
        let y = [0.0, 1.0, 0.0];
        assert!((angular_error_deg(x, x, false)).abs() < 1e-3);
        assert!((angular_error_deg(x, y, false) - 90.0).abs() < 1e-3);
        assert!((angular_error_deg(x, [-1.0, 0.0, 0.0], true) - 180.0).abs() < 0.2);
        // Angle ignores magnitude
        assert!((angular_error_deg([2.0, 0.0, 0.0], [0.5, 0.0, 0.0], true)).abs() < 0.2);
    }

    #[test]
    fn test_encode_closest_axes() {
        for (v, snorm) in [
            ([0.0f32, 0.0, 1.0], false),
            ([0.0, 0.0, 1.0], true),
            ([1.0, 0.0, 0.0], false),
            ([0.0, -1.0, 0.0], true),
        ] {
            let enc = encode_closest(v, snorm);
            let dec = decode_normal(Rgba::new(enc[0], enc[1], enc[2], 255), snorm);
            let ang = angular_error_deg(dec, v, false);
            assert!(ang < 0.5, "axis {:?} snorm={} encoded {} deg off", v, snorm, ang);
        }
    }

    #[test]
    fn test_normalize_image_produces_unit_lengths() {
        let mut img = Image::new(4, 1, false);
        img.set(0, 0, Rgba::new(255, 128, 128, 255));
        img.set(1, 0, Rgba::new(200, 200, 255, 255));
        img.set(2, 0, Rgba::new(128, 128, 128, 255));
        img.set(3, 0, Rgba::new(10, 240, 180, 255));

        normalize_image(&mut img, false);

        for x in 0..4 {
            let v = decode_normal(img.get(x, 0), false);
            let len = length(v);
            if len > 1e-6 {
                // Within quantization distance of unit length
                assert!((len - 1.0).abs() < 0.02, "x={} len={}", x, len);
            }
        }
    }

    #[test]
    fn test_length_penalty_applies_only_off_unit() {
        let params = RdoParams {
            metric: crate::types::ErrorMetric::NormalMap,
            ..Default::default()
        };
        // (255,128,128) decodes near +X at unit length; (188,128,128) is the
        // same direction at noticeably shorter length.
        let unit = Rgba::new(255, 128, 128, 255);
        let short = Rgba::new(188, 128, 128, 255);
        let se_unit = normal_se(unit, unit, 3, &params);
        let se_short = normal_se(short, unit, 3, &params);
        assert!(se_unit < 1.0);
        assert!(se_short > se_unit + 100.0, "short-vector SE {}", se_short);
    }
}
