//! Quality reporting: the PSNR family and normal-map angular statistics.

use crate::normal_map::{angular_error_deg, decode_normal, length, VALID_LEN_MAX, VALID_LEN_MIN};
use crate::types::{AngularStats, Image};

/// Capped PSNR ceiling; identical images report this.
const PSNR_CAP: f32 = 100.0;

#[inline]
fn luma_709(r: f32, g: f32, b: f32) -> f32 {
    0.2126 * r + 0.7152 * g + 0.0722 * b
}

/// PSNR over channels `[first_chan, first_chan + num_chans)`, or over the
/// Rec.709 luma when `num_chans` is 0. Capped at 100 dB.
pub fn psnr(a: &Image, b: &Image, first_chan: usize, num_chans: usize) -> f32 {
    debug_assert_eq!(a.width(), b.width());
    debug_assert_eq!(a.height(), b.height());

    let mut sum = 0.0f64;
    let mut count = 0u64;

    for y in 0..a.height() {
        for x in 0..a.width() {
            let pa = a.get(x, y);
            let pb = b.get(x, y);

            if num_chans == 0 {
                let ya = luma_709(pa.r() as f32, pa.g() as f32, pa.b() as f32);
                let yb = luma_709(pb.r() as f32, pb.g() as f32, pb.b() as f32);
                sum += ((ya - yb) as f64).powi(2);
                count += 1;
            } else {
                for c in first_chan..first_chan + num_chans {
                    let d = pa[c] as f64 - pb[c] as f64;
                    sum += d * d;
                    count += 1;
                }
            }
        }
    }

    let rms = (sum / count as f64).sqrt() as f32;
    if rms == 0.0 {
        PSNR_CAP
    } else {
        ((255.0 / rms).log10() * 20.0).clamp(0.0, PSNR_CAP)
    }
}

/// The reference metric block: RGB, RGBA, per-channel and Y-709 PSNR.
/// Returns (overall PSNR, luma PSNR); the overall value is the RGBA figure
/// for 4-channel images and the RGB figure otherwise.
pub fn report(coded: &Image, orig: &Image, num_comps: usize, print: bool) -> (f32, f32) {
    let rgb = psnr(coded, orig, 0, 3);
    if print {
        println!("RGB     PSNR: {:7.3} dB", rgb);
    }

    let mut overall = rgb;
    if num_comps == 4 {
        overall = psnr(coded, orig, 0, 4);
        if print {
            println!("RGBA    PSNR: {:7.3} dB", overall);
        }
    }

    if print {
        for (name, chan) in [("R", 0usize), ("G", 1), ("B", 2)] {
            println!("{}       PSNR: {:7.3} dB", name, psnr(coded, orig, chan, 1));
        }
        if num_comps == 4 {
            println!("A       PSNR: {:7.3} dB", psnr(coded, orig, 3, 1));
        }
    }

    let y = psnr(coded, orig, 0, 0);
    if print {
        println!("Y 709   PSNR: {:7.3} dB", y);
    }

    (overall, y)
}

/// Angular-error statistics between two normal maps, in degrees, plus
/// apparently-invalid vector-length counts on both sides.
pub fn angular_stats(orig: &Image, coded: &Image, snorm: bool) -> AngularStats {
    let total = orig.total_pixels() as f64;

    let mut min_deg = f32::INFINITY;
    let mut max_deg = 0.0f32;
    let mut sum = 0.0f64;
    let mut sum2 = 0.0f64;
    let mut invalid_src = 0usize;
    let mut invalid_coded = 0usize;

    for y in 0..orig.height() {
        for x in 0..orig.width() {
            let vo = decode_normal(orig.get(x, y), snorm);
            let vc = decode_normal(coded.get(x, y), snorm);

            let lo = length(vo);
            let lc = length(vc);
            if !(VALID_LEN_MIN..=VALID_LEN_MAX).contains(&lo) {
                invalid_src += 1;
            }
            if !(VALID_LEN_MIN..=VALID_LEN_MAX).contains(&lc) {
                invalid_coded += 1;
            }

            let deg = angular_error_deg(vc, vo, false);
            min_deg = min_deg.min(deg);
            max_deg = max_deg.max(deg);
            sum += deg as f64;
            sum2 += (deg as f64) * (deg as f64);
        }
    }

    let mean = sum / total;
    let variance = (sum2 / total - mean * mean).max(0.0);

    AngularStats {
        min_deg,
        mean_deg: mean as f32,
        std_deg: variance.sqrt() as f32,
        max_deg,
        rms_deg: (sum2 / total).sqrt() as f32,
        invalid_src_len: invalid_src,
        invalid_coded_len: invalid_coded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Rgba;

    fn filled(w: usize, h: usize, p: Rgba) -> Image {
        let mut img = Image::new(w, h, true);
        for y in 0..h {
            for x in 0..w {
                img.set(x, y, p);
            }
        }
        img
    }

    #[test]
    fn test_identical_images_hit_the_cap() {
        let img = filled(8, 8, Rgba::new(12, 200, 9, 255));
        assert_eq!(psnr(&img, &img, 0, 3), 100.0);
        assert_eq!(psnr(&img, &img, 0, 0), 100.0);
    }

    #[test]
    fn test_uniform_error_psnr() {
        let a = filled(4, 4, Rgba::new(100, 100, 100, 255));
        let b = filled(4, 4, Rgba::new(110, 110, 110, 255));
        // rms = 10 -> 20*log10(25.5) ~ 28.13 dB
        let p = psnr(&a, &b, 0, 3);
        assert!((p - 28.13).abs() < 0.05, "psnr {}", p);
    }

    #[test]
    fn test_alpha_only_error_shows_in_rgba_channel() {
        let a = filled(4, 4, Rgba::new(10, 10, 10, 255));
        let b = filled(4, 4, Rgba::new(10, 10, 10, 200));
        assert_eq!(psnr(&a, &b, 0, 3), 100.0);
        assert!(psnr(&a, &b, 0, 4) < 100.0);
        assert!(psnr(&a, &b, 3, 1) < 40.0);
    }

    #[test]
    fn test_angular_stats_identity() {
        let img = filled(6, 6, Rgba::new(128, 128, 255, 255));
        let s = angular_stats(&img, &img, false);
        assert!(s.max_deg < 1e-3);
        assert_eq!(s.invalid_src_len, 0);
        assert_eq!(s.invalid_coded_len, 0);
    }

    #[test]
    fn test_angular_stats_counts_degenerate_lengths() {
        // unorm (128,128,128) decodes to a near-zero vector
        let orig = filled(2, 2, Rgba::new(128, 128, 255, 255));
        let coded = filled(2, 2, Rgba::new(128, 128, 128, 255));
        let s = angular_stats(&orig, &coded, false);
        assert_eq!(s.invalid_src_len, 0);
        assert_eq!(s.invalid_coded_len, 4);
        assert!(s.mean_deg > 10.0);
    }
}
