//! Scanline predictors over the (left, above, upper-left) neighborhood.
//!
//! The forward direction produces the delta byte the container stores; the
//! inverse reconstructs the coded pixel the decoder will see. Out-of-image
//! neighbors read as the clear color, matching the parse planes' edges.

use crate::consts::{FILTER_AVG, FILTER_PAETH, FILTER_SUB, FILTER_UP};
use crate::types::{Image, Rgba};

/// Paeth predictor: whichever of a, b, c is closest to a + b - c, ties
/// broken in the order a, b, c.
#[inline]
pub fn paeth(a: i32, b: i32, c: i32) -> u8 {
    let p = a + b - c;
    let pa = (p - a).abs();
    let pb = (p - b).abs();
    let pc = (p - c).abs();

    if pa <= pb && pa <= pc {
        a as u8
    } else if pb <= pc {
        b as u8
    } else {
        c as u8
    }
}

#[inline]
fn avg(a: i32, b: i32) -> u8 {
    ((a + b) / 2) as u8
}

// c b
// a x
#[inline]
fn neighborhood(coded: &Image, x: usize, y: usize) -> (Rgba, Rgba, Rgba) {
    let ca = if x > 0 { coded.get(x - 1, y) } else { Rgba::BLACK };
    let cb = if y > 0 { coded.get(x, y - 1) } else { Rgba::BLACK };
    let cc = if x > 0 && y > 0 { coded.get(x - 1, y - 1) } else { Rgba::BLACK };
    (ca, cb, cc)
}

#[inline]
fn predicted(filter: u8, pa: i32, pb: i32, pc: i32) -> u8 {
    match filter {
        FILTER_PAETH => paeth(pa, pb, pc),
        FILTER_AVG => avg(pa, pb),
        FILTER_UP => pb as u8,
        _ => {
            debug_assert_eq!(filter, FILTER_SUB);
            pa as u8
        }
    }
}

/// Filter-forward: delta byte per channel for `p` at (x, y) given the coded
/// plane to its left and above.
#[inline]
pub fn predict_forward(
    p: Rgba,
    x: usize,
    y: usize,
    coded: &Image,
    filter: u8,
    num_comps: usize,
) -> Rgba {
    let (ca, cb, cc) = neighborhood(coded, x, y);

    let mut res = Rgba::default();
    for c in 0..num_comps {
        let d = predicted(filter, ca[c] as i32, cb[c] as i32, cc[c] as i32);
        res[c] = p[c].wrapping_sub(d);
    }
    if num_comps == 3 {
        res[3] = 255;
    }
    res
}

/// Filter-inverse: the coded pixel a decoder reconstructs from `delta`.
#[inline]
pub fn predict_inverse(
    delta: Rgba,
    x: usize,
    y: usize,
    coded: &Image,
    filter: u8,
    num_comps: usize,
) -> Rgba {
    let (ca, cb, cc) = neighborhood(coded, x, y);

    let mut res = Rgba::default();
    for c in 0..num_comps {
        let d = predicted(filter, ca[c] as i32, cb[c] as i32, cc[c] as i32);
        res[c] = delta[c].wrapping_add(d);
    }
    if num_comps == 3 {
        res[3] = 255;
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paeth_tie_break_order() {
        // All equal: every distance 0, a wins the tie
        assert_eq!(paeth(7, 7, 7), 7);
        // pa == pb, pc smallest: c wins
        assert_eq!(paeth(10, 20, 15), 15);
        // pb == 0: b wins over a
        assert_eq!(paeth(10, 20, 10), 20);
        // pa == pb == 10, pc largest: a wins the a/b tie
        assert_eq!(paeth(10, 10, 0), 10);
    }

    #[test]
    fn test_forward_inverse_roundtrip_all_filters() {
        let mut coded = Image::new(4, 3, true);
        let mut v = 13u8;
        for y in 0..3 {
            for x in 0..4 {
                v = v.wrapping_mul(31).wrapping_add(17);
                coded.set(x, y, Rgba::new(v, v.wrapping_add(40), v.wrapping_mul(3), v ^ 0x5a));
            }
        }

        let p = Rgba::new(200, 100, 50, 255);
        for filter in [FILTER_SUB, FILTER_UP, FILTER_AVG, FILTER_PAETH] {
            for (x, y) in [(0usize, 0usize), (1, 0), (0, 1), (2, 2), (3, 1)] {
                let d = predict_forward(p, x, y, &coded, filter, 4);
                let r = predict_inverse(d, x, y, &coded, filter, 4);
                assert_eq!(r, p, "filter {} at ({}, {})", filter, x, y);
            }
        }
    }

    #[test]
    fn test_three_channel_forces_opaque_alpha() {
        let coded = Image::new(2, 2, false);
        let d = predict_forward(Rgba::new(9, 8, 7, 123), 1, 1, &coded, FILTER_AVG, 3);
        assert_eq!(d.a(), 255);
        let r = predict_inverse(Rgba::new(1, 2, 3, 200), 1, 1, &coded, FILTER_AVG, 3);
        assert_eq!(r.a(), 255);
    }

    #[test]
    fn test_edge_neighbors_read_clear_color() {
        let mut coded = Image::new(2, 2, true);
        coded.set(0, 0, Rgba::new(50, 50, 50, 50));

        // At (0, 0) the left neighbor is the clear color (opaque black),
        // so Sub subtracts 0 from RGB and 255 from alpha.
        let d = predict_forward(Rgba::new(10, 20, 30, 255), 0, 0, &coded, FILTER_SUB, 4);
        assert_eq!(d, Rgba::new(10, 20, 30, 0));
    }
}
