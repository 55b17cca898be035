//! Rate-distortion optimized encoder for the fixed-opcode byte-stream
//! container (QOI), plus a small independent decoder used by the unpack
//! path and the equivalence tests.
//!
//! Every pixel enumerates all six opcodes and keeps the one minimizing
//! `mse_scale * D + bits * lambda`. Candidate families are tried cheapest
//! first; a family whose minimum bit cost already exceeds the best score
//! so far skips its lossy search entirely.

use crate::color::{compute_se, should_reject};
use crate::error::{Error, Result};
use crate::masking::MaskingMap;
use crate::types::{Image, RdoParams, Rgba, SpeedMode};

const QOI_MAGIC: [u8; 4] = *b"qoif";
const QOI_OP_INDEX: u8 = 0x00;
const QOI_OP_DIFF: u8 = 0x40;
const QOI_OP_LUMA: u8 = 0x80;
const QOI_OP_RUN: u8 = 0xc0;
const QOI_OP_RGB: u8 = 0xfe;
const QOI_OP_RGBA: u8 = 0xff;

/// Run lengths 63 and 64 collide with the RGB/RGBA tags.
const MAX_RUN: u32 = 62;

#[inline]
fn hash(p: Rgba) -> usize {
    (p.r() as usize * 3 + p.g() as usize * 5 + p.b() as usize * 7 + p.a() as usize * 11) % 64
}

#[inline]
fn wrapping_delta(a: u8, b: u8) -> i8 {
    a.wrapping_sub(b) as i8
}

#[derive(Clone, Copy)]
enum OpKind {
    Run,
    Index(u8),
    Diff(u8),
    Luma(u8, u8),
    Rgb,
    Rgba,
}

#[derive(Clone, Copy)]
struct Candidate {
    kind: OpKind,
    color: Rgba,
    t: f32,
}

struct EncoderState {
    prev: Rgba,
    index: [Rgba; 64],
    run: u32,
    out: Vec<u8>,
}

impl EncoderState {
    fn new() -> Self {
        Self {
            prev: Rgba::new(0, 0, 0, 255),
            index: [Rgba::new(0, 0, 0, 0); 64],
            run: 0,
            out: Vec::new(),
        }
    }

    fn flush_run(&mut self) {
        if self.run > 0 {
            self.out.push(QOI_OP_RUN | (self.run - 1) as u8);
            self.run = 0;
        }
    }

    fn emit(&mut self, c: Candidate) {
        match c.kind {
            OpKind::Run => {
                self.run += 1;
                if self.run == MAX_RUN {
                    self.flush_run();
                }
                return;
            }
            OpKind::Index(k) => {
                self.flush_run();
                self.out.push(QOI_OP_INDEX | k);
            }
            OpKind::Diff(byte) => {
                self.flush_run();
                self.out.push(byte);
            }
            OpKind::Luma(b0, b1) => {
                self.flush_run();
                self.out.push(b0);
                self.out.push(b1);
            }
            OpKind::Rgb => {
                self.flush_run();
                self.out.push(QOI_OP_RGB);
                self.out.push(c.color.r());
                self.out.push(c.color.g());
                self.out.push(c.color.b());
            }
            OpKind::Rgba => {
                self.flush_run();
                self.out.push(QOI_OP_RGBA);
                self.out.push(c.color.r());
                self.out.push(c.color.g());
                self.out.push(c.color.b());
                self.out.push(c.color.a());
            }
        }

        self.index[hash(c.color)] = c.color;
        self.prev = c.color;
    }
}

#[inline]
fn diff_byte(dr: i8, dg: i8, db: i8) -> u8 {
    QOI_OP_DIFF | ((dr + 2) as u8) << 4 | ((dg + 2) as u8) << 2 | (db + 2) as u8
}

#[inline]
fn luma_bytes(dg: i8, dr_dg: i8, db_dg: i8) -> (u8, u8) {
    (QOI_OP_LUMA | (dg + 32) as u8, ((dr_dg + 8) as u8) << 4 | (db_dg + 8) as u8)
}

#[inline]
fn apply_diff(prev: Rgba, dr: i8, dg: i8, db: i8) -> Rgba {
    Rgba::new(
        prev.r().wrapping_add(dr as u8),
        prev.g().wrapping_add(dg as u8),
        prev.b().wrapping_add(db as u8),
        prev.a(),
    )
}

/// The result of a fixed-opcode container encode.
pub struct QoiEncodeResult {
    pub file: Vec<u8>,
    pub coded: Image,
}

struct PixelChooser<'a> {
    params: &'a RdoParams,
    num_comps: usize,
    lambda: f32,
    speed: SpeedMode,
}

impl PixelChooser<'_> {
    fn consider(&self, best: &mut Option<Candidate>, kind: OpKind, color: Rgba, bits: f32, orig: Rgba, scale: f32) {
        let se = compute_se(color, orig, self.num_comps, self.params);
        let t = scale * se + bits * self.lambda;
        if best.map_or(true, |b| t < b.t) {
            *best = Some(Candidate { kind, color, t });
        }
    }

    /// Pick the opcode for one pixel given the running state.
    fn choose(&self, orig: Rgba, st: &EncoderState, scale: f32) -> Candidate {
        let num_comps = self.num_comps;
        let params = self.params;
        let mut best: Option<Candidate> = None;

        // RUN: repeat the previous pixel. Free while a run is open.
        let run_bits = if st.run > 0 { 0.0 } else { 8.0 };
        if !should_reject(st.prev, orig, num_comps, params) {
            self.consider(&mut best, OpKind::Run, st.prev, run_bits, orig, scale);
        }

        // INDEX: the lossless slot first, then the full table.
        let slot = hash(orig);
        if st.index[slot] == orig {
            self.consider(&mut best, OpKind::Index(slot as u8), orig, 8.0, orig, scale);
        }
        if best.map_or(true, |b| 8.0 * self.lambda < b.t) {
            for k in 0..64 {
                let cand = st.index[k];
                if should_reject(cand, orig, num_comps, params) {
                    continue;
                }
                self.consider(&mut best, OpKind::Index(k as u8), cand, 8.0, orig, scale);
            }
        }

        // DIFF: per-channel [-2, 1] around prev, alpha carried over.
        let dr = wrapping_delta(orig.r(), st.prev.r());
        let dg = wrapping_delta(orig.g(), st.prev.g());
        let db = wrapping_delta(orig.b(), st.prev.b());
        let alpha_same = orig.a() == st.prev.a();

        let in_diff = |v: i8| (-2..=1).contains(&v);
        if alpha_same && in_diff(dr) && in_diff(dg) && in_diff(db) {
            self.consider(&mut best, OpKind::Diff(diff_byte(dr, dg, db)), orig, 8.0, orig, scale);
        } else if best.map_or(true, |b| 8.0 * self.lambda < b.t) {
            for cr in -2i8..=1 {
                for cg in -2i8..=1 {
                    for cb in -2i8..=1 {
                        let cand = apply_diff(st.prev, cr, cg, cb);
                        if should_reject(cand, orig, num_comps, params) {
                            continue;
                        }
                        self.consider(&mut best, OpKind::Diff(diff_byte(cr, cg, cb)), cand, 8.0, orig, scale);
                    }
                }
            }
        }

        // LUMA: green delta plus red/blue deltas relative to green.
        let dr_dg = dr.wrapping_sub(dg);
        let db_dg = db.wrapping_sub(dg);
        let luma_lossless = alpha_same
            && (-32..=31).contains(&dg)
            && (-8..=7).contains(&dr_dg)
            && (-8..=7).contains(&db_dg);
        if luma_lossless {
            let (b0, b1) = luma_bytes(dg, dr_dg, db_dg);
            self.consider(&mut best, OpKind::Luma(b0, b1), orig, 16.0, orig, scale);
        } else if self.speed != SpeedMode::Fastest
            && best.map_or(true, |b| 16.0 * self.lambda < b.t)
        {
            let dg_range: Vec<i8> = match self.speed {
                SpeedMode::Uber => (-32i8..=31).collect(),
                _ => (-11i8..=11).collect(),
            };
            for cdg in dg_range {
                for cdr in -8i8..=7 {
                    for cdb in -8i8..=7 {
                        let cand = apply_diff(
                            st.prev,
                            cdg.wrapping_add(cdr),
                            cdg,
                            cdg.wrapping_add(cdb),
                        );
                        if should_reject(cand, orig, num_comps, params) {
                            continue;
                        }
                        let (b0, b1) = luma_bytes(cdg, cdr, cdb);
                        self.consider(&mut best, OpKind::Luma(b0, b1), cand, 16.0, orig, scale);
                    }
                }
            }
        }

        // RGB keeps the previous alpha; RGBA is the always-lossless floor.
        let rgb_color = Rgba::new(orig.r(), orig.g(), orig.b(), st.prev.a());
        if num_comps == 3 || !should_reject(rgb_color, orig, num_comps, params) {
            self.consider(&mut best, OpKind::Rgb, rgb_color, 32.0, orig, scale);
        }
        if num_comps == 4 {
            self.consider(&mut best, OpKind::Rgba, orig, 40.0, orig, scale);
        }

        best.expect("at least the literal opcode is always admissible")
    }
}

/// Encode the image as a QOI stream under the RD parameters.
pub fn encode(orig: &Image, masking: &MaskingMap, params: &RdoParams) -> QoiEncodeResult {
    let width = orig.width();
    let height = orig.height();
    let num_comps = orig.num_comps();

    let chooser = PixelChooser {
        params,
        num_comps,
        lambda: params.lambda,
        speed: params.speed_mode,
    };

    let mut st = EncoderState::new();
    st.out.reserve(14 + width * height + 8);
    st.out.extend_from_slice(&QOI_MAGIC);
    st.out.extend_from_slice(&(width as u32).to_be_bytes());
    st.out.extend_from_slice(&(height as u32).to_be_bytes());
    st.out.push(num_comps as u8);
    st.out.push(0); // sRGB with linear alpha

    let mut coded = Image::new(width, height, orig.has_alpha());

    for y in 0..height {
        for x in 0..width {
            let px = orig.get(x, y);
            let best = chooser.choose(px, &st, masking.get(x, y));
            st.emit(best);

            // The decoder forces alpha opaque on 3-channel output even
            // when its internal running state carries another value.
            let mut stored = best.color;
            if num_comps == 3 {
                stored[3] = 255;
            }
            coded.set(x, y, stored);
        }
    }

    st.flush_run();
    st.out.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 1]);

    QoiEncodeResult { file: st.out, coded }
}

/// Decode a QOI stream. 3-channel files come back with alpha forced to 255.
pub fn decode(data: &[u8]) -> Result<Image> {
    if data.len() < 22 || data[..4] != QOI_MAGIC {
        return Err(Error::InvalidContainer { format: "qoi", reason: "bad signature" });
    }

    let width = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
    let height = u32::from_be_bytes([data[8], data[9], data[10], data[11]]) as usize;
    let channels = data[12];
    if !(channels == 3 || channels == 4) {
        return Err(Error::InvalidContainer { format: "qoi", reason: "bad channel count" });
    }

    let mut img = Image::new(width, height, channels == 4);
    let mut prev = Rgba::new(0, 0, 0, 255);
    let mut index = [Rgba::new(0, 0, 0, 0); 64];

    let mut pos = 14;
    let mut px_idx = 0usize;
    let total = width * height;

    while px_idx < total {
        if pos >= data.len() {
            return Err(Error::InvalidContainer { format: "qoi", reason: "truncated stream" });
        }
        let b = data[pos];
        pos += 1;

        let truncated = Error::InvalidContainer { format: "qoi", reason: "truncated stream" };

        let mut run = 1usize;
        let px = match b {
            QOI_OP_RGB => {
                if pos + 3 > data.len() {
                    return Err(truncated);
                }
                let px = Rgba::new(data[pos], data[pos + 1], data[pos + 2], prev.a());
                pos += 3;
                px
            }
            QOI_OP_RGBA => {
                if pos + 4 > data.len() {
                    return Err(truncated);
                }
                let px = Rgba::new(data[pos], data[pos + 1], data[pos + 2], data[pos + 3]);
                pos += 4;
                px
            }
            _ => match b & 0xc0 {
                QOI_OP_INDEX => index[(b & 0x3f) as usize],
                QOI_OP_DIFF => apply_diff(
                    prev,
                    ((b >> 4) & 3) as i8 - 2,
                    ((b >> 2) & 3) as i8 - 2,
                    (b & 3) as i8 - 2,
                ),
                QOI_OP_LUMA => {
                    if pos >= data.len() {
                        return Err(truncated);
                    }
                    let dg = (b & 0x3f) as i8 - 32;
                    let b1 = data[pos];
                    pos += 1;
                    let dr = dg.wrapping_add(((b1 >> 4) & 0x0f) as i8 - 8);
                    let db = dg.wrapping_add((b1 & 0x0f) as i8 - 8);
                    apply_diff(prev, dr, dg, db)
                }
                _ => {
                    run = (b & 0x3f) as usize + 1;
                    prev
                }
            },
        };

        for _ in 0..run {
            if px_idx >= total {
                return Err(Error::InvalidContainer { format: "qoi", reason: "run overflows image" });
            }
            let x = px_idx % width;
            let y = px_idx / width;
            img.set(x, y, if channels == 3 { Rgba::new(px.r(), px.g(), px.b(), 255) } else { px });
            px_idx += 1;
        }

        index[hash(px)] = px;
        prev = px;
    }

    Ok(img)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masking::build_masking_map;
    use crate::types::ErrorMetric;

    fn linear_params(lambda: f32) -> RdoParams {
        RdoParams {
            lambda,
            format: crate::types::OutputFormat::Qoi,
            metric: ErrorMetric::Linear,
            ..Default::default()
        }
    }

    fn encode_pixels(pixels: &[Rgba], width: usize, height: usize, params: &RdoParams) -> QoiEncodeResult {
        let mut img = Image::new(width, height, true);
        for (i, &p) in pixels.iter().enumerate() {
            img.set(i % width, i / width, p);
        }
        let masking = build_masking_map(&img, params);
        encode(&img, &masking, params)
    }

    #[test]
    fn test_hash_function() {
        assert_eq!(hash(Rgba::new(0, 0, 0, 0)), 0);
        assert_eq!(hash(Rgba::new(1, 0, 0, 0)), 3);
        assert_eq!(hash(Rgba::new(0, 0, 0, 255)), (255 * 11) % 64);
    }

    #[test]
    fn test_terminator_and_header() {
        let result = encode_pixels(&[Rgba::new(9, 9, 9, 255)], 1, 1, &linear_params(0.0));
        assert_eq!(&result.file[..4], b"qoif");
        assert_eq!(&result.file[4..8], &1u32.to_be_bytes());
        assert_eq!(&result.file[8..12], &1u32.to_be_bytes());
        assert_eq!(result.file[12], 4);
        assert_eq!(&result.file[result.file.len() - 8..], &[0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_lossless_at_lambda_zero() {
        let pixels = [
            Rgba::new(0, 0, 0, 255),
            Rgba::new(255, 255, 255, 255),
            Rgba::new(0, 0, 0, 255),
            Rgba::new(255, 255, 255, 255),
        ];
        let result = encode_pixels(&pixels, 4, 1, &linear_params(0.0));

        let decoded = decode(&result.file).unwrap();
        for (i, &p) in pixels.iter().enumerate() {
            assert_eq!(decoded.get(i, 0), p, "pixel {}", i);
            assert_eq!(result.coded.get(i, 0), p, "coded {}", i);
        }
    }

    #[test]
    fn test_small_deltas_use_one_byte_ops() {
        // +1 steps fit DIFF; the repeat of the first color comes back via
        // INDEX or RUN. Nothing here needs an RGB literal after the first.
        let pixels = [
            Rgba::new(10, 20, 30, 255),
            Rgba::new(11, 21, 31, 255),
            Rgba::new(10, 20, 30, 255),
            Rgba::new(11, 21, 31, 255),
        ];
        let result = encode_pixels(&pixels, 4, 1, &linear_params(0.0));
        let decoded = decode(&result.file).unwrap();
        for (i, &p) in pixels.iter().enumerate() {
            assert_eq!(decoded.get(i, 0), p, "pixel {}", i);
        }

        // Header 14 + first pixel RGB (4) + three 1-byte ops + terminator 8
        assert_eq!(result.file.len(), 14 + 4 + 3 + 8);
    }

    #[test]
    fn test_plus_two_delta_encodes_as_luma() {
        // A +2 per-channel step is outside the DIFF window but inside LUMA's.
        let pixels = [Rgba::new(10, 20, 30, 255), Rgba::new(12, 22, 32, 255)];
        let result = encode_pixels(&pixels, 2, 1, &linear_params(0.0));
        let decoded = decode(&result.file).unwrap();
        assert_eq!(decoded.get(1, 0), pixels[1]);

        // Header + RGB(4) + LUMA(2) + terminator
        assert_eq!(result.file.len(), 14 + 4 + 2 + 8);
        let luma_byte = result.file[14 + 4];
        assert_eq!(luma_byte & 0xc0, QOI_OP_LUMA);
    }

    #[test]
    fn test_runs_flush_at_62() {
        let pixels = vec![Rgba::new(77, 77, 77, 255); 200];
        let result = encode_pixels(&pixels, 200, 1, &linear_params(0.0));
        let decoded = decode(&result.file).unwrap();
        for x in 0..200 {
            assert_eq!(decoded.get(x, 0), pixels[x]);
        }

        // Every RUN opcode in the stream respects the 62 cap
        for &b in &result.file[14..result.file.len() - 8] {
            if b & 0xc0 == QOI_OP_RUN && b != QOI_OP_RGB && b != QOI_OP_RGBA {
                assert!((b & 0x3f) + 1 <= 62);
            }
        }
    }

    #[test]
    fn test_decoder_matches_coded_plane_lossy() {
        // A gradient under heavy lambda: output is lossy but the stream
        // must still decode to exactly the encoder's coded plane.
        let mut pixels = Vec::new();
        for i in 0..64 {
            pixels.push(Rgba::new((i * 4) as u8, (i * 2) as u8, 100, 255));
        }
        let params = linear_params(2000.0);
        let result = encode_pixels(&pixels, 8, 8, &params);
        let decoded = decode(&result.file).unwrap();

        for y in 0..8 {
            for x in 0..8 {
                assert_eq!(decoded.get(x, y), result.coded.get(x, y), "({}, {})", x, y);
            }
        }
    }

    #[test]
    fn test_reject_respected_under_lambda() {
        let mut pixels = Vec::new();
        for i in 0..32 {
            pixels.push(Rgba::new((i * 8) as u8, 128, (255 - i * 8) as u8, 255));
        }
        let mut params = linear_params(5000.0);
        params.reject_thresholds = [6, 6, 6, 6];
        let result = encode_pixels(&pixels, 32, 1, &params);

        for (i, &p) in pixels.iter().enumerate() {
            assert!(!should_reject(result.coded.get(i, 0), p, 4, &params), "pixel {}", i);
        }
    }
}
