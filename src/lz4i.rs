//! Rate-distortion optimized encoder for the LZ4-framed raw-pixel
//! container.
//!
//! The parser does not drive an LZ4 tokenizer directly; it chooses the
//! coded byte values themselves so that the downstream block compressor
//! finds long matches. Every byte either stays a literal (lossless) or
//! aliases an earlier coded byte through the match graph; a post-pass
//! replaces each alias class with the rounded average of its members'
//! source bytes before the buffer is handed to the block compressor.

use crate::color::{compute_se, should_reject};
use crate::error::{Error, Result};
use crate::masking::MaskingMap;
use crate::types::{Image, RdoParams, Rgba, SpeedMode};

const LZ4I_MAGIC: [u8; 4] = *b"lz4i";
/// Pixels per parse window.
const WINDOW_PIXELS: usize = 4;
/// Minimum match run, in bytes.
const MIN_MATCH: usize = 4;
/// Length + distance + tag estimate for a fresh match.
const MATCH_BITS: f32 = 24.0;
const LITERAL_BITS: f32 = 8.0;

const BIG_SCORE: f32 = 1e9;

/// Lookback rows and horizontal byte search half-width per speed mode.
fn search_params(speed: SpeedMode) -> (usize, i64) {
    match speed {
        SpeedMode::Uber => (8, 64),
        SpeedMode::Better => (4, 16),
        SpeedMode::Fastest => (2, 8),
    }
}

/// Every composition of `total` into parts of size 1 (literal) or >= 4
/// (match), larger parts first. The all-literal baseline comes out last.
/// 16-byte windows additionally restrict match runs to whole pixels,
/// which keeps the menu near the 12-byte menu's size.
fn build_menu(total: usize, match_step: usize) -> Vec<Vec<u8>> {
    fn rec(remaining: usize, step: usize, current: &mut Vec<u8>, out: &mut Vec<Vec<u8>>) {
        if remaining == 0 {
            out.push(current.clone());
            return;
        }
        for part in (MIN_MATCH..=remaining).rev() {
            if part % step != 0 {
                continue;
            }
            current.push(part as u8);
            rec(remaining - part, step, current, out);
            current.pop();
        }
        current.push(1);
        rec(remaining - 1, step, current, out);
        current.pop();
    }

    let mut out = Vec::new();
    rec(total, match_step, &mut Vec::new(), &mut out);
    out
}

/// The result of an LZ4-container encode. `match_distances[i]` is the byte
/// distance byte `i` aliases, or 0 when `i` is a literal.
pub struct Lz4iEncodeResult {
    pub file: Vec<u8>,
    pub coded: Image,
    pub match_distances: Vec<u32>,
}

struct ByteCtx<'a> {
    orig: &'a Image,
    masking: &'a MaskingMap,
    params: &'a RdoParams,
    num_comps: usize,
    width: usize,
    stride: usize,
    rows_to_check: usize,
    search_dist: i64,
    lambda: f32,
}

impl ByteCtx<'_> {
    #[inline]
    fn pixel_xy(&self, px_idx: usize) -> (usize, usize) {
        (px_idx % self.width, px_idx / self.width)
    }

    /// Assemble the pixel covering window-local bytes, reading decided
    /// bytes from the trial window.
    fn window_pixel(&self, win: &[u8], p0: usize, px_idx: usize) -> Rgba {
        let c = self.num_comps;
        let base = px_idx * c - p0;
        let mut px = Rgba::new(0, 0, 0, 255);
        for ch in 0..c {
            px[ch] = win[base + ch];
        }
        px
    }

    /// Squared error of the window pixels in [first_px, last_px], scaled
    /// inputs from the trial window.
    fn pixel_range_se(&self, win: &[u8], p0: usize, first_px: usize, last_px: usize) -> f32 {
        let mut se = 0.0;
        for px_idx in first_px..=last_px {
            let (x, y) = self.pixel_xy(px_idx);
            let trial = self.window_pixel(win, p0, px_idx);
            se += compute_se(trial, self.orig.get(x, y), self.num_comps, self.params);
        }
        se
    }

    fn pixel_range_scale(&self, first_px: usize, last_px: usize) -> f32 {
        let mut scale = 0.0f32;
        for px_idx in first_px..=last_px {
            let (x, y) = self.pixel_xy(px_idx);
            scale = scale.max(self.masking.get(x, y));
        }
        scale
    }

    fn pixel_range_rejects(&self, win: &[u8], p0: usize, first_px: usize, last_px: usize) -> bool {
        for px_idx in first_px..=last_px {
            let (x, y) = self.pixel_xy(px_idx);
            let trial = self.window_pixel(win, p0, px_idx);
            if should_reject(trial, self.orig.get(x, y), self.num_comps, self.params) {
                return true;
            }
        }
        false
    }

    /// Read an already-decided coded byte: from the trial window when it
    /// falls inside the current window, from the committed plane otherwise.
    #[inline]
    fn decided_byte(&self, coded: &[u8], win: &[u8], p0: usize, j: usize) -> u8 {
        if j >= p0 {
            win[j - p0]
        } else {
            coded[j]
        }
    }

    /// Best source distance for a match run of `len` bytes at absolute
    /// position `p`. Returns (distance, bits, trial bytes).
    fn search_run(
        &self,
        coded: &[u8],
        win: &[u8],
        p0: usize,
        p: usize,
        len: usize,
        prev_trailing: Option<u32>,
    ) -> Option<(u32, f32, Vec<u8>)> {
        let stride = self.stride;
        let y = p / stride;
        let xb = p % stride;

        let first_px = p / self.num_comps;
        let last_px = (p + len - 1) / self.num_comps;
        let scale = self.pixel_range_scale(first_px, last_px);
        let npx = (last_px - first_px + 1) as f32;
        let o = p - p0;

        let mut best_t = BIG_SCORE;
        let mut best: Option<(u32, f32, Vec<u8>)> = None;
        let mut trial_win = win.to_vec();

        let mut visit = |s: i64, yd: usize, this: &Self, best_t: &mut f32, best: &mut Option<(u32, f32, Vec<u8>)>, trial_win: &mut Vec<u8>| {
            let q = (y - yd) as i64 * stride as i64 + s;
            let d = p as i64 - q;
            if d < MIN_MATCH as i64 {
                return;
            }
            let d = d as u32;

            trial_win.copy_from_slice(win);
            for i in 0..len {
                let src = p + i - d as usize;
                trial_win[o + i] = this.decided_byte(coded, win, p0, src);
            }

            let bits = if o == 0 && prev_trailing == Some(d) { 0.0 } else { MATCH_BITS };
            let se = this.pixel_range_se(trial_win, p0, first_px, last_px);
            let t = scale * (se / npx) + bits * this.lambda;
            if t < *best_t && !this.pixel_range_rejects(trial_win, p0, first_px, last_px) {
                *best_t = t;
                *best = Some((d, bits, trial_win[o..o + len].to_vec()));
            }
        };

        for yd in 0..self.rows_to_check {
            if yd > y {
                break;
            }

            let total_passes = if yd == 1 { 2 } else { 1 };
            for pass in 0..total_passes {
                let (s_start, s_end): (i64, i64) = if yd == 0 {
                    if xb < len {
                        continue;
                    }
                    ((xb as i64 - self.search_dist * 2).max(0), (xb - len) as i64)
                } else if yd == 1 && pass == 0 {
                    if stride as i64 <= self.search_dist * 2 {
                        continue;
                    }
                    ((stride as i64 - self.search_dist).max(0), stride as i64 - len as i64)
                } else {
                    (
                        (xb as i64 - self.search_dist).max(0),
                        (xb as i64 + self.search_dist).min(stride as i64 - len as i64),
                    )
                };

                if s_end < s_start {
                    continue;
                }

                let mut s = s_end;
                while s >= s_start {
                    visit(s, yd, self, &mut best_t, &mut best, &mut trial_win);
                    s -= 1;
                }
            }
        }

        best
    }
}

/// Encode the image as an LZ4-framed container under the RD parameters.
pub fn encode(orig: &Image, masking: &MaskingMap, params: &RdoParams) -> Lz4iEncodeResult {
    let width = orig.width();
    let height = orig.height();
    let num_comps = orig.num_comps();
    let stride = width * num_comps;
    let total = stride * height;
    let window_bytes = WINDOW_PIXELS * num_comps;

    let mut orig_bytes = Vec::with_capacity(total);
    for y in 0..height {
        for x in 0..width {
            let p = orig.get(x, y);
            for c in 0..num_comps {
                orig_bytes.push(p[c]);
            }
        }
    }

    // Literals are the source bytes; only matches rewrite them.
    let mut coded_bytes = orig_bytes.clone();
    let mut match_distances = vec![0u32; total];
    let mut future_matches: Vec<Vec<u32>> = vec![Vec::new(); total];

    let (rows_to_check, search_dist) = search_params(params.speed_mode);
    let menu = build_menu(window_bytes, if num_comps == 4 { 4 } else { 1 });

    let ctx = ByteCtx {
        orig,
        masking,
        params,
        num_comps,
        width,
        stride,
        rows_to_check,
        search_dist,
        lambda: params.lambda,
    };

    let mut prev_trailing: Option<u32> = None;

    let mut p0 = 0usize;
    while p0 + window_bytes <= total {
        let first_px = p0 / num_comps;
        let window_scale = ctx.pixel_range_scale(first_px, first_px + WINDOW_PIXELS - 1);

        let mut best_t = BIG_SCORE;
        let mut best_bytes = vec![0u8; window_bytes];
        let mut best_matches: Vec<(usize, usize, u32)> = Vec::new();

        for pattern in &menu {
            let mut win = orig_bytes[p0..p0 + window_bytes].to_vec();
            let mut matches: Vec<(usize, usize, u32)> = Vec::new();
            let mut bits = 0.0f32;
            let mut admissible = true;

            let mut o = 0usize;
            for &run in pattern {
                let len = run as usize;
                if len == 1 {
                    bits += LITERAL_BITS;
                    o += 1;
                    continue;
                }

                match ctx.search_run(&coded_bytes, &win, p0, p0 + o, len, prev_trailing) {
                    Some((d, run_bits, run_bytes)) => {
                        win[o..o + len].copy_from_slice(&run_bytes);
                        matches.push((o, len, d));
                        bits += run_bits;
                        o += len;
                    }
                    None => {
                        admissible = false;
                        break;
                    }
                }
            }

            if !admissible {
                continue;
            }
            debug_assert_eq!(o, window_bytes);

            if ctx.pixel_range_rejects(&win, p0, first_px, first_px + WINDOW_PIXELS - 1) {
                continue;
            }

            let se = ctx.pixel_range_se(&win, p0, first_px, first_px + WINDOW_PIXELS - 1);
            let t = window_scale * (se / WINDOW_PIXELS as f32) + bits * params.lambda;
            if t < best_t {
                best_t = t;
                best_bytes.copy_from_slice(&win);
                best_matches = matches;

                if se == 0.0 {
                    break;
                }
            }
        }

        debug_assert!(best_t < BIG_SCORE);

        coded_bytes[p0..p0 + window_bytes].copy_from_slice(&best_bytes);
        prev_trailing = None;
        for &(o, len, d) in &best_matches {
            for i in 0..len {
                let at = p0 + o + i;
                match_distances[at] = d;
                future_matches[at - d as usize].push(at as u32);
            }
            if o + len == window_bytes {
                prev_trailing = Some(d);
            }
        }

        p0 += window_bytes;
    }

    refine(&mut coded_bytes, &orig_bytes, &match_distances, &future_matches);

    let payload = lz4_flex::block::compress(&coded_bytes);
    let mut file = Vec::with_capacity(14 + payload.len());
    file.extend_from_slice(&LZ4I_MAGIC);
    file.extend_from_slice(&(width as u32).to_be_bytes());
    file.extend_from_slice(&(height as u32).to_be_bytes());
    file.push(num_comps as u8);
    file.push(0); // sRGB colorspace
    file.extend_from_slice(&payload);

    let mut coded = Image::new(width, height, orig.has_alpha());
    for y in 0..height {
        for x in 0..width {
            let base = (y * width + x) * num_comps;
            let mut px = Rgba::new(0, 0, 0, 255);
            for c in 0..num_comps {
                px[c] = coded_bytes[base + c];
            }
            coded.set(x, y, px);
        }
    }

    Lz4iEncodeResult { file, coded, match_distances }
}

/// Alias-class refinement: every connected component of the match graph
/// must decode to one value, so replace each class with the rounded
/// average of its members' source bytes. Pure post-process; the aliasing
/// invariant cannot break because the whole class gets the same byte.
fn refine(coded: &mut [u8], orig: &[u8], dists: &[u32], future: &[Vec<u32>]) {
    let mut visited = vec![false; coded.len()];
    let mut stack: Vec<usize> = Vec::new();
    let mut class: Vec<usize> = Vec::new();

    for i in 0..coded.len() {
        if visited[i] || (dists[i] == 0 && future[i].is_empty()) {
            continue;
        }

        class.clear();
        stack.push(i);
        visited[i] = true;
        while let Some(j) = stack.pop() {
            class.push(j);
            if dists[j] != 0 {
                let k = j - dists[j] as usize;
                if !visited[k] {
                    visited[k] = true;
                    stack.push(k);
                }
            }
            for &f in &future[j] {
                let f = f as usize;
                if !visited[f] {
                    visited[f] = true;
                    stack.push(f);
                }
            }
        }

        if class.len() < 2 {
            continue;
        }

        let sum: u64 = class.iter().map(|&j| orig[j] as u64).sum();
        let avg = ((sum + class.len() as u64 / 2) / class.len() as u64) as u8;
        for &j in &class {
            coded[j] = avg;
        }
    }
}

/// Decode an LZ4-framed container. 3-channel payloads come back with
/// alpha forced to 255.
pub fn decode(data: &[u8]) -> Result<Image> {
    if data.len() < 14 || data[..4] != LZ4I_MAGIC {
        return Err(Error::InvalidContainer { format: "lz4i", reason: "bad signature" });
    }

    let width = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
    let height = u32::from_be_bytes([data[8], data[9], data[10], data[11]]) as usize;
    let channels = data[12] as usize;
    if !(channels == 3 || channels == 4) {
        return Err(Error::InvalidContainer { format: "lz4i", reason: "bad channel count" });
    }

    let expected = width * height * channels;
    let raw = lz4_flex::block::decompress(&data[14..], expected)
        .map_err(|e| Error::Lz4Decode(e.to_string()))?;
    if raw.len() != expected {
        return Err(Error::InvalidContainer { format: "lz4i", reason: "payload size mismatch" });
    }

    let mut img = Image::new(width, height, channels == 4);
    for y in 0..height {
        for x in 0..width {
            let base = (y * width + x) * channels;
            let px = if channels == 4 {
                Rgba::new(raw[base], raw[base + 1], raw[base + 2], raw[base + 3])
            } else {
                Rgba::new(raw[base], raw[base + 1], raw[base + 2], 255)
            };
            img.set(x, y, px);
        }
    }

    Ok(img)
}
