//! Rate-distortion optimized scanline parser for the DEFLATE-based
//! container.
//!
//! Scanlines are parsed top to bottom; within a scanline, fixed-width
//! windows are parsed left to right. Each window tries every cover pattern
//! in the level's menu, pricing literal runs through per-pixel candidate
//! search and longer runs through LZ match search, and keeps the pattern
//! with the lowest `mse_scale * mse + bits * lambda`. The per-row filter
//! is then chosen by lowest total squared error across the whole row.

use std::collections::HashMap;

use crate::color::{compute_se, should_reject};
use crate::consts::{MatchOrder, RdoLevel, FILTER_AVG, LEVELS, MAX_DELTA_PIXELS, SKIP_FILTER};
use crate::deflate;
use crate::entropy::{CodeCosts, FrequencyObserver};
use crate::filters::{predict_forward, predict_inverse};
use crate::masking::MaskingMap;
use crate::types::{Image, RdoParams, Rgba};

const BIG_SCORE: f32 = 1e9;

/// Byte offset between two pixel positions in the filtered stream,
/// including the one filter-tag byte that leads every row. The tag byte is
/// load-bearing: the downstream stream really does carry it, so match
/// distances must account for it.
#[inline]
fn match_dist(xa: usize, ya: usize, xb: usize, yb: usize, width: usize, num_comps: usize) -> usize {
    let stride = width * num_comps + 1;
    (xa * num_comps + ya * stride) - (xb * num_comps + yb * stride)
}

/// Memoization key: a window x-offset plus the delta pixels committed
/// before the sub-problem. Only the first `x_ofs` slots participate in
/// equality and hashing.
#[derive(Clone, Copy, Debug)]
struct MemoKey {
    x_ofs: usize,
    prev: [Rgba; MAX_DELTA_PIXELS],
}

impl PartialEq for MemoKey {
    fn eq(&self, rhs: &Self) -> bool {
        self.x_ofs == rhs.x_ofs && self.prev[..self.x_ofs] == rhs.prev[..rhs.x_ofs]
    }
}

impl Eq for MemoKey {}

impl std::hash::Hash for MemoKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.x_ofs.hash(state);
        self.prev[..self.x_ofs].hash(state);
    }
}

#[derive(Clone, Copy)]
struct MemoValue {
    deltas: [Rgba; MAX_DELTA_PIXELS],
    bits: f32,
    se: f32,
    t: f32,
}

/// One memo map per sub-problem length, reset at every window evaluation.
struct SubCache {
    maps: Vec<HashMap<MemoKey, MemoValue>>,
}

impl SubCache {
    fn new() -> Self {
        Self { maps: (0..MAX_DELTA_PIXELS).map(|_| HashMap::with_capacity(8)).collect() }
    }

    fn reset(&mut self) {
        for m in &mut self.maps {
            m.clear();
        }
    }
}

struct Planes {
    delta: Image,
    coded: Image,
}

#[derive(Clone, Copy)]
struct LiteralBest {
    delta: Rgba,
    bits: f32,
    se: f32,
    t: f32,
    kind: u32,
}

#[derive(Clone, Copy)]
struct RunBest {
    deltas: [Rgba; MAX_DELTA_PIXELS],
    bits: f32,
    se: f32,
    t: f32,
}

#[derive(Clone, Copy)]
struct WindowBest {
    bits: f32,
    se: f32,
    t: f32,
    pattern: usize,
}

/// Per-pass debug tallies.
#[derive(Clone)]
struct ParseStats {
    filter_hist: [u32; 5],
    match_len_hist: [u32; MAX_DELTA_PIXELS + 1],
    /// Remainder-pixel literal kinds: true delta, shrunk delta, delta copy.
    lit_kind_hist: [u32; 3],
    pattern_hist_a: Vec<u32>,
    pattern_hist_b: Vec<u32>,
    windows_a: u64,
    windows_b: u64,
}

impl ParseStats {
    fn new(level: &RdoLevel) -> Self {
        Self {
            filter_hist: [0; 5],
            match_len_hist: [0; MAX_DELTA_PIXELS + 1],
            lit_kind_hist: [0; 3],
            pattern_hist_a: vec![0; level.menu.len()],
            pattern_hist_b: vec![0; level.double_menu.len()],
            windows_a: 0,
            windows_b: 0,
        }
    }
}

/// Enumerate candidate source positions for an n-pixel copy ending the
/// same way the container's window limits allow, nearest columns first.
fn for_each_source<F: FnMut(usize, usize)>(
    level: &RdoLevel,
    width: usize,
    x: usize,
    y: usize,
    n: usize,
    mut visit: F,
) {
    for yd in 0..level.scanlines_to_check as usize {
        if yd > y {
            break;
        }

        let total_passes = if yd == 1 && !level.exhaustive { 2 } else { 1 };
        for pass in 0..total_passes {
            let (x_start, x_end): (i64, i64) = if level.exhaustive {
                let end = if yd > 0 { width as i64 - n as i64 } else { x as i64 - n as i64 };
                (0, end)
            } else if yd == 0 {
                if x < n {
                    continue;
                }
                (
                    (x as i64 - level.search_dist as i64 * 2).max(0),
                    (x as i64 - n as i64).max(0),
                )
            } else if yd == 1 && pass == 0 {
                if width <= level.search_dist as usize * 2 {
                    continue;
                }
                ((width as i64 - level.search_dist as i64).max(0), width as i64 - n as i64)
            } else {
                (
                    (x as i64 - level.search_dist as i64).max(0),
                    (x as i64 + level.search_dist as i64).min(width as i64 - n as i64),
                )
            };

            if x_end < x_start {
                continue;
            }

            let mut xd = x_end;
            while xd >= x_start {
                visit(xd as usize, yd);
                xd -= 1;
            }
        }
    }
}

struct ParseCtx<'a> {
    orig: &'a Image,
    masking: &'a MaskingMap,
    params: &'a RdoParams,
    level: &'static RdoLevel,
    costs: &'a CodeCosts,
    lambda: f32,
    width: usize,
    num_comps: usize,
}

impl ParseCtx<'_> {
    /// Best single delta pixel at (x, y) under `filter`: the true delta,
    /// shrink-toward-zero variants, or a copy of an earlier delta pixel.
    fn find_optimal1(&self, x: usize, y: usize, filter: u8, planes: &Planes) -> LiteralBest {
        let num_comps = self.num_comps;
        let orig_color = self.orig.get(x, y);
        let orig_delta = predict_forward(orig_color, x, y, &planes.coded, filter, num_comps);

        let mut best = LiteralBest {
            delta: orig_delta,
            bits: self.costs.pixel_cost(orig_delta, num_comps),
            se: 0.0,
            t: 0.0,
            kind: 0,
        };
        best.t = best.bits * self.lambda;

        let scale = self.masking.get(x, y);

        if !self.params.match_only {
            let mut all_zero = orig_delta.r() == 0 && orig_delta.g() == 0 && orig_delta.b() == 0;
            if num_comps == 4 && orig_delta.a() != 0 {
                all_zero = false;
            }

            if !all_zero {
                let subsets = if num_comps == 4 { 16u32 } else { 8 };
                for subset in 1..subsets {
                    let mut delta = orig_delta;
                    for c in 0..num_comps {
                        if subset & (1 << c) != 0 {
                            let v = delta[c] as i8;
                            if v < 0 {
                                delta[c] = delta[c].wrapping_add(1);
                            } else if v > 0 {
                                delta[c] = delta[c].wrapping_sub(1);
                            }
                        }
                    }

                    let trial = predict_inverse(delta, x, y, &planes.coded, filter, num_comps);
                    if should_reject(trial, orig_color, num_comps, self.params) {
                        continue;
                    }

                    let se = compute_se(trial, orig_color, num_comps, self.params);
                    let bits = self.costs.pixel_cost(delta, num_comps);
                    let t = scale * se + bits * self.lambda;
                    if t < best.t {
                        best = LiteralBest { delta, bits, se, t, kind: 1 };
                    }
                }
            }
        }

        for_each_source(self.level, self.width, x, y, 1, |xd, yd| {
            let dist = match_dist(x, y, xd, y - yd, self.width, num_comps);
            debug_assert!(dist >= 3);
            if dist > 32768 {
                return;
            }

            let delta = planes.delta.get(xd, y - yd);
            let trial = predict_inverse(delta, x, y, &planes.coded, filter, num_comps);

            let se = compute_se(trial, orig_color, num_comps, self.params);
            let bits = self.costs.match_cost(dist as u32, num_comps as u32) as f32;
            let t = scale * se + bits * self.lambda;
            if t < best.t && !should_reject(trial, orig_color, num_comps, self.params) {
                best = LiteralBest { delta, bits, se, t, kind: 2 };
            }
        });

        best
    }

    /// Best length-n copy whose n delta pixels land at (x..x+n, y). Leaves
    /// trial pixels in the coded plane; the caller re-commits the winner.
    fn find_optimal_n(&self, n: usize, x: usize, y: usize, filter: u8, planes: &mut Planes) -> RunBest {
        let num_comps = self.num_comps;
        let oon = 1.0 / n as f32;

        let mut best =
            RunBest { deltas: [Rgba::default(); MAX_DELTA_PIXELS], bits: BIG_SCORE, se: BIG_SCORE, t: BIG_SCORE };

        let scale = self.masking.max_over_run(x, y, n);
        let Planes { delta: delta_img, coded: coded_img } = planes;

        for_each_source(self.level, self.width, x, y, n, |xd, yd| {
            let dist = match_dist(x, y, xd, y - yd, self.width, num_comps);
            debug_assert!(dist >= 3);
            if dist > 32768 {
                return;
            }

            let mut deltas = [Rgba::default(); MAX_DELTA_PIXELS];
            for i in 0..n {
                deltas[i] = delta_img.get(xd + i, y - yd);
            }

            let mut se = 0.0f32;
            for i in 0..n {
                let trial = predict_inverse(deltas[i], x + i, y, coded_img, filter, num_comps);
                coded_img.set(x + i, y, trial);
                se += compute_se(trial, self.orig.get(x + i, y), num_comps, self.params);
            }

            let bits = self.costs.match_cost(dist as u32, (n * num_comps) as u32) as f32;
            let t = scale * (se * oon) + bits * self.lambda;
            if t < best.t {
                let rejected = (0..n).any(|i| {
                    should_reject(coded_img.get(x + i, y), self.orig.get(x + i, y), num_comps, self.params)
                });
                if !rejected {
                    best = RunBest { deltas, bits, se, t };
                }
            }
        });

        best
    }

    /// Evaluate every cover pattern of `menu` over the m-pixel window at
    /// (x, y); the winner's deltas are left in `deltas_out[..m]`.
    fn eval_matches(
        &self,
        m: usize,
        menu: &[MatchOrder],
        x: usize,
        y: usize,
        filter: u8,
        planes: &mut Planes,
        cache: &mut SubCache,
        deltas_out: &mut [Rgba; MAX_DELTA_PIXELS],
    ) -> WindowBest {
        let num_comps = self.num_comps;
        let mse_scale = self.masking.max_over_run(x, y, m);

        cache.reset();

        let mut best = WindowBest { bits: BIG_SCORE, se: BIG_SCORE, t: BIG_SCORE, pattern: 0 };

        for (pattern_idx, pattern) in menu.iter().enumerate() {
            let mut total_bits = 0.0f32;
            let mut total_se = 0.0f32;

            let mut x_ofs = 0usize;
            for &run in pattern.iter() {
                let len = run as usize;

                let mut key = MemoKey { x_ofs, prev: [Rgba::default(); MAX_DELTA_PIXELS] };
                for q in 0..x_ofs {
                    key.prev[q] = planes.delta.get(x + q, y);
                }

                let value = if let Some(v) = cache.maps[len - 1].get(&key) {
                    *v
                } else {
                    let v = if len == 1 {
                        let r = self.find_optimal1(x + x_ofs, y, filter, planes);
                        let mut deltas = [Rgba::default(); MAX_DELTA_PIXELS];
                        deltas[0] = r.delta;
                        MemoValue { deltas, bits: r.bits, se: r.se, t: r.t }
                    } else {
                        let r = self.find_optimal_n(len, x + x_ofs, y, filter, planes);
                        MemoValue { deltas: r.deltas, bits: r.bits, se: r.se, t: r.t }
                    };
                    cache.maps[len - 1].insert(key, v);
                    v
                };

                for k in 0..len {
                    planes.delta.set(x + x_ofs + k, y, value.deltas[k]);
                    let coded = predict_inverse(
                        value.deltas[k],
                        x + x_ofs + k,
                        y,
                        &planes.coded,
                        filter,
                        num_comps,
                    );
                    planes.coded.set(x + x_ofs + k, y, coded);
                }

                total_bits += value.bits;
                total_se += value.se;
                x_ofs += len;
            }
            debug_assert_eq!(x_ofs, m);

            let mse = total_se / m as f32;
            let t = mse * mse_scale + total_bits * self.lambda;
            if t < best.t {
                best = WindowBest { bits: total_bits, se: total_se, t, pattern: pattern_idx };
                for k in 0..m {
                    deltas_out[k] = planes.delta.get(x + k, y);
                }

                if mse == 0.0 {
                    break;
                }
            }
        }

        // A menu without an all-literal pattern (the fused 2M menus) can
        // come up empty when every copy candidate rejects; the caller's
        // score comparison then falls back to the per-M-window result.
        best
    }

    /// Re-commit a window's winning deltas into both planes.
    fn commit(&self, x: usize, y: usize, filter: u8, deltas: &[Rgba], planes: &mut Planes) {
        for (k, &d) in deltas.iter().enumerate() {
            planes.delta.set(x + k, y, d);
            let coded = predict_inverse(d, x + k, y, &planes.coded, filter, self.num_comps);
            planes.coded.set(x + k, y, coded);
        }
    }

    fn tally_pattern(stats: &mut ParseStats, menu: &[MatchOrder], pattern: usize, double: bool) {
        for &run in menu[pattern].iter() {
            stats.match_len_hist[run as usize] += 1;
        }
        if double {
            stats.pattern_hist_b[pattern] += 1;
            stats.windows_b += 1;
        } else {
            stats.pattern_hist_a[pattern] += 1;
            stats.windows_a += 1;
        }
    }

    /// Parse one scanline under one filter. Returns (total_se, total_bits).
    fn parse_scanline(
        &self,
        y: usize,
        filter: u8,
        planes: &mut Planes,
        cache: &mut SubCache,
        stats: &mut ParseStats,
    ) -> (f32, f32) {
        let m = self.level.window;
        let width = self.width;
        let num_comps = self.num_comps;

        let mut total_se = 0.0f32;
        let mut total_bits = 0.0f32;

        let mut x = 0usize;
        while x < width {
            let step = if self.level.double_width { m * 2 } else { m };

            if x + step > width {
                // Remainder narrower than a window: single-pixel literals.
                let best = self.find_optimal1(x, y, filter, planes);
                planes.delta.set(x, y, best.delta);
                let coded = predict_inverse(best.delta, x, y, &planes.coded, filter, num_comps);
                planes.coded.set(x, y, coded);

                total_se += compute_se(coded, self.orig.get(x, y), num_comps, self.params);
                total_bits += best.bits;
                stats.match_len_hist[1] += 1;
                stats.lit_kind_hist[best.kind as usize] += 1;
                x += 1;
                continue;
            }

            if self.level.double_width {
                // Two M-windows independently, then the fused 2M window;
                // keep whichever pair scores lower.
                let mut deltas_a = [[Rgba::default(); MAX_DELTA_PIXELS]; 2];
                let mut best_a = [WindowBest { bits: 0.0, se: 0.0, t: 0.0, pattern: 0 }; 2];
                for o in 0..2 {
                    best_a[o] = self.eval_matches(
                        m,
                        self.level.menu,
                        x + o * m,
                        y,
                        filter,
                        planes,
                        cache,
                        &mut deltas_a[o],
                    );
                    self.commit(x + o * m, y, filter, &deltas_a[o][..m], planes);
                }

                let mut deltas_b = [Rgba::default(); MAX_DELTA_PIXELS];
                let best_b = self.eval_matches(
                    m * 2,
                    self.level.double_menu,
                    x,
                    y,
                    filter,
                    planes,
                    cache,
                    &mut deltas_b,
                );

                let scale = self.masking.max_over_run(x, y, m * 2);
                let se_a = best_a[0].se + best_a[1].se;
                let bits_a = best_a[0].bits + best_a[1].bits;
                let t_a = (se_a / (m * 2) as f32) * scale + bits_a * self.lambda;

                if t_a < best_b.t {
                    for o in 0..2 {
                        self.commit(x + o * m, y, filter, &deltas_a[o][..m], planes);
                        Self::tally_pattern(stats, self.level.menu, best_a[o].pattern, false);
                    }
                    total_bits += bits_a;
                } else {
                    self.commit(x, y, filter, &deltas_b[..m * 2], planes);
                    Self::tally_pattern(stats, self.level.double_menu, best_b.pattern, true);
                    total_bits += best_b.bits;
                }

                for k in 0..m * 2 {
                    total_se += compute_se(
                        planes.coded.get(x + k, y),
                        self.orig.get(x + k, y),
                        num_comps,
                        self.params,
                    );
                }

                x += m * 2;
            } else {
                let mut deltas = [Rgba::default(); MAX_DELTA_PIXELS];
                let best =
                    self.eval_matches(m, self.level.menu, x, y, filter, planes, cache, &mut deltas);
                self.commit(x, y, filter, &deltas[..m], planes);
                Self::tally_pattern(stats, self.level.menu, best.pattern, false);

                for k in 0..m {
                    total_se += compute_se(
                        planes.coded.get(x + k, y),
                        self.orig.get(x + k, y),
                        num_comps,
                        self.params,
                    );
                }
                total_bits += best.bits;

                x += m;
            }
        }

        (total_se, total_bits)
    }
}

/// Serialize an image as an ordinary lossless PNG (no RDO parse). Used by
/// the unpack paths.
pub fn write_lossless(img: &Image) -> Vec<u8> {
    let filters = vec![crate::consts::FILTER_PAETH; img.height()];
    let mut obs = FrequencyObserver::new();
    deflate::write_png(img, &filters, &mut obs)
}

/// A finished container encode: the file bytes, the pixels the decoder
/// will reconstruct, and the per-row filter choices.
pub struct PngEncodeResult {
    pub file: Vec<u8>,
    pub coded: Image,
    pub filters: Vec<u8>,
}

/// Run the full parse (one or two passes) and serialize the container.
pub fn encode(orig: &Image, masking: &MaskingMap, params: &RdoParams) -> PngEncodeResult {
    let width = orig.width();
    let height = orig.height();
    let num_comps = orig.num_comps();
    let level = &LEVELS[params.level];

    // Observation pass: an all-Average-filtered baseline seeds the first
    // frozen cost table.
    let mut obs = FrequencyObserver::new();
    let baseline_filters = vec![FILTER_AVG; height];
    let baseline_stream = deflate::filter_scanlines(orig, &baseline_filters);
    let _ = deflate::compress(&baseline_stream, &mut obs);

    let mut costs = CodeCosts::from_observer(&obs);

    let mut planes = Planes {
        delta: Image::new(width, height, orig.has_alpha()),
        coded: Image::new(width, height, orig.has_alpha()),
    };
    let mut filters = vec![FILTER_AVG; height];
    let mut cache = SubCache::new();

    let num_passes = if params.two_pass { 2 } else { 1 };
    let mut file = Vec::new();

    for pass in 0..num_passes {
        if params.print_progress && num_passes > 1 {
            println!("Pass {}", pass + 1);
        }
        if pass > 0 {
            planes.delta.clear();
            planes.coded.clear();
        }

        let ctx = ParseCtx {
            orig,
            masking,
            params,
            level,
            costs: &costs,
            lambda: params.lambda,
            width,
            num_comps,
        };

        if params.print_debug_output {
            println!("Literal table:");
            for (i, l) in ctx.costs.literal_lengths().iter().enumerate() {
                print!("{:2} ", l);
                if i % 16 == 15 {
                    println!();
                }
            }
            println!("Distance table:");
            for (i, l) in ctx.costs.distance_lengths().iter().enumerate() {
                print!("{:2} ", l);
                if i % 16 == 15 {
                    println!();
                }
            }
        }

        let mut stats = ParseStats::new(level);
        let mut best_delta_row = vec![Rgba::default(); width];
        let mut best_coded_row = vec![Rgba::default(); width];

        for y in 0..height {
            if params.print_progress && (y & 15) == 0 {
                print!("\r{:3.1}%", y as f32 * 100.0 / height as f32);
                use std::io::Write as _;
                let _ = std::io::stdout().flush();
            }

            let mut best_err = BIG_SCORE;
            let mut best_filter = 0u8;

            for filter in level.first_filter..=level.last_filter {
                if filter == SKIP_FILTER {
                    continue;
                }

                let (se, _bits) = ctx.parse_scanline(y, filter, &mut planes, &mut cache, &mut stats);

                // Filter selection is fidelity-first: total squared error,
                // not the RD score.
                if se < best_err {
                    best_err = se;
                    best_filter = filter;
                    best_delta_row.copy_from_slice(planes.delta.row(y));
                    best_coded_row.copy_from_slice(planes.coded.row(y));
                }
            }

            planes.delta.row_mut(y).copy_from_slice(&best_delta_row);
            planes.coded.row_mut(y).copy_from_slice(&best_coded_row);
            filters[y] = best_filter;
            stats.filter_hist[best_filter as usize] += 1;
        }

        if params.print_progress {
            print!("\r      \r");
        }

        if params.print_debug_output {
            println!("Filter hist:");
            for f in 1..=4 {
                println!("{} {}", f, stats.filter_hist[f]);
            }
            println!("Match len hist:");
            for l in 1..=MAX_DELTA_PIXELS {
                println!("{}: {}", l, stats.match_len_hist[l]);
            }
            println!("Windows: {} single, {} double", stats.windows_a, stats.windows_b);
            println!(
                "Remainder literal kinds: {} true, {} shrunk, {} copied",
                stats.lit_kind_hist[0], stats.lit_kind_hist[1], stats.lit_kind_hist[2]
            );
            println!("Pattern hist:");
            for (i, n) in stats.pattern_hist_a.iter().enumerate() {
                println!("{}: {}", i, n);
            }
            if !stats.pattern_hist_b.is_empty() {
                println!("Double pattern hist:");
                for (i, n) in stats.pattern_hist_b.iter().enumerate() {
                    println!("{}: {}", i, n);
                }
            }
        }

        if pass + 1 == num_passes {
            let mut final_obs = FrequencyObserver::new();
            file = deflate::write_png(&planes.coded, &filters, &mut final_obs);
        } else {
            // Re-observe the pass-1 tokenization and refreeze the tables.
            let mut pass_obs = FrequencyObserver::new();
            let stream = deflate::filter_scanlines(&planes.coded, &filters);
            let _ = deflate::compress(&stream, &mut pass_obs);
            costs = CodeCosts::from_observer(&pass_obs);
        }
    }

    PngEncodeResult { file, coded: planes.coded, filters }
}
