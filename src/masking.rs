//! Perceptual masking map: a per-pixel multiplicative weight on squared
//! error derived from local activity. Smooth regions (low std-dev) get
//! large weights so the parser spends its error budget where texture hides
//! it; alpha edges pull the weight back up to protect silhouettes.

use crate::types::{Image, RdoParams};

/// Running first/second moment accumulator over u8 samples.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackedStat {
    num: u32,
    total: u64,
    total2: u64,
}

impl TrackedStat {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn update(&mut self, val: u32) {
        self.num += 1;
        self.total += val as u64;
        self.total2 += (val as u64) * (val as u64);
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.num
    }

    #[inline]
    pub fn average(&self) -> f32 {
        if self.num == 0 {
            0.0
        } else {
            self.total as f32 / self.num as f32
        }
    }

    /// Population standard deviation.
    #[inline]
    pub fn std_dev(&self) -> f32 {
        if self.num == 0 {
            return 0.0;
        }
        let n = self.num as u64;
        ((n * self.total2 - self.total * self.total) as f32).sqrt() / self.num as f32
    }
}

/// W x H grid of MSE scale factors, all >= 1 and finite.
pub struct MaskingMap {
    width: usize,
    scales: Vec<f32>,
}

impl MaskingMap {
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.scales[y * self.width + x]
    }

    /// Largest scale over a horizontal pixel run.
    #[inline]
    pub fn max_over_run(&self, x: usize, y: usize, len: usize) -> f32 {
        let row = &self.scales[y * self.width + x..y * self.width + x + len];
        row.iter().fold(0.0f32, |m, &s| m.max(s))
    }
}

#[inline]
fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Max per-channel std-dev over an edge-clamped rectangular neighborhood.
fn neighborhood_max_std_dev(
    img: &Image,
    x: usize,
    y: usize,
    lo: i32,
    hi: i32,
    num_comps: usize,
) -> f32 {
    let mut stats = [TrackedStat::new(); 4];

    for yd in lo..hi {
        for xd in lo..hi {
            let p = img.get_clamped(x as i32 + xd, y as i32 + yd);
            for c in 0..num_comps {
                stats[c].update(p[c] as u32);
            }
        }
    }

    let mut max_std_dev = 0.0f32;
    for s in stats.iter().take(num_comps) {
        max_std_dev = max_std_dev.max(s.std_dev());
    }
    max_std_dev
}

/// Build the masking map for one encode.
pub fn build_masking_map(img: &Image, params: &RdoParams) -> MaskingMap {
    let width = img.width();
    let height = img.height();
    let num_comps = img.num_comps();

    let mut map = MaskingMap { width, scales: vec![1.0; width * height] };
    if params.no_mse_scaling {
        return map;
    }

    let smooth_max = params.smooth_max_scale();
    let ultra_max = params.ultra_smooth_max_scale();
    let max_std = params.max_smooth_std_dev;
    let max_ultra_std = params.max_ultra_smooth_std_dev;

    for y in 0..height {
        for x in 0..width {
            let alpha_edge = if num_comps == 4 && params.alpha_is_opacity {
                let mut alpha_stats = TrackedStat::new();
                for yd in -3..=3 {
                    for xd in -3..=3 {
                        let p = img.get_clamped(x as i32 + xd, y as i32 + yd);
                        alpha_stats.update(p.a() as u32);
                    }
                }
                let yl = (alpha_stats.std_dev() / max_std).clamp(0.0, 1.0);
                yl * yl
            } else {
                0.0
            };

            let smooth_std = neighborhood_max_std_dev(img, x, y, -1, 2, num_comps);
            let yl = (smooth_std / max_std).clamp(0.0, 1.0);
            let mut scale = lerp(smooth_max, 1.0, yl * yl);

            if num_comps == 4 {
                scale = lerp(scale, smooth_max, alpha_edge);
            }

            let ultra_std = neighborhood_max_std_dev(img, x, y, -5, 5, num_comps);
            let yl = (ultra_std / max_ultra_std).clamp(0.0, 1.0);
            scale = lerp(ultra_max, scale, yl * yl * yl);

            map.scales[y * width + x] = scale.max(1.0);
        }
    }

    map
}
