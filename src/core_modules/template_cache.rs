// THEORY:
// A template is matched at many sizes, and each size needs the same derived
// data: float planes (luma and R/G/B), the opacity mask, and the mean and
// standard deviation of every plane over the opaque pixels. The `TemplateCache`
// builds that data once per pixel size and hands out shared `Arc`s.
//
// Key architectural principles:
// 1.  **Keyed by dimensions, not by factor**: two scale factors that round to
//     the same pixel size share one entry. The base template is inserted at
//     construction, so factor 1.0 never resamples.
// 2.  **Resample from the base planes**: scaled variants are bilinear
//     interpolations of the base template's float planes and of its alpha
//     coverage, never re-derived from raw pixels. A resampled pixel stays in
//     the mask when at least half of its footprint was opaque. For masked
//     templates each tap is weighted by its coverage as well, so transparent
//     source pixels never bleed into the opaque edge.
// 3.  **First insert wins**: scale workers race to fill the cache. Lookups take
//     a read lock; a miss builds the entry without holding any lock, then
//     inserts it only if the slot is still empty. A loser drops its copy and
//     uses the winner's, so every caller observes identical statistics.
// 4.  **Masked statistics**: every sum, mean and deviation counts opaque pixels
//     only, which is what makes transparent template regions irrelevant to the
//     final score.

use crate::core_modules::frame::Frame;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Smallest side length a scaled template may have.
pub const MIN_TEMPLATE_SIDE: usize = 2;
/// Template plane standard deviations at or below this are treated as zero.
pub const STD_DEV_EPSILON: f64 = 1e-9;

/// One scalar plane of a template plus its statistics over opaque pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplatePlane {
    pub values: Vec<f32>,
    pub sum: f64,
    pub sum_sq: f64,
    pub mean: f64,
    pub std: f64,
}

impl TemplatePlane {
    fn new(values: Vec<f32>, mask: Option<&[bool]>, opaque_count: usize) -> Self {
        let mut sum = 0.0f64;
        let mut sum_sq = 0.0f64;
        for (i, &v) in values.iter().enumerate() {
            if mask.is_some_and(|m| !m[i]) {
                continue;
            }
            let v = v as f64;
            sum += v;
            sum_sq += v * v;
        }
        let n = opaque_count.max(1) as f64;
        let mean = sum / n;
        // Second pass: a flat plane must come out with a deviation of ~0, which
        // `sum_sq / n - mean^2` cannot guarantee.
        let mut squared_error = 0.0f64;
        for (i, &v) in values.iter().enumerate() {
            if mask.is_some_and(|m| !m[i]) {
                continue;
            }
            let d = v as f64 - mean;
            squared_error += d * d;
        }
        let std = (squared_error / n).sqrt();
        TemplatePlane { values, sum, sum_sq, mean, std }
    }

    pub fn is_constant(&self) -> bool {
        self.std <= STD_DEV_EPSILON
    }
}

/// A template at one pixel size, ready for correlation.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplatePrecomputation {
    pub width: usize,
    pub height: usize,
    pub luma: TemplatePlane,
    pub rgb: [TemplatePlane; 3],
    /// `None` when every pixel is opaque.
    pub mask: Option<Vec<bool>>,
    pub opaque_count: usize,
}

impl TemplatePrecomputation {
    /// Builds the precomputation from raw template pixels. Returns `None` for an
    /// empty or fully transparent template.
    pub fn from_frame(template: &Frame) -> Option<Self> {
        if template.is_empty() {
            return None;
        }
        let (width, height) = (template.width(), template.height());
        let n = width * height;
        let mut luma = Vec::with_capacity(n);
        let mut channels = [Vec::with_capacity(n), Vec::with_capacity(n), Vec::with_capacity(n)];
        let mut coverage = Vec::with_capacity(n);
        for y in 0..height {
            for x in 0..width {
                let pixel = template.pixel(x, y);
                luma.push(pixel.luminance());
                for (plane, value) in channels.iter_mut().zip(pixel.rgb()) {
                    plane.push(value);
                }
                coverage.push(!pixel.is_transparent());
            }
        }
        Self::assemble(width, height, luma, channels, coverage)
    }

    /// Bilinear resample to `width` x `height`.
    pub fn resized(&self, width: usize, height: usize) -> Option<Self> {
        if width < MIN_TEMPLATE_SIDE || height < MIN_TEMPLATE_SIDE {
            return None;
        }
        let sampler = Bilinear::new(self.width, self.height, width, height);
        let (luma, channels, coverage) = match &self.mask {
            None => (
                sampler.resample(&self.luma.values),
                [
                    sampler.resample(&self.rgb[0].values),
                    sampler.resample(&self.rgb[1].values),
                    sampler.resample(&self.rgb[2].values),
                ],
                vec![true; width * height],
            ),
            Some(mask) => {
                let alpha: Vec<f32> = mask.iter().map(|&m| if m { 1.0 } else { 0.0 }).collect();
                (
                    sampler.resample_covered(&self.luma.values, &alpha),
                    [
                        sampler.resample_covered(&self.rgb[0].values, &alpha),
                        sampler.resample_covered(&self.rgb[1].values, &alpha),
                        sampler.resample_covered(&self.rgb[2].values, &alpha),
                    ],
                    sampler.resample(&alpha).into_iter().map(|a| a >= 0.5).collect(),
                )
            }
        };
        Self::assemble(width, height, luma, channels, coverage)
    }

    fn assemble(
        width: usize,
        height: usize,
        luma: Vec<f32>,
        channels: [Vec<f32>; 3],
        coverage: Vec<bool>,
    ) -> Option<Self> {
        let opaque_count = coverage.iter().filter(|&&c| c).count();
        if opaque_count == 0 {
            return None;
        }
        let mask = (opaque_count < coverage.len()).then_some(coverage);
        let m = mask.as_deref();
        let [r, g, b] = channels;
        Some(TemplatePrecomputation {
            width,
            height,
            luma: TemplatePlane::new(luma, m, opaque_count),
            rgb: [
                TemplatePlane::new(r, m, opaque_count),
                TemplatePlane::new(g, m, opaque_count),
                TemplatePlane::new(b, m, opaque_count),
            ],
            mask,
            opaque_count,
        })
    }

    #[inline]
    pub fn is_opaque(&self, index: usize) -> bool {
        self.mask.as_ref().is_none_or(|m| m[index])
    }
}

struct Bilinear {
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
    fx: f64,
    fy: f64,
}

impl Bilinear {
    fn new(src_w: usize, src_h: usize, dst_w: usize, dst_h: usize) -> Self {
        Bilinear {
            src_w,
            src_h,
            dst_w,
            dst_h,
            fx: src_w as f64 / dst_w as f64,
            fy: src_h as f64 / dst_h as f64,
        }
    }

    fn axis(pos: f64, len: usize) -> (usize, usize, f32) {
        let p = pos.clamp(0.0, (len - 1) as f64);
        let p0 = p.floor() as usize;
        let p1 = (p0 + 1).min(len - 1);
        (p0, p1, (p - p0 as f64) as f32)
    }

    /// Source indices of the four taps around destination pixel (x, y) and the
    /// horizontal and vertical interpolation weights.
    #[inline]
    fn taps(&self, x: usize, y: usize) -> ([usize; 4], f32, f32) {
        let (y0, y1, wy) = Self::axis((y as f64 + 0.5) * self.fy - 0.5, self.src_h);
        let (x0, x1, wx) = Self::axis((x as f64 + 0.5) * self.fx - 0.5, self.src_w);
        let w = self.src_w;
        ([y0 * w + x0, y0 * w + x1, y1 * w + x0, y1 * w + x1], wx, wy)
    }

    fn resample(&self, src: &[f32]) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dst_w * self.dst_h);
        for y in 0..self.dst_h {
            for x in 0..self.dst_w {
                let ([i00, i01, i10, i11], wx, wy) = self.taps(x, y);
                let top = lerp(src[i00], src[i01], wx);
                let bottom = lerp(src[i10], src[i11], wx);
                out.push(lerp(top, bottom, wy));
            }
        }
        out
    }

    /// Like `resample`, but each tap also counts in proportion to its `alpha`:
    /// the result is sum(w * a * v) / sum(w * a) over the four taps.
    fn resample_covered(&self, src: &[f32], alpha: &[f32]) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dst_w * self.dst_h);
        for y in 0..self.dst_h {
            for x in 0..self.dst_w {
                let (taps, wx, wy) = self.taps(x, y);
                let (wx, wy) = (wx as f64, wy as f64);
                let weights = [(1.0 - wx) * (1.0 - wy), wx * (1.0 - wy), (1.0 - wx) * wy, wx * wy];
                out.push(covered_mean(src, alpha, &taps, &weights));
            }
        }
        out
    }
}

fn covered_mean(src: &[f32], alpha: &[f32], taps: &[usize; 4], weights: &[f64; 4]) -> f32 {
    let mut weighted = 0.0f64;
    let mut total = 0.0f64;
    let mut lo = f32::INFINITY;
    let mut hi = f32::NEG_INFINITY;
    for (&i, &w) in taps.iter().zip(weights) {
        let w = w * alpha[i] as f64;
        if w <= 0.0 {
            continue;
        }
        weighted += w * src[i] as f64;
        total += w;
        lo = lo.min(src[i]);
        hi = hi.max(src[i]);
    }
    if total <= 0.0 {
        return 0.0;
    }
    // Equal contributors must reproduce their value exactly, or a flat masked
    // template would stop being flat after resampling.
    if lo == hi {
        return lo;
    }
    ((weighted / total) as f32).clamp(lo, hi)
}

// Exact when both ends are equal, so flat regions stay flat after resampling.
#[inline]
fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Per-template cache of precomputations, keyed by pixel size.
#[derive(Debug)]
pub struct TemplateCache {
    base: Arc<TemplatePrecomputation>,
    scaled: RwLock<HashMap<(usize, usize), Arc<TemplatePrecomputation>>>,
}

impl TemplateCache {
    /// Returns `None` when the template has no opaque pixels.
    pub fn new(template: &Frame) -> Option<Self> {
        let base = Arc::new(TemplatePrecomputation::from_frame(template)?);
        let mut scaled = HashMap::new();
        scaled.insert((base.width, base.height), Arc::clone(&base));
        Some(TemplateCache { base, scaled: RwLock::new(scaled) })
    }

    pub fn base(&self) -> &Arc<TemplatePrecomputation> {
        &self.base
    }

    /// Pixel size the template takes at `factor`, or `None` when it would fall
    /// below the minimum side length.
    pub fn scaled_size(&self, factor: f64) -> Option<(usize, usize)> {
        if !factor.is_finite() || factor <= 0.0 {
            return None;
        }
        if (factor - 1.0).abs() < 1e-9 {
            return Some((self.base.width, self.base.height));
        }
        let width = (self.base.width as f64 * factor) as usize;
        let height = (self.base.height as f64 * factor) as usize;
        (width >= MIN_TEMPLATE_SIDE && height >= MIN_TEMPLATE_SIDE).then_some((width, height))
    }

    /// The template at `factor`, built and inserted on first request.
    pub fn scaled(&self, factor: f64) -> Option<Arc<TemplatePrecomputation>> {
        let key = self.scaled_size(factor)?;
        if let Some(hit) = self.scaled.read().get(&key) {
            return Some(Arc::clone(hit));
        }
        let built = Arc::new(self.base.resized(key.0, key.1)?);
        let mut map = self.scaled.write();
        Some(Arc::clone(map.entry(key).or_insert(built)))
    }

    pub fn len(&self) -> usize {
        self.scaled.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
