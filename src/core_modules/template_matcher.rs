// THEORY:
// The `TemplateMatcher` slides one template (already at its final pixel size)
// across one frame and scores every candidate window with normalized
// cross-correlation:
//
//     score = (sum(F*T) - n * mean_F * mean_T) / (n * std_F * std_T)
//
// NCC is invariant to uniform brightness and contrast changes, which makes it a
// robust similarity measure for UI elements rendered under varying lighting.
//
// Key architectural principles:
// 1.  **O(1) window statistics**: for a fully opaque template the window's sum
//     and sum of squares come from the frame's integral tables. Only the dot
//     product costs O(w*h).
// 2.  **Masking**: template pixels with zero alpha are excluded from `n` and
//     from every sum. For a masked template the window statistics are
//     accumulated over the opaque pixels alongside the dot product, so the
//     score depends on nothing the mask hides.
// 3.  **Degenerate statistics never divide by zero**: a flat frame window is
//     skipped; a flat template switches to an exact-equality scan that reports
//     1.0 on the first identical window.
// 4.  **Coarse then fine**: with a stride above 1 the grid scan finds the
//     neighbourhood, and an optional stride-1 pass over +-stride around the
//     coarse best sharpens the coordinate.
// 5.  **Colour**: in RGB mode each channel is correlated on its own and the
//     channel scores are averaged. Channels in which the template is flat carry
//     no shape information and are left out of the average.

use crate::core_modules::frame_statistics::{FramePrecomputation, IntegralPlane};
use crate::core_modules::template_cache::{TemplatePlane, TemplatePrecomputation};
use std::time::{Duration, Instant};
use tracing::trace;

/// Score reported before any window has been evaluated.
pub const NO_SCORE: f64 = -1.0;
/// Frame window variances at or below this are treated as zero.
const FLAT_WINDOW_VARIANCE: f64 = 1e-9;
const FLAT_WINDOW_TOLERANCE: f64 = 1e-9;

/// Tunables for a single-scale scan.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOptions {
    /// Minimum score accepted as a match.
    pub threshold: f64,
    /// Coarse scan step in pixels. Zero is treated as one.
    pub stride: usize,
    /// Re-scan the neighbourhood of the coarse best at stride 1.
    pub refine: bool,
    /// Report the best coordinate even when it is below `threshold`.
    pub return_best_even: bool,
    /// Correlate R, G and B separately instead of luma.
    pub use_rgb: bool,
    /// Record how long the scan took.
    pub debug_timing: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        MatchOptions {
            threshold: 0.80,
            stride: 1,
            refine: true,
            return_best_even: false,
            use_rgb: false,
            debug_timing: false,
        }
    }
}

/// Outcome of a scan at one scale or, after aggregation, across all scales.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Top-left corner of the best window. `None` when nothing qualified for
    /// reporting (below threshold without `return_best_even`, or no window).
    pub position: Option<(usize, usize)>,
    pub score: f64,
    pub scale: f64,
    pub found: bool,
    /// Size of the matched window, i.e. the template at `scale`.
    pub width: usize,
    pub height: usize,
    pub duration: Option<Duration>,
    pub scales_evaluated: usize,
}

impl MatchResult {
    pub fn not_found() -> Self {
        MatchResult {
            position: None,
            score: NO_SCORE,
            scale: 1.0,
            found: false,
            width: 0,
            height: 0,
            duration: None,
            scales_evaluated: 0,
        }
    }

    /// Centre of the matched window, when a position was reported.
    pub fn center(&self) -> Option<(i32, i32)> {
        self.position
            .map(|(x, y)| ((x + self.width / 2) as i32, (y + self.height / 2) as i32))
    }
}

/// A frame plane paired with the template plane it is correlated against.
struct ChannelPair<'a> {
    frame: &'a IntegralPlane,
    template: &'a TemplatePlane,
}

struct Scanner<'a> {
    channels: Vec<ChannelPair<'a>>,
    template: &'a TemplatePrecomputation,
    max_x: usize,
    max_y: usize,
}

impl<'a> Scanner<'a> {
    fn score_at(&self, x: usize, y: usize) -> Option<f64> {
        let mut total = 0.0;
        let mut informative = false;
        for pair in &self.channels {
            if let Some(s) = self.channel_score(pair, x, y) {
                total += s;
                informative = true;
            }
        }
        informative.then(|| (total / self.channels.len() as f64).clamp(-1.0, 1.0))
    }

    fn channel_score(&self, pair: &ChannelPair<'_>, x: usize, y: usize) -> Option<f64> {
        let tpl = self.template;
        let (w, h) = (tpl.width, tpl.height);
        let t = &pair.template.values;
        let mut dot = 0.0f64;
        let (sum, sum_sq) = match &tpl.mask {
            None => {
                for ty in 0..h {
                    let frow = &pair.frame.row_from(x, y + ty)[..w];
                    let trow = &t[ty * w..ty * w + w];
                    for (f, tv) in frow.iter().zip(trow) {
                        dot += *f as f64 * *tv as f64;
                    }
                }
                pair.frame.window_sums(x, y, w, h)
            }
            Some(mask) => {
                let mut sum = 0.0f64;
                let mut sum_sq = 0.0f64;
                for ty in 0..h {
                    let frow = &pair.frame.row_from(x, y + ty)[..w];
                    let base = ty * w;
                    for (tx, f) in frow.iter().enumerate() {
                        if !mask[base + tx] {
                            continue;
                        }
                        let f = *f as f64;
                        sum += f;
                        sum_sq += f * f;
                        dot += f * t[base + tx] as f64;
                    }
                }
                (sum, sum_sq)
            }
        };

        let n = tpl.opaque_count as f64;
        let mean_f = sum / n;
        let var_f = sum_sq / n - mean_f * mean_f;
        // Integral-table sums carry rounding proportional to their magnitude.
        if var_f <= FLAT_WINDOW_VARIANCE + FLAT_WINDOW_TOLERANCE * (sum_sq / n) {
            return None;
        }
        let numerator = dot - n * mean_f * pair.template.mean;
        let denominator = n * var_f.sqrt() * pair.template.std;
        Some((numerator / denominator).clamp(-1.0, 1.0))
    }

    fn scan(&self, xs: impl Iterator<Item = usize> + Clone, ys: impl Iterator<Item = usize>, best: &mut Best) {
        for y in ys {
            for x in xs.clone() {
                if let Some(score) = self.score_at(x, y) {
                    best.offer(score, x, y);
                }
            }
        }
    }

    fn exact_match(&self, x: usize, y: usize) -> bool {
        let tpl = self.template;
        let w = tpl.width;
        for ty in 0..tpl.height {
            for tx in 0..w {
                let i = ty * w + tx;
                if !tpl.is_opaque(i) {
                    continue;
                }
                let same = self
                    .channels
                    .iter()
                    .all(|pair| pair.frame.value(x + tx, y + ty) == pair.template.values[i]);
                if !same {
                    return false;
                }
            }
        }
        true
    }
}

struct Best {
    score: f64,
    position: Option<(usize, usize)>,
}

impl Best {
    fn offer(&mut self, score: f64, x: usize, y: usize) {
        // The first candidate always lands, even at the -1 floor.
        if self.position.is_none() || score > self.score {
            self.score = score;
            self.position = Some((x, y));
        }
    }
}

/// Scans `template` over `frame` and returns the best window.
pub fn match_template(
    frame: &FramePrecomputation,
    template: &TemplatePrecomputation,
    options: &MatchOptions,
) -> MatchResult {
    let started = Instant::now();
    let mut result = MatchResult {
        width: template.width,
        height: template.height,
        ..MatchResult::not_found()
    };

    if frame.is_empty() || template.width > frame.width() || template.height > frame.height() {
        return result;
    }

    let rgb_channels: Option<Vec<ChannelPair<'_>>> = if options.use_rgb {
        frame.rgb().map(|planes| {
            planes
                .iter()
                .zip(&template.rgb)
                .filter(|(_, t)| !t.is_constant())
                .map(|(f, t)| ChannelPair { frame: f, template: t })
                .collect()
        })
    } else {
        None
    };
    let flat = match &rgb_channels {
        Some(channels) => channels.is_empty() && template.luma.is_constant(),
        None => template.luma.is_constant(),
    };
    let channels = match rgb_channels {
        Some(channels) if !channels.is_empty() => channels,
        _ => vec![ChannelPair { frame: frame.luma(), template: &template.luma }],
    };

    let scanner = Scanner {
        channels,
        template,
        max_x: frame.width() - template.width,
        max_y: frame.height() - template.height,
    };
    let stride = options.stride.max(1);
    let mut best = Best { score: NO_SCORE, position: None };

    if flat {
        'outer: for y in 0..=scanner.max_y {
            for x in 0..=scanner.max_x {
                if scanner.exact_match(x, y) {
                    best = Best { score: 1.0, position: Some((x, y)) };
                    break 'outer;
                }
            }
        }
    } else {
        scanner.scan((0..=scanner.max_x).step_by(stride), (0..=scanner.max_y).step_by(stride), &mut best);
        if options.refine && stride > 1 {
            if let Some((bx, by)) = best.position {
                let xs = bx.saturating_sub(stride)..=(bx + stride).min(scanner.max_x);
                let ys = by.saturating_sub(stride)..=(by + stride).min(scanner.max_y);
                scanner.scan(xs, ys, &mut best);
            }
        }
    }

    result.score = best.score;
    result.found = best.position.is_some() && best.score >= options.threshold;
    if result.found || options.return_best_even {
        result.position = best.position;
    }
    if options.debug_timing {
        result.duration = Some(started.elapsed());
    }
    trace!(
        width = template.width,
        height = template.height,
        score = result.score,
        found = result.found,
        "template scan complete"
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::frame::{Frame, Rect};
    use crate::core_modules::pixel::pixel::Pixel;

    // Deterministic textured frame: no two neighbouring windows look alike.
    fn textured(width: usize, height: usize, seed: u32) -> Frame {
        let mut frame = Frame::filled(width, height, Pixel::new(0, 0, 0, 255));
        let mut state = seed.wrapping_mul(2654435761).wrapping_add(12345);
        for y in 0..height {
            for x in 0..width {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                let r = (state & 0xff) as u8;
                let g = ((state >> 8) & 0xff) as u8;
                let b = ((state >> 16) & 0xff) as u8;
                frame.put_pixel(x, y, Pixel::new(r, g, b, 255));
            }
        }
        frame
    }

    // Ramp plus one soft blob: a single, smooth correlation peak.
    fn blob(width: usize, height: usize, cx: f64, cy: f64) -> Frame {
        let mut frame = Frame::filled(width, height, Pixel::new(0, 0, 0, 255));
        for y in 0..height {
            for x in 0..width {
                let d2 = (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2);
                let v = (x + y) as f64 + 100.0 * (-d2 / 50.0).exp();
                let v = v.min(255.0) as u8;
                frame.put_pixel(x, y, Pixel::new(v, v, v, 255));
            }
        }
        frame
    }

    fn precompute(frame: &Frame, rgb: bool) -> FramePrecomputation {
        FramePrecomputation::build(frame, rgb)
    }

    fn template_of(frame: &Frame) -> TemplatePrecomputation {
        TemplatePrecomputation::from_frame(frame).unwrap()
    }

    #[test]
    fn exact_copy_scores_one_at_its_origin() {
        let frame = textured(48, 40, 7);
        let template = frame.crop(Rect::new(17, 11, 12, 9));
        for use_rgb in [false, true] {
            let options = MatchOptions { use_rgb, ..MatchOptions::default() };
            let result = match_template(&precompute(&frame, use_rgb), &template_of(&template), &options);
            assert!(result.found);
            assert_eq!(result.position, Some((17, 11)));
            assert!((result.score - 1.0).abs() < 1e-6, "score {}", result.score);
            assert_eq!(result.center(), Some((23, 15)));
        }
    }

    #[test]
    fn scores_stay_within_unit_range() {
        let frame = textured(30, 30, 3);
        let template = textured(7, 5, 99);
        for stride in [1, 2, 5] {
            let options = MatchOptions { stride, return_best_even: true, ..MatchOptions::default() };
            let result = match_template(&precompute(&frame, false), &template_of(&template), &options);
            assert!((-1.0..=1.0).contains(&result.score));
            assert!(result.position.is_some());
        }
    }

    #[test]
    fn coarse_stride_with_refine_recovers_the_exact_offset() {
        let frame = blob(64, 64, 30.0, 40.0);
        let template = frame.crop(Rect::new(21, 34, 16, 16));
        let options = MatchOptions { stride: 4, refine: true, ..MatchOptions::default() };
        let result = match_template(&precompute(&frame, false), &template_of(&template), &options);
        assert_eq!(result.position, Some((21, 34)));
        assert!((result.score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn transparent_pixels_do_not_influence_the_score() {
        let frame = textured(40, 40, 5);
        let mut template = frame.crop(Rect::new(10, 12, 12, 12));
        // Left half transparent.
        for y in 0..12 {
            for x in 0..6 {
                let p = template.pixel(x, y);
                template.put_pixel(x, y, Pixel::new(p.red, p.green, p.blue, 0));
            }
        }
        let pre = template_of(&template);
        let options = MatchOptions::default();
        let clean = match_template(&precompute(&frame, false), &pre, &options);

        let mut altered = frame.clone();
        for y in 12..24 {
            for x in 10..16 {
                altered.put_pixel(x, y, Pixel::new(255, (x * y) as u8, 0, 255));
            }
        }
        let dirty = match_template(&precompute(&altered, false), &pre, &options);

        assert_eq!(clean.position, Some((10, 12)));
        assert_eq!(dirty.position, Some((10, 12)));
        assert!((clean.score - dirty.score).abs() < 1e-9);
        assert!((dirty.score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn flat_template_uses_exact_equality() {
        let mut frame = textured(20, 20, 1);
        let patch = Pixel::new(50, 60, 70, 255);
        for y in 8..12 {
            for x in 3..7 {
                frame.put_pixel(x, y, patch);
            }
        }
        let template = Frame::filled(4, 4, patch);
        let result = match_template(&precompute(&frame, false), &template_of(&template), &MatchOptions::default());
        assert!(result.found);
        assert_eq!(result.position, Some((3, 8)));
        assert_eq!(result.score, 1.0);

        let missing = Frame::filled(4, 4, Pixel::new(1, 2, 3, 255));
        let result = match_template(&precompute(&frame, false), &template_of(&missing), &MatchOptions::default());
        assert!(!result.found);
        assert_eq!(result.score, NO_SCORE);
    }

    #[test]
    fn oversized_template_is_not_found() {
        let frame = textured(10, 10, 2);
        let template = textured(11, 4, 2);
        let options = MatchOptions { return_best_even: true, ..MatchOptions::default() };
        let result = match_template(&precompute(&frame, false), &template_of(&template), &options);
        assert!(!result.found);
        assert_eq!(result.position, None);
        assert_eq!(result.score, NO_SCORE);
    }

    #[test]
    fn best_below_threshold_is_reported_only_on_request() {
        let frame = textured(30, 30, 8);
        let template = textured(6, 6, 1234);
        let strict = MatchOptions { threshold: 0.99, ..MatchOptions::default() };
        let result = match_template(&precompute(&frame, false), &template_of(&template), &strict);
        assert!(!result.found);
        assert!(result.position.is_none());
        assert!(result.score > NO_SCORE);

        let lenient = MatchOptions { return_best_even: true, ..strict };
        let result = match_template(&precompute(&frame, false), &template_of(&template), &lenient);
        assert!(!result.found);
        assert!(result.position.is_some());
    }

    #[test]
    fn flat_frame_windows_are_skipped() {
        let frame = Frame::filled(16, 16, Pixel::new(90, 90, 90, 255));
        let template = textured(4, 4, 4);
        let options = MatchOptions { return_best_even: true, debug_timing: true, ..MatchOptions::default() };
        let result = match_template(&precompute(&frame, false), &template_of(&template), &options);
        assert_eq!(result.score, NO_SCORE);
        assert!(result.position.is_none());
        assert!(result.duration.is_some());
    }

    #[test]
    fn perfect_inverse_is_still_reported_as_best() {
        // Template and frame the same size: one window, scoring -1.
        let source = textured(8, 6, 21);
        let mut template = source.clone();
        let mut negated = source.clone();
        for y in 0..6 {
            for x in 0..8 {
                let v = source.pixel(x, y).red;
                template.put_pixel(x, y, Pixel::new(v, v, v, 255));
                negated.put_pixel(x, y, Pixel::new(255 - v, 255 - v, 255 - v, 255));
            }
        }
        let options = MatchOptions { return_best_even: true, ..MatchOptions::default() };
        let result = match_template(&precompute(&negated, false), &template_of(&template), &options);
        assert!(!result.found);
        assert_eq!(result.position, Some((0, 0)));
        assert!((result.score + 1.0).abs() < 1e-6, "score {}", result.score);
    }
}
