// THEORY:
// Every correlation score needs the mean and variance of the frame window it
// is compared against. Computing those per window is O(w*h) and would double
// the cost of the scan, so each incoming frame is summarised once into
// summed-area tables: one over the pixel values and one over their squares.
// Any rectangle's sum and sum of squares then costs four lookups.
//
// Key architectural principles:
// 1.  **Per frame, never cached**: the precomputation is rebuilt for every
//     frame and shared read-only (behind an `Arc`) by all scale workers of that
//     frame's search.
// 2.  **Inclusive tables of size w*h**: `sum[y*w + x]` covers the rectangle
//     from (0,0) to (x,y) inclusive. Window queries subtract the row/column
//     just outside the window, guarding the zero edges explicitly.
// 3.  **f64 accumulation**: the values themselves are stored as f32 (they feed
//     the dot product), but the running sums are f64 so that large frames do
//     not lose the variance of a flat window to cancellation.

use crate::core_modules::frame::Frame;

/// One scalar plane of a frame plus its integral tables.
#[derive(Debug, Clone)]
pub struct IntegralPlane {
    width: usize,
    height: usize,
    values: Vec<f32>,
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
}

impl IntegralPlane {
    pub fn from_values(width: usize, height: usize, values: Vec<f32>) -> Self {
        debug_assert_eq!(values.len(), width * height);
        let mut sum = vec![0.0f64; width * height];
        let mut sum_sq = vec![0.0f64; width * height];
        for y in 0..height {
            let mut row_sum = 0.0f64;
            let mut row_sq = 0.0f64;
            for x in 0..width {
                let i = y * width + x;
                let v = values[i] as f64;
                row_sum += v;
                row_sq += v * v;
                let (above, above_sq) = if y > 0 {
                    (sum[i - width], sum_sq[i - width])
                } else {
                    (0.0, 0.0)
                };
                sum[i] = row_sum + above;
                sum_sq[i] = row_sq + above_sq;
            }
        }
        IntegralPlane { width, height, values, sum, sum_sq }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn value(&self, x: usize, y: usize) -> f32 {
        self.values[y * self.width + x]
    }

    /// The values of row `y`, starting at column `x`.
    #[inline]
    pub fn row_from(&self, x: usize, y: usize) -> &[f32] {
        let start = y * self.width;
        &self.values[start + x..start + self.width]
    }

    /// Sum and sum of squares over the `w` x `h` window whose top-left is (x, y).
    #[inline]
    pub fn window_sums(&self, x: usize, y: usize, w: usize, h: usize) -> (f64, f64) {
        let x1 = x + w - 1;
        let y1 = y + h - 1;
        let at = |table: &[f64], xx: usize, yy: usize| table[yy * self.width + xx];
        let rect = |table: &[f64]| {
            let mut total = at(table, x1, y1);
            if x > 0 {
                total -= at(table, x - 1, y1);
            }
            if y > 0 {
                total -= at(table, x1, y - 1);
            }
            if x > 0 && y > 0 {
                total += at(table, x - 1, y - 1);
            }
            total
        };
        (rect(self.sum.as_slice()), rect(self.sum_sq.as_slice()))
    }
}

/// Everything the matcher needs to know about one frame.
#[derive(Debug, Clone)]
pub struct FramePrecomputation {
    width: usize,
    height: usize,
    luma: IntegralPlane,
    rgb: Option<[IntegralPlane; 3]>,
}

impl FramePrecomputation {
    /// Summarises `frame`. Per-channel planes are built only when `with_rgb`.
    pub fn build(frame: &Frame, with_rgb: bool) -> Self {
        let (width, height) = (frame.width(), frame.height());
        let n = width * height;
        let mut luma = Vec::with_capacity(n);
        let mut channels = if with_rgb {
            Some([Vec::with_capacity(n), Vec::with_capacity(n), Vec::with_capacity(n)])
        } else {
            None
        };

        for y in 0..height {
            for x in 0..width {
                let pixel = frame.pixel(x, y);
                luma.push(pixel.luminance());
                if let Some(planes) = channels.as_mut() {
                    let rgb = pixel.rgb();
                    for (plane, value) in planes.iter_mut().zip(rgb) {
                        plane.push(value);
                    }
                }
            }
        }

        FramePrecomputation {
            width,
            height,
            luma: IntegralPlane::from_values(width, height, luma),
            rgb: channels.map(|[r, g, b]| {
                [
                    IntegralPlane::from_values(width, height, r),
                    IntegralPlane::from_values(width, height, g),
                    IntegralPlane::from_values(width, height, b),
                ]
            }),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn luma(&self) -> &IntegralPlane {
        &self.luma
    }

    pub fn rgb(&self) -> Option<&[IntegralPlane; 3]> {
        self.rgb.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(values: &[f32], width: usize, x: usize, y: usize, w: usize, h: usize) -> (f64, f64) {
        let mut s = 0.0;
        let mut sq = 0.0;
        for yy in y..y + h {
            for xx in x..x + w {
                let v = values[yy * width + xx] as f64;
                s += v;
                sq += v * v;
            }
        }
        (s, sq)
    }

    #[test]
    fn window_sums_agree_with_direct_summation() {
        let (width, height) = (13, 9);
        let values: Vec<f32> = (0..width * height).map(|i| ((i * 37) % 251) as f32).collect();
        let plane = IntegralPlane::from_values(width, height, values.clone());
        for &(x, y, w, h) in &[(0, 0, 13, 9), (0, 0, 1, 1), (5, 3, 4, 2), (12, 8, 1, 1), (0, 4, 7, 5)] {
            let (s, sq) = plane.window_sums(x, y, w, h);
            let (es, esq) = naive(&values, width, x, y, w, h);
            assert!((s - es).abs() < 1e-6, "sum at {x},{y}");
            assert!((sq - esq).abs() < 1e-3, "sum_sq at {x},{y}");
        }
    }

    #[test]
    fn rgb_planes_are_optional() {
        let frame = Frame::filled(4, 3, crate::core_modules::pixel::pixel::Pixel::new(10, 20, 30, 255));
        assert!(FramePrecomputation::build(&frame, false).rgb().is_none());
        let full = FramePrecomputation::build(&frame, true);
        let rgb = full.rgb().unwrap();
        assert_eq!(rgb[1].value(2, 2), 20.0);
        let expected = full.luma().value(0, 0) as f64 * 12.0;
        assert!((full.luma().window_sums(0, 0, 4, 3).0 - expected).abs() < 1e-4);
    }
}
