// THEORY:
// A `Frame` is an owned RGBA buffer with an explicit row stride, matching the
// layout capture backends hand out (rows may be padded past `width * 4`). The
// detection core only ever reads frames; everything that needs a smaller
// picture (the monitoring ROI, the down-scaled analysis frame) produces a new
// `Frame` rather than a view, so no borrow outlives a detection call.
//
// Key architectural principles:
// 1.  **Validated once**: `Frame::new` checks the stride and buffer length up
//     front, so the per-pixel accessors can index without re-checking.
// 2.  **Empty is legal**: a 0x0 frame is a valid value. Downstream components
//     treat it as "nothing to find" rather than an error.
// 3.  **Buffer reuse at the boundary**: `FramePool` keeps a small free list of
//     byte buffers so per-frame crops and down-scaled copies do not allocate
//     in steady state.

use crate::core_modules::pixel::pixel::{CHANNELS, Pixel};
use crate::error::{VisionError, VisionResult};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// An axis-aligned rectangle in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Rect {
    pub fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Rect { x, y, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: usize,
    height: usize,
    stride: usize,
    data: Vec<u8>,
}

impl Frame {
    /// Wraps a raw RGBA buffer whose rows are `stride` bytes apart.
    pub fn new(width: usize, height: usize, stride: usize, data: Vec<u8>) -> VisionResult<Self> {
        if width == 0 || height == 0 {
            return Ok(Frame { width: 0, height: 0, stride: 0, data: Vec::new() });
        }
        let row_bytes = width * CHANNELS;
        if stride < row_bytes {
            return Err(VisionError::invalid_frame(format!(
                "stride {stride} is shorter than a {width}px row ({row_bytes} bytes)"
            )));
        }
        let required = stride * (height - 1) + row_bytes;
        if data.len() < required {
            return Err(VisionError::invalid_frame(format!(
                "{width}x{height} frame with stride {stride} needs {required} bytes, got {}",
                data.len()
            )));
        }
        Ok(Frame { width, height, stride, data })
    }

    /// Wraps a tightly packed RGBA buffer.
    pub fn from_rgba(width: usize, height: usize, data: Vec<u8>) -> VisionResult<Self> {
        Frame::new(width, height, width * CHANNELS, data)
    }

    pub fn from_rgba_image(image: image::RgbaImage) -> Self {
        let (width, height) = (image.width() as usize, image.height() as usize);
        let data = image.into_raw();
        Frame { width, height, stride: width * CHANNELS, data }
    }

    /// A frame where every pixel has the same value.
    pub fn filled(width: usize, height: usize, pixel: Pixel) -> Self {
        let mut data = Vec::with_capacity(width * height * CHANNELS);
        for _ in 0..width * height {
            data.extend_from_slice(&[pixel.red, pixel.green, pixel.blue, pixel.alpha]);
        }
        Frame { width, height, stride: width * CHANNELS, data }
    }

    pub fn empty() -> Self {
        Frame { width: 0, height: 0, stride: 0, data: Vec::new() }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    /// The `width * 4` meaningful bytes of row `y`, without stride padding.
    #[inline]
    pub fn row(&self, y: usize) -> &[u8] {
        let start = y * self.stride;
        &self.data[start..start + self.width * CHANNELS]
    }

    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> Pixel {
        let offset = y * self.stride + x * CHANNELS;
        Pixel::from_rgba(&self.data[offset..offset + CHANNELS])
    }

    pub fn put_pixel(&mut self, x: usize, y: usize, pixel: Pixel) {
        let offset = y * self.stride + x * CHANNELS;
        self.data[offset..offset + CHANNELS]
            .copy_from_slice(&[pixel.red, pixel.green, pixel.blue, pixel.alpha]);
    }

    /// Gives the backing buffer back, e.g. to return it to a `FramePool`.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Copies the pixels of `rect` into a tightly packed frame. The rectangle
    /// is intersected with the frame bounds first.
    pub fn crop(&self, rect: Rect) -> Frame {
        self.crop_into(rect, Vec::new())
    }

    /// Same as `crop`, reusing `buffer` as the destination storage.
    pub fn crop_into(&self, rect: Rect, mut buffer: Vec<u8>) -> Frame {
        let rect = self.clamp_rect(rect);
        buffer.clear();
        if rect.is_empty() {
            return Frame { width: 0, height: 0, stride: 0, data: buffer };
        }
        buffer.reserve(rect.width * rect.height * CHANNELS);
        for y in rect.y..rect.y + rect.height {
            let row = self.row(y);
            buffer.extend_from_slice(&row[rect.x * CHANNELS..(rect.x + rect.width) * CHANNELS]);
        }
        Frame {
            width: rect.width,
            height: rect.height,
            stride: rect.width * CHANNELS,
            data: buffer,
        }
    }

    /// Square region of side `size` centred on (cx, cy), shifted to stay inside
    /// the frame and never smaller than 1x1 on a non-empty frame.
    pub fn roi_rect(&self, cx: i32, cy: i32, size: usize) -> Rect {
        if self.is_empty() {
            return Rect::default();
        }
        let width = size.clamp(1, self.width);
        let height = size.clamp(1, self.height);
        let half = (size / 2) as i64;
        let max_x = (self.width - width) as i64;
        let max_y = (self.height - height) as i64;
        let x = (cx as i64 - half).clamp(0, max_x) as usize;
        let y = (cy as i64 - half).clamp(0, max_y) as usize;
        Rect::new(x, y, width, height)
    }

    /// Crops the monitoring ROI around (cx, cy). Returns the crop and where it
    /// came from.
    pub fn extract_roi(&self, cx: i32, cy: i32, size: usize) -> (Frame, Rect) {
        let rect = self.roi_rect(cx, cy, size);
        (self.crop(rect), rect)
    }

    /// Nearest-neighbour resize by `factor`. Factors at or above 1.0 (and
    /// non-finite ones) return a copy.
    pub fn downscale(&self, factor: f64) -> Frame {
        self.downscale_into(factor, Vec::new())
    }

    /// Same as `downscale`, reusing `buffer` as the destination storage.
    pub fn downscale_into(&self, factor: f64, mut data: Vec<u8>) -> Frame {
        if self.is_empty() || !factor.is_finite() || factor <= 0.0 || factor >= 1.0 {
            return self.crop_into(self.bounds(), data);
        }
        let width = ((self.width as f64 * factor) as usize).max(1);
        let height = ((self.height as f64 * factor) as usize).max(1);
        data.clear();
        data.reserve(width * height * CHANNELS);
        for y in 0..height {
            let sy = (y * self.height / height).min(self.height - 1);
            let row = self.row(sy);
            for x in 0..width {
                let sx = (x * self.width / width).min(self.width - 1);
                data.extend_from_slice(&row[sx * CHANNELS..sx * CHANNELS + CHANNELS]);
            }
        }
        Frame { width, height, stride: width * CHANNELS, data }
    }

    fn clamp_rect(&self, rect: Rect) -> Rect {
        let x = rect.x.min(self.width);
        let y = rect.y.min(self.height);
        let width = rect.width.min(self.width - x);
        let height = rect.height.min(self.height - y);
        Rect::new(x, y, width, height)
    }
}

const FRAME_POOL_SIZE: usize = 8;

/// A small free list of byte buffers for per-frame crops.
pub struct FramePool {
    buffers: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
}

impl Default for FramePool {
    fn default() -> Self {
        FramePool::new(FRAME_POOL_SIZE)
    }
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        FramePool {
            buffers: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Takes a cleared buffer from the pool, or a fresh one when it is empty.
    pub fn acquire(&self) -> Vec<u8> {
        let mut buffer = self.buffers.lock().pop_front().unwrap_or_default();
        buffer.clear();
        buffer
    }

    /// Returns a buffer. Dropped when the pool is already full.
    pub fn release(&self, buffer: Vec<u8>) {
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.capacity {
            buffers.push_back(buffer);
        }
    }

    pub fn available(&self) -> usize {
        self.buffers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: usize, height: usize) -> Frame {
        let mut frame = Frame::filled(width, height, Pixel::new(0, 0, 0, 255));
        for y in 0..height {
            for x in 0..width {
                frame.put_pixel(x, y, Pixel::new(x as u8, y as u8, 0, 255));
            }
        }
        frame
    }

    #[test]
    fn rejects_short_buffers_and_narrow_strides() {
        assert!(Frame::new(4, 4, 8, vec![0; 64]).is_err());
        assert!(Frame::new(4, 4, 16, vec![0; 63]).is_err());
        assert!(Frame::new(4, 4, 20, vec![0; 76]).is_ok());
        assert!(Frame::new(0, 4, 0, Vec::new()).unwrap().is_empty());
    }

    #[test]
    fn padded_rows_are_read_without_padding() {
        let mut data = vec![0u8; 20 * 2];
        data[20..24].copy_from_slice(&[9, 8, 7, 255]);
        let frame = Frame::new(4, 2, 20, data).unwrap();
        assert_eq!(frame.row(1).len(), 16);
        assert_eq!(frame.pixel(0, 1), Pixel::new(9, 8, 7, 255));
    }

    #[test]
    fn roi_is_centred_and_clamped_to_the_frame() {
        let frame = gradient(100, 80);
        let (roi, rect) = frame.extract_roi(50, 40, 20);
        assert_eq!(rect, Rect::new(40, 30, 20, 20));
        assert_eq!(roi.pixel(0, 0), frame.pixel(40, 30));

        let (_, corner) = frame.extract_roi(2, 79, 20);
        assert_eq!(corner, Rect::new(0, 60, 20, 20));

        let (_, oversized) = frame.extract_roi(50, 40, 500);
        assert_eq!(oversized, Rect::new(0, 0, 100, 80));

        let (tiny, _) = frame.extract_roi(10, 10, 0);
        assert_eq!((tiny.width(), tiny.height()), (1, 1));
    }

    #[test]
    fn downscale_samples_nearest_pixels() {
        let frame = gradient(40, 20);
        let half = frame.downscale(0.5);
        assert_eq!((half.width(), half.height()), (20, 10));
        assert_eq!(half.pixel(3, 2), frame.pixel(6, 4));
        assert_eq!(frame.downscale(1.0), frame);
    }

    #[test]
    fn pool_recycles_buffers_up_to_capacity() {
        let pool = FramePool::new(1);
        let frame = gradient(8, 8);
        let crop = frame.crop_into(Rect::new(0, 0, 4, 4), pool.acquire());
        pool.release(crop.into_bytes());
        pool.release(Vec::new());
        assert_eq!(pool.available(), 1);
        assert!(pool.acquire().capacity() >= 64);
        assert_eq!(pool.available(), 0);
    }
}
