// Image file I/O for frames: loading templates and captured frames from disk,
// and dumping frames (ROIs, down-scaled copies) for inspection.

pub mod image_helper {
    use crate::core_modules::frame::Frame;
    use crate::error::{VisionError, VisionResult};
    use image::ImageEncoder;
    use std::path::Path;

    /// Decodes any format `image` understands into an RGBA frame. The alpha
    /// channel is kept, so a PNG template carries its own match mask.
    pub fn load_frame(path: impl AsRef<Path>) -> VisionResult<Frame> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(VisionError::FileNotFound(path.to_path_buf()));
        }
        let image = image::open(path)?.to_rgba8();
        Ok(Frame::from_rgba_image(image))
    }

    /// Writes `frame` as an RGBA PNG.
    pub fn save_frame(path: impl AsRef<Path>, frame: &Frame) -> VisionResult<()> {
        let mut packed = Vec::with_capacity(frame.width() * frame.height() * 4);
        for y in 0..frame.height() {
            packed.extend_from_slice(frame.row(y));
        }
        let output = std::fs::File::create(path)?;
        let encoder = image::codecs::png::PngEncoder::new(output);
        encoder.write_image(
            &packed,
            frame.width() as u32,
            frame.height() as u32,
            image::ExtendedColorType::Rgba8,
        )?;
        Ok(())
    }
}
