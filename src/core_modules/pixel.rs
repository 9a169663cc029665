// THEORY:
// The `Pixel` is the smallest unit the engine reasons about: a "dumb" RGBA
// container plus the two single-pixel brightness transforms the rest of the
// crate depends on.
//
// Two lumas, two jobs:
// - `luminance` (Rec. 709 weights, f32) feeds the correlation matcher. It is
//   precise and continuous, which keeps the NCC statistics well conditioned.
// - `fast_luma` (integer weights 77/150/29, shifted by 8) feeds the motion
//   detector. It is a single byte, cheap enough to run on every ROI pixel of
//   every frame, and its quantization is far below the detector's thresholds.
//
// A pixel with zero alpha is "absent": the matcher treats it as luma 0 when it
// appears in a frame and excludes it entirely when it appears in a template.

pub mod pixel {
    pub type Channel = u8;
    pub type Luminance = f32;

    pub const CHANNELS: usize = 4;

    /// A "dumb" data container representing a single RGBA pixel.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct Pixel {
        pub red: Channel,
        pub green: Channel,
        pub blue: Channel,
        pub alpha: Channel,
    }

    impl Pixel {
        pub fn new(red: Channel, green: Channel, blue: Channel, alpha: Channel) -> Self {
            Pixel { red, green, blue, alpha }
        }

        /// Reads a pixel from the first four bytes of an RGBA slice.
        #[inline]
        pub fn from_rgba(bytes: &[Channel]) -> Self {
            Pixel::new(bytes[0], bytes[1], bytes[2], bytes[3])
        }

        pub fn is_transparent(&self) -> bool {
            self.alpha == 0
        }

        /// Rec. 709 luma in 0..255, zero for fully transparent pixels.
        #[inline]
        pub fn luminance(&self) -> Luminance {
            if self.is_transparent() {
                return 0.0;
            }
            0.2126 * self.red as f32 + 0.7152 * self.green as f32 + 0.0722 * self.blue as f32
        }

        /// Integer-weighted luma. Ignores alpha.
        #[inline]
        pub fn fast_luma(&self) -> Channel {
            ((77 * self.red as u32 + 150 * self.green as u32 + 29 * self.blue as u32) >> 8) as Channel
        }

        /// Channel values as floats, zeroed when transparent.
        #[inline]
        pub fn rgb(&self) -> [f32; 3] {
            if self.is_transparent() {
                return [0.0; 3];
            }
            [self.red as f32, self.green as f32, self.blue as f32]
        }
    }
}
