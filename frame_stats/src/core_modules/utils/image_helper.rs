pub mod image_helper {
    use crate::core_modules::frame::frame::{Frame, Sample};
    use crate::error::DecodeError;
    use image::{DynamicImage, ImageEncoder};
    use std::path::Path;

    /// Turns a frame file into a decoded `Frame`.
    ///
    /// Implementations must be shareable across worker threads; a decoder is
    /// called concurrently for different units.
    pub trait FrameDecoder: Send + Sync {
        fn decode(&self, path: &Path) -> Result<Frame, DecodeError>;
    }

    /// Decoder backed by the `image` crate. Accepts any format `image` can open.
    #[derive(Debug, Clone)]
    pub struct ImageDecoder {
        channels: usize,
        bit_depth: u8,
    }

    impl ImageDecoder {
        pub fn new(channels: usize, bit_depth: u8) -> Self {
            Self {
                channels,
                bit_depth,
            }
        }

        fn samples(&self, image: &DynamicImage) -> Result<Vec<Sample>, DecodeError> {
            let samples = match (self.channels, self.bit_depth) {
                (1, 8) => widen(image.to_luma8().into_raw()),
                (3, 8) => widen(image.to_rgb8().into_raw()),
                (4, 8) => widen(image.to_rgba8().into_raw()),
                (1, 16) => image.to_luma16().into_raw(),
                (3, 16) => image.to_rgb16().into_raw(),
                (4, 16) => image.to_rgba16().into_raw(),
                (_, 8) | (_, 16) => {
                    return Err(DecodeError::Malformed(format!(
                        "{} channels cannot be decoded",
                        self.channels
                    )));
                }
                (_, depth) => return Err(DecodeError::UnsupportedDepth(depth)),
            };
            Ok(samples)
        }
    }

    impl FrameDecoder for ImageDecoder {
        fn decode(&self, path: &Path) -> Result<Frame, DecodeError> {
            let image = image::open(path)?;

            // Grayscale or alpha frames are not silently expanded into the configured layout.
            let found = image.color().channel_count() as usize;
            if found != self.channels {
                return Err(DecodeError::ChannelMismatch {
                    expected: self.channels,
                    found,
                });
            }

            let samples = self.samples(&image)?;
            Ok(Frame::new(image.width(), image.height(), self.channels, samples))
        }
    }

    fn widen(bytes: Vec<u8>) -> Vec<Sample> {
        bytes.into_iter().map(Sample::from).collect()
    }

    /// Writes an 8-bit buffer as a PNG. Used to build fixture datasets.
    pub fn save(
        path: &Path,
        width: u32,
        height: u32,
        channels: usize,
        buffer: &[u8],
    ) -> Result<(), image::error::ImageError> {
        let color = match channels {
            1 => image::ExtendedColorType::L8,
            4 => image::ExtendedColorType::Rgba8,
            _ => image::ExtendedColorType::Rgb8,
        };
        let output = std::fs::File::create(path)?;
        let encoder = image::codecs::png::PngEncoder::new(output);

        encoder.write_image(buffer, width, height, color)?;

        Ok(())
    }
}
