// THEORY:
// The `Frame` module represents one decoded image: a 2D grid of pixels with a
// fixed number of interleaved channels. It is a "dumb" data container that
// lives only for as long as it takes to reduce it to its `ChannelMoments`.
//
// Key architectural principles:
// 1.  **Transient Data**: A frame is decoded, summarized, and dropped. Nothing
//     downstream ever sees pixel data, which is what keeps memory flat no matter
//     how large the dataset is.
// 2.  **Depth-Agnostic Samples**: Samples are stored as `u16` so that both 8-bit
//     and 16-bit sources fit. The caller supplies the maximum sample value and the
//     frame normalizes into [0, 1] while summarizing.
// 3.  **Spatial Reduction Only**: A frame knows how to compute its own per-channel
//     mean and variance. It does not know about other frames or units.

pub mod frame {
    use crate::core_modules::moments::ChannelMoments;

    pub type Sample = u16;

    /// A decoded image, stored row-major with interleaved channels.
    #[derive(Debug, Clone)]
    pub struct Frame {
        /// The width of the frame in pixels.
        pub width: u32,
        /// The height of the frame in pixels.
        pub height: u32,
        /// Number of interleaved channels per pixel.
        pub channels: usize,
        /// `width * height * channels` raw samples.
        pub samples: Vec<Sample>,
    }

    impl Frame {
        pub fn new(width: u32, height: u32, channels: usize, samples: Vec<Sample>) -> Self {
            debug_assert_eq!(samples.len(), width as usize * height as usize * channels);
            Self {
                width,
                height,
                channels,
                samples,
            }
        }

        /// Widens an 8-bit buffer into a frame.
        pub fn from_bytes(width: u32, height: u32, channels: usize, bytes: &[u8]) -> Self {
            Self::new(
                width,
                height,
                channels,
                bytes.iter().map(|&b| Sample::from(b)).collect(),
            )
        }

        pub fn pixel_count(&self) -> u64 {
            self.width as u64 * self.height as u64
        }

        /// Per-channel moments of this frame in normalized space.
        /// `max_sample` is the value that maps to 1.0 (255 for 8-bit sources).
        pub fn moments(&self, max_sample: f64) -> ChannelMoments {
            ChannelMoments::from_interleaved(&self.samples, self.channels, 1.0 / max_sample)
        }
    }
}
