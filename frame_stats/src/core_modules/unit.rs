// THEORY:
// A `Unit` is one directory of frames (one video of the dataset) and the unit of
// parallel dispatch. The `UnitProcessor` reduces a unit to a single
// `ChannelMoments` by decoding each frame and merging the frame moments with the
// same pooled-variance rule the aggregator uses for whole units.
//
// Key architectural principles:
// 1.  **All Or Nothing**: A unit either produces moments for every one of its
//     frames or fails. A frame that will not decode fails the unit, naming both.
// 2.  **No Shared State**: Processing touches only the filesystem and local
//     variables, so any number of units can run side by side without locks.
// 3.  **Cooperative Stop**: Between frames the processor asks whether it should
//     stop. Cancellation and timeouts are observed at that boundary.

use crate::core_modules::moments::ChannelMoments;
use crate::core_modules::utils::image_helper::image_helper::FrameDecoder;
use crate::error::{DecodeError, StatsError, UnitError};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Handle to one directory of frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    /// Stable identifier, the directory name.
    pub id: String,
    /// Full path of the directory.
    pub path: PathBuf,
}

impl Unit {
    pub fn new(path: PathBuf) -> Self {
        let id = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self { id, path }
    }

    /// Every regular file directly inside the unit directory, sorted.
    pub fn frame_paths(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut frames = Vec::new();
        for entry in std::fs::read_dir(&self.path)? {
            let path = entry?.path();
            if path.is_file() {
                frames.push(path);
            }
        }
        // Order does not change the result; sorting keeps error reports reproducible.
        frames.sort();

        Ok(frames)
    }
}

/// Eagerly lists every subdirectory of `root` as a unit, sorted by identifier.
/// Entries that are not directories are ignored.
pub fn discover_units(root: &Path) -> Result<Vec<Unit>, StatsError> {
    let root_error = |source| StatsError::DatasetRoot {
        path: root.to_path_buf(),
        source,
    };

    let mut units = Vec::new();
    for entry in std::fs::read_dir(root).map_err(root_error)? {
        let path = entry.map_err(root_error)?.path();
        if path.is_dir() {
            units.push(Unit::new(path));
        }
    }
    units.sort_by(|a, b| a.id.cmp(&b.id));

    Ok(units)
}

/// Reduces a unit to its `ChannelMoments`.
pub struct UnitProcessor {
    decoder: Arc<dyn FrameDecoder>,
    channels: usize,
    max_sample: f64,
}

impl UnitProcessor {
    pub fn new(decoder: Arc<dyn FrameDecoder>, channels: usize, max_sample: f64) -> Self {
        Self {
            decoder,
            channels,
            max_sample,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Decodes every frame file of `unit` and folds their moments.
    /// `should_stop` is polled before each frame.
    pub fn process(
        &self,
        unit: &Unit,
        should_stop: &dyn Fn() -> bool,
    ) -> Result<ChannelMoments, UnitError> {
        let mut moments = ChannelMoments::empty(self.channels);

        let frame_paths = unit.frame_paths().map_err(|source| UnitError::Listing {
            unit: unit.id.clone(),
            source,
        })?;

        for frame_path in frame_paths {
            if should_stop() {
                return Err(UnitError::Cancelled {
                    unit: unit.id.clone(),
                });
            }

            let decode_error = |source| UnitError::Decode {
                unit: unit.id.clone(),
                frame: frame_path.clone(),
                source,
            };
            let frame = self.decoder.decode(&frame_path).map_err(decode_error)?;
            if frame.channels != self.channels {
                return Err(decode_error(DecodeError::ChannelMismatch {
                    expected: self.channels,
                    found: frame.channels,
                }));
            }

            moments.merge(&frame.moments(self.max_sample));
        }

        Ok(moments)
    }
}
