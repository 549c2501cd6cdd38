// THEORY:
// Errors come in three layers. A `DecodeError` says why one frame could not be
// read. A `UnitError` says which unit failed, and for decode failures which
// frame. A `StatsError` ends a whole run.
//
// Every error that concerns a unit carries the unit's identifier, so a failed
// run can always be traced back to a directory on disk.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// A single frame could not be turned into a `Frame`.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error("expected {expected} channels, found {found}")]
    ChannelMismatch { expected: usize, found: usize },

    #[error("unsupported sample depth of {0} bits")]
    UnsupportedDepth(u8),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// A unit failed as a whole. Units never contribute partial credit.
#[derive(Error, Debug)]
pub enum UnitError {
    #[error("unit '{unit}': failed to decode frame {frame:?}: {source}")]
    Decode {
        unit: String,
        frame: PathBuf,
        #[source]
        source: DecodeError,
    },

    #[error("unit '{unit}': failed to list frames: {source}")]
    Listing {
        unit: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unit '{unit}': no result after {after:?}")]
    Timeout { unit: String, after: Duration },

    #[error("unit '{unit}': cancelled before completion")]
    Cancelled { unit: String },

    #[error("unit '{unit}': worker panicked: {message}")]
    Panicked { unit: String, message: String },
}

impl UnitError {
    /// The identifier of the unit this error belongs to.
    pub fn unit(&self) -> &str {
        match self {
            UnitError::Decode { unit, .. }
            | UnitError::Listing { unit, .. }
            | UnitError::Timeout { unit, .. }
            | UnitError::Cancelled { unit }
            | UnitError::Panicked { unit, .. } => unit,
        }
    }
}

/// Errors that end a whole run.
#[derive(Error, Debug)]
pub enum StatsError {
    #[error("failed to read dataset root {path:?}: {source}")]
    DatasetRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("empty dataset: {0}")]
    EmptyDataset(String),

    #[error(transparent)]
    Unit(#[from] UnitError),

    #[error("run aborted before all units completed")]
    Aborted,

    #[error("only {observed} of {dispatched} dispatched units reported an outcome")]
    LostUnits { observed: usize, dispatched: usize },

    #[error("aggregation task failed: {0}")]
    Aggregation(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to read configuration {path:?}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    ConfigParse(String),
}

pub type Result<T> = std::result::Result<T, StatsError>;
