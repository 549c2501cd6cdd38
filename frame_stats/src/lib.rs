// THEORY:
// This file is the main entry point for the `frame_stats` library crate.
// It defines the public API exposed to external consumers (like the
// `stats_runner` command-line tool).
//
// The primary goal is to export the `StatsPipeline` and its associated data
// structures (`PipelineConfig`, `Report`, etc.) as the high-level interface to
// the engine. The reduction math and the unit/frame plumbing live in
// `core_modules`; the bounded worker pool and the aggregation task live in
// `parallel_pipeline`.

pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;
pub mod progress;

pub use core_modules::aggregator::{Aggregator, DatasetStatistics};
pub use core_modules::moments::ChannelMoments;
pub use core_modules::unit::{Unit, UnitProcessor, discover_units};
pub use core_modules::utils::image_helper::image_helper::{FrameDecoder, ImageDecoder};
pub use error::{DecodeError, StatsError, UnitError};
pub use parallel_pipeline::{AbortHandle, Scheduler, WorkerPool};
pub use pipeline::{
    FailurePolicy, PipelineConfig, Report, StatsPipeline, UnitFailure, VarianceConvention,
};
pub use progress::{BarProgress, NullProgress, ProgressEvent, ProgressSink, UnitStatus};
