// THEORY:
// The `pipeline` module is the top-level API for the statistics engine. It wraps
// unit discovery, the bounded worker pool, and the aggregation task behind a
// single `StatsPipeline::run` call that returns a `Report`.
// Its purpose is to give callers (the CLI runner, or any program that needs
// normalization constants for a dataset) one entry point and one configuration
// struct, without exposing the concurrency machinery underneath.

use crate::core_modules::aggregator::DatasetStatistics;
use crate::core_modules::unit::{Unit, UnitProcessor, discover_units};
use crate::core_modules::utils::image_helper::image_helper::{FrameDecoder, ImageDecoder};
use crate::error::{Result, StatsError};
use crate::parallel_pipeline::{AbortHandle, Scheduler};
use crate::progress::ProgressSink;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on concurrent units, regardless of how many cores the host has.
pub const DEFAULT_MAX_WORKERS: usize = 32;
pub const DEFAULT_CHANNELS: usize = 3;
pub const DEFAULT_DATA_ROOT: &str = "./20bn-jester-v1";

/// What to do when a unit fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort the run on the first failed unit and report it.
    #[default]
    FailFast,
    /// Log and exclude failed units, reporting how many were excluded.
    BestEffort,
}

/// Which variance the final standard deviation is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceConvention {
    /// Divide by the pixel count.
    #[default]
    Population,
    /// Divide by the pixel count minus one.
    Sample,
}

/// Configuration for the StatsPipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Directory holding one subdirectory per unit.
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Fixed cap on concurrent units. The effective cap is
    /// `min(max_workers, available cores)`.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Channels per pixel (1, 3 or 4).
    #[serde(default = "default_channels")]
    pub channels: usize,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Bits per source sample (8 or 16). Samples are divided by `2^bit_depth - 1`.
    #[serde(default = "default_bit_depth")]
    pub bit_depth: u8,

    #[serde(default)]
    pub variance: VarianceConvention,

    /// Optional limit on how long a single unit may take.
    #[serde(default)]
    pub unit_timeout_secs: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            max_workers: DEFAULT_MAX_WORKERS,
            channels: DEFAULT_CHANNELS,
            failure_policy: FailurePolicy::default(),
            bit_depth: default_bit_depth(),
            variance: VarianceConvention::default(),
            unit_timeout_secs: None,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a YAML or JSON file.
    /// Format is picked from the extension; anything else is read as YAML.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| StatsError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| StatsError::ConfigParse(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| StatsError::ConfigParse(e.to_string()))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| StatsError::ConfigParse(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(StatsError::Config("max_workers must be > 0".to_string()));
        }
        if !matches!(self.channels, 1 | 3 | 4) {
            return Err(StatsError::Config(format!(
                "channels must be 1, 3 or 4, got {}",
                self.channels
            )));
        }
        if !matches!(self.bit_depth, 8 | 16) {
            return Err(StatsError::Config(format!(
                "bit_depth must be 8 or 16, got {}",
                self.bit_depth
            )));
        }
        if self.unit_timeout_secs == Some(0) {
            return Err(StatsError::Config("unit_timeout_secs must be > 0".to_string()));
        }
        Ok(())
    }

    /// The effective number of concurrently processed units.
    pub fn worker_cap(&self) -> usize {
        self.max_workers.min(num_cpus::get()).max(1)
    }

    /// The sample value that normalizes to 1.0, or `None` for a depth that has
    /// no such value.
    pub fn max_sample_value(&self) -> Option<f64> {
        let levels = 1u64.checked_shl(u32::from(self.bit_depth))?;
        match levels - 1 {
            0 => None,
            max => Some(max as f64),
        }
    }

    pub fn unit_timeout(&self) -> Option<Duration> {
        self.unit_timeout_secs.map(Duration::from_secs)
    }
}

fn default_data_root() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_ROOT)
}

fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

fn default_channels() -> usize {
    DEFAULT_CHANNELS
}

fn default_bit_depth() -> u8 {
    8
}

/// A unit that was excluded from the statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFailure {
    pub unit: String,
    pub reason: String,
}

/// The outcome of a completed run.
#[derive(Debug, Clone)]
pub struct Report {
    pub statistics: DatasetStatistics,
    /// Units discovered and dispatched.
    pub units_total: usize,
    /// Units that contributed pixels. Empty units are counted separately.
    pub units_processed: usize,
    /// Units that held no frames.
    pub empty_units: Vec<String>,
    /// Units excluded under the best-effort policy.
    pub failed_units: Vec<UnitFailure>,
    pub elapsed: Duration,
}

impl Report {
    pub fn failure_count(&self) -> usize {
        self.failed_units.len()
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Units: {} processed, {} empty, {} failed, {} total; {} pixels in {:.1}s",
            self.units_processed,
            self.empty_units.len(),
            self.failure_count(),
            self.units_total,
            self.statistics.total_weight,
            self.elapsed.as_secs_f64()
        )
    }
}

/// The main, top-level struct for the statistics engine.
pub struct StatsPipeline {
    config: PipelineConfig,
    scheduler: Scheduler,
}

impl StatsPipeline {
    /// Builds a pipeline that decodes frames with the `image` crate.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let decoder = Arc::new(ImageDecoder::new(config.channels, config.bit_depth));
        Self::with_decoder(config, decoder)
    }

    /// Builds a pipeline around any frame decoder. The configuration is
    /// validated here and cannot change afterwards.
    pub fn with_decoder(config: PipelineConfig, decoder: Arc<dyn FrameDecoder>) -> Result<Self> {
        config.validate()?;
        let max_sample = config.max_sample_value().ok_or_else(|| {
            StatsError::Config(format!("bit_depth {} has no sample range", config.bit_depth))
        })?;

        let processor = Arc::new(UnitProcessor::new(decoder, config.channels, max_sample));
        let scheduler = Scheduler::new(&config, processor);
        Ok(Self { config, scheduler })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The number of units that will run at once.
    pub fn worker_cap(&self) -> usize {
        self.scheduler.capacity()
    }

    /// Lets another task stop a run that is in progress.
    pub fn abort_handle(&self) -> AbortHandle {
        self.scheduler.abort_handle()
    }

    /// Lists the units under the configured data root.
    pub fn discover(&self) -> Result<Vec<Unit>> {
        discover_units(&self.config.data_root)
    }

    /// Discovers every unit under the data root and computes the dataset statistics.
    pub async fn run(&self, progress: Box<dyn ProgressSink>) -> Result<Report> {
        let units = self.discover()?;
        tracing::info!(
            "Discovered {} units under {}",
            units.len(),
            self.config.data_root.display()
        );
        self.run_units(units, progress).await
    }

    /// Computes statistics over an explicit set of units.
    pub async fn run_units(
        &self,
        units: Vec<Unit>,
        progress: Box<dyn ProgressSink>,
    ) -> Result<Report> {
        self.config.validate()?;
        self.scheduler.run(units, progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::utils::image_helper::image_helper::save;
    use crate::error::UnitError;
    use crate::progress::NullProgress;
    use std::fs;

    #[test]
    fn defaults_match_the_reference_run() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_workers, 32);
        assert_eq!(config.channels, 3);
        assert_eq!(config.failure_policy, FailurePolicy::FailFast);
        assert_eq!(config.variance, VarianceConvention::Population);
        assert_eq!(config.max_sample_value(), Some(255.0));
        assert!(config.unit_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn worker_cap_never_exceeds_the_fixed_bound() {
        let config = PipelineConfig {
            max_workers: 2,
            ..PipelineConfig::default()
        };
        assert!(config.worker_cap() >= 1);
        assert!(config.worker_cap() <= 2);
    }

    #[test]
    fn yaml_fills_in_missing_fields() {
        let config = PipelineConfig::from_yaml(
            "data_root: /data/jester\nfailure_policy: best_effort\nbit_depth: 16\n",
        )
        .expect("parse");

        assert_eq!(config.data_root, PathBuf::from("/data/jester"));
        assert_eq!(config.failure_policy, FailurePolicy::BestEffort);
        assert_eq!(config.max_sample_value(), Some(65535.0));
        assert_eq!(config.max_workers, DEFAULT_MAX_WORKERS);
    }

    #[test]
    fn json_and_yaml_agree() {
        let from_json = PipelineConfig::from_json(
            r#"{"data_root": "frames", "max_workers": 4, "variance": "sample"}"#,
        )
        .expect("parse");
        let from_yaml = PipelineConfig::from_yaml(&from_json.to_yaml().expect("serialize"))
            .expect("parse");
        assert_eq!(from_json, from_yaml);
        assert_eq!(from_yaml.variance, VarianceConvention::Sample);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let bad = [
            PipelineConfig {
                max_workers: 0,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                channels: 2,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                bit_depth: 12,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                unit_timeout_secs: Some(0),
                ..PipelineConfig::default()
            },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(StatsError::Config(_))));
        }
    }

    #[test]
    fn out_of_range_bit_depths_are_rejected_when_building() {
        for bit_depth in [0, 1, 32, 64, 200] {
            let config = PipelineConfig {
                bit_depth,
                ..PipelineConfig::default()
            };
            assert!(matches!(StatsPipeline::new(config), Err(StatsError::Config(_))));
        }

        let zero = PipelineConfig {
            bit_depth: 0,
            ..PipelineConfig::default()
        };
        assert_eq!(zero.max_sample_value(), None);
        let wide = PipelineConfig {
            bit_depth: 200,
            ..PipelineConfig::default()
        };
        assert_eq!(wide.max_sample_value(), None);
    }

    #[test]
    fn report_display_mentions_counts() {
        let report = Report {
            statistics: DatasetStatistics {
                mean: vec![0.5],
                std_dev: vec![0.1],
                variance: vec![0.01],
                total_weight: 400,
            },
            units_total: 10,
            units_processed: 8,
            empty_units: vec!["3".to_string()],
            failed_units: vec![
                UnitFailure {
                    unit: "4".to_string(),
                    reason: "bad".to_string(),
                },
                UnitFailure {
                    unit: "5".to_string(),
                    reason: "bad".to_string(),
                },
            ],
            elapsed: Duration::from_millis(1500),
        };

        let display = report.to_string();
        assert!(display.contains("8 processed"));
        assert!(display.contains("1 empty"));
        assert!(display.contains("2 failed"));
        assert!(display.contains("400 pixels"));
    }

    #[tokio::test]
    async fn end_to_end_over_png_units() {
        let root = tempfile::tempdir().expect("temp dir");
        for (unit, value) in [("a", 255u8), ("b", 0u8), ("c", 0u8)] {
            let dir = root.path().join(unit);
            fs::create_dir(&dir).unwrap();
            save(&dir.join("00001.png"), 2, 2, 3, &[value; 12]).unwrap();
        }
        // An empty unit and a stray file next to the units.
        fs::create_dir(root.path().join("d")).unwrap();
        fs::write(root.path().join("jester-v1-labels.csv"), "Doing other things\n").unwrap();

        let pipeline = StatsPipeline::new(PipelineConfig {
            data_root: root.path().to_path_buf(),
            ..PipelineConfig::default()
        })
        .expect("pipeline");
        let report = pipeline.run(Box::new(NullProgress)).await.expect("run");

        assert_eq!(report.units_total, 4);
        assert_eq!(report.units_processed, 3);
        assert!(report.to_string().contains("3 processed, 1 empty"));
        assert_eq!(report.empty_units, vec!["d".to_string()]);
        assert_eq!(report.failure_count(), 0);
        assert_eq!(report.statistics.total_weight, 12);
        for c in 0..3 {
            assert!((report.statistics.mean[c] - 1.0 / 3.0).abs() < 1e-12);
            assert!((report.statistics.variance[c] - 2.0 / 9.0).abs() < 1e-12);
        }
    }

    #[tokio::test]
    async fn dataset_without_units_is_empty() {
        let root = tempfile::tempdir().expect("temp dir");
        let pipeline = StatsPipeline::new(PipelineConfig {
            data_root: root.path().to_path_buf(),
            ..PipelineConfig::default()
        })
        .expect("pipeline");
        let result = pipeline.run(Box::new(NullProgress)).await;
        assert!(matches!(result, Err(StatsError::EmptyDataset(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pipeline_recovers_after_a_fail_fast_run() {
        let root = tempfile::tempdir().expect("temp dir");
        for unit in ["a", "b", "c"] {
            let dir = root.path().join(unit);
            fs::create_dir(&dir).unwrap();
            save(&dir.join("00001.png"), 2, 2, 3, &[128u8; 12]).unwrap();
        }
        let broken = root.path().join("b").join("00002.png");
        fs::write(&broken, b"truncated").unwrap();

        let pipeline = StatsPipeline::new(PipelineConfig {
            data_root: root.path().to_path_buf(),
            ..PipelineConfig::default()
        })
        .expect("pipeline");

        let first = pipeline.run(Box::new(NullProgress)).await;
        match first {
            Err(StatsError::Unit(UnitError::Decode { unit, frame, .. })) => {
                assert_eq!(unit, "b");
                assert_eq!(frame, broken);
            }
            other => panic!("expected a decode failure, got {other:?}"),
        }
        assert!(!pipeline.abort_handle().is_aborted());

        save(&broken, 2, 2, 3, &[128u8; 12]).unwrap();
        let second = pipeline.run(Box::new(NullProgress)).await.expect("second run");
        assert_eq!(second.units_processed, 3);
        assert_eq!(second.statistics.total_weight, 16);
        assert!((second.statistics.mean[0] - 128.0 / 255.0).abs() < 1e-12);
    }
}
