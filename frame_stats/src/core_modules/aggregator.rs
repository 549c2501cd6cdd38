// THEORY:
// The `Aggregator` owns the one piece of mutable state shared by the whole run:
// the running dataset moments. It is deliberately single-owner. Workers never
// touch it; they hand their unit moments to whoever owns the aggregator (the
// aggregation task), which folds them one at a time in arrival order.
//
// Because folding uses the pooled variance combination, arrival order has no
// effect on the result beyond floating-point rounding, and the running value is
// at every moment the exact statistics of the units folded so far.

use crate::core_modules::moments::ChannelMoments;
use crate::error::StatsError;
use crate::pipeline::VarianceConvention;

/// Final dataset-wide statistics in normalized sample space.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetStatistics {
    pub mean: Vec<f64>,
    pub std_dev: Vec<f64>,
    pub variance: Vec<f64>,
    /// Total number of pixels behind the statistics.
    pub total_weight: u64,
}

/// Folds unit moments into a running total.
#[derive(Debug, Clone)]
pub struct Aggregator {
    running: ChannelMoments,
    folded: usize,
}

impl Aggregator {
    pub fn new(channels: usize) -> Self {
        Self {
            running: ChannelMoments::empty(channels),
            folded: 0,
        }
    }

    /// Folds one unit's moments into the running total.
    pub fn fold(&mut self, partial: &ChannelMoments) {
        self.running.merge(partial);
        self.folded += 1;
    }

    pub fn running(&self) -> &ChannelMoments {
        &self.running
    }

    /// Number of partial results folded so far, including zero-weight ones.
    pub fn folded(&self) -> usize {
        self.folded
    }

    pub fn total_weight(&self) -> u64 {
        self.running.weight
    }

    /// Produces the final mean and standard deviation.
    /// Fails instead of dividing by zero when nothing with weight was folded.
    pub fn finalize(self, convention: VarianceConvention) -> Result<DatasetStatistics, StatsError> {
        if self.running.is_empty() {
            return Err(StatsError::EmptyDataset(format!(
                "{} units folded but no pixels were observed",
                self.folded
            )));
        }

        let variance = match convention {
            VarianceConvention::Population => self.running.variance.clone(),
            VarianceConvention::Sample => self.running.sample_variance(),
        };
        let std_dev = variance.iter().map(|v| v.sqrt()).collect();

        Ok(DatasetStatistics {
            mean: self.running.mean,
            std_dev,
            variance,
            total_weight: self.running.weight,
        })
    }
}
