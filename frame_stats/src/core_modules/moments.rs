// THEORY:
// `ChannelMoments` is the currency of the whole engine. Every level of the
// computation (a single frame, a whole unit, the running dataset total) is
// described by the same three things per channel: a mean, a population
// variance, and the number of pixels (the weight) behind them.
//
// Key architectural principles:
// 1.  **One Combination Rule**: Two sets of moments are merged with the pooled
//     (parallel) variance formula. The same `merge` folds frames into a unit
//     and units into the dataset, so there is exactly one piece of math to
//     trust and test.
// 2.  **Exactness Under Any Grouping**: Because the merge carries the
//     between-group term `delta^2 * n_a * n_b / n`, the result is the exact
//     weighted mean/variance of everything merged so far, no matter how the
//     pixels were grouped or in which order the groups arrived.
// 3.  **Weight Is Authority**: A zero-weight set of moments is neutral. Merging
//     into an empty accumulator yields the incoming moments unchanged.

/// Per-channel mean, population variance, and pixel weight.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMoments {
    /// The per-channel mean, in normalized sample space.
    pub mean: Vec<f64>,
    /// The per-channel population variance.
    pub variance: Vec<f64>,
    /// The number of pixels these moments describe.
    pub weight: u64,
}

impl ChannelMoments {
    /// Moments of nothing: zero weight, zero mean, zero variance.
    pub fn empty(channels: usize) -> Self {
        Self {
            mean: vec![0.0; channels],
            variance: vec![0.0; channels],
            weight: 0,
        }
    }

    pub fn new(mean: Vec<f64>, variance: Vec<f64>, weight: u64) -> Self {
        debug_assert_eq!(mean.len(), variance.len());
        Self {
            mean,
            variance,
            weight,
        }
    }

    /// Computes the moments of an interleaved sample buffer (`p0c0, p0c1, ..., p1c0, ...`),
    /// multiplying every sample by `scale` first.
    ///
    /// Uses two passes over the buffer (mean, then squared deviations), which
    /// avoids the cancellation of the naive `E[x^2] - E[x]^2` form.
    pub fn from_interleaved<T>(samples: &[T], channels: usize, scale: f64) -> Self
    where
        T: Copy + Into<f64>,
    {
        if channels == 0 {
            return Self::empty(0);
        }
        let pixels = samples.len() / channels;
        if pixels == 0 {
            return Self::empty(channels);
        }

        let mut mean = vec![0.0; channels];
        for pixel in samples.chunks_exact(channels) {
            for (sum, &sample) in mean.iter_mut().zip(pixel) {
                *sum += sample.into() * scale;
            }
        }
        for sum in &mut mean {
            *sum /= pixels as f64;
        }

        let mut variance = vec![0.0; channels];
        for pixel in samples.chunks_exact(channels) {
            for ((acc, &sample), &mu) in variance.iter_mut().zip(pixel).zip(&mean) {
                let deviation = sample.into() * scale - mu;
                *acc += deviation * deviation;
            }
        }
        for acc in &mut variance {
            *acc /= pixels as f64;
        }

        Self::new(mean, variance, pixels as u64)
    }

    pub fn channels(&self) -> usize {
        self.mean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weight == 0
    }

    /// Folds `other` into `self` with the pooled variance combination.
    pub fn merge(&mut self, other: &ChannelMoments) {
        if other.weight == 0 {
            return;
        }
        if self.weight == 0 {
            self.clone_from(other);
            return;
        }
        debug_assert_eq!(self.channels(), other.channels());

        let n_a = self.weight as f64;
        let n_b = other.weight as f64;
        let n = n_a + n_b;
        let cross = n_a * n_b / n;

        for c in 0..self.mean.len() {
            let delta = other.mean[c] - self.mean[c];
            let m2 = n_a * self.variance[c] + n_b * other.variance[c] + delta * delta * cross;
            self.mean[c] += delta * (n_b / n);
            self.variance[c] = m2 / n;
        }
        self.weight += other.weight;
    }

    /// Consuming form of [`ChannelMoments::merge`].
    pub fn merged(mut self, other: &ChannelMoments) -> Self {
        self.merge(other);
        self
    }

    pub fn std_dev(&self) -> Vec<f64> {
        self.variance.iter().map(|v| v.sqrt()).collect()
    }

    /// Bessel-corrected variance. A single pixel has no spread, so it reports zero.
    pub fn sample_variance(&self) -> Vec<f64> {
        if self.weight < 2 {
            return vec![0.0; self.channels()];
        }
        let correction = self.weight as f64 / (self.weight - 1) as f64;
        self.variance.iter().map(|v| v * correction).collect()
    }
}
