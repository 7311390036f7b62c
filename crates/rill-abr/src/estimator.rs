use std::time::{Duration, Instant};

use crate::types::{AbrOptions, BandwidthSample, BANDWIDTH_FLOOR_BPS};

/// Exponentially weighted bandwidth estimator.
///
/// Samples older than the configured window invalidate the running estimate
/// before the next sample is folded in, so a long pause does not leave a
/// stale estimate driving selection.
#[derive(Clone, Debug)]
pub struct BandwidthEstimator {
    sample_window: Duration,
    alpha: f64,
    last_update_at: Option<Instant>,
    estimate_bps: Option<f64>,
}

impl BandwidthEstimator {
    pub fn new(opts: &AbrOptions) -> Self {
        Self {
            sample_window: opts.sample_window,
            alpha: opts.smoothing,
            last_update_at: None,
            estimate_bps: None,
        }
    }

    pub fn estimate_bps(&self) -> Option<u64> {
        self.estimate_bps.map(|v| v.round() as u64)
    }

    pub fn push_sample(&mut self, sample: BandwidthSample) {
        if sample.duration == Duration::ZERO || sample.bytes == 0 {
            return;
        }

        if let Some(last_update_at) = self.last_update_at {
            if sample.at.duration_since(last_update_at) > self.sample_window {
                self.estimate_bps = None;
            }
        }

        let sample_bps = (sample.bytes as f64 * 8.0) / sample.duration.as_secs_f64();
        self.estimate_bps = Some(match self.estimate_bps {
            None => sample_bps,
            Some(prev) => self.alpha * sample_bps + (1.0 - self.alpha) * prev,
        });
        self.last_update_at = Some(sample.at);
    }

    /// Clamp the estimate to the floor after a timed-out request. The next
    /// selection falls through to the lowest renditions; a later successful
    /// download recovers the estimate through normal sampling.
    pub fn penalize_timeout(&mut self, at: Instant) {
        self.estimate_bps = Some(BANDWIDTH_FLOOR_BPS as f64);
        self.last_update_at = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(bytes: u64, millis: u64, at: Instant) -> BandwidthSample {
        BandwidthSample {
            bytes,
            duration: Duration::from_millis(millis),
            at,
        }
    }

    #[test]
    fn first_sample_sets_estimate() {
        let mut est = BandwidthEstimator::new(&AbrOptions::default());
        let now = Instant::now();

        est.push_sample(sample(125_000, 1000, now));
        assert_eq!(est.estimate_bps(), Some(1_000_000));
    }

    #[test]
    fn zero_length_sample_ignored() {
        let mut est = BandwidthEstimator::new(&AbrOptions::default());

        est.push_sample(sample(0, 100, Instant::now()));
        assert_eq!(est.estimate_bps(), None);
    }

    #[test]
    fn stale_estimate_discarded_after_window() {
        let opts = AbrOptions {
            sample_window: Duration::from_secs(10),
            ..AbrOptions::default()
        };
        let mut est = BandwidthEstimator::new(&opts);
        let t0 = Instant::now();

        est.push_sample(sample(125_000, 1000, t0));
        est.push_sample(sample(12_500, 1000, t0 + Duration::from_secs(60)));

        // The old 1 Mbps estimate is gone; only the 100 kbps sample counts.
        assert_eq!(est.estimate_bps(), Some(100_000));
    }

    #[test]
    fn timeout_clamps_to_floor() {
        let mut est = BandwidthEstimator::new(&AbrOptions::default());
        let now = Instant::now();

        est.push_sample(sample(1_250_000, 1000, now));
        est.penalize_timeout(now);
        assert_eq!(est.estimate_bps(), Some(BANDWIDTH_FLOOR_BPS));
    }
}
