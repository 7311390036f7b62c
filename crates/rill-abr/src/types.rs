use std::time::{Duration, Instant};

/// Lowest bandwidth estimate the engine will report. Timed-out segment
/// requests clamp the estimate here so the next selection falls through to
/// the lowest renditions instead of retrying the same one.
pub const BANDWIDTH_FLOOR_BPS: u64 = 16_000;

/// One measured download used to update the bandwidth estimate.
#[derive(Clone, Copy, Debug)]
pub struct BandwidthSample {
    pub bytes: u64,
    pub duration: Duration,
    pub at: Instant,
}

/// A rendition as seen by the selectors: the attributes that matter for
/// selection, nothing else.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candidate {
    /// Index of the rendition in the manifest.
    pub id: usize,
    /// Advertised bandwidth in bits per second, if the manifest carries one.
    pub bandwidth: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Not user-disabled and not currently excluded.
    pub enabled: bool,
    /// User-disabled, independent of exclusion.
    pub disabled: bool,
    pub has_video: bool,
    pub has_audio: bool,
}

impl Candidate {
    pub fn bandwidth_or_zero(&self) -> u64 {
        self.bandwidth.unwrap_or(0)
    }

    pub fn resolution(&self) -> Option<(u32, u32)> {
        match (self.width, self.height) {
            (Some(w), Some(h)) => Some((w, h)),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlayerDimensions {
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Debug)]
pub struct AbrOptions {
    /// Safety factor applied to the advertised bandwidth of a rendition
    /// before comparing it against the estimate.
    pub bandwidth_variance: f64,
    /// Refine the bandwidth pick by player dimensions when they are known.
    pub limit_by_player_dimensions: bool,
    /// Estimates older than this are discarded before the next sample.
    pub sample_window: Duration,
    /// EWMA smoothing factor for new samples.
    pub smoothing: f64,
}

impl Default for AbrOptions {
    fn default() -> Self {
        Self {
            bandwidth_variance: 1.2,
            limit_by_player_dimensions: true,
            sample_window: Duration::from_secs(30),
            smoothing: 0.3,
        }
    }
}
