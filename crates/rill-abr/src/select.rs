use crate::types::{AbrOptions, Candidate, PlayerDimensions};

/// Candidates eligible for selection. When every rendition is excluded the
/// exclusion flag is ignored (otherwise playback would simply stop), keeping
/// only the user-disabled ones out.
fn eligible(candidates: &[Candidate]) -> Vec<&Candidate> {
    let enabled: Vec<&Candidate> = candidates.iter().filter(|c| c.enabled).collect();
    if !enabled.is_empty() {
        return enabled;
    }
    candidates.iter().filter(|c| !c.disabled).collect()
}

fn sorted_by_bandwidth<'a>(pool: &[&'a Candidate]) -> Vec<&'a Candidate> {
    let mut sorted = pool.to_vec();
    sorted.sort_by_key(|c| c.bandwidth_or_zero());
    sorted
}

/// Steady-state selector: highest-bandwidth rendition whose advertised
/// bandwidth, scaled by the variance factor, stays under the estimate;
/// optionally refined by player dimensions.
pub fn select_by_bandwidth(
    candidates: &[Candidate],
    estimate_bps: u64,
    dimensions: Option<PlayerDimensions>,
    opts: &AbrOptions,
) -> Option<usize> {
    let pool = eligible(candidates);
    let sorted = sorted_by_bandwidth(&pool);

    let within_bandwidth: Vec<&Candidate> = sorted
        .iter()
        .copied()
        .filter(|c| (c.bandwidth_or_zero() as f64) * opts.bandwidth_variance <= estimate_bps as f64)
        .collect();

    let bandwidth_pick = within_bandwidth
        .last()
        .copied()
        .or_else(|| sorted.first().copied());

    let dims = match (dimensions, opts.limit_by_player_dimensions) {
        (Some(d), true) => d,
        _ => return bandwidth_pick.map(|c| c.id),
    };

    // Among the bandwidth-appropriate renditions that advertise a resolution,
    // the smallest one that still covers the player wins; equal resolutions
    // are tie-broken by bandwidth.
    let pool_for_resolution: Vec<&Candidate> = if within_bandwidth.is_empty() {
        sorted.clone()
    } else {
        within_bandwidth
    };

    let mut covering: Vec<&Candidate> = pool_for_resolution
        .iter()
        .copied()
        .filter(|c| {
            c.resolution()
                .is_some_and(|(w, h)| w >= dims.width && h >= dims.height)
        })
        .collect();
    covering.sort_by_key(|c| {
        let (w, h) = c.resolution().unwrap_or((u32::MAX, u32::MAX));
        (w as u64 * h as u64, c.bandwidth_or_zero())
    });

    if let Some(first) = covering.first() {
        let (w, h) = first.resolution().unwrap_or((0, 0));
        let best = covering
            .iter()
            .take_while(|c| c.resolution() == Some((w, h)))
            .max_by_key(|c| c.bandwidth_or_zero());
        return best.map(|c| c.id);
    }

    let exact = pool_for_resolution
        .iter()
        .copied()
        .filter(|c| c.resolution() == Some((dims.width, dims.height)))
        .max_by_key(|c| c.bandwidth_or_zero());
    if let Some(exact) = exact {
        return Some(exact.id);
    }

    bandwidth_pick.map(|c| c.id)
}

/// Outcome of the rebuffer-minimizing selector.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RebufferChoice {
    pub id: usize,
    /// Estimated seconds of rebuffering this rendition would cause; zero or
    /// negative means the fetch finishes before the buffer runs dry.
    pub rebuffer_impact: f64,
}

/// Selector used under rebuffer pressure (and by the early-abort heuristic):
/// estimates, per rendition, how long fetching the next segment would take
/// relative to the time left before the buffer runs dry.
///
/// Without a sync point the request time is doubled: a speculative timing
/// fetch may be thrown away and repeated.
pub fn select_minimizing_rebuffer(
    candidates: &[Candidate],
    estimate_bps: u64,
    segment_duration: f64,
    time_until_rebuffer: f64,
    has_sync_point: bool,
) -> Option<RebufferChoice> {
    if estimate_bps == 0 {
        return None;
    }
    let round_trips = if has_sync_point { 1.0 } else { 2.0 };

    let mut choices: Vec<RebufferChoice> = candidates
        .iter()
        .filter(|c| c.enabled && c.bandwidth.is_some())
        .map(|c| {
            let request_time =
                segment_duration * (c.bandwidth_or_zero() as f64) / (estimate_bps as f64);
            RebufferChoice {
                id: c.id,
                rebuffer_impact: request_time * round_trips - time_until_rebuffer,
            }
        })
        .collect();

    if choices.is_empty() {
        return None;
    }

    let safe = choices
        .iter()
        .filter(|choice| choice.rebuffer_impact <= 0.0)
        .max_by_key(|choice| {
            candidates
                .iter()
                .find(|c| c.id == choice.id)
                .map(|c| c.bandwidth_or_zero())
                .unwrap_or(0)
        });
    if let Some(safe) = safe {
        return Some(*safe);
    }

    choices.sort_by(|a, b| {
        a.rebuffer_impact
            .partial_cmp(&b.rebuffer_impact)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    choices.first().copied()
}

/// First-pick selector: the lowest-bandwidth enabled rendition that carries
/// video, to minimize time to first frame. Falls back to the lowest
/// audio-only rendition when nothing has video.
pub fn select_initial_lowest(candidates: &[Candidate]) -> Option<usize> {
    let pool = eligible(candidates);
    let sorted = sorted_by_bandwidth(&pool);

    sorted
        .iter()
        .find(|c| c.has_video)
        .or_else(|| sorted.iter().find(|c| c.has_audio))
        .or_else(|| sorted.first())
        .map(|c| c.id)
}

#[cfg(test)]
mod tests {
    use rstest::*;

    use super::*;

    fn candidate(id: usize, bandwidth: u64) -> Candidate {
        Candidate {
            id,
            bandwidth: Some(bandwidth),
            width: None,
            height: None,
            enabled: true,
            disabled: false,
            has_video: true,
            has_audio: true,
        }
    }

    fn candidate_res(id: usize, bandwidth: u64, width: u32, height: u32) -> Candidate {
        Candidate {
            width: Some(width),
            height: Some(height),
            ..candidate(id, bandwidth)
        }
    }

    fn ladder() -> Vec<Candidate> {
        vec![
            candidate(0, 300_000),
            candidate(1, 800_000),
            candidate(2, 2_000_000),
            candidate(3, 5_000_000),
        ]
    }

    #[rstest]
    #[case::plenty(10_000_000, 3)]
    #[case::mid(2_500_000, 2)]
    #[case::tight(1_000_000, 1)]
    #[case::starved(100_000, 0)]
    fn bandwidth_pick_respects_variance(#[case] estimate: u64, #[case] expected: usize) {
        let opts = AbrOptions {
            bandwidth_variance: 1.2,
            ..AbrOptions::default()
        };
        let pick = select_by_bandwidth(&ladder(), estimate, None, &opts);
        assert_eq!(pick, Some(expected));
    }

    #[rstest]
    fn selector_is_idempotent() {
        let opts = AbrOptions::default();
        let first = select_by_bandwidth(&ladder(), 2_500_000, None, &opts);
        for _ in 0..10 {
            assert_eq!(select_by_bandwidth(&ladder(), 2_500_000, None, &opts), first);
        }
    }

    #[rstest]
    fn excluded_renditions_skipped_until_all_excluded() {
        let mut candidates = ladder();
        candidates[3].enabled = false;

        let opts = AbrOptions::default();
        let pick = select_by_bandwidth(&candidates, 100_000_000, None, &opts);
        assert_eq!(pick, Some(2));

        // All excluded: exclusion is ignored, disabled still honored.
        for c in &mut candidates {
            c.enabled = false;
        }
        candidates[1].disabled = true;
        let pick = select_by_bandwidth(&candidates, 100_000_000, None, &opts);
        assert_eq!(pick, Some(3));
    }

    #[rstest]
    fn resolution_refinement_prefers_smallest_covering() {
        let candidates = vec![
            candidate_res(0, 300_000, 640, 360),
            candidate_res(1, 800_000, 1280, 720),
            candidate_res(2, 2_000_000, 1920, 1080),
        ];
        let dims = PlayerDimensions {
            width: 960,
            height: 540,
        };

        let pick = select_by_bandwidth(&candidates, 100_000_000, Some(dims), &AbrOptions::default());
        assert_eq!(pick, Some(1));
    }

    #[rstest]
    fn equal_resolution_tie_broken_by_bandwidth() {
        let candidates = vec![
            candidate_res(0, 700_000, 1280, 720),
            candidate_res(1, 900_000, 1280, 720),
        ];
        let dims = PlayerDimensions {
            width: 1280,
            height: 720,
        };

        let pick = select_by_bandwidth(&candidates, 100_000_000, Some(dims), &AbrOptions::default());
        assert_eq!(pick, Some(1));
    }

    #[rstest]
    fn rebuffer_selector_prefers_highest_safe() {
        // 10s segment, 4 Mbps estimate, 8s until rebuffer: the 2 Mbps
        // rendition takes 5s (safe), the 5 Mbps one 12.5s (unsafe).
        let choice =
            select_minimizing_rebuffer(&ladder(), 4_000_000, 10.0, 8.0, true).expect("choice");
        assert_eq!(choice.id, 2);
        assert!(choice.rebuffer_impact <= 0.0);
    }

    #[rstest]
    fn rebuffer_selector_doubles_without_sync_point() {
        // Same setup, but without a sync point the 2 Mbps rendition costs
        // 10s of request time against 8s of runway.
        let choice =
            select_minimizing_rebuffer(&ladder(), 4_000_000, 10.0, 8.0, false).expect("choice");
        assert_eq!(choice.id, 1);
    }

    #[rstest]
    fn rebuffer_selector_least_negative_when_none_safe() {
        let choice =
            select_minimizing_rebuffer(&ladder(), 100_000, 10.0, 0.5, true).expect("choice");
        // Everything rebuffers; the cheapest rendition loses the least.
        assert_eq!(choice.id, 0);
        assert!(choice.rebuffer_impact > 0.0);
    }

    #[rstest]
    fn initial_pick_is_lowest_with_video() {
        let mut candidates = ladder();
        candidates[0].has_video = false;

        assert_eq!(select_initial_lowest(&candidates), Some(1));
    }

    #[rstest]
    fn initial_pick_falls_back_to_audio_only() {
        let candidates = vec![
            Candidate {
                has_video: false,
                ..candidate(0, 96_000)
            },
            Candidate {
                has_video: false,
                ..candidate(1, 256_000)
            },
        ];

        assert_eq!(select_initial_lowest(&candidates), Some(0));
    }
}
