/// Normalized, ordered set of buffered time intervals.
///
/// Mirrors the time-ranges view a media sink reports: non-overlapping,
/// ascending `[start, end)` pairs in seconds.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BufferedRanges {
    ranges: Vec<(f64, f64)>,
}

impl BufferedRanges {
    pub fn new(mut ranges: Vec<(f64, f64)>) -> Self {
        ranges.retain(|(start, end)| end > start);
        ranges.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut merged: Vec<(f64, f64)> = Vec::with_capacity(ranges.len());
        for (start, end) in ranges {
            match merged.last_mut() {
                Some((_, last_end)) if start <= *last_end => {
                    *last_end = last_end.max(end);
                }
                _ => merged.push((start, end)),
            }
        }
        Self { ranges: merged }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn as_slice(&self) -> &[(f64, f64)] {
        &self.ranges
    }

    pub fn start(&self) -> Option<f64> {
        self.ranges.first().map(|r| r.0)
    }

    pub fn end(&self) -> Option<f64> {
        self.ranges.last().map(|r| r.1)
    }

    /// The range containing `time`, if any.
    pub fn range_containing(&self, time: f64) -> Option<(f64, f64)> {
        self.ranges
            .iter()
            .copied()
            .find(|(start, end)| *start <= time && time < *end)
    }

    /// The first range starting strictly after `time`. Used to find gaps
    /// ahead of the playhead.
    pub fn next_range_after(&self, time: f64) -> Option<(f64, f64)> {
        self.ranges.iter().copied().find(|(start, _)| *start > time)
    }

    /// Seconds buffered contiguously ahead of `time`. Zero when `time` sits
    /// in a gap.
    pub fn forward_duration(&self, time: f64) -> f64 {
        self.range_containing(time)
            .map(|(_, end)| end - time)
            .unwrap_or(0.0)
    }

    /// Intersection with another set of ranges. The result is the time both
    /// tracks have buffered.
    pub fn intersect(&self, other: &BufferedRanges) -> BufferedRanges {
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let (a_start, a_end) = self.ranges[i];
            let (b_start, b_end) = other.ranges[j];
            let start = a_start.max(b_start);
            let end = a_end.min(b_end);
            if end > start {
                out.push((start, end));
            }
            if a_end < b_end {
                i += 1;
            } else {
                j += 1;
            }
        }
        BufferedRanges { ranges: out }
    }

    /// Total buffered seconds across all ranges.
    pub fn total_duration(&self) -> f64 {
        self.ranges.iter().map(|(start, end)| end - start).sum()
    }
}

impl From<Vec<(f64, f64)>> for BufferedRanges {
    fn from(ranges: Vec<(f64, f64)>) -> Self {
        Self::new(ranges)
    }
}
