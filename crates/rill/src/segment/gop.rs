//! Group-of-pictures cache for fast rendition switches.
//!
//! When the playhead is inside already-buffered video and a switch replaces
//! it, the replacement must start on a keyframe boundary that lines up with
//! what is already appended, or the sink shows a glitch at the seam.

use std::collections::VecDeque;

/// One appended group of pictures.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Gop {
    pub pts: f64,
    pub dts: f64,
    pub duration: f64,
    pub byte_length: u64,
}

impl Gop {
    pub fn end(&self) -> f64 {
        self.pts + self.duration
    }
}

/// How to join replacement video onto what is already buffered.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SwitchAlignment {
    /// Start the replacement at the end of a cached group; the seam falls
    /// on a keyframe boundary.
    FuseAt { time: f64 },
    /// No usable group: stretch the last appended keyframe over the gap.
    ExtendKeyframe { by: f64 },
}

/// Recent groups of pictures, newest last.
#[derive(Debug)]
pub struct GopCache {
    gops: VecDeque<Gop>,
    capacity: usize,
}

impl Default for GopCache {
    fn default() -> Self {
        Self::new(6)
    }
}

impl GopCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            gops: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.gops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gops.is_empty()
    }

    pub fn push(&mut self, gop: Gop) {
        if self.gops.len() == self.capacity {
            self.gops.pop_front();
        }
        self.gops.push_back(gop);
    }

    /// Groups crossing a discontinuity are useless for alignment.
    pub fn clear(&mut self) {
        self.gops.clear();
    }

    /// Latest cached group ending at or before `time`.
    fn group_ending_before(&self, time: f64) -> Option<&Gop> {
        self.gops.iter().rev().find(|g| g.end() <= time)
    }

    /// Decide how replacement video joins the buffer at `switch_time`.
    ///
    /// Fusing needs a cached group from the same codec configuration, lying
    /// inside the current timeline, whose end is within half a second of the
    /// switch point. Anything else falls back to stretching the keyframe.
    pub fn alignment_for_switch(
        &self,
        switch_time: f64,
        timeline_start: f64,
        same_codec_config: bool,
    ) -> SwitchAlignment {
        if same_codec_config {
            if let Some(gop) = self.group_ending_before(switch_time) {
                let gap = switch_time - gop.end();
                if gop.pts >= timeline_start && gap <= 0.5 {
                    return SwitchAlignment::FuseAt { time: gop.end() };
                }
            }
        }
        SwitchAlignment::ExtendKeyframe {
            by: (switch_time - timeline_start).max(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::*;

    use super::*;

    fn gop(pts: f64, duration: f64) -> Gop {
        Gop {
            pts,
            dts: pts,
            duration,
            byte_length: 100_000,
        }
    }

    #[rstest]
    fn cache_evicts_oldest() {
        let mut cache = GopCache::new(3);
        for i in 0..5 {
            cache.push(gop(i as f64, 1.0));
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(
            cache.alignment_for_switch(3.2, 0.0, true),
            SwitchAlignment::FuseAt { time: 3.0 }
        );
    }

    #[rstest]
    fn fuses_on_nearby_group_boundary() {
        let mut cache = GopCache::default();
        cache.push(gop(10.0, 2.0));
        cache.push(gop(12.0, 2.0));

        assert_eq!(
            cache.alignment_for_switch(14.3, 0.0, true),
            SwitchAlignment::FuseAt { time: 14.0 }
        );
    }

    #[rstest]
    fn distant_group_extends_keyframe_instead() {
        let mut cache = GopCache::default();
        cache.push(gop(10.0, 2.0));

        assert_eq!(
            cache.alignment_for_switch(14.0, 10.0, true),
            SwitchAlignment::ExtendKeyframe { by: 4.0 }
        );
    }

    fn assert_extends_by(alignment: SwitchAlignment, expected: f64) {
        match alignment {
            SwitchAlignment::ExtendKeyframe { by } => {
                assert!((by - expected).abs() < 1e-9, "extended by {by}");
            }
            other => panic!("expected keyframe extension, got {other:?}"),
        }
    }

    #[rstest]
    fn config_change_never_fuses() {
        let mut cache = GopCache::default();
        cache.push(gop(10.0, 2.0));

        assert_extends_by(cache.alignment_for_switch(12.1, 11.0, false), 1.1);
    }

    #[rstest]
    fn group_before_timeline_start_is_rejected() {
        let mut cache = GopCache::default();
        cache.push(gop(10.0, 2.0));

        // The cached group starts before the current discontinuity.
        assert_extends_by(cache.alignment_for_switch(12.2, 11.5, true), 0.7);
    }
}
