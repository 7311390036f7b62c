//! Stalled-playback detection and correction.
//!
//! The watcher is a poll-driven state machine: the controller feeds it a
//! playback snapshot on a fixed cadence and applies whatever correction it
//! returns. Keeping the watcher free of timers makes every rule directly
//! testable.

use tracing::{debug, info};

use crate::config::StallOptions;
use crate::ranges::BufferedRanges;

/// What the player looks like at one poll.
#[derive(Clone, Debug)]
pub struct PlaybackSnapshot {
    pub current_time: f64,
    /// Ranges playable right now (intersection of all active tracks).
    pub buffered: BufferedRanges,
    /// Video track ranges, for underflow detection. Empty for audio-only
    /// content.
    pub video_buffered: BufferedRanges,
    pub seekable_start: f64,
    pub seekable_end: f64,
    /// False while paused or before playback began.
    pub playing: bool,
}

/// Correction to apply to the player.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StallAction {
    /// The playhead fell out of the live window; rejoin at its start.
    SeekToSeekableStart { to: f64 },
    /// The playhead ran past the seekable range.
    SeekToSeekableEnd { to: f64 },
    /// Audio kept playing while video ran dry; re-seek in place to reset
    /// the decode pipeline.
    ResumeVideoUnderflow { to: f64 },
    /// Jump over an unbuffered hole to the start of the next range.
    SkipGap { from: f64, to: f64 },
    /// Playback is inside buffered media but not advancing; a tiny in-place
    /// seek unsticks it.
    NudgeInPlace { to: f64 },
}

#[derive(Debug)]
pub struct StallWatcher {
    opts: StallOptions,
    last_time: Option<f64>,
    stuck_polls: u32,
    /// Gap currently being watched, armed until it persists one full poll.
    armed_gap: Option<(f64, f64)>,
}

impl StallWatcher {
    pub fn new(opts: StallOptions) -> Self {
        Self {
            opts,
            last_time: None,
            stuck_polls: 0,
            armed_gap: None,
        }
    }

    /// Forget progress history, e.g. after a seek the engine issued itself.
    pub fn reset(&mut self) {
        self.last_time = None;
        self.stuck_polls = 0;
        self.armed_gap = None;
    }

    /// Inspect one snapshot and decide whether playback needs help.
    pub fn poll(&mut self, snapshot: &PlaybackSnapshot) -> Option<StallAction> {
        if !snapshot.playing {
            self.reset();
            return None;
        }

        let progressed = self
            .last_time
            .map(|last| snapshot.current_time > last)
            .unwrap_or(true);
        self.last_time = Some(snapshot.current_time);
        if progressed {
            self.stuck_polls = 0;
            self.armed_gap = None;
            return None;
        }
        self.stuck_polls += 1;

        if let Some(action) = self.out_of_seekable(snapshot) {
            self.reset();
            return Some(action);
        }
        if let Some(action) = self.video_underflow(snapshot) {
            self.reset();
            info!(to = snapshot.current_time, "video underflow, resetting decode");
            return Some(action);
        }
        if let Some(action) = self.gap_ahead(snapshot) {
            return Some(action);
        }
        self.nudge(snapshot)
    }

    /// The playhead drifted out of the seekable window, which on a live
    /// stream slides away underneath a stalled player.
    fn out_of_seekable(&self, snapshot: &PlaybackSnapshot) -> Option<StallAction> {
        if snapshot.seekable_end <= snapshot.seekable_start {
            return None;
        }
        if snapshot.current_time < snapshot.seekable_start {
            return Some(StallAction::SeekToSeekableStart {
                to: snapshot.seekable_start,
            });
        }
        if snapshot.current_time > snapshot.seekable_end {
            return Some(StallAction::SeekToSeekableEnd {
                to: snapshot.seekable_end,
            });
        }
        None
    }

    /// Audio-led stall: overall playback position is buffered, but the
    /// video track's end trails the playhead by a window that indicates the
    /// video decoder starved while audio kept going.
    fn video_underflow(&self, snapshot: &PlaybackSnapshot) -> Option<StallAction> {
        if snapshot.video_buffered.is_empty() {
            return None;
        }
        if snapshot.video_buffered.range_containing(snapshot.current_time).is_some() {
            return None;
        }
        let video_end = snapshot.video_buffered.end()?;
        let behind = snapshot.current_time - video_end;
        if behind >= self.opts.underflow_min_behind && behind <= self.opts.underflow_max_behind {
            return Some(StallAction::ResumeVideoUnderflow {
                to: snapshot.current_time,
            });
        }
        None
    }

    /// The playhead sits in a hole with buffered media ahead. The skip is
    /// armed on first sight and fires only when the same gap is still there
    /// on the next poll, so a range mid-append is not jumped over.
    fn gap_ahead(&mut self, snapshot: &PlaybackSnapshot) -> Option<StallAction> {
        if snapshot
            .buffered
            .range_containing(snapshot.current_time)
            .is_some()
        {
            self.armed_gap = None;
            return None;
        }
        let next = snapshot.buffered.next_range_after(snapshot.current_time)?;

        match self.armed_gap {
            Some(armed) if armed == next => {
                self.armed_gap = None;
                debug!(from = snapshot.current_time, to = next.0, "skipping gap");
                Some(StallAction::SkipGap {
                    from: snapshot.current_time,
                    to: next.0 + self.opts.gap_skip_offset,
                })
            }
            _ => {
                self.armed_gap = Some(next);
                None
            }
        }
    }

    /// Inside buffered media yet stuck for several polls: some players wedge
    /// on a microscopic hole the ranges don't surface.
    fn nudge(&mut self, snapshot: &PlaybackSnapshot) -> Option<StallAction> {
        if snapshot
            .buffered
            .range_containing(snapshot.current_time)
            .is_none()
        {
            return None;
        }
        if self.stuck_polls < self.opts.stuck_polls_before_nudge {
            return None;
        }
        self.stuck_polls = 0;
        Some(StallAction::NudgeInPlace {
            to: snapshot.current_time + 0.01,
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::*;

    use super::*;

    fn snapshot(current_time: f64, buffered: Vec<(f64, f64)>) -> PlaybackSnapshot {
        PlaybackSnapshot {
            current_time,
            buffered: BufferedRanges::new(buffered.clone()),
            video_buffered: BufferedRanges::new(buffered),
            seekable_start: 0.0,
            seekable_end: 1000.0,
            playing: true,
        }
    }

    fn watcher() -> StallWatcher {
        StallWatcher::new(StallOptions::default())
    }

    #[rstest]
    fn progressing_playback_needs_nothing() {
        let mut watcher = watcher();
        assert_eq!(watcher.poll(&snapshot(1.0, vec![(0.0, 30.0)])), None);
        assert_eq!(watcher.poll(&snapshot(1.25, vec![(0.0, 30.0)])), None);
    }

    #[rstest]
    fn paused_playback_is_ignored() {
        let mut watcher = watcher();
        let mut snap = snapshot(1.0, vec![(0.0, 30.0)]);
        snap.playing = false;
        assert_eq!(watcher.poll(&snap), None);
        assert_eq!(watcher.poll(&snap), None);
    }

    #[rstest]
    fn behind_live_window_seeks_to_start() {
        let mut watcher = watcher();
        let mut snap = snapshot(5.0, vec![]);
        snap.seekable_start = 20.0;
        snap.seekable_end = 60.0;

        watcher.poll(&snap);
        let action = watcher.poll(&snap);
        assert_eq!(action, Some(StallAction::SeekToSeekableStart { to: 20.0 }));
    }

    #[rstest]
    fn past_seekable_end_seeks_back() {
        let mut watcher = watcher();
        let mut snap = snapshot(70.0, vec![]);
        snap.seekable_start = 20.0;
        snap.seekable_end = 60.0;

        watcher.poll(&snap);
        let action = watcher.poll(&snap);
        assert_eq!(action, Some(StallAction::SeekToSeekableEnd { to: 60.0 }));
    }

    #[rstest]
    fn video_underflow_resumes_in_place() {
        let mut watcher = watcher();
        let mut snap = snapshot(23.0, vec![(0.0, 30.0)]);
        // Video ran out 3 seconds ago; audio kept playing.
        snap.video_buffered = BufferedRanges::new(vec![(0.0, 20.0)]);

        watcher.poll(&snap);
        let action = watcher.poll(&snap);
        assert_eq!(action, Some(StallAction::ResumeVideoUnderflow { to: 23.0 }));
    }

    #[rstest]
    fn video_far_behind_is_not_underflow() {
        let mut watcher = watcher();
        let mut snap = snapshot(30.0, vec![(0.0, 40.0)]);
        snap.video_buffered = BufferedRanges::new(vec![(0.0, 20.0)]);

        watcher.poll(&snap);
        assert_eq!(watcher.poll(&snap), None);
    }

    #[rstest]
    fn gap_skip_fires_on_second_sighting() {
        let mut watcher = watcher();
        let snap = snapshot(8.5, vec![(0.0, 8.0), (10.0, 30.0)]);

        // First stuck poll arms the gap; the second fires.
        assert_eq!(watcher.poll(&snap), None);
        assert_eq!(watcher.poll(&snap), None);
        let action = watcher.poll(&snap);
        assert_eq!(
            action,
            Some(StallAction::SkipGap {
                from: 8.5,
                to: 10.1
            })
        );
    }

    #[rstest]
    fn moved_gap_rearms() {
        let mut watcher = watcher();
        let first = snapshot(8.5, vec![(0.0, 8.0), (10.0, 30.0)]);
        let grown = snapshot(8.5, vec![(0.0, 8.0), (9.5, 30.0)]);

        watcher.poll(&first);
        watcher.poll(&first); // arms (10.0, 30.0)
        // The range grew backwards before the skip fired; re-arm on the new
        // gap instead of jumping to a stale target.
        assert_eq!(watcher.poll(&grown), None);
        let action = watcher.poll(&grown);
        assert_eq!(
            action,
            Some(StallAction::SkipGap {
                from: 8.5,
                to: 9.6
            })
        );
    }

    #[rstest]
    fn nudges_after_enough_stuck_polls() {
        let mut watcher = watcher();
        let snap = snapshot(5.0, vec![(0.0, 30.0)]);

        let mut action = None;
        for _ in 0..6 {
            action = watcher.poll(&snap);
        }
        assert_eq!(action, Some(StallAction::NudgeInPlace { to: 5.01 }));
    }

    #[rstest]
    fn progress_resets_the_nudge_counter() {
        let mut watcher = watcher();
        let stuck = snapshot(5.0, vec![(0.0, 30.0)]);

        for _ in 0..4 {
            assert_eq!(watcher.poll(&stuck), None);
        }
        assert_eq!(watcher.poll(&snapshot(5.5, vec![(0.0, 30.0)])), None);
        // Counter restarted; four more stuck polls are not enough.
        for _ in 0..4 {
            assert_eq!(watcher.poll(&stuck), None);
        }
    }
}
