//! Stream-time synchronization.
//!
//! Live playlists give no absolute position: after a refresh or a rendition
//! switch the engine has to re-locate the playhead inside the new segment
//! list. Several strategies apply depending on what has been learned so far;
//! the one yielding the point nearest the target wins.

use std::collections::HashMap;

use tracing::debug;

use crate::playlist::Rendition;

/// A known correspondence between stream time and a segment index.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SyncPoint {
    pub time: f64,
    pub segment_index: usize,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Located {
    point: SyncPoint,
    distance: f64,
    strategy: &'static str,
}

/// Tracks timeline mappings, discontinuity starts, and the wall-clock
/// offset, and derives sync points from them.
#[derive(Debug, Default)]
pub struct SyncController {
    /// Offset from playlist-local time to stream time, per discontinuity
    /// sequence. Written once per timeline and never rewritten: appended
    /// media cannot move.
    timeline_offsets: HashMap<u64, f64>,
    /// Stream time at which each discontinuity sequence starts.
    discontinuity_starts: HashMap<u64, f64>,
    /// Stream time minus wall-clock date_time, learned from the first
    /// segment that carries both.
    datetime_offset: Option<f64>,
}

impl SyncController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeline_offset(&self, timeline: u64) -> Option<f64> {
        self.timeline_offsets.get(&timeline).copied()
    }

    /// Record the mapping for a timeline from a segment whose stream time is
    /// now known. First write wins.
    pub fn save_timeline_offset(&mut self, timeline: u64, playlist_time: f64, stream_time: f64) {
        let offset = stream_time - playlist_time;
        if self.timeline_offsets.contains_key(&timeline) {
            return;
        }
        debug!(timeline, offset, "timeline mapping established");
        self.timeline_offsets.insert(timeline, offset);
    }

    /// Record where a discontinuity sequence starts in stream time.
    pub fn save_discontinuity_start(&mut self, timeline: u64, stream_time: f64) {
        self.discontinuity_starts.entry(timeline).or_insert(stream_time);
    }

    /// Learn the wall-clock offset from a segment carrying both a date_time
    /// and a known stream-time start.
    pub fn save_datetime_anchor(&mut self, date_time: f64, stream_time: f64) {
        if self.datetime_offset.is_none() {
            self.datetime_offset = Some(stream_time - date_time);
        }
    }

    /// Stream-time bounds learned for `segment_index` after an append; also
    /// feeds the wall-clock and discontinuity anchors.
    pub fn save_segment_timing(&mut self, rendition: &Rendition, segment_index: usize, start: f64) {
        let Some(segment) = rendition.segments.get(segment_index) else {
            return;
        };
        let playlist_time = rendition.segments[..segment_index]
            .iter()
            .map(|s| s.duration)
            .sum::<f64>();
        self.save_timeline_offset(segment.timeline, playlist_time, start);
        if segment.discontinuity {
            self.save_discontinuity_start(segment.timeline, start);
        }
        if let Some(date_time) = segment.date_time {
            self.save_datetime_anchor(date_time, start);
        }
    }

    /// Re-anchor the playlist sync info when `expired` segments fell off the
    /// front of a live window. The anchor time advances by the durations of
    /// the segments that left, when they are known.
    pub fn expired_anchor(
        old: &Rendition,
        expired: usize,
    ) -> Option<crate::playlist::PlaylistSyncInfo> {
        if expired == 0 || expired > old.segments.len() {
            return old.sync_info;
        }
        let last_expired = &old.segments[expired - 1];
        let time = last_expired.end.or_else(|| {
            old.sync_info.and_then(|info| {
                let from = (info.media_sequence.checked_sub(old.media_sequence)?) as usize;
                if from > expired {
                    return None;
                }
                Some(
                    info.time
                        + old.segments[from..expired]
                            .iter()
                            .map(|s| s.duration)
                            .sum::<f64>(),
                )
            })
        })?;
        Some(crate::playlist::PlaylistSyncInfo {
            media_sequence: old.media_sequence + expired as u64,
            time,
        })
    }

    /// Best known sync point for `target_time` in `rendition`, or None when
    /// nothing has been learned that applies.
    pub fn sync_point(
        &self,
        rendition: &Rendition,
        target_time: f64,
        current_timeline: u64,
    ) -> Option<SyncPoint> {
        let candidates = [
            self.vod_strategy(rendition, target_time),
            self.datetime_strategy(rendition, target_time),
            self.segment_strategy(rendition, target_time, current_timeline),
            self.discontinuity_strategy(rendition, target_time, current_timeline),
            self.playlist_strategy(rendition, target_time),
        ];

        let best = candidates
            .into_iter()
            .flatten()
            .min_by(|a, b| {
                a.distance
                    .partial_cmp(&b.distance)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })?;
        debug!(
            strategy = best.strategy,
            time = best.point.time,
            segment_index = best.point.segment_index,
            "sync point chosen"
        );
        Some(best.point)
    }

    /// A finished presentation always starts at zero.
    fn vod_strategy(&self, rendition: &Rendition, target: f64) -> Option<Located> {
        if rendition.is_live() {
            return None;
        }
        Some(Located {
            point: SyncPoint {
                time: 0.0,
                segment_index: 0,
            },
            distance: target.abs(),
            strategy: "vod",
        })
    }

    /// Wall-clock tags give a point for any segment once the offset is known.
    fn datetime_strategy(&self, rendition: &Rendition, target: f64) -> Option<Located> {
        let offset = self.datetime_offset?;
        rendition
            .segments
            .iter()
            .enumerate()
            .filter_map(|(index, segment)| {
                let time = segment.date_time? + offset;
                Some(Located {
                    point: SyncPoint {
                        time,
                        segment_index: index,
                    },
                    distance: (time - target).abs(),
                    strategy: "datetime",
                })
            })
            .min_by(|a, b| {
                a.distance
                    .partial_cmp(&b.distance)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    /// A segment whose start was learned directly is exact. Only segments on
    /// the current timeline apply; a learned start across a discontinuity
    /// belongs to a different time base.
    fn segment_strategy(
        &self,
        rendition: &Rendition,
        target: f64,
        current_timeline: u64,
    ) -> Option<Located> {
        rendition
            .segments
            .iter()
            .enumerate()
            .filter(|(_, segment)| segment.timeline == current_timeline)
            .filter_map(|(index, segment)| {
                let time = segment.start?;
                Some(Located {
                    point: SyncPoint {
                        time,
                        segment_index: index,
                    },
                    distance: (time - target).abs(),
                    strategy: "segment",
                })
            })
            .min_by(|a, b| {
                a.distance
                    .partial_cmp(&b.distance)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    /// The start of the current discontinuity sequence anchors its first
    /// segment in the list.
    fn discontinuity_strategy(
        &self,
        rendition: &Rendition,
        target: f64,
        current_timeline: u64,
    ) -> Option<Located> {
        let time = *self.discontinuity_starts.get(&current_timeline)?;
        let index = rendition
            .segments
            .iter()
            .position(|s| s.timeline == current_timeline)?;
        Some(Located {
            point: SyncPoint {
                time,
                segment_index: index,
            },
            distance: (time - target).abs(),
            strategy: "discontinuity",
        })
    }

    /// The media-sequence anchor carried across refreshes.
    fn playlist_strategy(&self, rendition: &Rendition, target: f64) -> Option<Located> {
        let info = rendition.sync_info?;
        let index = info.media_sequence.checked_sub(rendition.media_sequence)? as usize;
        if index >= rendition.segments.len() {
            return None;
        }
        Some(Located {
            point: SyncPoint {
                time: info.time,
                segment_index: index,
            },
            distance: (info.time - target).abs(),
            strategy: "playlist",
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::*;

    use crate::playlist::{PlaylistSyncInfo, Rendition, Segment};

    use super::*;

    fn live_rendition(media_sequence: u64, durations: &[f64]) -> Rendition {
        let mut rendition = Rendition::new(0, "v0.m3u8");
        rendition.media_sequence = media_sequence;
        rendition.segments = durations
            .iter()
            .enumerate()
            .map(|(i, &d)| Segment::new(format!("s{i}.ts"), d))
            .collect();
        rendition
    }

    #[rstest]
    fn vod_always_syncs_at_zero() {
        let mut rendition = live_rendition(0, &[10.0, 10.0]);
        rendition.end_list = true;

        let sync = SyncController::new();
        let point = sync.sync_point(&rendition, 5.0, 0).expect("vod point");
        assert_eq!(point, SyncPoint { time: 0.0, segment_index: 0 });
    }

    #[rstest]
    fn live_without_knowledge_has_no_point() {
        let rendition = live_rendition(3, &[10.0, 10.0]);
        let sync = SyncController::new();
        assert_eq!(sync.sync_point(&rendition, 30.0, 0), None);
    }

    #[rstest]
    fn segment_strategy_uses_learned_start() {
        let mut rendition = live_rendition(3, &[10.0, 10.0, 10.0]);
        rendition.segments[1].start = Some(40.0);

        let sync = SyncController::new();
        let point = sync.sync_point(&rendition, 45.0, 0).expect("segment point");
        assert_eq!(point, SyncPoint { time: 40.0, segment_index: 1 });
    }

    #[rstest]
    fn segment_strategy_skips_other_timelines() {
        let mut rendition = live_rendition(3, &[10.0, 10.0, 10.0]);
        rendition.segments[1].timeline = 1;
        rendition.segments[1].start = Some(40.0);

        let sync = SyncController::new();
        // The learned start sits across a discontinuity from timeline 0.
        assert_eq!(sync.sync_point(&rendition, 45.0, 0), None);
        let point = sync.sync_point(&rendition, 45.0, 1).expect("point");
        assert_eq!(point, SyncPoint { time: 40.0, segment_index: 1 });
    }

    #[rstest]
    fn nearest_strategy_wins() {
        let mut rendition = live_rendition(3, &[10.0, 10.0, 10.0]);
        rendition.segments[2].start = Some(50.0);
        rendition.sync_info = Some(PlaylistSyncInfo {
            media_sequence: 3,
            time: 30.0,
        });

        let sync = SyncController::new();
        // Target near the anchor: playlist strategy is closer.
        let point = sync.sync_point(&rendition, 31.0, 0).expect("point");
        assert_eq!(point.segment_index, 0);
        // Target near the learned segment: segment strategy is closer.
        let point = sync.sync_point(&rendition, 52.0, 0).expect("point");
        assert_eq!(point.segment_index, 2);
    }

    #[rstest]
    fn datetime_strategy_applies_learned_offset() {
        let mut rendition = live_rendition(3, &[10.0, 10.0]);
        rendition.segments[0].date_time = Some(1_000_000.0);
        rendition.segments[1].date_time = Some(1_000_010.0);

        let mut sync = SyncController::new();
        sync.save_datetime_anchor(1_000_000.0, 30.0);

        let point = sync.sync_point(&rendition, 39.0, 0).expect("point");
        assert_eq!(point, SyncPoint { time: 40.0, segment_index: 1 });
    }

    #[rstest]
    fn timeline_offset_is_write_once() {
        let mut sync = SyncController::new();
        sync.save_timeline_offset(1, 0.0, 100.0);
        sync.save_timeline_offset(1, 0.0, 999.0);
        assert_eq!(sync.timeline_offset(1), Some(100.0));
    }

    #[rstest]
    fn expired_anchor_advances_by_expired_durations() {
        let mut old = live_rendition(3, &[10.0, 10.0, 10.0]);
        old.sync_info = Some(PlaylistSyncInfo {
            media_sequence: 3,
            time: 30.0,
        });

        let anchor = SyncController::expired_anchor(&old, 2).expect("anchor");
        assert_eq!(anchor.media_sequence, 5);
        assert_eq!(anchor.time, 50.0);
    }

    #[rstest]
    fn expired_anchor_prefers_learned_end() {
        let mut old = live_rendition(3, &[10.0, 10.0]);
        old.segments[0].end = Some(41.5);

        let anchor = SyncController::expired_anchor(&old, 1).expect("anchor");
        assert_eq!(anchor.media_sequence, 4);
        assert_eq!(anchor.time, 41.5);
    }

    #[rstest]
    fn save_segment_timing_feeds_all_anchors() {
        let mut rendition = live_rendition(3, &[10.0, 10.0]);
        rendition.segments[1].timeline = 1;
        rendition.segments[1].discontinuity = true;
        rendition.segments[1].date_time = Some(2_000.0);

        let mut sync = SyncController::new();
        sync.save_segment_timing(&rendition, 1, 40.0);

        assert_eq!(sync.timeline_offset(1), Some(30.0));
        let point = sync.sync_point(&rendition, 40.0, 1).expect("point");
        assert_eq!(point.segment_index, 1);
        assert_eq!(point.time, 40.0);
    }
}
