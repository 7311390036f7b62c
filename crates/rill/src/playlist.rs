//! Playlist data model: renditions, segments, and the live-update merge
//! rules that keep per-segment timing across refreshes.

use std::collections::HashMap;
use std::time::Duration;

use rill_net::ByteRange;

/// Key material reference for an encrypted segment.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentKey {
    pub uri: String,
    pub iv: Option<[u8; 16]>,
}

/// Initialization segment reference. Segments sharing the same uri and range
/// share one cached init payload.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InitSegmentRef {
    pub uri: String,
    pub byte_range: Option<ByteRange>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Segment {
    pub uri: String,
    pub duration: f64,
    pub byte_range: Option<ByteRange>,
    pub key: Option<SegmentKey>,
    pub map: Option<InitSegmentRef>,
    /// Wall-clock presentation time from the playlist, seconds since epoch.
    pub date_time: Option<f64>,
    /// Stream-time bounds learned from probing or appending; playlists never
    /// carry these, refreshes must not lose them.
    pub start: Option<f64>,
    pub end: Option<f64>,
    /// Discontinuity sequence this segment belongs to.
    pub timeline: u64,
    /// True when this segment starts a new discontinuity sequence.
    pub discontinuity: bool,
}

impl Segment {
    pub fn new(uri: impl Into<String>, duration: f64) -> Self {
        Self {
            uri: uri.into(),
            duration,
            byte_range: None,
            key: None,
            map: None,
            date_time: None,
            start: None,
            end: None,
            timeline: 0,
            discontinuity: false,
        }
    }
}

/// Exclusion state of a rendition.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ExcludeUntil {
    /// Excluded until this wall-clock instant, milliseconds since epoch.
    Until(f64),
    /// Excluded for the session (codec or container incompatibility).
    Forever,
}

impl ExcludeUntil {
    pub fn is_active(&self, now_ms: f64) -> bool {
        match self {
            ExcludeUntil::Until(deadline) => *deadline > now_ms,
            ExcludeUntil::Forever => true,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, ExcludeUntil::Forever)
    }
}

/// Attributes advertised for a rendition in the multivariant document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RenditionAttributes {
    pub bandwidth: Option<u64>,
    pub codecs: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub audio_group: Option<String>,
    pub subtitle_group: Option<String>,
}

impl RenditionAttributes {
    fn codec_list(&self) -> Vec<&str> {
        self.codecs
            .as_deref()
            .map(|c| c.split(',').map(str::trim).collect())
            .unwrap_or_default()
    }

    pub fn has_video_codec(&self) -> bool {
        self.codec_list().iter().any(|c| {
            c.starts_with("avc1") || c.starts_with("hev1") || c.starts_with("hvc1")
                || c.starts_with("av01") || c.starts_with("vp09")
        })
    }

    pub fn has_audio_codec(&self) -> bool {
        self.codec_list().iter().any(|c| {
            c.starts_with("mp4a") || c.starts_with("ac-3") || c.starts_with("ec-3")
                || c.starts_with("opus") || c.starts_with("flac")
        })
    }
}

/// Media-sequence anchor: stream time of the first segment at a known
/// media sequence number. Lets a refreshed playlist be located in stream
/// time even after segments expired.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlaylistSyncInfo {
    pub media_sequence: u64,
    pub time: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Rendition {
    pub id: usize,
    pub uri: String,
    pub segments: Vec<Segment>,
    /// Sequence number of `segments[0]`.
    pub media_sequence: u64,
    pub target_duration: f64,
    pub end_list: bool,
    pub exclude_until: Option<ExcludeUntil>,
    /// User-disabled renditions never play, even when everything else is
    /// excluded.
    pub disabled: bool,
    pub attributes: RenditionAttributes,
    pub sync_info: Option<PlaylistSyncInfo>,
}

impl Rendition {
    pub fn new(id: usize, uri: impl Into<String>) -> Self {
        Self {
            id,
            uri: uri.into(),
            segments: Vec::new(),
            media_sequence: 0,
            target_duration: 10.0,
            end_list: false,
            exclude_until: None,
            disabled: false,
            attributes: RenditionAttributes::default(),
            sync_info: None,
        }
    }

    pub fn is_live(&self) -> bool {
        !self.end_list
    }

    pub fn is_excluded(&self, now_ms: f64) -> bool {
        self.exclude_until
            .as_ref()
            .is_some_and(|e| e.is_active(now_ms))
    }

    pub fn is_enabled(&self, now_ms: f64) -> bool {
        !self.disabled && !self.is_excluded(now_ms)
    }

    /// Total advertised duration of the current window.
    pub fn duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }

    /// Sequence number of the segment at `index`.
    pub fn sequence_of(&self, index: usize) -> u64 {
        self.media_sequence + index as u64
    }

    /// View of this rendition for the selectors.
    pub fn candidate(&self, now_ms: f64) -> rill_abr::Candidate {
        rill_abr::Candidate {
            id: self.id,
            bandwidth: self.attributes.bandwidth,
            width: self.attributes.width,
            height: self.attributes.height,
            enabled: self.is_enabled(now_ms),
            disabled: self.disabled,
            has_video: self.attributes.has_video_codec(),
            has_audio: self.attributes.has_audio_codec(),
        }
    }
}

/// Segment index and offset into it for a stream time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MediaPosition {
    pub media_index: usize,
    /// Seconds from the start of that segment.
    pub start_time: f64,
}

/// Walk segment durations from a known (index, start time) anchor to find
/// the segment containing `time`. Returns None when `time` falls outside the
/// current window.
pub fn media_position_for_time(
    rendition: &Rendition,
    time: f64,
    anchor_index: usize,
    anchor_time: f64,
) -> Option<MediaPosition> {
    if anchor_index > rendition.segments.len() {
        return None;
    }
    let mut start = anchor_time;

    if time >= anchor_time {
        for (offset, segment) in rendition.segments[anchor_index..].iter().enumerate() {
            let end = start + segment.duration;
            if time < end {
                return Some(MediaPosition {
                    media_index: anchor_index + offset,
                    start_time: start,
                });
            }
            start = end;
        }
        return None;
    }

    for (index, segment) in rendition.segments[..anchor_index].iter().enumerate().rev() {
        start -= segment.duration;
        if time >= start {
            return Some(MediaPosition {
                media_index: index,
                start_time: start,
            });
        }
    }
    None
}

/// Alternate-track renditions grouped by the group id the multivariant
/// document assigns them. Values are rendition ids into the manifest.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MediaGroups {
    pub audio: HashMap<String, Vec<usize>>,
    pub subtitles: HashMap<String, Vec<usize>>,
}

/// Parsed multivariant document.
#[derive(Clone, Debug, Default)]
pub struct Manifest {
    renditions: Vec<Rendition>,
    by_uri: HashMap<String, usize>,
    pub media_groups: MediaGroups,
    /// Publisher-requested refresh interval, for sources whose whole
    /// presentation lives in one document.
    pub minimum_update_period: Option<Duration>,
}

impl Manifest {
    pub fn new(renditions: Vec<Rendition>) -> Self {
        let by_uri = renditions
            .iter()
            .enumerate()
            .map(|(index, r)| (r.uri.clone(), index))
            .collect();
        Self {
            renditions,
            by_uri,
            media_groups: MediaGroups::default(),
            minimum_update_period: None,
        }
    }

    pub fn renditions(&self) -> &[Rendition] {
        &self.renditions
    }

    pub fn len(&self) -> usize {
        self.renditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.renditions.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&Rendition> {
        self.renditions.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Rendition> {
        self.renditions.get_mut(id)
    }

    pub fn by_uri(&self, uri: &str) -> Option<&Rendition> {
        self.by_uri.get(uri).and_then(|&i| self.renditions.get(i))
    }

    pub fn by_uri_mut(&mut self, uri: &str) -> Option<&mut Rendition> {
        match self.by_uri.get(uri) {
            Some(&i) => self.renditions.get_mut(i),
            None => None,
        }
    }

    /// Candidate views of the variant renditions. Renditions that exist as
    /// alternate-track group members never compete in main selection.
    pub fn candidates(&self, now_ms: f64) -> Vec<rill_abr::Candidate> {
        self.renditions
            .iter()
            .filter(|r| !self.is_group_member(r.id))
            .map(|r| r.candidate(now_ms))
            .collect()
    }

    fn is_group_member(&self, id: usize) -> bool {
        self.media_groups
            .audio
            .values()
            .chain(self.media_groups.subtitles.values())
            .any(|ids| ids.contains(&id))
    }

    /// Alternate-audio renditions in `rendition`'s audio group.
    pub fn alternate_audio(&self, rendition: &Rendition) -> Vec<&Rendition> {
        self.group_members(
            rendition.attributes.audio_group.as_deref(),
            &self.media_groups.audio,
        )
    }

    /// Subtitle renditions in `rendition`'s subtitle group.
    pub fn subtitle_tracks(&self, rendition: &Rendition) -> Vec<&Rendition> {
        self.group_members(
            rendition.attributes.subtitle_group.as_deref(),
            &self.media_groups.subtitles,
        )
    }

    fn group_members(
        &self,
        group: Option<&str>,
        groups: &HashMap<String, Vec<usize>>,
    ) -> Vec<&Rendition> {
        let Some(group) = group else {
            return Vec::new();
        };
        groups
            .get(group)
            .map(|ids| ids.iter().filter_map(|&id| self.get(id)).collect())
            .unwrap_or_default()
    }
}

/// Result of merging a refreshed media playlist over the previous one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Same window, no new segments.
    Unchanged,
    /// The window advanced or grew; `expired` segments fell off the front.
    Updated { expired: usize },
}

/// Merge a refreshed playlist into the previous one, carrying learned
/// per-segment timing forward.
///
/// A refresh is unchanged when segment count, end-list flag, and media
/// sequence all match. Otherwise segments are aligned by sequence number:
/// old index `i` corresponds to new index `i - k` where `k` is the sequence
/// advance. Fields the playlist authoritatively restates (duration, uri,
/// byte range) come from the new document; learned fields (start, end) and
/// a date_time the new document dropped are preserved from the old.
pub fn merge_rendition(old: &Rendition, new: Rendition) -> (Rendition, MergeOutcome) {
    let unchanged = old.segments.len() == new.segments.len()
        && old.end_list == new.end_list
        && old.media_sequence == new.media_sequence;
    if unchanged {
        let mut merged = new;
        carry_segment_fields(old, &mut merged, 0);
        merged.sync_info = merged.sync_info.or(old.sync_info);
        return (merged, MergeOutcome::Unchanged);
    }

    let advance = new.media_sequence.saturating_sub(old.media_sequence) as usize;
    let expired = advance.min(old.segments.len());

    let mut merged = new;
    carry_segment_fields(old, &mut merged, advance);
    merged.sync_info = merged.sync_info.or(old.sync_info);
    (merged, MergeOutcome::Updated { expired })
}

fn carry_segment_fields(old: &Rendition, new: &mut Rendition, advance: usize) {
    for (old_index, old_segment) in old.segments.iter().enumerate().skip(advance) {
        let Some(new_segment) = new.segments.get_mut(old_index - advance) else {
            break;
        };
        new_segment.start = new_segment.start.or(old_segment.start);
        new_segment.end = new_segment.end.or(old_segment.end);
        new_segment.date_time = new_segment.date_time.or(old_segment.date_time);
    }
}

/// Delay before the next live refresh. A changed playlist is polled again
/// after its last segment's duration; an unchanged one at half the target
/// duration, so a late segment is picked up quickly.
pub fn refresh_delay(rendition: &Rendition, changed: bool) -> Duration {
    if changed {
        let last = rendition.segments.last().map(|s| s.duration).unwrap_or(0.0);
        Duration::from_millis((last * 1000.0) as u64)
    } else {
        Duration::from_millis((rendition.target_duration * 500.0) as u64)
    }
}
