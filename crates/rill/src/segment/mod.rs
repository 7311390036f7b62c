//! Segment fetching and the decisions around it: when to request, what to
//! request, when to give up on an in-flight request, and what to trim.

mod gop;

pub use gop::{Gop, GopCache, SwitchAlignment};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use rill_abr::Candidate;
use rill_net::{ByteRange, RequestOptions, Transport};
use tracing::{debug, trace};
use url::Url;

use crate::coordinator::BufferCoordinator;
use crate::error::{EngineError, EngineResult};
use crate::events::EventEmitter;
use crate::playlist::{media_position_for_time, InitSegmentRef, Rendition, Segment};
use crate::ranges::BufferedRanges;
use crate::services::{
    BufferKind, Decrypter, TimingInfo, TrackInfo, TransmuxEvent, TransmuxJob, TransmuxQueue,
    Transmuxer,
};
use crate::sync::SyncPoint;

/// Which elementary track a loader feeds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrackType {
    /// Muxed or video-led content; owns timestamp offsets and duration.
    Main,
    /// Alternate audio.
    Audio,
    Subtitle,
}

/// Loader lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoaderPhase {
    Init,
    Ready,
    /// No segment needed right now; the buffer goal is met.
    Waiting,
    Appending,
    Disposed,
}

/// A decided segment request.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentRequest {
    pub media_index: usize,
    /// Stream time the segment is believed to start at, when known.
    pub start_time: Option<f64>,
    /// The request exists only to learn timing; its media may land outside
    /// the target range and must not move the playhead.
    pub is_sync_request: bool,
}

/// Decide the next segment to request, if any.
///
/// Before playback has started only one second of media is fetched; there
/// is no point racing ahead of a playhead that may never start. Afterwards
/// the loader fills forward until the buffer goal is met. Without any sync
/// point on a live stream the first request is a timing probe taken a few
/// segments back from the live edge.
pub fn next_request(
    rendition: &Rendition,
    buffered: &BufferedRanges,
    current_time: f64,
    buffer_goal: f64,
    has_played: bool,
    sync_point: Option<SyncPoint>,
    last_requested_index: Option<usize>,
) -> Option<SegmentRequest> {
    if rendition.segments.is_empty() {
        return None;
    }

    let forward = buffered.forward_duration(current_time);
    if !has_played && forward >= 1.0 {
        return None;
    }
    if forward >= buffer_goal {
        return None;
    }

    // Continue sequentially once a position is established.
    if let Some(last) = last_requested_index {
        let next = last + 1;
        if next >= rendition.segments.len() {
            return None;
        }
        return Some(SegmentRequest {
            media_index: next,
            start_time: rendition.segments[next].start,
            is_sync_request: false,
        });
    }

    // First request: locate the playhead (or the end of what is buffered).
    let target_time = if forward > 0.0 {
        current_time + forward
    } else {
        current_time
    };

    if let Some(sync) = sync_point {
        if let Some(position) =
            media_position_for_time(rendition, target_time, sync.segment_index, sync.time)
        {
            return Some(SegmentRequest {
                media_index: position.media_index,
                start_time: Some(position.start_time),
                is_sync_request: false,
            });
        }
    }

    if !rendition.is_live() {
        let position = media_position_for_time(rendition, target_time, 0, 0.0)?;
        return Some(SegmentRequest {
            media_index: position.media_index,
            start_time: Some(position.start_time),
            is_sync_request: false,
        });
    }

    // Live with no usable sync point: probe for timing behind the edge so
    // the learned mapping covers the segments about to be requested.
    let probe = rendition.segments.len().saturating_sub(3);
    Some(SegmentRequest {
        media_index: probe,
        start_time: None,
        is_sync_request: true,
    })
}

/// Selection state a download needs to judge abandoning itself mid-flight.
#[derive(Clone, Debug)]
pub struct AbortContext {
    pub candidates: Vec<Candidate>,
    /// Seconds of buffer left ahead of the playhead when the request began.
    pub time_until_rebuffer: f64,
    pub has_sync_point: bool,
}

/// Snapshot of an in-flight request for the early-abort decision.
#[derive(Clone, Copy, Debug)]
pub struct AbortCheck {
    pub bytes_received: u64,
    pub elapsed: Duration,
    pub segment_duration: f64,
    /// Advertised bits per second of the rendition being fetched.
    pub current_bandwidth: u64,
    pub time_until_rebuffer: f64,
    pub has_sync_point: bool,
}

impl AbortCheck {
    /// Bits per second measured on this request so far.
    pub fn measured_bandwidth(&self) -> u64 {
        let seconds = self.elapsed.as_secs_f64();
        if seconds <= 0.0 {
            return 0;
        }
        ((self.bytes_received * 8) as f64 / seconds) as u64
    }

    /// Whether to abandon the request in favour of another rendition.
    ///
    /// Needs at least a second of measurement to trust the numbers. The
    /// request is abandoned only when it can no longer finish before the
    /// buffer runs dry and some other rendition demonstrably can do better.
    pub fn should_abort(&self, candidates: &[Candidate], current_id: usize) -> Option<usize> {
        if self.elapsed < Duration::from_secs(1) {
            return None;
        }
        let measured = self.measured_bandwidth();
        if measured == 0 {
            return None;
        }

        let total_bits = self.segment_duration * self.current_bandwidth as f64;
        let remaining_bits = (total_bits - (self.bytes_received * 8) as f64).max(0.0);
        let time_remaining = remaining_bits / measured as f64;
        if time_remaining <= self.time_until_rebuffer {
            return None;
        }

        let choice = rill_abr::select_minimizing_rebuffer(
            candidates,
            measured,
            self.segment_duration,
            self.time_until_rebuffer,
            self.has_sync_point,
        )?;
        let current_impact = time_remaining - self.time_until_rebuffer;
        if choice.id != current_id && choice.rebuffer_impact < current_impact {
            return Some(choice.id);
        }
        None
    }
}

/// Range of played-out media to drop behind the playhead, if any.
///
/// Never trims closer than one target duration behind the playhead, and
/// never ahead of the seekable start.
pub fn back_buffer_trim(
    current_time: f64,
    seekable_start: f64,
    target_duration: f64,
    back_buffer: f64,
) -> Option<(f64, f64)> {
    let trim_to = seekable_start
        .max(current_time - back_buffer)
        .min(current_time - target_duration);
    (trim_to > 0.0).then_some((0.0, trim_to))
}

/// Half a frame at 30fps; timing disagreements under this are noise.
const TIMING_EPSILON: f64 = 1.0 / 60.0;

/// Timestamp offset to apply before appending `segment_start`, or None when
/// the current offset still stands.
///
/// Only the main loader moves offsets; alternate tracks inherit its
/// decision. An offset changes exactly when a new timeline begins, and
/// lands at the end of what is already buffered so the new timeline plays
/// gaplessly after the old one. With nothing buffered, the learned end of
/// the previous segment overrides the playlist-derived start when the two
/// disagree: the playlist start can include lead-in the demuxer dropped.
pub fn timestamp_offset_update(
    track: TrackType,
    starts_new_timeline: bool,
    segment_start: f64,
    previous_segment_end: Option<f64>,
    buffered_end: Option<f64>,
) -> Option<f64> {
    if track != TrackType::Main || !starts_new_timeline {
        return None;
    }
    let start = match previous_segment_end {
        Some(end) if (end - segment_start).abs() > TIMING_EPSILON => end,
        _ => segment_start,
    };
    Some(buffered_end.unwrap_or(start))
}

/// Timing and track facts learned from one completed segment.
#[derive(Clone, Debug, Default)]
pub struct SegmentOutcome {
    pub track_info: Option<TrackInfo>,
    pub audio_timing: Option<TimingInfo>,
    pub video_timing: Option<TimingInfo>,
    pub bytes_received: u64,
    pub elapsed: Duration,
    pub baseline_dts: Option<f64>,
    /// Request generation this outcome belongs to; stale generations must
    /// be discarded by the caller.
    pub generation: u64,
    /// The download was abandoned because the rendition cannot finish in
    /// time. Nothing was appended; only the bandwidth fields are meaningful.
    pub aborted: bool,
}

impl SegmentOutcome {
    /// Earliest start across tracks.
    pub fn start(&self) -> Option<f64> {
        match (self.audio_timing, self.video_timing) {
            (Some(a), Some(v)) => Some(a.start.min(v.start)),
            (Some(a), None) => Some(a.start),
            (None, Some(v)) => Some(v.start),
            (None, None) => None,
        }
    }

    /// Latest end across tracks.
    pub fn end(&self) -> Option<f64> {
        match (self.audio_timing, self.video_timing) {
            (Some(a), Some(v)) => Some(a.end.max(v.end)),
            (Some(a), None) => Some(a.end),
            (None, Some(v)) => Some(v.end),
            (None, None) => None,
        }
    }
}

/// Fetches one segment at a time for a single track: key and init segment
/// in parallel with the body, decrypt, transmux, and hand the results to
/// the buffer coordinator.
pub struct SegmentLoader {
    track: TrackType,
    transport: Arc<dyn Transport>,
    decrypter: Option<Arc<dyn Decrypter>>,
    transmux: Arc<TransmuxQueue<Box<dyn Transmuxer>>>,
    emitter: EventEmitter,
    base_url: Url,
    init_cache: HashMap<InitSegmentRef, Bytes>,
    key_cache: HashMap<String, Bytes>,
    gops: GopCache,
    baseline_dts: Option<f64>,
    generation: u64,
    phase: LoaderPhase,
}

/// Outcome of one body download.
enum BodyFetch {
    Complete(Bytes),
    /// Abandoned mid-flight; only the byte count is meaningful.
    Aborted { bytes_received: u64 },
}

impl SegmentLoader {
    pub fn new(
        track: TrackType,
        transport: Arc<dyn Transport>,
        decrypter: Option<Arc<dyn Decrypter>>,
        transmux: Arc<TransmuxQueue<Box<dyn Transmuxer>>>,
        emitter: EventEmitter,
        base_url: Url,
    ) -> Self {
        Self {
            track,
            transport,
            decrypter,
            transmux,
            emitter,
            base_url,
            init_cache: HashMap::new(),
            key_cache: HashMap::new(),
            gops: GopCache::default(),
            baseline_dts: None,
            generation: 0,
            phase: LoaderPhase::Init,
        }
    }

    pub fn track(&self) -> TrackType {
        self.track
    }

    pub fn phase(&self) -> LoaderPhase {
        self.phase
    }

    /// Invalidate any in-flight work. Outcomes carrying an older generation
    /// must be dropped by the caller.
    pub fn abort(&mut self) {
        self.generation += 1;
        if self.phase != LoaderPhase::Disposed {
            self.phase = LoaderPhase::Ready;
        }
    }

    /// The buffer goal is met; nothing to fetch until the playhead moves.
    pub fn wait(&mut self) {
        if self.phase == LoaderPhase::Ready {
            self.phase = LoaderPhase::Waiting;
        }
    }

    pub fn dispose(&mut self) {
        self.generation += 1;
        self.phase = LoaderPhase::Disposed;
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// A rendition switch restarts decode-time tracking; cached groups of
    /// pictures from the old rendition are useless for future alignment.
    pub fn reset_timeline(&mut self) {
        self.baseline_dts = None;
        self.gops.clear();
    }

    /// Where replacement media from a new rendition can join what this
    /// loader already appended.
    pub fn alignment_for_switch(
        &self,
        switch_time: f64,
        timeline_start: f64,
        same_codec_config: bool,
    ) -> SwitchAlignment {
        self.gops
            .alignment_for_switch(switch_time, timeline_start, same_codec_config)
    }

    /// Fetch, decrypt, transmux one segment and queue its media for append.
    ///
    /// `timestamp_offset` must already reflect any timeline decision made
    /// by the caller. The returned outcome carries learned timing and the
    /// bandwidth sample.
    pub async fn load_segment(
        &mut self,
        rendition: &Rendition,
        media_index: usize,
        timestamp_offset: f64,
        abort: Option<&AbortContext>,
        coordinator: &mut BufferCoordinator,
    ) -> EngineResult<SegmentOutcome> {
        if self.phase == LoaderPhase::Disposed {
            return Err(EngineError::Cancelled);
        }
        let segment = rendition
            .segments
            .get(media_index)
            .ok_or_else(|| EngineError::SegmentNotFound(format!("index {media_index}")))?
            .clone();
        let generation = self.generation;
        self.phase = LoaderPhase::Appending;

        let started = Instant::now();
        let ((key, init), body) = futures::try_join!(
            self.fetch_aux(&segment),
            self.fetch_body(&segment, rendition, started, abort),
        )?;
        let mut body = match body {
            BodyFetch::Complete(bytes) => bytes,
            BodyFetch::Aborted { bytes_received } => {
                debug!(
                    rendition = rendition.id,
                    media_index,
                    bytes = bytes_received,
                    "download abandoned, rendition cannot keep up"
                );
                self.phase = LoaderPhase::Ready;
                return Ok(SegmentOutcome {
                    bytes_received,
                    elapsed: started.elapsed(),
                    generation,
                    aborted: true,
                    ..SegmentOutcome::default()
                });
            }
        };
        let bytes_received = (body.len()
            + key.as_ref().map(|k| k.len()).unwrap_or(0)
            + init.as_ref().map(|i| i.len()).unwrap_or(0)) as u64;
        let elapsed = started.elapsed();

        if let Some(key_ref) = segment.key.as_ref() {
            if let Some(fresh) = key {
                self.key_cache.insert(key_ref.uri.clone(), fresh);
            }
            let key_bytes = self
                .key_cache
                .get(&key_ref.uri)
                .cloned()
                .ok_or_else(|| EngineError::KeyProcessing("key unavailable".into()))?;
            let decrypter = self
                .decrypter
                .as_ref()
                .ok_or_else(|| EngineError::KeyProcessing("no decrypter configured".into()))?;
            let iv = key_ref
                .iv
                .unwrap_or_else(|| iv_from_sequence(rendition.sequence_of(media_index)));
            body = decrypter.decrypt(body, key_bytes, iv).await?;
        }

        if let (Some(init_bytes), Some(map)) = (init, segment.map.as_ref()) {
            self.init_cache.insert(map.clone(), init_bytes);
        }
        let init_payload = segment
            .map
            .as_ref()
            .and_then(|map| self.init_cache.get(map).cloned());

        let events = self
            .transmux
            .run(TransmuxJob {
                data: body,
                timestamp_offset,
                baseline_dts: self.baseline_dts,
            })
            .await?;

        let mut outcome = SegmentOutcome {
            elapsed,
            bytes_received,
            generation,
            ..SegmentOutcome::default()
        };
        let mut first_video = true;
        let mut first_audio = true;
        for event in events {
            match event {
                TransmuxEvent::TrackInfo(info) => outcome.track_info = Some(info),
                TransmuxEvent::AudioTiming(timing) => outcome.audio_timing = Some(timing),
                TransmuxEvent::VideoTiming(timing) => outcome.video_timing = Some(timing),
                TransmuxEvent::AudioData(data) => {
                    if first_audio {
                        if let Some(init) = init_payload.clone() {
                            coordinator.push_append(BufferKind::Audio, init);
                        }
                        first_audio = false;
                    }
                    coordinator.push_append(BufferKind::Audio, data);
                }
                TransmuxEvent::VideoData(data) => {
                    if first_video {
                        if let Some(init) = init_payload.clone() {
                            coordinator.push_append(BufferKind::Video, init);
                        }
                        first_video = false;
                    }
                    coordinator.push_append(BufferKind::Video, data);
                }
                TransmuxEvent::Done { baseline_dts } => {
                    self.baseline_dts = baseline_dts;
                    outcome.baseline_dts = baseline_dts;
                }
            }
        }

        // Remember the appended video run so a later fast switch can fuse
        // onto a group boundary instead of re-encoding a keyframe.
        if let Some(timing) = outcome.video_timing {
            self.gops.push(Gop {
                pts: timing.start,
                dts: outcome.baseline_dts.unwrap_or(timing.start),
                duration: timing.end - timing.start,
                byte_length: bytes_received,
            });
        }

        self.emitter
            .emit_progress(rendition.id, media_index, bytes_received);
        trace!(
            media_index,
            bytes = bytes_received,
            ms = elapsed.as_millis() as u64,
            "segment loaded"
        );
        self.phase = LoaderPhase::Ready;
        Ok(outcome)
    }

    /// Key and init segment fetched concurrently with the body; cached
    /// entries skip the network. A failure on any leg drops the others.
    async fn fetch_aux(
        &self,
        segment: &Segment,
    ) -> EngineResult<(Option<Bytes>, Option<Bytes>)> {
        let key_target = match segment.key.as_ref() {
            Some(key) if !self.key_cache.contains_key(&key.uri) => Some(self.resolve(&key.uri)?),
            _ => None,
        };
        let init_target = match segment.map.as_ref() {
            Some(map) if !self.init_cache.contains_key(map) => {
                Some((self.resolve(&map.uri)?, map.byte_range))
            }
            _ => None,
        };

        let key = async {
            match key_target {
                Some(url) => Ok::<_, EngineError>(Some(self.fetch_bytes(url, None).await?)),
                None => Ok(None),
            }
        };
        let init = async {
            match init_target {
                Some((url, range)) => {
                    Ok::<_, EngineError>(Some(self.fetch_bytes(url, range).await?))
                }
                None => Ok(None),
            }
        };
        let (key, init) = futures::try_join!(key, init)?;
        Ok((key, init))
    }

    /// Download the segment body. With an abort context the body is
    /// streamed and every chunk re-evaluates whether some other rendition
    /// could finish sooner than this one.
    async fn fetch_body(
        &self,
        segment: &Segment,
        rendition: &Rendition,
        started: Instant,
        abort: Option<&AbortContext>,
    ) -> EngineResult<BodyFetch> {
        let url = self.resolve(&segment.uri)?;
        let mut opts = RequestOptions::default();
        if let Some(range) = segment.byte_range {
            opts = opts.with_byte_range(range);
        }
        let Some(abort) = abort else {
            let response = self.transport.get(url, opts).await?;
            return Ok(BodyFetch::Complete(response.bytes));
        };

        let mut stream = self.transport.stream(url, opts).await?;
        let mut body = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk?);
            let check = AbortCheck {
                bytes_received: body.len() as u64,
                elapsed: started.elapsed(),
                segment_duration: segment.duration,
                current_bandwidth: rendition.attributes.bandwidth.unwrap_or(0),
                time_until_rebuffer: abort.time_until_rebuffer,
                has_sync_point: abort.has_sync_point,
            };
            if check.should_abort(&abort.candidates, rendition.id).is_some() {
                return Ok(BodyFetch::Aborted {
                    bytes_received: body.len() as u64,
                });
            }
        }
        Ok(BodyFetch::Complete(body.freeze()))
    }

    async fn fetch_bytes(&self, url: Url, range: Option<ByteRange>) -> EngineResult<Bytes> {
        let mut opts = RequestOptions::default();
        if let Some(range) = range {
            opts = opts.with_byte_range(range);
        }
        let response = self.transport.get(url, opts).await?;
        Ok(response.bytes)
    }

    fn resolve(&self, uri: &str) -> EngineResult<Url> {
        self.base_url
            .join(uri)
            .map_err(|e| EngineError::InvalidUri(format!("{uri}: {e}")))
    }
}

/// Default initialization vector: the segment's media sequence number in
/// the low-order bytes.
fn iv_from_sequence(sequence: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&sequence.to_be_bytes());
    iv
}
