//! Top-level playback orchestration.
//!
//! One controller owns the playlist loader, the segment loader, the sync
//! and buffer state, and the adaptive selection loop. Everything the host
//! provides (sink, player, parser, transmuxer) comes in behind the service
//! traits; everything timing-related runs through one tick so the decision
//! helpers stay synchronous and testable.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rill_abr::{BandwidthEstimator, BandwidthSample};
use rill_net::Transport;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::EngineConfig;
use crate::coordinator::BufferCoordinator;
use crate::error::{EngineError, EngineResult};
use crate::events::EventEmitter;
use crate::loader::PlaylistLoader;
use crate::playlist::{ExcludeUntil, Manifest, Rendition};
use crate::ranges::BufferedRanges;
use crate::segment::{
    back_buffer_trim, next_request, timestamp_offset_update, AbortContext, SegmentLoader,
    SegmentRequest, SwitchAlignment,
};
use crate::services::{BufferKind, EndOfStreamKind, ManifestParser, MediaSink, Player};
use crate::stall::{PlaybackSnapshot, StallAction, StallWatcher};
use crate::sync::SyncController;

/// How a rendition switch takes effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchKind {
    /// Replace buffered media near the playhead; visible almost at once.
    Fast,
    /// Let the buffer drain and append the new rendition after it.
    Smooth,
}

/// A switch is fast when there is little buffered runway to hide it behind,
/// or before playback has begun, when replacing is free.
pub fn switch_kind(forward_buffer: f64, low_water_line: f64, has_played: bool) -> SwitchKind {
    if !has_played || forward_buffer < low_water_line {
        SwitchKind::Fast
    } else {
        SwitchKind::Smooth
    }
}

/// Renditions can only replace each other when their track composition
/// matches what the sink was configured for. Moving between muxed and
/// audio-only content mid-stream would require tearing the sink down.
pub fn media_switch_allowed(from: &Rendition, to: &Rendition) -> EngineResult<()> {
    let from_video = from.attributes.has_video_codec();
    let to_video = to.attributes.has_video_codec();
    if from_video != to_video {
        return Err(EngineError::IllegalMediaSwitch(format!(
            "rendition {} and {} differ in video tracks",
            from.id, to.id
        )));
    }
    Ok(())
}

/// A live playlist that stops changing while the loader is pinned at its
/// final segment has gone stale upstream.
pub fn playlist_stale(unchanged_refreshes: u32, pinned_at_end: bool) -> bool {
    pinned_at_end && unchanged_refreshes >= 3
}

/// Seekable window of a rendition, given the stream time its window starts
/// at. Live streams hold the end back from the edge so a seek target does
/// not outrun the packager.
pub fn seekable(rendition: &Rendition, anchor_time: f64) -> (f64, f64) {
    let duration = rendition.duration();
    if !rendition.is_live() {
        return (0.0, duration);
    }
    let end = (anchor_time + duration - 3.0 * rendition.target_duration).max(anchor_time);
    (anchor_time, end)
}

/// Exclude rendition `id`, cascading when that empties the candidate pool.
///
/// When every rendition ends up excluded, timed exclusions are lifted so
/// selection can retry them. Permanent exclusions survive the reset unless
/// the manifest has nothing else to offer.
pub fn exclude_rendition(
    manifest: &mut Manifest,
    id: usize,
    permanent: bool,
    duration: Duration,
    now_ms: f64,
) -> EngineResult<()> {
    let rendition = manifest
        .get_mut(id)
        .ok_or_else(|| EngineError::RenditionNotFound(format!("rendition {id}")))?;
    rendition.exclude_until = Some(if permanent {
        ExcludeUntil::Forever
    } else {
        ExcludeUntil::Until(now_ms + duration.as_millis() as f64)
    });

    let any_enabled = manifest.renditions().iter().any(|r| r.is_enabled(now_ms));
    if any_enabled {
        return Ok(());
    }

    warn!("all renditions excluded, lifting timed exclusions");
    let mut lifted = false;
    for index in 0..manifest.len() {
        let Some(r) = manifest.get_mut(index) else {
            continue;
        };
        if r.disabled {
            continue;
        }
        if matches!(r.exclude_until, Some(ExcludeUntil::Until(_))) {
            r.exclude_until = None;
            lifted = true;
        }
    }
    if lifted {
        return Ok(());
    }

    // Only permanently excluded renditions remain. A single-rendition
    // manifest gets its exclusion lifted rather than ending playback.
    let non_disabled: Vec<usize> = manifest
        .renditions()
        .iter()
        .filter(|r| !r.disabled)
        .map(|r| r.id)
        .collect();
    if let [only] = non_disabled.as_slice() {
        if let Some(r) = manifest.get_mut(*only) {
            r.exclude_until = None;
        }
        return Ok(());
    }
    Err(EngineError::RenditionsExhausted)
}

fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as f64)
        .unwrap_or(0.0)
}

/// An alternate-track loader running alongside the main rendition, feeding
/// one buffer from its own playlist position.
struct AlternateTrack {
    rendition_id: usize,
    segments: SegmentLoader,
    last_requested_index: Option<usize>,
    ended: bool,
}

pub struct StreamController {
    config: EngineConfig,
    emitter: EventEmitter,
    token: CancellationToken,
    playlist: PlaylistLoader,
    segments: SegmentLoader,
    sync: SyncController,
    coordinator: BufferCoordinator,
    estimator: BandwidthEstimator,
    stall: StallWatcher,
    sink: Arc<dyn MediaSink>,
    player: Arc<dyn Player>,
    alternate_audio: Option<AlternateTrack>,

    playback_started_at: Option<Instant>,
    last_requested_index: Option<usize>,
    current_timeline: u64,
    timestamp_offset_set: bool,
    unchanged_refreshes: u32,
    next_refresh_at: Option<Instant>,
    anchor_time: f64,
    last_seekable: Option<(f64, f64)>,
    ended: bool,
}

impl StreamController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        parser: Arc<dyn ManifestParser>,
        sink: Arc<dyn MediaSink>,
        player: Arc<dyn Player>,
        segments: SegmentLoader,
        url: Url,
    ) -> Self {
        let emitter = EventEmitter::default();
        let estimator = BandwidthEstimator::new(&config.abr);
        let stall = StallWatcher::new(config.stall);
        let coordinator = BufferCoordinator::new(config.quirks, true);
        let playlist = PlaylistLoader::new(transport, parser, emitter.clone(), url);
        Self {
            config,
            emitter,
            token: CancellationToken::new(),
            playlist,
            segments,
            sync: SyncController::new(),
            coordinator,
            estimator,
            stall,
            sink,
            player,
            alternate_audio: None,
            playback_started_at: None,
            last_requested_index: None,
            current_timeline: 0,
            timestamp_offset_set: false,
            unchanged_refreshes: 0,
            next_refresh_at: None,
            anchor_time: 0.0,
            last_seekable: None,
            ended: false,
        }
    }

    pub fn events(&self) -> EventEmitter {
        self.emitter.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn current_rendition(&self) -> Option<&Rendition> {
        self.playlist.media()
    }

    pub fn bandwidth_estimate(&self) -> Option<u64> {
        self.estimator.estimate_bps()
    }

    /// Load the multivariant document and pick the starting rendition: the
    /// lowest with video, so first frame arrives fast and adaptation moves
    /// up from measurements rather than guesses.
    pub async fn start(&mut self) -> EngineResult<()> {
        self.playlist.load().await?;
        let manifest = self
            .playlist
            .manifest()
            .ok_or_else(|| EngineError::PlaylistParse("manifest missing after load".into()))?;
        let initial = rill_abr::select_initial_lowest(&manifest.candidates(now_ms()))
            .ok_or(EngineError::RenditionsExhausted)?;
        info!(rendition = initial, "starting playback");
        self.switch_to(initial).await?;
        Ok(())
    }

    /// Run until cancelled or a fatal error. Each pass refreshes playlists
    /// when due, adapts the rendition, fills the buffer, and corrects
    /// stalls.
    pub async fn run(&mut self) -> EngineResult<()> {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    debug!("controller cancelled");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.stall.poll_interval) => {}
            }
            if let Err(error) = self.tick().await {
                if error.is_fatal() {
                    self.emitter.emit_error(&error.to_string(), false);
                    return Err(error);
                }
                self.emitter.emit_error(&error.to_string(), true);
            }
        }
    }

    /// One scheduling pass.
    pub async fn tick(&mut self) -> EngineResult<()> {
        match self.refresh_if_due().await {
            // A stale upstream is a rendition failure: exclude it and let
            // selection move elsewhere.
            Err(error @ EngineError::PlaylistStale) => {
                self.exclude_and_reselect(&error).await?;
            }
            result => result?,
        }
        self.adapt().await?;
        self.fill_buffer().await?;
        self.fill_alternate_audio().await?;
        self.trim_back_buffer();
        self.coordinator.drain(self.sink.as_ref()).await?;
        self.update_seekable();
        self.watch_stall();
        Ok(())
    }

    async fn refresh_if_due(&mut self) -> EngineResult<()> {
        let live = self.playlist.media().map(|r| r.is_live()).unwrap_or(false);
        if !live {
            return Ok(());
        }
        let due = self
            .next_refresh_at
            .map(|at| Instant::now() >= at)
            .unwrap_or(true);
        if !due {
            return Ok(());
        }

        match self.playlist.refresh().await {
            Ok(outcome) => {
                self.next_refresh_at = Some(Instant::now() + outcome.next_refresh);
                match outcome.merge {
                    crate::playlist::MergeOutcome::Unchanged => {
                        self.unchanged_refreshes += 1;
                        let pinned = self
                            .playlist
                            .media()
                            .zip(self.last_requested_index)
                            .map(|(r, last)| last + 1 >= r.segments.len())
                            .unwrap_or(false);
                        if playlist_stale(self.unchanged_refreshes, pinned) {
                            warn!("live playlist went stale");
                            self.unchanged_refreshes = 0;
                            return Err(EngineError::PlaylistStale);
                        }
                    }
                    crate::playlist::MergeOutcome::Updated { expired } => {
                        self.unchanged_refreshes = 0;
                        if expired > 0 {
                            self.on_segments_expired(expired);
                        }
                    }
                }
                Ok(())
            }
            Err(error) => {
                self.next_refresh_at = Some(Instant::now() + self.playlist.backoff_delay());
                Err(error)
            }
        }
    }

    /// The live window slid; the playhead anchor and the requested index
    /// move with it.
    fn on_segments_expired(&mut self, expired: usize) {
        if let Some(last) = self.last_requested_index {
            self.last_requested_index = last.checked_sub(expired);
        }
        if let Some(info) = self.playlist.media().and_then(|r| r.sync_info) {
            self.anchor_time = info.time;
        }
        if let Some(timeline) = self
            .playlist
            .media()
            .and_then(|r| r.segments.first())
            .map(|s| s.timeline)
        {
            self.emitter.emit_sync_info_updated(timeline);
        }
    }

    /// Re-run selection against the current estimate and switch when it
    /// lands on a different rendition.
    async fn adapt(&mut self) -> EngineResult<()> {
        let Some(estimate) = self.estimator.estimate_bps() else {
            return Ok(());
        };
        let Some(manifest) = self.playlist.manifest() else {
            return Ok(());
        };
        let candidates = manifest.candidates(now_ms());
        let pick = rill_abr::select_by_bandwidth(
            &candidates,
            estimate,
            self.player.dimensions(),
            &self.config.abr,
        );
        let Some(pick) = pick else {
            return Ok(());
        };
        if Some(pick) == self.playlist.current_id() {
            return Ok(());
        }
        self.switch_to(pick).await
    }

    async fn switch_to(&mut self, id: usize) -> EngineResult<()> {
        if let (Some(from), Some(manifest)) = (self.playlist.media(), self.playlist.manifest()) {
            let to = manifest
                .get(id)
                .ok_or_else(|| EngineError::RenditionNotFound(format!("rendition {id}")))?;
            media_switch_allowed(from, to)?;

            let buffered = self.playable_ranges();
            let forward = buffered.forward_duration(self.player.current_time());
            let kind = switch_kind(
                forward,
                self.config.buffer.low_water_line,
                self.player.has_played(),
            );
            debug!(from = from.id, to = id, ?kind, "rendition switch");
            if kind == SwitchKind::Fast {
                // Replace buffered media from the playhead (or the nearest
                // group-of-pictures boundary behind it) and re-request.
                let current_time = self.player.current_time();
                let timeline_start = self
                    .sync
                    .timeline_offset(self.current_timeline)
                    .unwrap_or(0.0);
                let same_codec = from.attributes.codecs == to.attributes.codecs;
                let replace_from = match self.segments.alignment_for_switch(
                    current_time,
                    timeline_start,
                    same_codec,
                ) {
                    SwitchAlignment::FuseAt { time } => time,
                    SwitchAlignment::ExtendKeyframe { .. } => current_time,
                };
                if let Some(end) = buffered.end() {
                    if end > replace_from {
                        self.coordinator
                            .push_remove(BufferKind::Video, replace_from, end);
                        self.coordinator
                            .push_remove(BufferKind::Audio, replace_from, end);
                    }
                }
                self.last_requested_index = None;
                self.segments.abort();
                if let Some(alt) = self.alternate_audio.as_mut() {
                    alt.last_requested_index = None;
                    alt.segments.abort();
                }
            }
        }

        self.playlist.media_switch(id)?;
        self.segments.reset_timeline();
        // An alternate track only survives the switch when the new rendition
        // shares its audio group.
        if let Some(alt_id) = self.alternate_audio.as_ref().map(|a| a.rendition_id) {
            if !self.in_active_audio_group(alt_id) {
                self.disable_alternate_audio();
            }
        }
        if self.playlist.media().map(|r| r.segments.is_empty()).unwrap_or(true)
            || self.playlist.state() == crate::loader::LoaderState::SwitchingMedia
        {
            let outcome = self.playlist.refresh().await?;
            self.next_refresh_at = Some(Instant::now() + outcome.next_refresh);
        }
        Ok(())
    }

    /// Request and append the next segment when the buffer needs one.
    async fn fill_buffer(&mut self) -> EngineResult<()> {
        if self.ended {
            return Ok(());
        }
        let current_time = self.player.current_time();
        let buffered = self.playable_ranges();
        let played = self
            .playback_started_at
            .map(|at| at.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        if self.player.has_played() && self.playback_started_at.is_none() {
            self.playback_started_at = Some(Instant::now());
        }
        let goal = self.config.buffer.goal_at(played);

        let (request, has_sync_point) = {
            let Some(rendition) = self.playlist.media() else {
                return Ok(());
            };
            let sync_point = self
                .sync
                .sync_point(rendition, current_time, self.current_timeline);
            let has_sync_point = sync_point.is_some();
            let request = next_request(
                rendition,
                &buffered,
                current_time,
                goal,
                self.player.has_played(),
                sync_point,
                self.last_requested_index,
            );
            (request, has_sync_point)
        };
        let Some(request) = request else {
            self.segments.wait();
            self.maybe_end_stream();
            return Ok(());
        };
        // Sync requests establish timing and must finish; everything else may
        // abandon itself mid-download when a lower rendition would serve the
        // playhead sooner.
        let abort = (!request.is_sync_request).then(|| AbortContext {
            candidates: self
                .playlist
                .manifest()
                .map(|m| m.candidates(now_ms()))
                .unwrap_or_default(),
            time_until_rebuffer: buffered.forward_duration(current_time),
            has_sync_point,
        });

        match self.load_one(&request, abort).await {
            Ok(()) => Ok(()),
            Err(EngineError::Net(net)) if net.is_timeout() => {
                self.estimator.penalize_timeout(Instant::now());
                self.emitter.emit_bandwidth_updated(
                    self.estimator.estimate_bps().unwrap_or(0),
                );
                Ok(())
            }
            Err(EngineError::Net(net)) if net.is_abort() => Ok(()),
            Err(error) => self.exclude_and_reselect(&error).await,
        }
    }

    fn in_active_audio_group(&self, id: usize) -> bool {
        self.playlist
            .media()
            .zip(self.playlist.manifest())
            .map(|(current, manifest)| {
                manifest.alternate_audio(current).iter().any(|r| r.id == id)
            })
            .unwrap_or(false)
    }

    /// Route audio through rendition `id` from the current rendition's audio
    /// group, loaded by `loader` at its own playlist position. Buffered audio
    /// ahead of the playhead is flushed so the new track replaces it.
    pub fn enable_alternate_audio(
        &mut self,
        id: usize,
        loader: SegmentLoader,
    ) -> EngineResult<()> {
        if !self.in_active_audio_group(id) {
            return Err(EngineError::RenditionNotFound(format!(
                "rendition {id} is not in the active audio group"
            )));
        }
        self.flush_audio_ahead();
        info!(rendition = id, "alternate audio enabled");
        self.alternate_audio = Some(AlternateTrack {
            rendition_id: id,
            segments: loader,
            last_requested_index: None,
            ended: false,
        });
        Ok(())
    }

    /// Fall back to the muxed audio of the main rendition.
    pub fn disable_alternate_audio(&mut self) {
        let Some(mut alt) = self.alternate_audio.take() else {
            return;
        };
        alt.segments.dispose();
        self.flush_audio_ahead();
        // The main loader re-requests so muxed audio covers the flushed
        // range again.
        self.last_requested_index = None;
        self.segments.abort();
        info!("alternate audio disabled");
    }

    fn flush_audio_ahead(&mut self) {
        let current_time = self.player.current_time();
        if let Some(end) = self.sink.buffered(BufferKind::Audio).end() {
            if end > current_time {
                self.coordinator
                    .push_remove(BufferKind::Audio, current_time, end);
            }
        }
    }

    /// Keep the alternate audio track fed, mirroring `fill_buffer` against
    /// the alternate rendition's own position. Alternate downloads are never
    /// abandoned mid-flight; audio segments are small enough that abandoning
    /// them buys nothing.
    async fn fill_alternate_audio(&mut self) -> EngineResult<()> {
        if self.ended || self.alternate_audio.is_none() {
            return Ok(());
        }
        let current_time = self.player.current_time();
        let buffered = self.sink.buffered(BufferKind::Audio);
        let played = self
            .playback_started_at
            .map(|at| at.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let goal = self.config.buffer.goal_at(played);

        let Some(alt) = self.alternate_audio.as_mut() else {
            return Ok(());
        };
        let Some(rendition) = self
            .playlist
            .manifest()
            .and_then(|m| m.get(alt.rendition_id))
            .cloned()
        else {
            return Ok(());
        };
        let sync_point = self
            .sync
            .sync_point(&rendition, current_time, self.current_timeline);
        let request = next_request(
            &rendition,
            &buffered,
            current_time,
            goal,
            self.player.has_played(),
            sync_point,
            alt.last_requested_index,
        );
        let Some(request) = request else {
            alt.segments.wait();
            alt.ended = rendition.end_list
                && alt
                    .last_requested_index
                    .map(|last| last + 1 >= rendition.segments.len())
                    .unwrap_or(false);
            self.maybe_end_stream();
            return Ok(());
        };

        let outcome = alt
            .segments
            .load_segment(
                &rendition,
                request.media_index,
                request.start_time.unwrap_or(0.0),
                None,
                &mut self.coordinator,
            )
            .await?;
        if !alt.segments.is_current(outcome.generation) {
            return Ok(());
        }
        if let Some(start) = outcome.start() {
            self.sync
                .save_segment_timing(&rendition, request.media_index, start);
        }
        if !request.is_sync_request {
            alt.last_requested_index = Some(request.media_index);
        }
        Ok(())
    }

    /// Exclude the active rendition after `error` and re-run selection over
    /// what remains.
    async fn exclude_and_reselect(&mut self, error: &EngineError) -> EngineResult<()> {
        let id = self.playlist.current_id().unwrap_or(0);
        let permanent = matches!(error, EngineError::CodecIncompatible(_));
        warn!(rendition = id, %error, "excluding rendition after failure");
        let manifest = self
            .playlist
            .manifest_mut()
            .ok_or(EngineError::RenditionsExhausted)?;
        exclude_rendition(
            manifest,
            id,
            permanent,
            self.config.exclusion.default_duration,
            now_ms(),
        )?;
        self.emitter.emit_rendition_excluded(id, permanent);
        let candidates = self
            .playlist
            .manifest()
            .map(|m| m.candidates(now_ms()))
            .unwrap_or_default();
        if let Some(next) = rill_abr::select_by_bandwidth(
            &candidates,
            self.estimator
                .estimate_bps()
                .unwrap_or(rill_abr::BANDWIDTH_FLOOR_BPS),
            self.player.dimensions(),
            &self.config.abr,
        ) {
            self.switch_to(next).await?;
        }
        Ok(())
    }

    async fn load_one(
        &mut self,
        request: &SegmentRequest,
        abort: Option<AbortContext>,
    ) -> EngineResult<()> {
        let rendition = self
            .playlist
            .media()
            .ok_or_else(|| EngineError::RenditionNotFound("no rendition selected".into()))?
            .clone();
        let segment = rendition
            .segments
            .get(request.media_index)
            .ok_or_else(|| EngineError::SegmentNotFound(format!("index {}", request.media_index)))?;

        let starts_new_timeline =
            segment.timeline != self.current_timeline || !self.timestamp_offset_set;
        let segment_start = request.start_time.unwrap_or(0.0);
        let previous_end = request
            .media_index
            .checked_sub(1)
            .and_then(|index| rendition.segments.get(index))
            .and_then(|s| s.end);
        let buffered_end = self.playable_ranges().end();
        if let Some(offset) = timestamp_offset_update(
            self.segments.track(),
            starts_new_timeline,
            segment_start,
            previous_end,
            buffered_end,
        ) {
            self.coordinator.push_timestamp_offset(BufferKind::Video, offset);
            self.coordinator.push_timestamp_offset(BufferKind::Audio, offset);
            self.timestamp_offset_set = true;
        }
        self.current_timeline = segment.timeline;

        let outcome = self
            .segments
            .load_segment(
                &rendition,
                request.media_index,
                segment_start,
                abort.as_ref(),
                &mut self.coordinator,
            )
            .await?;
        if !self.segments.is_current(outcome.generation) {
            return Ok(());
        }

        self.estimator.push_sample(BandwidthSample {
            bytes: outcome.bytes_received,
            duration: outcome.elapsed,
            at: Instant::now(),
        });
        if let Some(estimate) = self.estimator.estimate_bps() {
            self.emitter.emit_bandwidth_updated(estimate);
        }

        // An abandoned download only contributes its partial bandwidth
        // sample; the next adapt pass reselects with the updated estimate.
        if outcome.aborted {
            return Ok(());
        }

        if let (Some(start), Some(end)) = (outcome.start(), outcome.end()) {
            let media_index = request.media_index;
            self.sync.save_segment_timing(&rendition, media_index, start);
            if let Some(manifest) = self.playlist.manifest_mut() {
                if let Some(segment) = manifest
                    .get_mut(rendition.id)
                    .and_then(|r| r.segments.get_mut(media_index))
                {
                    segment.start = Some(start);
                    segment.end = Some(end);
                }
            }
        }

        // A sync request only establishes timing; position from it instead
        // of treating it as sequential progress.
        if !request.is_sync_request {
            self.last_requested_index = Some(request.media_index);
        }
        Ok(())
    }

    fn maybe_end_stream(&mut self) {
        if self.ended {
            return;
        }
        let at_end = self
            .playlist
            .media()
            .zip(self.last_requested_index)
            .map(|(r, last)| r.end_list && last + 1 >= r.segments.len())
            .unwrap_or(false);
        // Every active track has to finish before the presentation closes.
        let alternate_done = self
            .alternate_audio
            .as_ref()
            .map(|alt| alt.ended)
            .unwrap_or(true);
        if at_end && alternate_done {
            info!("all segments appended, ending stream");
            self.coordinator.push_end_of_stream(EndOfStreamKind::Ended);
            self.emitter.emit_end_of_stream();
            self.ended = true;
        }
    }

    fn trim_back_buffer(&mut self) {
        let current_time = self.player.current_time();
        let Some(rendition) = self.playlist.media() else {
            return;
        };
        let (seekable_start, _) = seekable(rendition, self.anchor_time);
        let Some((from, to)) = back_buffer_trim(
            current_time,
            seekable_start,
            rendition.target_duration,
            self.config.buffer.back_buffer,
        ) else {
            return;
        };
        let buffered_start = self.playable_ranges().start().unwrap_or(0.0);
        if to <= buffered_start {
            return;
        }
        self.coordinator.push_remove(BufferKind::Video, from, to);
        self.coordinator.push_remove(BufferKind::Audio, from, to);
    }

    fn update_seekable(&mut self) {
        let Some(rendition) = self.playlist.media() else {
            return;
        };
        let window = seekable(rendition, self.anchor_time);
        if self.last_seekable != Some(window) {
            self.last_seekable = Some(window);
            self.emitter.emit_seekable_changed(window.0, window.1);
        }
    }

    /// Hosts forward the sink's native stall signal here; it runs a stall
    /// check immediately instead of waiting for the next poll tick.
    pub fn notify_stalled(&mut self) {
        self.watch_stall();
    }

    fn watch_stall(&mut self) {
        let (seekable_start, seekable_end) = self.last_seekable.unwrap_or((0.0, 0.0));
        let snapshot = PlaybackSnapshot {
            current_time: self.player.current_time(),
            buffered: self.playable_ranges(),
            video_buffered: self.sink.buffered(BufferKind::Video),
            seekable_start,
            seekable_end,
            playing: self.player.is_playing(),
        };
        let Some(action) = self.stall.poll(&snapshot) else {
            return;
        };
        let to = match action {
            StallAction::SeekToSeekableStart { to }
            | StallAction::SeekToSeekableEnd { to }
            | StallAction::ResumeVideoUnderflow { to }
            | StallAction::SkipGap { to, .. }
            | StallAction::NudgeInPlace { to } => to,
        };
        info!(?action, "correcting stalled playback");
        self.player.seek(to);
        self.emitter.emit_stall_corrected(to);
        self.stall.reset();
    }

    /// Time ranges playable right now: the intersection of both tracks when
    /// the content carries both, otherwise whichever track exists.
    fn playable_ranges(&self) -> BufferedRanges {
        let audio = self.sink.buffered(BufferKind::Audio);
        let video = self.sink.buffered(BufferKind::Video);
        match (audio.is_empty(), video.is_empty()) {
            (false, false) => audio.intersect(&video),
            (true, _) => video,
            (_, true) => audio,
        }
    }
}
