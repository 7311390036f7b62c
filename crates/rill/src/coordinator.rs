//! Buffer operation scheduling.
//!
//! Media sinks accept one mutation per buffer at a time, and presentation
//! level operations (duration, end of stream) require every buffer to be
//! idle. The coordinator queues operations per buffer in FIFO order, treats
//! presentation operations as barriers across both queues, and decides,
//! from a snapshot of sink state, which operation may run next.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::debug;

use crate::config::SinkQuirks;
use crate::error::EngineResult;
use crate::services::{BufferKind, EndOfStreamKind, MediaSink};

#[derive(Clone, Debug)]
pub enum BufferOp {
    Append { data: Bytes },
    Remove { start: f64, end: f64 },
    SetTimestampOffset { offset: f64 },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SourceOp {
    SetDuration(f64),
    EndOfStream(EndOfStreamKind),
}

/// What the scheduler picked to run next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Next {
    Source,
    Buffer(BufferKind),
}

/// A queued presentation operation and how many buffer operations, queued
/// before it, may still drain ahead of it.
struct PendingSource {
    op: SourceOp,
    audio_ahead: usize,
    video_ahead: usize,
}

pub struct BufferCoordinator {
    audio: VecDeque<BufferOp>,
    video: VecDeque<BufferOp>,
    source: VecDeque<PendingSource>,
    quirks: SinkQuirks,
    /// The sink has a video buffer; without one the audio-hold quirk never
    /// applies.
    has_video: bool,
    video_appended: bool,
}

impl BufferCoordinator {
    pub fn new(quirks: SinkQuirks, has_video: bool) -> Self {
        Self {
            audio: VecDeque::new(),
            video: VecDeque::new(),
            source: VecDeque::new(),
            quirks,
            has_video,
            video_appended: false,
        }
    }

    pub fn push_append(&mut self, kind: BufferKind, data: Bytes) {
        self.queue_mut(kind).push_back(BufferOp::Append { data });
    }

    pub fn push_remove(&mut self, kind: BufferKind, start: f64, end: f64) {
        self.queue_mut(kind).push_back(BufferOp::Remove { start, end });
    }

    pub fn push_timestamp_offset(&mut self, kind: BufferKind, offset: f64) {
        self.queue_mut(kind)
            .push_back(BufferOp::SetTimestampOffset { offset });
    }

    pub fn push_set_duration(&mut self, duration: f64) {
        self.push_source(SourceOp::SetDuration(duration));
    }

    pub fn push_end_of_stream(&mut self, kind: EndOfStreamKind) {
        self.push_source(SourceOp::EndOfStream(kind));
    }

    fn push_source(&mut self, op: SourceOp) {
        self.source.push_back(PendingSource {
            op,
            audio_ahead: self.audio.len(),
            video_ahead: self.video.len(),
        });
    }

    pub fn pending(&self, kind: BufferKind) -> usize {
        self.queue(kind).len()
    }

    pub fn pending_source(&self) -> usize {
        self.source.len()
    }

    pub fn is_idle(&self) -> bool {
        self.audio.is_empty() && self.video.is_empty() && self.source.is_empty()
    }

    fn queue(&self, kind: BufferKind) -> &VecDeque<BufferOp> {
        match kind {
            BufferKind::Audio => &self.audio,
            BufferKind::Video => &self.video,
        }
    }

    fn queue_mut(&mut self, kind: BufferKind) -> &mut VecDeque<BufferOp> {
        match kind {
            BufferKind::Audio => &mut self.audio,
            BufferKind::Video => &mut self.video,
        }
    }

    /// Decide what may run against the given sink-busy snapshot.
    ///
    /// A presentation operation is a barrier across both buffer queues:
    /// buffer operations queued before it drain first, operations queued
    /// after it wait until it has run against an idle sink. Audio appends
    /// are held back until the first video append lands when the sink
    /// needs it.
    pub fn next_ready(&self, audio_updating: bool, video_updating: bool) -> Option<Next> {
        if let Some(front) = self.source.front() {
            if front.audio_ahead == 0 && front.video_ahead == 0 {
                let all_idle = !audio_updating && !video_updating;
                return all_idle.then_some(Next::Source);
            }
            if front.video_ahead > 0 && !self.video.is_empty() && !video_updating {
                return Some(Next::Buffer(BufferKind::Video));
            }
            if front.audio_ahead > 0
                && !self.audio.is_empty()
                && !audio_updating
                && !self.audio_held()
            {
                return Some(Next::Buffer(BufferKind::Audio));
            }
            return None;
        }

        if !self.video.is_empty() && !video_updating {
            return Some(Next::Buffer(BufferKind::Video));
        }
        if !self.audio.is_empty() && !audio_updating {
            if self.audio_held() {
                return None;
            }
            return Some(Next::Buffer(BufferKind::Audio));
        }
        None
    }

    fn audio_held(&self) -> bool {
        self.quirks.delay_audio_until_video_append
            && self.has_video
            && !self.video_appended
            && matches!(self.audio.front(), Some(BufferOp::Append { .. }))
    }

    /// Run at most one ready operation against the sink. Returns false when
    /// nothing could run.
    pub async fn step(&mut self, sink: &dyn MediaSink) -> EngineResult<bool> {
        let next = self.next_ready(
            sink.updating(BufferKind::Audio),
            sink.updating(BufferKind::Video),
        );
        match next {
            None => Ok(false),
            Some(Next::Source) => {
                let op = match self.source.pop_front() {
                    Some(pending) => pending.op,
                    None => return Ok(false),
                };
                match op {
                    SourceOp::SetDuration(duration) => sink.set_duration(duration).await?,
                    SourceOp::EndOfStream(kind) => {
                        debug!(?kind, "closing presentation");
                        sink.end_of_stream(kind).await?;
                    }
                }
                Ok(true)
            }
            Some(Next::Buffer(kind)) => {
                let op = match self.queue_mut(kind).pop_front() {
                    Some(op) => op,
                    None => return Ok(false),
                };
                // The popped operation was queued before every pending
                // barrier, so it counts down in each of them.
                for pending in &mut self.source {
                    let ahead = match kind {
                        BufferKind::Audio => &mut pending.audio_ahead,
                        BufferKind::Video => &mut pending.video_ahead,
                    };
                    *ahead = ahead.saturating_sub(1);
                }
                match op {
                    BufferOp::Append { data } => {
                        sink.append_buffer(kind, data).await?;
                        if kind == BufferKind::Video {
                            self.video_appended = true;
                        }
                    }
                    BufferOp::Remove { start, end } => sink.remove(kind, start, end).await?,
                    BufferOp::SetTimestampOffset { offset } => {
                        sink.set_timestamp_offset(kind, offset)
                    }
                }
                Ok(true)
            }
        }
    }

    /// Drain everything currently runnable.
    pub async fn drain(&mut self, sink: &dyn MediaSink) -> EngineResult<()> {
        while self.step(sink).await? {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use rstest::*;

    use crate::ranges::BufferedRanges;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        log: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn log(&self) -> Vec<String> {
            self.log.lock().expect("lock").clone()
        }

        fn push(&self, entry: impl Into<String>) {
            self.log.lock().expect("lock").push(entry.into());
        }
    }

    #[async_trait]
    impl MediaSink for RecordingSink {
        fn create_buffer(&self, _kind: BufferKind, _codec: &str) -> EngineResult<()> {
            Ok(())
        }

        async fn append_buffer(&self, kind: BufferKind, data: Bytes) -> EngineResult<()> {
            self.push(format!("append {kind:?} {}", data.len()));
            Ok(())
        }

        async fn remove(&self, kind: BufferKind, start: f64, end: f64) -> EngineResult<()> {
            self.push(format!("remove {kind:?} {start}..{end}"));
            Ok(())
        }

        async fn set_duration(&self, duration: f64) -> EngineResult<()> {
            self.push(format!("duration {duration}"));
            Ok(())
        }

        async fn end_of_stream(&self, kind: EndOfStreamKind) -> EngineResult<()> {
            self.push(format!("eos {kind:?}"));
            Ok(())
        }

        fn timestamp_offset(&self, _kind: BufferKind) -> f64 {
            0.0
        }

        fn set_timestamp_offset(&self, kind: BufferKind, offset: f64) {
            self.push(format!("offset {kind:?} {offset}"));
        }

        fn buffered(&self, _kind: BufferKind) -> BufferedRanges {
            BufferedRanges::empty()
        }

        fn updating(&self, _kind: BufferKind) -> bool {
            false
        }
    }

    fn data(len: usize) -> Bytes {
        Bytes::from(vec![0u8; len])
    }

    #[rstest]
    fn buffer_ops_wait_while_sink_is_busy() {
        let mut coordinator = BufferCoordinator::new(SinkQuirks::default(), true);
        coordinator.push_append(BufferKind::Video, data(1));

        assert_eq!(coordinator.next_ready(false, true), None);
        assert_eq!(
            coordinator.next_ready(false, false),
            Some(Next::Buffer(BufferKind::Video))
        );
    }

    #[rstest]
    fn source_op_waits_for_drained_buffers() {
        let mut coordinator = BufferCoordinator::new(SinkQuirks::default(), true);
        coordinator.push_append(BufferKind::Video, data(1));
        coordinator.push_set_duration(60.0);

        // Buffer queue not empty: the source op waits.
        assert_eq!(
            coordinator.next_ready(false, false),
            Some(Next::Buffer(BufferKind::Video))
        );

        // Buffer queues drained but sink busy: still waits.
        let mut only_source = BufferCoordinator::new(SinkQuirks::default(), true);
        only_source.push_set_duration(60.0);
        assert_eq!(only_source.next_ready(false, true), None);
        assert_eq!(only_source.next_ready(false, false), Some(Next::Source));
    }

    #[rstest]
    fn audio_append_held_until_first_video_append() {
        let quirks = SinkQuirks {
            delay_audio_until_video_append: true,
        };
        let mut coordinator = BufferCoordinator::new(quirks, true);
        coordinator.push_append(BufferKind::Audio, data(1));

        assert_eq!(coordinator.next_ready(false, false), None);

        coordinator.push_append(BufferKind::Video, data(2));
        assert_eq!(
            coordinator.next_ready(false, false),
            Some(Next::Buffer(BufferKind::Video))
        );
    }

    #[rstest]
    fn audio_hold_skipped_without_video_track() {
        let quirks = SinkQuirks {
            delay_audio_until_video_append: true,
        };
        let mut coordinator = BufferCoordinator::new(quirks, false);
        coordinator.push_append(BufferKind::Audio, data(1));

        assert_eq!(
            coordinator.next_ready(false, false),
            Some(Next::Buffer(BufferKind::Audio))
        );
    }

    #[rstest]
    fn audio_remove_not_held_by_quirk() {
        let quirks = SinkQuirks {
            delay_audio_until_video_append: true,
        };
        let mut coordinator = BufferCoordinator::new(quirks, true);
        coordinator.push_remove(BufferKind::Audio, 0.0, 10.0);

        assert_eq!(
            coordinator.next_ready(false, false),
            Some(Next::Buffer(BufferKind::Audio))
        );
    }

    #[rstest]
    fn ops_behind_a_pending_source_op_wait() {
        let mut coordinator = BufferCoordinator::new(SinkQuirks::default(), true);
        coordinator.push_set_duration(60.0);
        coordinator.push_append(BufferKind::Video, data(1));

        // Sink busy: neither the duration change nor the append behind it
        // may run.
        assert_eq!(coordinator.next_ready(false, true), None);
        assert_eq!(coordinator.next_ready(false, false), Some(Next::Source));
    }

    #[tokio::test]
    async fn source_op_gates_ops_queued_after_it() {
        let mut coordinator = BufferCoordinator::new(SinkQuirks::default(), true);
        coordinator.push_append(BufferKind::Video, data(5));
        coordinator.push_set_duration(60.0);
        coordinator.push_append(BufferKind::Video, data(6));

        let sink = RecordingSink::default();
        coordinator.drain(&sink).await.expect("drain");

        assert_eq!(
            sink.log(),
            vec!["append Video 5", "duration 60", "append Video 6"]
        );
        assert!(coordinator.is_idle());
    }

    #[tokio::test]
    async fn drain_runs_in_fifo_order_with_video_first() {
        let mut coordinator = BufferCoordinator::new(SinkQuirks::default(), true);
        coordinator.push_append(BufferKind::Audio, data(10));
        coordinator.push_append(BufferKind::Video, data(20));
        coordinator.push_append(BufferKind::Audio, data(11));
        coordinator.push_set_duration(60.0);

        let sink = RecordingSink::default();
        coordinator.drain(&sink).await.expect("drain");

        assert_eq!(
            sink.log(),
            vec![
                "append Video 20",
                "append Audio 10",
                "append Audio 11",
                "duration 60",
            ]
        );
        assert!(coordinator.is_idle());
    }

    #[tokio::test]
    async fn end_of_stream_runs_after_appends() {
        let mut coordinator = BufferCoordinator::new(SinkQuirks::default(), true);
        coordinator.push_append(BufferKind::Video, data(5));
        coordinator.push_end_of_stream(EndOfStreamKind::Ended);

        let sink = RecordingSink::default();
        coordinator.drain(&sink).await.expect("drain");

        assert_eq!(sink.log(), vec!["append Video 5", "eos Ended"]);
    }
}
