//! Service seams the engine is generic over.
//!
//! The engine never parses manifest grammar, touches media buffers, remuxes
//! containers, or handles key material itself. Hosts plug those capabilities
//! in behind these traits; tests plug in fakes.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::EngineResult;
use crate::playlist::{Manifest, Rendition};
use crate::ranges::BufferedRanges;

/// Which media buffer an operation targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Audio,
    Video,
}

/// Track composition of a rendition or a transmuxed segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrackInfo {
    pub has_audio: bool,
    pub has_video: bool,
}

/// First and last presentation timestamps of a parsed segment, in seconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimingInfo {
    pub start: f64,
    pub end: f64,
}

/// Why the presentation is being closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndOfStreamKind {
    /// All content was appended.
    Ended,
    /// A fatal decode or network condition ends the presentation early.
    Error,
}

/// Parses manifest documents into the engine's playlist model.
#[cfg_attr(test, unimock::unimock(api = ManifestParserMock))]
pub trait ManifestParser: Send + Sync {
    /// Parse a multivariant document.
    fn parse(&self, bytes: &Bytes, base_uri: &str) -> EngineResult<Manifest>;

    /// Parse a media document for the rendition identified by `id`.
    fn parse_rendition(&self, bytes: &Bytes, base_uri: &str, id: usize)
        -> EngineResult<Rendition>;
}

/// The host's media buffer surface.
///
/// Append and remove are asynchronous and exclusive per buffer; the
/// coordinator serializes operations so implementations may assume at most
/// one in flight per buffer.
#[async_trait]
pub trait MediaSink: Send + Sync {
    fn create_buffer(&self, kind: BufferKind, codec: &str) -> EngineResult<()>;

    async fn append_buffer(&self, kind: BufferKind, data: Bytes) -> EngineResult<()>;

    async fn remove(&self, kind: BufferKind, start: f64, end: f64) -> EngineResult<()>;

    async fn set_duration(&self, duration: f64) -> EngineResult<()>;

    async fn end_of_stream(&self, kind: EndOfStreamKind) -> EngineResult<()>;

    fn timestamp_offset(&self, kind: BufferKind) -> f64;

    fn set_timestamp_offset(&self, kind: BufferKind, offset: f64);

    fn buffered(&self, kind: BufferKind) -> BufferedRanges;

    /// True while an append or remove is in flight on this buffer.
    fn updating(&self, kind: BufferKind) -> bool;
}

/// A unit of work for the transmuxer.
#[derive(Clone, Debug)]
pub struct TransmuxJob {
    pub data: Bytes,
    /// Seconds subtracted from every timestamp before append.
    pub timestamp_offset: f64,
    /// Decode-time shift carried over from the previous segment of the same
    /// timeline, keeping frames monotonic across segment boundaries.
    pub baseline_dts: Option<f64>,
}

/// Output of one transmux job, in emit order.
#[derive(Clone, Debug)]
pub enum TransmuxEvent {
    TrackInfo(TrackInfo),
    AudioTiming(TimingInfo),
    VideoTiming(TimingInfo),
    AudioData(Bytes),
    VideoData(Bytes),
    Done { baseline_dts: Option<f64> },
}

/// Converts fetched container data into sink-appendable form.
#[async_trait]
pub trait Transmuxer: Send + Sync {
    async fn transmux(&self, job: TransmuxJob) -> EngineResult<Vec<TransmuxEvent>>;
}

#[async_trait]
impl<T: Transmuxer + ?Sized> Transmuxer for Box<T> {
    async fn transmux(&self, job: TransmuxJob) -> EngineResult<Vec<TransmuxEvent>> {
        (**self).transmux(job).await
    }
}

/// Decrypts protected segment payloads.
#[async_trait]
pub trait Decrypter: Send + Sync {
    async fn decrypt(&self, data: Bytes, key: Bytes, iv: [u8; 16]) -> EngineResult<Bytes>;
}

/// The host player's playback surface: where the playhead is, whether it is
/// moving, and how to move it.
#[cfg_attr(test, unimock::unimock(api = PlayerMock))]
pub trait Player: Send + Sync {
    fn current_time(&self) -> f64;

    fn is_playing(&self) -> bool;

    /// True once playback has ever started; gates the startup buffer rule.
    fn has_played(&self) -> bool;

    fn seek(&self, to: f64);

    fn dimensions(&self) -> Option<rill_abr::PlayerDimensions>;
}

/// Serializes transmux jobs: at most one in flight, the rest queued in FIFO
/// order. Loaders for different tracks share one transmuxer instance.
pub struct TransmuxQueue<T> {
    inner: tokio::sync::Mutex<T>,
}

impl<T: Transmuxer> TransmuxQueue<T> {
    pub fn new(transmuxer: T) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(transmuxer),
        }
    }

    pub async fn run(&self, job: TransmuxJob) -> EngineResult<Vec<TransmuxEvent>> {
        let transmuxer = self.inner.lock().await;
        transmuxer.transmux(job).await
    }
}
