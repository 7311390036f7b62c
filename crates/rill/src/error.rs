use thiserror::Error;

/// Engine orchestration errors.
///
/// Network errors are recoverable: they drive bandwidth re-estimation and
/// rendition exclusion. Append rejections are fatal for the affected track.
/// Only [`EngineError::RenditionsExhausted`] and a sink decode failure
/// surface as terminal, user-visible failures.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Network error: {0}")]
    Net(#[from] rill_net::NetError),

    #[error("Manifest parsing error: {0}")]
    PlaylistParse(String),

    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("Rendition not found: {0}")]
    RenditionNotFound(String),

    #[error("Segment not found: {0}")]
    SegmentNotFound(String),

    #[error("Buffer append rejected: {0}")]
    Append(String),

    #[error("Illegal media switch: {0}")]
    IllegalMediaSwitch(String),

    #[error("Live playlist stopped changing while pinned at its end")]
    PlaylistStale,

    #[error("Incompatible codec: {0}")]
    CodecIncompatible(String),

    #[error("All candidate renditions are excluded or failing")]
    RenditionsExhausted,

    #[error("Key processing failed: {0}")]
    KeyProcessing(String),

    #[error("Transmux failed: {0}")]
    Transmux(String),

    #[error("Cancelled")]
    Cancelled,
}

impl EngineError {
    /// Errors that end playback outright, as opposed to errors the stream
    /// controller can absorb through exclusion and reselection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Append(_) | EngineError::RenditionsExhausted
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Captured request failure surfaced alongside loader error events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestFailure {
    pub status: Option<u16>,
    pub message: String,
    /// 4 for server-side (>= 500) responses, 2 otherwise.
    pub code: u8,
}

impl RequestFailure {
    pub fn from_net(error: &rill_net::NetError) -> Self {
        let status = error.status_code();
        let code = match status {
            Some(s) if s >= 500 => 4,
            _ => 2,
        };
        Self {
            status,
            message: error.to_string(),
            code,
        }
    }
}
