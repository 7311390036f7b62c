#![forbid(unsafe_code)]

// Internal modules (exposed for advanced usage and testing)
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod loader;
pub mod playlist;
pub mod ranges;
pub mod segment;
pub mod services;
pub mod stall;
pub mod sync;

pub use config::{BufferOptions, EngineConfig, ExclusionOptions, SinkQuirks, StallOptions};
pub use controller::{StreamController, SwitchKind};
pub use coordinator::BufferCoordinator;
pub use error::{EngineError, EngineResult, RequestFailure};
pub use events::{EngineEvent, EventEmitter};
pub use loader::{DocumentLoader, LoaderState, PlaylistLoader, RefreshOutcome};
pub use playlist::{
    ExcludeUntil, InitSegmentRef, Manifest, MediaGroups, MediaPosition, MergeOutcome,
    PlaylistSyncInfo, Rendition, RenditionAttributes, Segment, SegmentKey,
};
pub use ranges::BufferedRanges;
pub use segment::{
    AbortCheck, AbortContext, Gop, GopCache, LoaderPhase, SegmentLoader, SegmentOutcome,
    SegmentRequest, SwitchAlignment, TrackType,
};
pub use services::{
    BufferKind, Decrypter, EndOfStreamKind, ManifestParser, MediaSink, Player, TimingInfo,
    TrackInfo, TransmuxEvent, TransmuxJob, TransmuxQueue, Transmuxer,
};
pub use stall::{PlaybackSnapshot, StallAction, StallWatcher};
pub use sync::{SyncController, SyncPoint};
