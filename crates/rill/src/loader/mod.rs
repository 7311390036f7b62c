//! Playlist loading state machine.
//!
//! One loader owns the multivariant document and the media playlist of the
//! rendition currently playing. Live playlists are re-fetched on a cadence
//! derived from their own advertised durations; refreshed windows are merged
//! over the previous ones so learned segment timing survives.

mod document;

pub use document::DocumentLoader;

use std::sync::Arc;

use rill_net::{RequestOptions, Transport};
use tracing::{debug, warn};
use url::Url;

use crate::error::{EngineError, EngineResult, RequestFailure};
use crate::events::EventEmitter;
use crate::playlist::{
    merge_rendition, refresh_delay, Manifest, MergeOutcome, Rendition,
};
use crate::services::ManifestParser;
use crate::sync::SyncController;

/// Loader lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoaderState {
    /// Nothing fetched yet.
    HaveNothing,
    /// Multivariant document parsed, no media playlist yet.
    HaveMaster,
    /// A media playlist is loaded but a refresh is due or running.
    HaveMetadata,
    /// The loaded media playlist is current.
    HaveCurrentMetadata,
    /// A switch to another rendition is waiting on its media playlist.
    SwitchingMedia,
}

/// Outcome of one refresh cycle, with the delay before the next.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RefreshOutcome {
    pub merge: MergeOutcome,
    pub next_refresh: std::time::Duration,
}

pub struct PlaylistLoader {
    transport: Arc<dyn Transport>,
    parser: Arc<dyn ManifestParser>,
    emitter: EventEmitter,
    url: Url,
    state: LoaderState,
    manifest: Option<Manifest>,
    current: Option<usize>,
    pending: Option<usize>,
    last_failure: Option<RequestFailure>,
}

impl PlaylistLoader {
    pub fn new(
        transport: Arc<dyn Transport>,
        parser: Arc<dyn ManifestParser>,
        emitter: EventEmitter,
        url: Url,
    ) -> Self {
        Self {
            transport,
            parser,
            emitter,
            url,
            state: LoaderState::HaveNothing,
            manifest: None,
            current: None,
            pending: None,
            last_failure: None,
        }
    }

    pub fn state(&self) -> LoaderState {
        self.state
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    pub fn manifest_mut(&mut self) -> Option<&mut Manifest> {
        self.manifest.as_mut()
    }

    /// The rendition currently playing, once one is selected.
    pub fn media(&self) -> Option<&Rendition> {
        let manifest = self.manifest.as_ref()?;
        manifest.get(self.current?)
    }

    pub fn current_id(&self) -> Option<usize> {
        self.current
    }

    /// Failure captured by the most recent fetch, cleared on success.
    pub fn last_failure(&self) -> Option<&RequestFailure> {
        self.last_failure.as_ref()
    }

    /// Fetch and parse the multivariant document.
    ///
    /// Calling again after a rendition is playing does not refetch the
    /// multivariant document: a live rendition is refreshed instead, a
    /// complete one is announced again.
    pub async fn load(&mut self) -> EngineResult<()> {
        if self.manifest.is_some() {
            if let Some(id) = self.current {
                let live = self.media().map(|r| r.is_live()).unwrap_or(false);
                if live {
                    self.refresh().await?;
                } else {
                    self.emitter.emit_playlist_loaded(id);
                }
                return Ok(());
            }
        }
        let bytes = self.fetch(self.url.clone()).await?;
        let manifest = self.parser.parse(&bytes, self.url.as_str())?;
        if manifest.is_empty() {
            return Err(EngineError::PlaylistParse(
                "multivariant document lists no renditions".into(),
            ));
        }
        debug!(url = %self.url, renditions = manifest.len(), "multivariant document loaded");
        self.manifest = Some(manifest);
        self.state = LoaderState::HaveMaster;
        Ok(())
    }

    /// Switch the loader to rendition `id`.
    ///
    /// Switching to the current rendition, or re-requesting an in-flight
    /// pending switch, is a no-op. When the target's media playlist is
    /// already complete (a finished presentation fetched earlier), the swap
    /// is synchronous; otherwise the loader enters `SwitchingMedia` and the
    /// next `refresh` call fetches the target.
    pub fn media_switch(&mut self, id: usize) -> EngineResult<()> {
        let manifest = self
            .manifest
            .as_ref()
            .ok_or_else(|| EngineError::RenditionNotFound(format!("rendition {id}")))?;
        let target = manifest
            .get(id)
            .ok_or_else(|| EngineError::RenditionNotFound(format!("rendition {id}")))?;

        if self.current == Some(id) && self.state != LoaderState::SwitchingMedia {
            return Ok(());
        }
        if self.pending == Some(id) {
            return Ok(());
        }

        if target.end_list && !target.segments.is_empty() {
            let from = self.current;
            self.current = Some(id);
            self.pending = None;
            self.state = LoaderState::HaveCurrentMetadata;
            self.emitter.emit_media_changed(from, id);
            return Ok(());
        }

        self.pending = Some(id);
        self.state = LoaderState::SwitchingMedia;
        Ok(())
    }

    /// Fetch the media playlist for the current (or pending) rendition,
    /// merge it over the loaded one, and report when to refresh next.
    pub async fn refresh(&mut self) -> EngineResult<RefreshOutcome> {
        let id = self
            .pending
            .or(self.current)
            .ok_or_else(|| EngineError::RenditionNotFound("no rendition selected".into()))?;

        let uri = {
            let manifest = self
                .manifest
                .as_ref()
                .ok_or_else(|| EngineError::RenditionNotFound(format!("rendition {id}")))?;
            manifest
                .get(id)
                .ok_or_else(|| EngineError::RenditionNotFound(format!("rendition {id}")))?
                .uri
                .clone()
        };
        let url = self
            .url
            .join(&uri)
            .map_err(|e| EngineError::InvalidUri(format!("{uri}: {e}")))?;

        if self.state == LoaderState::HaveCurrentMetadata {
            self.state = LoaderState::HaveMetadata;
        }
        let bytes = self.fetch(url.clone()).await?;
        let fresh = self.parser.parse_rendition(&bytes, url.as_str(), id)?;

        let manifest = self
            .manifest
            .as_mut()
            .ok_or_else(|| EngineError::RenditionNotFound(format!("rendition {id}")))?;
        let old = manifest
            .get(id)
            .ok_or_else(|| EngineError::RenditionNotFound(format!("rendition {id}")))?;

        let (mut merged, merge) = merge_rendition(old, fresh);
        if let MergeOutcome::Updated { expired } = merge {
            if expired > 0 {
                merged.sync_info = SyncController::expired_anchor(old, expired);
            }
        }
        let changed = matches!(merge, MergeOutcome::Updated { .. });
        let next_refresh = refresh_delay(&merged, changed);
        if let Some(slot) = manifest.get_mut(id) {
            *slot = merged;
        }

        let from = self.current;
        let switched = self.pending.take() == Some(id) && from != Some(id);
        self.current = Some(id);
        self.state = LoaderState::HaveCurrentMetadata;

        if switched {
            self.emitter.emit_media_changed(from, id);
        }
        if changed {
            self.emitter.emit_playlist_loaded(id);
        } else {
            self.emitter.emit_playlist_unchanged(id);
        }
        Ok(RefreshOutcome {
            merge,
            next_refresh,
        })
    }

    /// Delay before retrying after a failed refresh: half the target
    /// duration, so a transient failure does not stall the live edge.
    pub fn backoff_delay(&self) -> std::time::Duration {
        let target = self.media().map(|r| r.target_duration).unwrap_or(10.0);
        std::time::Duration::from_millis((target * 500.0) as u64)
    }

    async fn fetch(&mut self, url: Url) -> EngineResult<bytes::Bytes> {
        match self.transport.get(url.clone(), RequestOptions::default()).await {
            Ok(response) => {
                self.last_failure = None;
                Ok(response.bytes)
            }
            Err(error) => {
                let failure = RequestFailure::from_net(&error);
                warn!(url = %url, code = failure.code, "playlist request failed");
                self.last_failure = Some(failure);
                Err(error.into())
            }
        }
    }
}
