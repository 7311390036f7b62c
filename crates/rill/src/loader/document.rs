//! Loader for sources whose whole presentation lives in one document.
//!
//! Every rendition's segment list arrives with each fetch of the same URL,
//! so media switches never hit the network: they are applied locally, and
//! deferred while a refresh is in flight so a switch never observes a
//! half-applied update. Live documents advertise their own refresh cadence.

use std::sync::Arc;
use std::time::Duration;

use rill_net::{RequestOptions, Transport};
use tracing::{debug, warn};
use url::Url;

use crate::error::{EngineError, EngineResult, RequestFailure};
use crate::events::EventEmitter;
use crate::playlist::{merge_rendition, refresh_delay, Manifest, MergeOutcome, Rendition};
use crate::services::ManifestParser;

use super::LoaderState;

pub struct DocumentLoader {
    transport: Arc<dyn Transport>,
    parser: Arc<dyn ManifestParser>,
    emitter: EventEmitter,
    url: Url,
    state: LoaderState,
    manifest: Option<Manifest>,
    current: Option<usize>,
    deferred_switch: Option<usize>,
    refreshing: bool,
    /// Server wall clock minus local wall clock, in seconds.
    clock_offset: Option<f64>,
    last_failure: Option<RequestFailure>,
}

impl DocumentLoader {
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
            deferred_switch: None,
            refreshing: false,
            clock_offset: None,
            last_failure: None,
        }
    }

    pub fn state(&self) -> LoaderState {
        self.state
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    pub fn media(&self) -> Option<&Rendition> {
        let manifest = self.manifest.as_ref()?;
        manifest.get(self.current?)
    }

    pub fn current_id(&self) -> Option<usize> {
        self.current
    }

    pub fn clock_offset(&self) -> Option<f64> {
        self.clock_offset
    }

    pub fn last_failure(&self) -> Option<&RequestFailure> {
        self.last_failure.as_ref()
    }

    /// Fetch and parse the presentation document. Since segment lists are
    /// inline there is no separate media-playlist state.
    pub async fn load(&mut self) -> EngineResult<()> {
        let bytes = self.fetch(self.url.clone()).await?;
        let manifest = self.parser.parse(&bytes, self.url.as_str())?;
        if manifest.is_empty() {
            return Err(EngineError::PlaylistParse(
                "presentation document lists no renditions".into(),
            ));
        }
        debug!(url = %self.url, renditions = manifest.len(), "presentation document loaded");
        self.manifest = Some(manifest);
        self.state = LoaderState::HaveMetadata;
        Ok(())
    }

    /// Switch renditions. Applied immediately, unless a refresh is mid
    /// flight, in which case it lands right after the refresh completes.
    pub fn media_switch(&mut self, id: usize) -> EngineResult<()> {
        let manifest = self
            .manifest
            .as_ref()
            .ok_or_else(|| EngineError::RenditionNotFound(format!("rendition {id}")))?;
        if manifest.get(id).is_none() {
            return Err(EngineError::RenditionNotFound(format!("rendition {id}")));
        }

        if self.refreshing {
            self.deferred_switch = Some(id);
            return Ok(());
        }
        self.apply_switch(id);
        Ok(())
    }

    fn apply_switch(&mut self, id: usize) {
        if self.current == Some(id) {
            return;
        }
        let from = self.current;
        self.current = Some(id);
        self.state = LoaderState::HaveCurrentMetadata;
        self.emitter.emit_media_changed(from, id);
    }

    /// Re-fetch the document and merge every rendition over its previous
    /// window. Returns the delay before the next refresh; a static
    /// presentation reports None.
    pub async fn refresh(&mut self) -> EngineResult<Option<Duration>> {
        self.refreshing = true;
        let result = self.refresh_inner().await;
        self.refreshing = false;
        if let Some(id) = self.deferred_switch.take() {
            self.apply_switch(id);
        }
        result
    }

    async fn refresh_inner(&mut self) -> EngineResult<Option<Duration>> {
        let bytes = self.fetch(self.url.clone()).await?;
        let fresh = self.parser.parse(&bytes, self.url.as_str())?;

        let manifest = match self.manifest.as_mut() {
            Some(manifest) => manifest,
            None => {
                self.manifest = Some(fresh);
                self.state = LoaderState::HaveMetadata;
                return Ok(self.next_refresh_delay(true));
            }
        };

        let mut any_changed = false;
        for fresh_rendition in fresh.renditions() {
            let Some(old) = manifest.by_uri(&fresh_rendition.uri) else {
                continue;
            };
            let id = old.id;
            let (merged, outcome) = merge_rendition(old, fresh_rendition.clone());
            if matches!(outcome, MergeOutcome::Updated { .. }) {
                any_changed = true;
            }
            if let Some(slot) = manifest.get_mut(id) {
                *slot = merged;
            }
        }
        manifest.minimum_update_period = fresh.minimum_update_period;

        if let Some(id) = self.current {
            if any_changed {
                self.emitter.emit_playlist_loaded(id);
            } else {
                self.emitter.emit_playlist_unchanged(id);
            }
        }
        Ok(self.next_refresh_delay(any_changed))
    }

    fn next_refresh_delay(&self, changed: bool) -> Option<Duration> {
        let manifest = self.manifest.as_ref()?;
        if let Some(period) = manifest.minimum_update_period {
            return Some(period);
        }
        let current = self.media()?;
        if !current.is_live() {
            return None;
        }
        Some(refresh_delay(current, changed))
    }

    /// One-shot wall-clock synchronization against a time endpoint whose
    /// body is milliseconds since epoch. Live-edge math uses server time;
    /// skew between the client clock and the packager would otherwise walk
    /// the playhead off the window.
    pub async fn sync_clock(&mut self, time_url: Url) -> EngineResult<()> {
        if self.clock_offset.is_some() {
            return Ok(());
        }
        let bytes = self.fetch(time_url.clone()).await?;
        let body = std::str::from_utf8(&bytes)
            .map_err(|_| EngineError::PlaylistParse("time endpoint body is not utf-8".into()))?;
        let server_ms: f64 = body
            .trim()
            .parse()
            .map_err(|_| EngineError::PlaylistParse("time endpoint body is not a number".into()))?;
        let local_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as f64)
            .unwrap_or(0.0);
        self.clock_offset = Some((server_ms - local_ms) / 1000.0);
        debug!(offset = self.clock_offset, "clock synchronized");
        Ok(())
    }

    async fn fetch(&mut self, url: Url) -> EngineResult<bytes::Bytes> {
        match self.transport.get(url.clone(), RequestOptions::default()).await {
            Ok(response) => {
                self.last_failure = None;
                Ok(response.bytes)
            }
            Err(error) => {
                let failure = RequestFailure::from_net(&error);
                warn!(url = %url, code = failure.code, "document request failed");
                self.last_failure = Some(failure);
                Err(error.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rill_net::Response;
    use unimock::{matching, MockFn, Unimock};

    use crate::playlist::Segment;
    use crate::services::ManifestParserMock;

    use super::*;

    fn inline_rendition(id: usize, count: usize, live: bool) -> Rendition {
        let mut rendition = Rendition::new(id, format!("rep-{id}"));
        rendition.end_list = !live;
        rendition.segments = (0..count)
            .map(|i| Segment::new(format!("rep-{id}-s{i}.m4s"), 4.0))
            .collect();
        rendition
    }

    fn transport() -> Unimock {
        Unimock::new(
            rill_net::TransportMock::get
                .each_call(matching!(_, _))
                .answers(&|_, _, _| {
                    Ok(Response {
                        bytes: Bytes::from_static(b"<doc/>"),
                        headers: rill_net::Headers::default(),
                        status: 200,
                    })
                }),
        )
    }

    fn loader_with(parser: Unimock) -> DocumentLoader {
        DocumentLoader::new(
            Arc::new(transport()),
            Arc::new(parser),
            EventEmitter::default(),
            Url::parse("http://example.com/manifest.mpd").expect("url"),
        )
    }

    #[tokio::test]
    async fn load_goes_straight_to_metadata() {
        let parser = Unimock::new(
            ManifestParserMock::parse
                .some_call(matching!(_, _))
                .answers(&|_, _, _| {
                    Ok(Manifest::new(vec![
                        inline_rendition(0, 3, false),
                        inline_rendition(1, 3, false),
                    ]))
                }),
        );
        let mut loader = loader_with(parser);

        loader.load().await.expect("load");
        assert_eq!(loader.state(), LoaderState::HaveMetadata);
    }

    #[tokio::test]
    async fn switch_is_local_and_immediate() {
        let parser = Unimock::new(
            ManifestParserMock::parse
                .some_call(matching!(_, _))
                .answers(&|_, _, _| {
                    Ok(Manifest::new(vec![
                        inline_rendition(0, 3, false),
                        inline_rendition(1, 3, false),
                    ]))
                }),
        );
        let mut loader = loader_with(parser);
        loader.load().await.expect("load");

        loader.media_switch(1).expect("switch");
        assert_eq!(loader.current_id(), Some(1));
        assert_eq!(loader.state(), LoaderState::HaveCurrentMetadata);
        assert_eq!(loader.media().map(|r| r.segments.len()), Some(3));
    }

    #[tokio::test]
    async fn static_presentation_needs_no_refresh() {
        let parser = Unimock::new(
            ManifestParserMock::parse
                .each_call(matching!(_, _))
                .answers(&|_, _, _| Ok(Manifest::new(vec![inline_rendition(0, 3, false)]))),
        );
        let mut loader = loader_with(parser);
        loader.load().await.expect("load");
        loader.media_switch(0).expect("switch");

        let delay = loader.refresh().await.expect("refresh");
        assert_eq!(delay, None);
    }

    #[tokio::test]
    async fn advertised_update_period_wins() {
        let parser = Unimock::new(
            ManifestParserMock::parse
                .each_call(matching!(_, _))
                .answers(&|_, _, _| {
                    let mut manifest = Manifest::new(vec![inline_rendition(0, 3, true)]);
                    manifest.minimum_update_period = Some(Duration::from_secs(2));
                    Ok(manifest)
                }),
        );
        let mut loader = loader_with(parser);
        loader.load().await.expect("load");
        loader.media_switch(0).expect("switch");

        let delay = loader.refresh().await.expect("refresh");
        assert_eq!(delay, Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn refresh_merges_grown_windows() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        let parser = Unimock::new(
            ManifestParserMock::parse
                .each_call(matching!(_, _))
                .answers(&|_, _, _| {
                    let count = if CALLS.fetch_add(1, Ordering::SeqCst) == 0 { 3 } else { 4 };
                    Ok(Manifest::new(vec![inline_rendition(0, count, true)]))
                }),
        );
        let mut loader = loader_with(parser);
        loader.load().await.expect("load");
        loader.media_switch(0).expect("switch");

        loader.refresh().await.expect("refresh");
        assert_eq!(loader.media().map(|r| r.segments.len()), Some(4));
    }

    #[tokio::test]
    async fn clock_sync_is_one_shot() {
        let parser = Unimock::new(());
        let mut loader = DocumentLoader::new(
            Arc::new(Unimock::new(
                rill_net::TransportMock::get
                    .some_call(matching!(_, _))
                    .answers(&|_, _, _| {
                        Ok(Response {
                            bytes: Bytes::from_static(b"1700000000000"),
                            headers: rill_net::Headers::default(),
                            status: 200,
                        })
                    }),
            )),
            Arc::new(parser),
            EventEmitter::default(),
            Url::parse("http://example.com/manifest.mpd").expect("url"),
        );

        let time_url = Url::parse("http://example.com/time").expect("url");
        loader.sync_clock(time_url.clone()).await.expect("sync");
        let first = loader.clock_offset().expect("offset");

        // Second call must not hit the network (the mock allows one call).
        loader.sync_clock(time_url).await.expect("sync again");
        assert_eq!(loader.clock_offset(), Some(first));
    }
}
