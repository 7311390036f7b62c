use tokio::sync::broadcast;

/// Events observed by the host player.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    PlaylistLoaded {
        rendition: usize,
    },
    PlaylistUnchanged {
        rendition: usize,
    },
    MediaChanged {
        from: Option<usize>,
        to: usize,
    },
    Progress {
        rendition: usize,
        media_index: usize,
        bytes_received: u64,
    },
    BandwidthUpdated {
        bits_per_second: u64,
    },
    RenditionExcluded {
        rendition: usize,
        permanent: bool,
    },
    SyncInfoUpdated {
        timeline: u64,
    },
    SeekableChanged {
        start: f64,
        end: f64,
    },
    StallCorrected {
        seek_to: f64,
    },
    EndOfStream,
    Error {
        error: String,
        recoverable: bool,
    },
}

#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn emit_playlist_loaded(&self, rendition: usize) {
        self.emit(EngineEvent::PlaylistLoaded { rendition });
    }

    pub fn emit_playlist_unchanged(&self, rendition: usize) {
        self.emit(EngineEvent::PlaylistUnchanged { rendition });
    }

    pub fn emit_media_changed(&self, from: Option<usize>, to: usize) {
        self.emit(EngineEvent::MediaChanged { from, to });
    }

    pub fn emit_progress(&self, rendition: usize, media_index: usize, bytes_received: u64) {
        self.emit(EngineEvent::Progress {
            rendition,
            media_index,
            bytes_received,
        });
    }

    pub fn emit_bandwidth_updated(&self, bits_per_second: u64) {
        self.emit(EngineEvent::BandwidthUpdated { bits_per_second });
    }

    pub fn emit_rendition_excluded(&self, rendition: usize, permanent: bool) {
        self.emit(EngineEvent::RenditionExcluded {
            rendition,
            permanent,
        });
    }

    pub fn emit_sync_info_updated(&self, timeline: u64) {
        self.emit(EngineEvent::SyncInfoUpdated { timeline });
    }

    pub fn emit_seekable_changed(&self, start: f64, end: f64) {
        self.emit(EngineEvent::SeekableChanged { start, end });
    }

    pub fn emit_stall_corrected(&self, seek_to: f64) {
        self.emit(EngineEvent::StallCorrected { seek_to });
    }

    pub fn emit_end_of_stream(&self) {
        self.emit(EngineEvent::EndOfStream);
    }

    pub fn emit_error(&self, error: &str, recoverable: bool) {
        self.emit(EngineEvent::Error {
            error: error.to_string(),
            recoverable,
        });
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_receives_emitted_events() {
        let emitter = EventEmitter::new(8);
        let mut rx = emitter.subscribe();

        emitter.emit_end_of_stream();

        let event = rx.try_recv().ok();
        assert!(matches!(event, Some(EngineEvent::EndOfStream)));
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let emitter = EventEmitter::new(8);
        emitter.emit_playlist_loaded(0);
    }
}
