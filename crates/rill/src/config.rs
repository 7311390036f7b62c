use std::time::Duration;

/// Buffering targets.
///
/// The forward-buffer goal ramps up with playback time so startup stays lean
/// while steady-state playback builds headroom.
#[derive(Clone, Copy, Debug)]
pub struct BufferOptions {
    /// Forward-buffer goal at playback start, in seconds.
    pub goal_base: f64,
    /// Seconds of goal added per second played.
    pub goal_rate: f64,
    /// Upper bound on the forward-buffer goal, in seconds.
    pub goal_max: f64,
    /// Below this much forward buffer the loaders may switch renditions
    /// immediately instead of waiting for the buffer to drain.
    pub low_water_line: f64,
    /// Seconds of media kept behind the playhead before trimming.
    pub back_buffer: f64,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            goal_base: 30.0,
            goal_rate: 0.5,
            goal_max: 60.0,
            low_water_line: 30.0,
            back_buffer: 30.0,
        }
    }
}

impl BufferOptions {
    /// Forward-buffer goal after `played` seconds of playback.
    pub fn goal_at(&self, played: f64) -> f64 {
        (self.goal_base + self.goal_rate * played.max(0.0)).min(self.goal_max)
    }
}

/// Rendition exclusion behaviour.
#[derive(Clone, Copy, Debug)]
pub struct ExclusionOptions {
    /// How long a rendition stays excluded after a recoverable failure.
    pub default_duration: Duration,
}

impl Default for ExclusionOptions {
    fn default() -> Self {
        Self {
            default_duration: Duration::from_secs(60),
        }
    }
}

/// Workarounds for media sink implementations with ordering constraints.
#[derive(Clone, Copy, Debug)]
pub struct SinkQuirks {
    /// Hold audio appends until the first video append lands. Some sinks
    /// mis-order decode when audio for a timestamp arrives first.
    pub delay_audio_until_video_append: bool,
}

impl Default for SinkQuirks {
    fn default() -> Self {
        Self {
            delay_audio_until_video_append: true,
        }
    }
}

/// Stall detection tuning.
#[derive(Clone, Copy, Debug)]
pub struct StallOptions {
    /// Playback poll interval.
    pub poll_interval: Duration,
    /// Video may trail the playhead by up to this window before it counts as
    /// underflow rather than a seek target.
    pub underflow_min_behind: f64,
    pub underflow_max_behind: f64,
    /// Offset added when seeking past a gap, to land safely inside the next
    /// buffered range.
    pub gap_skip_offset: f64,
    /// Consecutive no-progress polls while buffered before nudging the
    /// playhead in place.
    pub stuck_polls_before_nudge: u32,
}

impl Default for StallOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            underflow_min_behind: 2.0,
            underflow_max_behind: 4.0,
            gap_skip_offset: 0.1,
            stuck_polls_before_nudge: 5,
        }
    }
}

/// Top-level engine configuration.
#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    pub buffer: BufferOptions,
    pub exclusion: ExclusionOptions,
    pub quirks: SinkQuirks,
    pub stall: StallOptions,
    pub net: rill_net::NetOptions,
    pub abr: rill_abr::AbrOptions,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer(mut self, buffer: BufferOptions) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn with_exclusion(mut self, exclusion: ExclusionOptions) -> Self {
        self.exclusion = exclusion;
        self
    }

    pub fn with_quirks(mut self, quirks: SinkQuirks) -> Self {
        self.quirks = quirks;
        self
    }

    pub fn with_stall(mut self, stall: StallOptions) -> Self {
        self.stall = stall;
        self
    }

    pub fn with_net(mut self, net: rill_net::NetOptions) -> Self {
        self.net = net;
        self
    }

    pub fn with_abr(mut self, abr: rill_abr::AbrOptions) -> Self {
        self.abr = abr;
        self
    }
}
