//! Rendering seam
//!
//! A [`RenderSurface`] presents the primary transport's media. The session
//! only needs playback events for readiness and stall detection, a snapshot
//! of the playback position, and the static cover used to hide reconnects.

use crate::media::MediaTransport;
use crate::Result;
use dh2d_primitives::EventBus;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaybackEvent {
    /// Enough data to start rendering
    CanPlay,
    /// Playback started or resumed
    Playing,
    /// Playback position advanced
    TimeUpdate,
    /// Playback stopped for lack of data
    Waiting,
}

/// Buffered media time range, in seconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

/// Playback state at one instant
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackSnapshot {
    /// Current position, in seconds
    pub current_time: f64,
    pub duration: f64,
    pub paused: bool,
    pub ended: bool,
    /// HTML media ready state (0 = nothing loaded .. 4 = enough data)
    pub ready_state: u8,
    pub buffered: Vec<TimeRange>,
}

impl PlaybackSnapshot {
    /// Whether buffered data extends at least `margin` seconds past the
    /// current position
    pub fn has_data_ahead(&self, margin: f64) -> bool {
        self.buffered
            .iter()
            .any(|range| range.end > self.current_time + margin)
    }

    pub fn ready_state_description(&self) -> &'static str {
        match self.ready_state {
            0 => "no media data loaded",
            1 => "metadata loaded, no data to play",
            2 => "data for current position only",
            3 => "data to play a little ahead",
            4 => "enough data to keep playing",
            _ => "unknown state",
        }
    }
}

/// Where the avatar is rendered
pub trait RenderSurface: Send + Sync {
    /// Present the transport's remote media
    fn attach(&self, transport: Arc<dyn MediaTransport>) -> Result<()>;

    /// Stop presenting; idempotent
    fn detach(&self);

    fn events(&self) -> EventBus<PlaybackEvent, PlaybackSnapshot>;

    fn snapshot(&self) -> PlaybackSnapshot;

    fn play(&self);

    /// Freeze the last frame as a static cover
    fn draw_cover(&self);

    fn cover_visible(&self) -> bool;

    fn hide_cover(&self);
}
