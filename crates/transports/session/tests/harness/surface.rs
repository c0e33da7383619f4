//! Render surface that records what the session asks of it

use dh2d_primitives::EventBus;
use dh2d_session::media::MediaTransport;
use dh2d_session::render::{PlaybackEvent, PlaybackSnapshot, RenderSurface, TimeRange};
use dh2d_session::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub struct FakeSurface {
    events: EventBus<PlaybackEvent, PlaybackSnapshot>,
    snapshot: Mutex<PlaybackSnapshot>,
    attached: AtomicBool,
    auto_can_play: AtomicBool,
    cover: AtomicBool,
    covers_drawn: AtomicUsize,
    plays: AtomicUsize,
}

impl FakeSurface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: EventBus::new(),
            snapshot: Mutex::new(PlaybackSnapshot {
                paused: true,
                ..Default::default()
            }),
            attached: AtomicBool::new(false),
            auto_can_play: AtomicBool::new(true),
            cover: AtomicBool::new(false),
            covers_drawn: AtomicUsize::new(0),
            plays: AtomicUsize::new(0),
        })
    }

    /// Whether attaching a transport reports `can_play` right away
    pub fn set_auto_can_play(&self, enabled: bool) {
        self.auto_can_play.store(enabled, Ordering::SeqCst);
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn covers_drawn(&self) -> usize {
        self.covers_drawn.load(Ordering::SeqCst)
    }

    pub fn plays(&self) -> usize {
        self.plays.load(Ordering::SeqCst)
    }

    pub fn set_snapshot(&self, snapshot: PlaybackSnapshot) {
        *self.snapshot.lock() = snapshot;
    }

    /// Playing at `time` with data buffered up to `buffered_end`
    pub fn play_at(&self, time: f64, buffered_end: f64, ready_state: u8) {
        self.set_snapshot(PlaybackSnapshot {
            current_time: time,
            duration: f64::INFINITY,
            paused: false,
            ended: false,
            ready_state,
            buffered: vec![TimeRange {
                start: 0.0,
                end: buffered_end,
            }],
        });
    }

    /// Publish `event` with the current snapshot
    pub fn emit(&self, event: PlaybackEvent) {
        let snapshot = self.snapshot();
        self.events.emit(event, &snapshot);
    }
}

impl RenderSurface for FakeSurface {
    fn attach(&self, _transport: Arc<dyn MediaTransport>) -> Result<()> {
        self.attached.store(true, Ordering::SeqCst);
        if self.auto_can_play.load(Ordering::SeqCst) {
            self.emit(PlaybackEvent::CanPlay);
        }
        Ok(())
    }

    fn detach(&self) {
        self.attached.store(false, Ordering::SeqCst);
    }

    fn events(&self) -> EventBus<PlaybackEvent, PlaybackSnapshot> {
        self.events.clone()
    }

    fn snapshot(&self) -> PlaybackSnapshot {
        self.snapshot.lock().clone()
    }

    fn play(&self) {
        self.plays.fetch_add(1, Ordering::SeqCst);
        self.snapshot.lock().paused = false;
    }

    fn draw_cover(&self) {
        self.covers_drawn.fetch_add(1, Ordering::SeqCst);
        self.cover.store(true, Ordering::SeqCst);
    }

    fn cover_visible(&self) -> bool {
        self.cover.load(Ordering::SeqCst)
    }

    fn hide_cover(&self) {
        self.cover.store(false, Ordering::SeqCst);
    }
}
