//! In-memory media engine, transport and negotiator

use async_trait::async_trait;
use dh2d_primitives::EventBus;
use dh2d_session::media::{
    InboundStats, MediaEngine, MediaTransport, Negotiator, SessionDescription, TrackKind,
    TransportEvent, TransportEventKind, TransportRole, TransportState,
};
use dh2d_session::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub struct FakeTransport {
    role: TransportRole,
    state: Mutex<TransportState>,
    stats: Mutex<InboundStats>,
    events: EventBus<TransportEventKind, TransportEvent>,
}

impl FakeTransport {
    fn new(role: TransportRole) -> Self {
        Self {
            role,
            state: Mutex::new(TransportState::New),
            stats: Mutex::new(InboundStats::default()),
            events: EventBus::new(),
        }
    }

    /// Change state and publish it
    pub fn set_state(&self, state: TransportState) {
        *self.state.lock() = state;
        self.events
            .emit(TransportEventKind::StateChange, &TransportEvent::StateChange(state));
    }

    pub fn set_stats(&self, frames_received: u64, audio_samples_duration: f64) {
        *self.stats.lock() = InboundStats {
            frames_received,
            audio_samples_duration,
        };
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    fn role(&self) -> TransportRole {
        self.role
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer(format!("v=0 {:?}", self.role)))
    }

    async fn apply_answer(&self, _answer: SessionDescription) -> Result<()> {
        self.set_state(TransportState::Connected);
        if self.role == TransportRole::Primary {
            self.events
                .emit(TransportEventKind::Track, &TransportEvent::Track(TrackKind::Audio));
            self.events
                .emit(TransportEventKind::Track, &TransportEvent::Track(TrackKind::Video));
        }
        Ok(())
    }

    fn state(&self) -> TransportState {
        *self.state.lock()
    }

    fn events(&self) -> EventBus<TransportEventKind, TransportEvent> {
        self.events.clone()
    }

    async fn stats(&self) -> Result<InboundStats> {
        Ok(*self.stats.lock())
    }

    fn close(&self) {
        *self.state.lock() = TransportState::Closed;
    }
}

#[derive(Default)]
pub struct FakeEngine {
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    create_delay: Mutex<Duration>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take `delay` to create each transport
    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock() = delay;
    }

    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.transports.lock().clone()
    }

    /// Most recent transport of `role`
    pub fn last(&self, role: TransportRole) -> Arc<FakeTransport> {
        self.transports
            .lock()
            .iter()
            .rev()
            .find(|t| t.role == role)
            .cloned()
            .expect("no transport of that role")
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn create_transport(&self, role: TransportRole) -> Result<Arc<dyn MediaTransport>> {
        let delay = *self.create_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let transport = Arc::new(FakeTransport::new(role));
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

/// Answers every offer, optionally failing the first few
#[derive(Default)]
pub struct FakeNegotiator {
    urls: Mutex<Vec<Url>>,
    fail: AtomicUsize,
}

impl FakeNegotiator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, n: usize) {
        self.fail.store(n, Ordering::SeqCst);
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().iter().map(|u| u.path().to_string()).collect()
    }
}

#[async_trait]
impl Negotiator for FakeNegotiator {
    async fn exchange(&self, url: &Url, offer: SessionDescription) -> Result<SessionDescription> {
        self.urls.lock().push(url.clone());
        if self
            .fail
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Negotiation("503 Service Unavailable".to_string()));
        }
        Ok(SessionDescription::answer(offer.sdp))
    }
}
