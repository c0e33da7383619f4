//! Media transport seam
//!
//! The session never touches codecs or ICE directly. A [`MediaEngine`]
//! creates transports for a role; each [`MediaTransport`] produces a local
//! description, accepts the remote one, and reports state changes and remote
//! tracks on its event bus.

mod negotiation;

pub use negotiation::{negotiate, HttpNegotiator, Negotiator};

use crate::Result;
use async_trait::async_trait;
use dh2d_primitives::EventBus;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Connection state of a media transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// States from which the transport will not recover
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransportState::Disconnected | TransportState::Failed | TransportState::Closed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportState::New => "new",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// What a transport carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportRole {
    /// Receive-only audio + video from the avatar
    Primary,
    /// Send-only microphone (or caller-supplied) audio
    AudioInput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportEventKind {
    StateChange,
    Track,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChange(TransportState),
    /// A remote track arrived
    Track(TrackKind),
}

impl TransportEvent {
    pub fn kind(&self) -> TransportEventKind {
        match self {
            TransportEvent::StateChange(_) => TransportEventKind::StateChange,
            TransportEvent::Track(_) => TransportEventKind::Track,
        }
    }
}

/// Inbound RTP counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InboundStats {
    /// Video frames received
    pub frames_received: u64,
    /// Total duration of received audio samples, in seconds
    pub audio_samples_duration: f64,
}

/// Session description exchanged with the negotiation endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "offer".to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp: sdp.into(),
        }
    }
}

/// A single media transport
#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn role(&self) -> TransportRole;

    /// Create the local offer (complete, with gathered candidates)
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn apply_answer(&self, answer: SessionDescription) -> Result<()>;

    fn state(&self) -> TransportState;

    /// Event bus carrying state changes and remote tracks
    fn events(&self) -> EventBus<TransportEventKind, TransportEvent>;

    async fn stats(&self) -> Result<InboundStats>;

    /// Idempotent
    fn close(&self);
}

/// Creates media transports
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_transport(&self, role: TransportRole) -> Result<Arc<dyn MediaTransport>>;
}
