//! Live connection handle and the protocol that establishes it

mod establish;
mod retry;

pub use establish::Establisher;
pub use retry::RetryPolicy;

use crate::control::ControlChannel;
use crate::media::MediaTransport;
use crate::protocol::{AppMessage, ClientMessage};
use crate::render::RenderSurface;
use crate::Result;
use bytes::Bytes;
use dh2d_primitives::{EventBus, Subscription, Subscriptions};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEventKind {
    Message,
    Audio,
}

/// Inbound traffic re-emitted by a connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Whitelisted application message
    Message(AppMessage),
    /// Raw inbound audio frame
    Audio(Bytes),
}

impl ConnectionEvent {
    pub fn kind(&self) -> ConnectionEventKind {
        match self {
            ConnectionEvent::Message(_) => ConnectionEventKind::Message,
            ConnectionEvent::Audio(_) => ConnectionEventKind::Audio,
        }
    }
}

struct ConnectionInner {
    session_id: String,
    control: ControlChannel,
    primary: Arc<dyn MediaTransport>,
    secondary: Option<Arc<dyn MediaTransport>>,
    surface: Arc<dyn RenderSurface>,
    events: EventBus<ConnectionEventKind, ConnectionEvent>,
    /// Control channel subscriptions feeding `events`
    relay: Arc<Mutex<Subscriptions>>,
    closed: AtomicBool,
}

/// A fully established connection
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("session_id", &self.inner.session_id)
            .field("secondary", &self.inner.secondary.is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Parts of a connection assembled by an attempt
pub struct ConnectionParts {
    pub session_id: String,
    pub control: ControlChannel,
    pub primary: Arc<dyn MediaTransport>,
    pub secondary: Option<Arc<dyn MediaTransport>>,
    pub surface: Arc<dyn RenderSurface>,
    pub events: EventBus<ConnectionEventKind, ConnectionEvent>,
    pub relay: Arc<Mutex<Subscriptions>>,
}

impl Connection {
    pub fn from_parts(parts: ConnectionParts) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                session_id: parts.session_id,
                control: parts.control,
                primary: parts.primary,
                secondary: parts.secondary,
                surface: parts.surface,
                events: parts.events,
                relay: parts.relay,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Session id assigned by the server
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn control(&self) -> &ControlChannel {
        &self.inner.control
    }

    pub fn primary(&self) -> &Arc<dyn MediaTransport> {
        &self.inner.primary
    }

    pub fn secondary(&self) -> Option<&Arc<dyn MediaTransport>> {
        self.inner.secondary.as_ref()
    }

    pub fn surface(&self) -> &Arc<dyn RenderSurface> {
        &self.inner.surface
    }

    pub fn send(&self, message: &ClientMessage) -> Result<()> {
        self.inner.control.send(message)
    }

    pub fn on<F>(&self, kind: ConnectionEventKind, handler: F) -> Subscription
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, handler)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Release the control channel, both transports and the render binding
    ///
    /// Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(session_id = %self.inner.session_id, "Closing connection");
        self.inner.relay.lock().unsubscribe_all();
        self.inner.control.close();
        self.inner.primary.close();
        if let Some(secondary) = &self.inner.secondary {
            secondary.close();
        }
        self.inner.surface.detach();
        self.inner.events.clear();
    }
}
