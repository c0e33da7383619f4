//! Control channel: JSON text frames to and from the service
//!
//! A [`ControlChannel`] is a transport-agnostic handle. Outgoing frames go
//! through an unbounded queue drained by the transport's writer; incoming
//! frames are published by the transport's reader on the channel's event bus.
//!
//! A new channel holds inbound events back until its owner has subscribed
//! and calls [`ControlChannel::resume`], so frames that arrive while the
//! owner is still setting up are replayed instead of lost.

mod websocket;

pub use websocket::WsConnector;

use crate::protocol::ClientMessage;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dh2d_primitives::{EventBus, Subscription};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

/// Frames handed to the transport writer
#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingFrame {
    Text(String),
    /// Close the connection; nothing is sent after this
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlEventKind {
    Text,
    Binary,
    Closed,
}

/// Inbound control channel event
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    Text(String),
    Binary(Bytes),
    /// Remote side closed the connection (or it failed)
    Closed,
}

impl ControlEvent {
    pub fn kind(&self) -> ControlEventKind {
        match self {
            ControlEvent::Text(_) => ControlEventKind::Text,
            ControlEvent::Binary(_) => ControlEventKind::Binary,
            ControlEvent::Closed => ControlEventKind::Closed,
        }
    }
}

struct ChannelInner {
    url: String,
    outbound: mpsc::UnboundedSender<OutgoingFrame>,
    events: EventBus<ControlEventKind, ControlEvent>,
    closed: AtomicBool,
    /// Inbound events waiting for `resume`; `None` once live
    held: Mutex<Option<Vec<ControlEvent>>>,
}

/// Handle to an open control channel
#[derive(Clone)]
pub struct ControlChannel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("url", &self.inner.url)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ControlChannel {
    /// Create a channel whose outgoing frames are written to `outbound`
    ///
    /// The transport publishes inbound frames with [`ControlChannel::deliver`].
    pub fn new(url: impl Into<String>, outbound: mpsc::UnboundedSender<OutgoingFrame>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                url: url.into(),
                outbound,
                events: EventBus::new(),
                closed: AtomicBool::new(false),
                held: Mutex::new(Some(Vec::new())),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Serialize and send a message
    pub fn send(&self, message: &ClientMessage) -> Result<()> {
        self.send_text(message.to_json()?)
    }

    pub fn send_text(&self, text: String) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ControlClosed);
        }
        self.inner
            .outbound
            .send(OutgoingFrame::Text(text))
            .map_err(|_| Error::ControlClosed)
    }

    /// Close from the local side
    ///
    /// Idempotent. Does not publish [`ControlEvent::Closed`].
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!(url = %self.inner.url, "Closing control channel");
            let _ = self.inner.outbound.send(OutgoingFrame::Close);
        }
    }

    /// Subscribe to inbound events of `kind`
    pub fn on<F>(&self, kind: ControlEventKind, handler: F) -> Subscription
    where
        F: Fn(&ControlEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, handler)
    }

    /// Publish an inbound event (transport side)
    ///
    /// Events after a close are dropped; the first remote `Closed` is
    /// published once. Until [`ControlChannel::resume`] is called events are
    /// held back in arrival order.
    pub fn deliver(&self, event: ControlEvent) {
        match event {
            ControlEvent::Closed => {
                if self.inner.closed.swap(true, Ordering::SeqCst) {
                    return;
                }
            }
            _ if self.is_closed() => return,
            _ => {}
        }

        if let Some(held) = self.inner.held.lock().as_mut() {
            held.push(event);
            return;
        }
        self.inner.events.emit(event.kind(), &event);
    }

    /// Replay held inbound events to current subscribers and publish every
    /// later event directly
    ///
    /// Idempotent. Events delivered during the replay keep their order.
    pub fn resume(&self) {
        loop {
            let batch = {
                let mut held = self.inner.held.lock();
                match held.as_mut() {
                    None => return,
                    Some(events) if events.is_empty() => {
                        *held = None;
                        return;
                    }
                    Some(events) => std::mem::take(events),
                }
            };
            if !batch.is_empty() {
                debug!(url = %self.inner.url, held = batch.len(), "Replaying held control events");
            }
            for event in batch {
                self.inner.events.emit(event.kind(), &event);
            }
        }
    }

    /// Whether inbound events are still held back
    pub fn is_holding(&self) -> bool {
        self.inner.held.lock().is_some()
    }
}

/// Opens control channels
#[async_trait]
pub trait ControlConnector: Send + Sync {
    /// Open a channel to `url`
    ///
    /// The channel is returned holding inbound events; callers subscribe and
    /// then call [`ControlChannel::resume`].
    async fn connect(&self, url: &Url) -> Result<ControlChannel>;
}
