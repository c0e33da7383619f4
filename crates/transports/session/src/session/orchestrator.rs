//! Session orchestrator
//!
//! A [`Session`] is the single logical session callers interact with. A
//! driver task owns the connection lifecycle:
//!
//! ```text
//! pending -> connecting -> connected -> reconnecting -> connected -> ...
//!                                                    \-> closed | failed
//! ```
//!
//! Messages sent while no connection is live are kept in a FIFO backlog. On
//! every (re)connect the cached `config` message is replayed first, then the
//! backlog is drained, all before the connection is published for new sends.
//! A send never overtakes the backlog: while it is non-empty new messages
//! queue behind it.

use super::admission::{AdmissionGate, CapacityGate, SessionRegistry, SessionTicket};
use super::lifecycle::{DefaultLifecycle, Lifecycle};
use crate::auth::{AuthCheck, HttpAuthCheck};
use crate::config::{generate_session_id, ClientConfig, SessionConfig};
use crate::connection::{Connection, ConnectionEvent, ConnectionEventKind, Establisher};
use crate::control::WsConnector;
use crate::media::{HttpNegotiator, MediaEngine};
use crate::protocol::{AppMessage, ClientMessage};
use crate::render::RenderSurface;
use crate::{Error, Result};
use bytes::Bytes;
use dh2d_primitives::{EventBus, HandlerId, Scope, Subscription, Subscriptions};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Externally visible session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Pending,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Reconnecting => "reconnecting",
            SessionStatus::Closed => "closed",
            SessionStatus::Failed => "failed",
        }
    }

    /// `Closed` or `Failed`
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Closed | SessionStatus::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    Message,
    Audio,
    StatusChange,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Message(AppMessage),
    Audio(Bytes),
    StatusChange(SessionStatus),
}

impl SessionEvent {
    pub fn kind(&self) -> SessionEventKind {
        match self {
            SessionEvent::Message(_) => SessionEventKind::Message,
            SessionEvent::Audio(_) => SessionEventKind::Audio,
            SessionEvent::StatusChange(_) => SessionEventKind::StatusChange,
        }
    }
}

/// Collaborators a session is built from
#[derive(Clone)]
pub struct SessionDeps {
    pub lifecycle: Arc<dyn Lifecycle>,
    pub auth: Arc<dyn AuthCheck>,
    pub admission: Arc<dyn AdmissionGate>,
}

impl SessionDeps {
    /// WebSocket control channel, HTTP negotiation and authentication against
    /// `client`, one active session at a time per `registry`
    pub fn http(client: ClientConfig, engine: Arc<dyn MediaEngine>, registry: SessionRegistry) -> Self {
        let establisher = Establisher::new(
            client.clone(),
            Arc::new(WsConnector::new()),
            engine,
            Arc::new(HttpNegotiator::default()),
        );
        Self {
            lifecycle: Arc::new(DefaultLifecycle::new(establisher)),
            auth: Arc::new(HttpAuthCheck::new(client)),
            admission: Arc::new(CapacityGate::new(registry)),
        }
    }
}

/// Where `send` goes right now
enum Outbound {
    Buffer,
    Live(Connection),
    Closed,
}

/// Messages waiting for a connection, in send order
#[derive(Default)]
struct Backlog(VecDeque<ClientMessage>);

impl Backlog {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn push(&mut self, message: ClientMessage) {
        self.0.push_back(message);
    }

    /// Deliver `message` now, or queue it if older messages are still waiting
    fn push_or_deliver<F>(&mut self, message: ClientMessage, deliver: F)
    where
        F: FnOnce(&ClientMessage) -> Result<()>,
    {
        if !self.0.is_empty() {
            self.0.push_back(message);
            return;
        }
        if let Err(e) = deliver(&message) {
            debug!(error = %e, "Send failed, keeping message for the next connection");
            self.0.push_back(message);
        }
    }

    /// Deliver queued messages in order, stopping at the first failure
    ///
    /// Returns how many were delivered.
    fn drain<F>(&mut self, mut deliver: F) -> usize
    where
        F: FnMut(&ClientMessage) -> Result<()>,
    {
        let mut delivered = 0;
        while let Some(message) = self.0.pop_front() {
            if let Err(e) = deliver(&message) {
                warn!(error = %e, remaining = self.0.len() + 1, "Backlog drain interrupted");
                self.0.push_front(message);
                break;
            }
            delivered += 1;
        }
        delivered
    }
}

struct State {
    status: SessionStatus,
    session_id: String,
    outbound: Outbound,
    backlog: Backlog,
    config: Option<ClientMessage>,
}

struct Shared {
    video_id: String,
    state: Mutex<State>,
    events: EventBus<SessionEventKind, SessionEvent>,
}

impl Shared {
    fn set_status(&self, status: SessionStatus) {
        {
            let mut state = self.state.lock();
            if state.status == status {
                return;
            }
            state.status = status;
        }
        info!(%status, "Session status changed");
        self.events
            .emit(SessionEventKind::StatusChange, &SessionEvent::StatusChange(status));
    }

    fn send(&self, message: ClientMessage) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match &state.outbound {
            Outbound::Closed => Err(Error::SessionClosed),
            Outbound::Buffer => {
                state.backlog.push(message);
                Ok(())
            }
            Outbound::Live(connection) => {
                state
                    .backlog
                    .push_or_deliver(message, |message| connection.send(message));
                Ok(())
            }
        }
    }

    fn config(&self, message: ClientMessage) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match &state.outbound {
            Outbound::Closed => return Err(Error::SessionClosed),
            Outbound::Buffer => {}
            Outbound::Live(connection) => {
                if let Err(e) = connection.send(&message) {
                    debug!(error = %e, "Config send failed, replaying on reconnect");
                }
            }
        }
        state.config = Some(message);
        Ok(())
    }

    /// Replay config, drain the backlog, then route sends to `connection`
    fn go_live(&self, connection: &Connection) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if matches!(state.outbound, Outbound::Closed) {
            return;
        }

        if let Some(config) = &state.config {
            if let Err(e) = connection.send(config) {
                warn!(error = %e, "Config replay failed");
            }
        }
        let drained = state.backlog.drain(|message| connection.send(message));
        if drained > 0 {
            debug!(drained, "Backlog drained");
        }

        state.session_id = connection.session_id().to_string();
        state.outbound = Outbound::Live(connection.clone());
    }

    fn buffer(&self) {
        let mut state = self.state.lock();
        if matches!(state.outbound, Outbound::Live(_)) {
            state.outbound = Outbound::Buffer;
        }
    }

    fn close_outbound(&self) {
        self.state.lock().outbound = Outbound::Closed;
    }
}

/// A resilient digital human session
///
/// Dropping a session closes it in the background; [`Session::close`] also
/// waits for the teardown to finish.
pub struct Session {
    shared: Arc<Shared>,
    scope: Scope,
    done: watch::Receiver<bool>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id())
            .field("video_id", &self.shared.video_id)
            .field("status", &self.status())
            .finish()
    }
}

impl Session {
    /// Create a session and start driving it on the current tokio runtime
    ///
    /// # Errors
    ///
    /// `Error::InvalidConfig` if `config` does not validate.
    pub fn new(
        deps: SessionDeps,
        surface: Arc<dyn RenderSurface>,
        mut config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let session_id = config.session_id.get_or_insert_with(generate_session_id).clone();

        let shared = Arc::new(Shared {
            video_id: config.video_id.clone(),
            state: Mutex::new(State {
                status: SessionStatus::Pending,
                session_id: session_id.clone(),
                outbound: Outbound::Buffer,
                backlog: Backlog::default(),
                config: None,
            }),
            events: EventBus::new(),
        });
        let scope = Scope::new();
        let (done_tx, done) = watch::channel(false);

        let span = info_span!("session", session_id = %session_id, video_id = %config.video_id);
        let driver = Driver {
            ticket: SessionTicket::new(session_id, config.video_id.clone()),
            shared: shared.clone(),
            deps,
            surface,
            config,
            scope: scope.clone(),
            admitted: false,
            forwarding: Subscriptions::new(),
            current: None,
        };
        tokio::spawn(
            async move {
                driver.run().await;
                let _ = done_tx.send(true);
            }
            .instrument(span),
        );

        Ok(Self {
            shared,
            scope,
            done,
        })
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.state.lock().status
    }

    /// Current session id; replaced by the server-assigned id on connect
    pub fn session_id(&self) -> String {
        self.shared.state.lock().session_id.clone()
    }

    pub fn video_id(&self) -> &str {
        &self.shared.video_id
    }

    /// Send a message, buffering it while no connection is live
    ///
    /// `config` messages are routed through [`Session::config`].
    ///
    /// # Errors
    ///
    /// `Error::SessionClosed` once the session has been closed.
    pub fn send(&self, message: ClientMessage) -> Result<()> {
        if message.is_config() {
            return self.shared.config(message);
        }
        self.shared.send(message)
    }

    /// Send a `config` message and replay it after every reconnect
    ///
    /// While disconnected the message is only cached.
    pub fn config(&self, fields: Map<String, Value>) -> Result<()> {
        self.shared.config(ClientMessage::config(fields))
    }

    pub fn on<F>(&self, kind: SessionEventKind, handler: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.shared.events.on(kind, handler)
    }

    pub fn off(&self, kind: SessionEventKind, handler: Option<HandlerId>) {
        self.shared.events.off(kind, handler)
    }

    /// Close the session and wait until it is torn down
    ///
    /// Idempotent. Returns the terminal status.
    pub async fn close(&self) -> SessionStatus {
        self.scope.trigger();
        let mut done = self.done.clone();
        let _ = done.wait_for(|done| *done).await;
        self.status()
    }

    /// Wait until the session reaches `closed` or `failed` on its own
    pub async fn closed(&self) -> SessionStatus {
        let mut done = self.done.clone();
        let _ = done.wait_for(|done| *done).await;
        self.status()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.scope.trigger();
    }
}

/// Owns the connection lifecycle of one session
struct Driver {
    shared: Arc<Shared>,
    deps: SessionDeps,
    surface: Arc<dyn RenderSurface>,
    config: SessionConfig,
    scope: Scope,
    ticket: SessionTicket,
    admitted: bool,
    /// Connection -> session event forwarding
    forwarding: Subscriptions,
    current: Option<Connection>,
}

impl Driver {
    async fn run(mut self) {
        let terminal = self.lifecycle().await;
        self.finish(terminal).await;
    }

    async fn lifecycle(&mut self) -> SessionStatus {
        match self.deps.admission.admit(&self.ticket, &self.scope).await {
            Ok(()) => self.admitted = true,
            Err(e) if e.is_aborted() => return SessionStatus::Closed,
            Err(e) => {
                error!(error = %e, "Admission failed");
                return SessionStatus::Failed;
            }
        }
        if self.scope.is_triggered() {
            return SessionStatus::Closed;
        }

        if let Err(status) = self.authenticate().await {
            return status;
        }
        self.shared.set_status(SessionStatus::Connecting);
        let mut connection = match self.connect().await {
            Ok(connection) => connection,
            Err(status) => return status,
        };

        loop {
            self.adopt(&connection);
            let reason = self
                .deps
                .lifecycle
                .until_failed(&connection, &self.config, &self.scope)
                .await;
            if self.scope.is_triggered() {
                return SessionStatus::Closed;
            }

            info!(reason = %reason, "Connection lost, reconnecting");
            self.shared.set_status(SessionStatus::Reconnecting);
            self.release().await;
            if self.scope.is_triggered() {
                return SessionStatus::Closed;
            }

            if let Err(status) = self.authenticate().await {
                return status;
            }
            connection = match self.connect().await {
                Ok(connection) => connection,
                Err(status) => return status,
            };
        }
    }

    async fn authenticate(&self) -> std::result::Result<(), SessionStatus> {
        match self.scope.until_triggered(self.deps.auth.is_logged_in()).await {
            Err(_) => Err(SessionStatus::Closed),
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => {
                warn!("Not logged in");
                Err(SessionStatus::Failed)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Authentication check failed");
                Err(SessionStatus::Failed)
            }
        }
    }

    async fn connect(&self) -> std::result::Result<Connection, SessionStatus> {
        let mut config = self.config.clone();
        config.session_id = Some(self.shared.state.lock().session_id.clone());

        match self
            .deps
            .lifecycle
            .connect(self.surface.clone(), &config, &self.scope)
            .await
        {
            Ok(connection) => Ok(connection),
            Err(e) if e.is_aborted() => Err(SessionStatus::Closed),
            Err(e) => {
                error!(error = %e, "Connect failed");
                Err(SessionStatus::Failed)
            }
        }
    }

    fn adopt(&mut self, connection: &Connection) {
        self.current = Some(connection.clone());

        let events = self.shared.events.clone();
        self.forwarding
            .push(connection.on(ConnectionEventKind::Message, move |event| {
                if let ConnectionEvent::Message(message) = event {
                    events.emit(SessionEventKind::Message, &SessionEvent::Message(message.clone()));
                }
            }));
        let events = self.shared.events.clone();
        self.forwarding
            .push(connection.on(ConnectionEventKind::Audio, move |event| {
                if let ConnectionEvent::Audio(data) = event {
                    events.emit(SessionEventKind::Audio, &SessionEvent::Audio(data.clone()));
                }
            }));

        self.shared.go_live(connection);
        self.shared.set_status(SessionStatus::Connected);
    }

    async fn release(&mut self) {
        self.shared.buffer();
        self.forwarding.unsubscribe_all();
        if let Some(connection) = self.current.take() {
            self.deps.lifecycle.disconnect(&connection).await;
        }
    }

    async fn finish(&mut self, terminal: SessionStatus) {
        self.shared.close_outbound();
        self.release().await;
        if self.admitted {
            self.deps.admission.release(&self.ticket).await;
        }
        self.shared.set_status(terminal);
        self.shared.events.clear();
    }
}
