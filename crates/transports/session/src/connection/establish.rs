//! Connection establishment
//!
//! One attempt opens the control channel, waits for the server's session
//! ready message, negotiates the primary (and optional audio input)
//! transport, and waits for the render surface to be able to play. Every
//! resource an attempt opens is registered on the attempt's own scope, so a
//! failed, timed out or cancelled attempt releases everything it touched.
//! Attempts are retried until one succeeds or the caller's scope triggers.

use super::{Connection, ConnectionEvent, ConnectionEventKind, ConnectionParts};
use crate::config::{ClientConfig, SessionConfig};
use crate::control::{ControlChannel, ControlConnector, ControlEvent, ControlEventKind};
use crate::media::{
    negotiate, MediaEngine, MediaTransport, Negotiator, TrackKind, TransportEvent,
    TransportEventKind, TransportRole,
};
use crate::protocol::ServerMessage;
use crate::render::{PlaybackEvent, RenderSurface};
use crate::{Error, Result};
use dh2d_primitives::{EventBus, Scope, Subscriptions};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, trace, warn};
use url::Url;

/// Listeners that only live for one attempt
struct AttemptListeners(Subscriptions);

impl Drop for AttemptListeners {
    fn drop(&mut self) {
        self.0.unsubscribe_all();
    }
}

/// Opens connections with retry
pub struct Establisher {
    client: ClientConfig,
    connector: Arc<dyn ControlConnector>,
    engine: Arc<dyn MediaEngine>,
    negotiator: Arc<dyn Negotiator>,
}

impl Establisher {
    pub fn new(
        client: ClientConfig,
        connector: Arc<dyn ControlConnector>,
        engine: Arc<dyn MediaEngine>,
        negotiator: Arc<dyn Negotiator>,
    ) -> Self {
        Self {
            client,
            connector,
            engine,
            negotiator,
        }
    }

    /// Control channel URL for a session
    pub fn control_url(&self, config: &SessionConfig) -> Result<Url> {
        self.client.control_url(config)
    }

    /// Negotiation endpoint for one transport
    pub fn offer_url(&self, session_id: &str, role: TransportRole) -> Result<Url> {
        self.client.offer_url(session_id, role)
    }

    /// Connect, retrying failed attempts until `scope` triggers
    ///
    /// # Errors
    ///
    /// - `Error::Aborted` once `scope` has triggered, including when it
    ///   triggers while an attempt is about to succeed
    /// - non-retryable errors (configuration, authentication) as-is
    #[instrument(name = "connect", skip_all, fields(video_id = %config.video_id))]
    pub async fn connect(
        &self,
        surface: Arc<dyn RenderSurface>,
        config: &SessionConfig,
        scope: &Scope,
    ) -> Result<Connection> {
        let video_visible = Arc::new(AtomicBool::new(false));
        let mut attempt: u32 = 0;

        loop {
            scope.check()?;
            video_visible.store(false, Ordering::SeqCst);

            let result = scope
                .run_scoped(|attempt_scope| {
                    let once = self.connect_once(
                        attempt,
                        surface.clone(),
                        config,
                        attempt_scope,
                        video_visible.clone(),
                    );
                    async move {
                        match config.connect_timeout() {
                            Some(limit) => tokio::time::timeout(limit, once)
                                .await
                                .unwrap_or_else(|_| {
                                    Err(Error::OperationTimeout(format!(
                                        "connect timeout after {}ms",
                                        limit.as_millis()
                                    )))
                                }),
                            None => once.await,
                        }
                    }
                })
                .await;

            let error = match result {
                Ok(connection) if scope.is_triggered() => {
                    connection.close();
                    return Err(Error::Aborted);
                }
                Ok(connection) => {
                    info!(attempt, session_id = connection.session_id(), "Connection established");
                    return Ok(connection);
                }
                Err(e) => e,
            };

            if video_visible.load(Ordering::SeqCst) {
                surface.draw_cover();
            }

            if error.is_aborted() || scope.is_triggered() {
                info!(attempt, "Connect aborted");
                return Err(Error::Aborted);
            }

            if !error.is_retryable() {
                warn!(attempt, error = %error, "Connect failed permanently");
                return Err(error);
            }

            let delay = config.retry.calculate_backoff(attempt);
            warn!(
                attempt,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "Connect attempt failed, retrying"
            );
            scope.until_triggered(tokio::time::sleep(delay)).await?;
            attempt = attempt.saturating_add(1);
        }
    }

    #[instrument(name = "attempt", skip_all, fields(attempt = attempt))]
    async fn connect_once(
        &self,
        attempt: u32,
        surface: Arc<dyn RenderSurface>,
        config: &SessionConfig,
        scope: Scope,
        video_visible: Arc<AtomicBool>,
    ) -> Result<Connection> {
        debug!("Attempt started");
        let result = scope
            .until_triggered(self.assemble(surface, config, &scope, video_visible))
            .await?;
        if let Err(e) = &result {
            debug!(error = %e, "Attempt failed");
        }
        result
    }

    async fn assemble(
        &self,
        surface: Arc<dyn RenderSurface>,
        config: &SessionConfig,
        scope: &Scope,
        video_visible: Arc<AtomicBool>,
    ) -> Result<Connection> {
        let url = self.control_url(config)?;
        let control = self.connector.connect(&url).await?;
        {
            let control = control.clone();
            let _ = scope.on_trigger_or_run(move || control.close());
        }

        // Subscribe before the first await so an early session ready is kept
        let events = EventBus::new();
        let relay = Arc::new(Mutex::new(Subscriptions::new()));
        {
            let relay = relay.clone();
            let _ = scope.on_trigger_or_run(move || relay.lock().unsubscribe_all());
        }
        let (ready_rx, closed_rx) = relay_control(&control, &events, &relay);
        control.resume();

        let primary = self.open_transport(TransportRole::Primary, scope).await?;
        let secondary = if config.audio_input {
            Some(self.open_transport(TransportRole::AudioInput, scope).await?)
        } else {
            None
        };
        {
            let surface = surface.clone();
            let _ = scope.on_trigger_or_run(move || surface.detach());
        }

        let mut listeners = AttemptListeners(Subscriptions::new());
        let tracks_rx = await_tracks(primary.as_ref(), &mut listeners.0);
        let can_play_rx = await_playback(surface.as_ref(), PlaybackEvent::CanPlay, &mut listeners.0);

        if control.is_closed() {
            return Err(Error::ControlClosed);
        }

        let setup = async {
            let session_id = ready_rx.await.map_err(|_| Error::ControlClosed)?;
            info!(session_id, "Session ready");

            let primary_url = self.offer_url(&session_id, TransportRole::Primary)?;
            let primary_round = negotiate(primary.as_ref(), self.negotiator.as_ref(), &primary_url);
            match &secondary {
                Some(secondary) => {
                    let audio_url = self.offer_url(&session_id, TransportRole::AudioInput)?;
                    let audio_round =
                        negotiate(secondary.as_ref(), self.negotiator.as_ref(), &audio_url);
                    futures::future::try_join(primary_round, audio_round).await?;
                }
                None => primary_round.await?,
            }
            debug!("Media transports negotiated");
            Ok::<_, Error>(session_id)
        };

        let video_ready = async {
            tracks_rx
                .await
                .map_err(|_| Error::MediaTransport("transport dropped before tracks arrived".to_string()))?;
            surface.attach(primary.clone())?;
            debug!("Video source ready");

            can_play_rx
                .await
                .map_err(|_| Error::Render("render surface dropped before playback".to_string()))?;
            video_visible.store(true, Ordering::SeqCst);
            debug!("Video can play");
            surface.play();

            if let Some(fade) = config.cover_fade() {
                if surface.cover_visible() {
                    tokio::time::sleep(fade).await;
                    surface.hide_cover();
                }
            }
            Ok::<_, Error>(())
        };

        let session_id = tokio::select! {
            result = futures::future::try_join(setup, video_ready) => result?.0,
            _ = closed_rx => return Err(Error::ControlClosed),
        };
        drop(listeners);

        Ok(Connection::from_parts(ConnectionParts {
            session_id,
            control,
            primary,
            secondary,
            surface,
            events,
            relay,
        }))
    }

    async fn open_transport(
        &self,
        role: TransportRole,
        scope: &Scope,
    ) -> Result<Arc<dyn MediaTransport>> {
        let transport = self.engine.create_transport(role).await?;
        {
            let transport = transport.clone();
            let _ = scope.on_trigger_or_run(move || transport.close());
        }
        Ok(transport)
    }
}

/// Route control traffic into the connection's event bus
///
/// Returns receivers for the session ready id and for a remote close.
fn relay_control(
    control: &ControlChannel,
    events: &EventBus<ConnectionEventKind, ConnectionEvent>,
    relay: &Mutex<Subscriptions>,
) -> (oneshot::Receiver<String>, oneshot::Receiver<()>) {
    let (ready_tx, ready_rx) = oneshot::channel();
    let (closed_tx, closed_rx) = oneshot::channel();
    let ready_tx = Mutex::new(Some(ready_tx));
    let closed_tx = Mutex::new(Some(closed_tx));
    let mut relay = relay.lock();

    let text_events = events.clone();
    relay.push(control.on(ControlEventKind::Text, move |event| {
        let ControlEvent::Text(text) = event else {
            return;
        };
        match ServerMessage::parse(text) {
            Ok(ServerMessage::SessionReady { session_id }) => {
                if let Some(tx) = ready_tx.lock().take() {
                    let _ = tx.send(session_id);
                }
            }
            Ok(ServerMessage::Application(message)) => {
                text_events.emit(ConnectionEventKind::Message, &ConnectionEvent::Message(message))
            }
            Ok(ServerMessage::Ignored(kind)) => trace!(kind = %kind, "Ignoring control message"),
            Err(e) => warn!(error = %e, "Dropping malformed control message"),
        }
    }));

    let audio_events = events.clone();
    relay.push(control.on(ControlEventKind::Binary, move |event| {
        if let ControlEvent::Binary(data) = event {
            audio_events.emit(ConnectionEventKind::Audio, &ConnectionEvent::Audio(data.clone()));
        }
    }));

    relay.push(control.on(ControlEventKind::Closed, move |_| {
        if let Some(tx) = closed_tx.lock().take() {
            let _ = tx.send(());
        }
    }));

    (ready_rx, closed_rx)
}

/// Resolves once both a remote audio and a remote video track arrived
fn await_tracks(
    transport: &dyn MediaTransport,
    listeners: &mut Subscriptions,
) -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    let seen = Mutex::new((false, false));

    listeners.push(transport.events().on(TransportEventKind::Track, move |event| {
        let TransportEvent::Track(kind) = event else {
            return;
        };
        debug!(?kind, "Remote track added");
        let mut seen = seen.lock();
        match kind {
            TrackKind::Audio => seen.0 = true,
            TrackKind::Video => seen.1 = true,
        }
        if seen.0 && seen.1 {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(());
            }
        }
    }));
    rx
}

/// Resolves on the first `event` from the surface
fn await_playback(
    surface: &dyn RenderSurface,
    event: PlaybackEvent,
    listeners: &mut Subscriptions,
) -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    listeners.push(surface.events().on(event, move |_| {
        if let Some(tx) = tx.lock().take() {
            let _ = tx.send(());
        }
    }));
    rx
}
