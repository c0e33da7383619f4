//! Connection health monitoring
//!
//! [`until_failed`] runs every enabled health check against a live
//! connection and resolves with the first failure observed:
//!
//! - control channel closed by the remote side
//! - a media transport reaching a terminal state
//! - decode stall (when `max_stall_duration_ms` is set)
//! - scheduled rotation after `reconnect_interval_ms`, deferred until the
//!   avatar is idle
//! - audio/video drift above `max_av_drift_ms`
//! - a ping left unanswered for `ping_timeout_ms`
//!
//! Without an audio input transport the monitor also reports received frame
//! counts to the server.

mod stall;

pub use stall::{StallInfo, StallReason, StallWatchdog};

use crate::config::SessionConfig;
use crate::connection::{Connection, ConnectionEvent, ConnectionEventKind};
use crate::control::ControlEventKind;
use crate::media::{MediaTransport, TransportEvent, TransportEventKind, TransportRole, TransportState};
use crate::protocol::{ping_timestamp, status, ClientMessage};
use crate::render::PlaybackEvent;
use dh2d_primitives::{Scope, Subscriptions};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, trace, warn};

/// Why a connection was declared unhealthy
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    ControlClosed,
    TransportState {
        role: TransportRole,
        state: TransportState,
    },
    Stall(StallInfo),
    /// Scheduled rotation
    Rotation,
    Drift {
        difference_ms: u64,
    },
    PingTimeout,
    /// The monitor's scope was triggered
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ControlClosed => write!(f, "control channel closed"),
            FailureReason::TransportState { role, state } => {
                write!(f, "{:?} transport {}", role, state)
            }
            FailureReason::Stall(info) => write!(
                f,
                "playback stalled ({}) at {:.2}s, {}",
                info.reason, info.current_time, info.ready_state_desc
            ),
            FailureReason::Rotation => write!(f, "scheduled rotation"),
            FailureReason::Drift { difference_ms } => {
                write!(f, "audio/video drift of {}ms", difference_ms)
            }
            FailureReason::PingTimeout => write!(f, "ping timeout"),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// First-wins failure slot shared by every check
#[derive(Clone)]
struct Resolver {
    slot: Arc<Mutex<Option<oneshot::Sender<FailureReason>>>>,
}

impl Resolver {
    fn new() -> (Self, oneshot::Receiver<FailureReason>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                slot: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    fn resolve(&self, reason: FailureReason) {
        if let Some(tx) = self.slot.lock().take() {
            info!(reason = %reason, "Connection unhealthy");
            let _ = tx.send(reason);
        } else {
            trace!(reason = %reason, "Ignoring failure after resolution");
        }
    }
}

/// Tasks and listeners released when monitoring ends
struct Checks {
    tasks: Vec<JoinHandle<()>>,
    subscriptions: Subscriptions,
}

impl Checks {
    fn new() -> Self {
        Self {
            tasks: Vec::new(),
            subscriptions: Subscriptions::new(),
        }
    }
}

impl Drop for Checks {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.subscriptions.unsubscribe_all();
    }
}

/// Wait for the first health failure of `conn`
///
/// Every check is torn down before this returns. If `scope` triggers first
/// the result is [`FailureReason::Cancelled`].
#[instrument(name = "monitor", skip_all, fields(session_id = %conn.session_id()))]
pub async fn until_failed(conn: &Connection, config: &SessionConfig, scope: &Scope) -> FailureReason {
    let (resolver, failed) = Resolver::new();
    let mut checks = Checks::new();

    watch_control(conn, &resolver, &mut checks);
    watch_transport(conn.primary(), &resolver, &mut checks);
    match conn.secondary() {
        Some(secondary) => watch_transport(secondary, &resolver, &mut checks),
        None => {
            if let Some(period) = config.stats_interval() {
                checks.tasks.push(tokio::spawn(report_stats(conn.clone(), period)));
            }
        }
    }

    if let (Some(max), Some(period)) = (config.max_stall_duration(), config.stall_check()) {
        watch_stall(conn, max, period, &resolver, &mut checks);
    }
    if let Some(after) = config.reconnect_interval() {
        watch_rotation(conn, after, &resolver, &mut checks);
    }
    if let Some(period) = config.drift_check() {
        watch_drift(conn, config, period, &resolver, &mut checks);
    }
    if let Some((every, deadline)) = config.ping() {
        watch_ping(conn, every, deadline, &resolver, &mut checks);
    }
    debug!(checks = checks.tasks.len(), "Monitoring connection");

    tokio::select! {
        reason = failed => reason.unwrap_or(FailureReason::Cancelled),
        _ = scope.triggered() => FailureReason::Cancelled,
    }
}

fn watch_control(conn: &Connection, resolver: &Resolver, checks: &mut Checks) {
    let r = resolver.clone();
    checks
        .subscriptions
        .push(conn.control().on(ControlEventKind::Closed, move |_| {
            r.resolve(FailureReason::ControlClosed)
        }));
    if conn.control().is_closed() {
        resolver.resolve(FailureReason::ControlClosed);
    }
}

fn watch_transport(transport: &Arc<dyn MediaTransport>, resolver: &Resolver, checks: &mut Checks) {
    let role = transport.role();
    let r = resolver.clone();
    checks
        .subscriptions
        .push(transport.events().on(TransportEventKind::StateChange, move |event| {
            if let TransportEvent::StateChange(state) = event {
                debug!(?role, %state, "Transport state changed");
                if state.is_terminal() {
                    r.resolve(FailureReason::TransportState { role, state: *state });
                }
            }
        }));

    let state = transport.state();
    if state.is_terminal() {
        resolver.resolve(FailureReason::TransportState { role, state });
    }
}

/// Report received frame counts while no audio input transport exists
async fn report_stats(conn: Connection, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut reported = 0u64;

    loop {
        ticker.tick().await;
        let stats = match conn.primary().stats().await {
            Ok(stats) => stats,
            Err(e) => {
                trace!(error = %e, "Stats unavailable");
                continue;
            }
        };
        if stats.frames_received > reported {
            reported = stats.frames_received;
            if let Err(e) = conn.send(&ClientMessage::stats(reported)) {
                trace!(error = %e, "Could not report stats");
            }
        }
    }
}

fn watch_stall(
    conn: &Connection,
    max: Duration,
    period: Duration,
    resolver: &Resolver,
    checks: &mut Checks,
) {
    let surface = conn.surface().clone();
    let events = surface.events();
    let (tx, mut rx) = mpsc::unbounded_channel();

    for kind in [PlaybackEvent::Playing, PlaybackEvent::TimeUpdate, PlaybackEvent::Waiting] {
        let tx = tx.clone();
        checks.subscriptions.push(events.on(kind, move |snapshot| {
            let _ = tx.send((kind, snapshot.current_time));
        }));
    }
    drop(tx);

    let resolver = resolver.clone();
    checks.tasks.push(tokio::spawn(async move {
        let mut dog = StallWatchdog::new(max, Instant::now());
        let snapshot = surface.snapshot();
        if !snapshot.paused && !snapshot.ended {
            dog.on_playing(Instant::now(), snapshot.current_time);
        }

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = dog.waiting_deadline();
            let stalled = tokio::select! {
                _ = ticker.tick() => dog.check(Instant::now(), &surface.snapshot()),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    dog.poll_waiting(Instant::now(), &surface.snapshot())
                }
                event = rx.recv() => {
                    let Some((kind, time)) = event else { break };
                    let now = Instant::now();
                    match kind {
                        PlaybackEvent::Playing => dog.on_playing(now, time),
                        PlaybackEvent::TimeUpdate => dog.on_time_update(now, time),
                        PlaybackEvent::Waiting => dog.on_waiting(now),
                        PlaybackEvent::CanPlay => {}
                    }
                    None
                }
            };

            if let Some(info) = stalled {
                warn!(
                    reason = %info.reason,
                    current_time = info.current_time,
                    ready_state = info.ready_state,
                    buffered = ?info.buffered,
                    "Playback stalled"
                );
                resolver.resolve(FailureReason::Stall(info));
                break;
            }
        }
    }));
}

struct RotationState {
    status: String,
    due: bool,
}

fn watch_rotation(conn: &Connection, after: Duration, resolver: &Resolver, checks: &mut Checks) {
    let state = Arc::new(Mutex::new(RotationState {
        status: status::SLEEPING.to_string(),
        due: false,
    }));

    let s = state.clone();
    let r = resolver.clone();
    checks
        .subscriptions
        .push(conn.on(ConnectionEventKind::Message, move |event| {
            let ConnectionEvent::Message(message) = event else {
                return;
            };
            let Some(new_status) = message.status() else {
                return;
            };
            let mut state = s.lock();
            state.status = new_status.to_string();
            if state.due && (new_status == status::SLEEPING || new_status == status::LISTENING) {
                r.resolve(FailureReason::Rotation);
            }
        }));

    let r = resolver.clone();
    checks.tasks.push(tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let mut state = state.lock();
        state.due = true;
        if state.status == status::SLEEPING {
            r.resolve(FailureReason::Rotation);
        } else {
            debug!(status = %state.status, "Rotation due, waiting for idle avatar");
        }
    }));
}

fn watch_drift(
    conn: &Connection,
    config: &SessionConfig,
    period: Duration,
    resolver: &Resolver,
    checks: &mut Checks,
) {
    let primary = conn.primary().clone();
    let (tx, mut connected) = mpsc::unbounded_channel();
    checks
        .subscriptions
        .push(primary.events().on(TransportEventKind::StateChange, move |event| {
            if *event == TransportEvent::StateChange(TransportState::Connected) {
                let _ = tx.send(());
            }
        }));

    let frame_rate = f64::from(config.frame_rate);
    let max_ms = config.max_av_drift_ms;
    let resolver = resolver.clone();
    checks.tasks.push(tokio::spawn(async move {
        if primary.state() != TransportState::Connected && connected.recv().await.is_none() {
            return;
        }

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let stats = match primary.stats().await {
                Ok(stats) => stats,
                Err(e) => {
                    trace!(error = %e, "Stats unavailable");
                    continue;
                }
            };
            let video_secs = stats.frames_received as f64 / frame_rate;
            let drift_ms = (stats.audio_samples_duration - video_secs).abs() * 1000.0;
            if drift_ms > max_ms as f64 {
                warn!(
                    audio_secs = stats.audio_samples_duration,
                    video_secs, drift_ms, "Audio/video drift too large"
                );
                resolver.resolve(FailureReason::Drift {
                    difference_ms: drift_ms.round() as u64,
                });
                break;
            }
        }
    }));
}

type PendingPongs = Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>;

fn watch_ping(
    conn: &Connection,
    every: Duration,
    deadline: Duration,
    resolver: &Resolver,
    checks: &mut Checks,
) {
    let pending: PendingPongs = Arc::new(Mutex::new(HashMap::new()));

    let p = pending.clone();
    checks
        .subscriptions
        .push(conn.on(ConnectionEventKind::Message, move |event| {
            if let ConnectionEvent::Message(message) = event {
                if let Some(timestamp) = message.pong_timestamp() {
                    if let Some(tx) = p.lock().remove(timestamp) {
                        let _ = tx.send(());
                    }
                }
            }
        }));

    let conn = conn.clone();
    let resolver = resolver.clone();
    checks.tasks.push(tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;

            let timestamp = ping_timestamp();
            let (tx, rx) = oneshot::channel();
            pending.lock().insert(timestamp.clone(), tx);
            let sent_at = Instant::now();
            if let Err(e) = conn.send(&ClientMessage::ping(&timestamp)) {
                trace!(error = %e, "Could not send ping");
            }

            match tokio::time::timeout(deadline, rx).await {
                Ok(_) => {
                    trace!(latency_ms = sent_at.elapsed().as_millis() as u64, "Pong received");
                }
                Err(_) => {
                    pending.lock().remove(&timestamp);
                    warn!(timestamp = %timestamp, "No pong within {}ms", deadline.as_millis());
                    resolver.resolve(FailureReason::PingTimeout);
                    break;
                }
            }
        }
    }));
}
