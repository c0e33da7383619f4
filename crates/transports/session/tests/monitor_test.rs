//! Health monitor tests
//!
//! Each test establishes a connection against the fakes, runs the monitor
//! on it and breaks one health signal.

mod harness;

use dh2d_primitives::Scope;
use dh2d_session::connection::Connection;
use dh2d_session::media::{TransportRole, TransportState};
use dh2d_session::monitor::{self, FailureReason, StallReason};
use dh2d_session::render::PlaybackEvent;
use dh2d_session::SessionConfig;
use harness::{settle, test_config, TestHarness};
use serde_json::json;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct Monitored {
    conn: Connection,
    scope: Scope,
    task: JoinHandle<FailureReason>,
}

async fn monitored(h: &TestHarness, config: SessionConfig) -> Monitored {
    let conn = h.connect(&config).await;
    let scope = Scope::new();
    let task = {
        let conn = conn.clone();
        let scope = scope.clone();
        tokio::spawn(async move { monitor::until_failed(&conn, &config, &scope).await })
    };
    settle(1).await;
    Monitored { conn, scope, task }
}

/// Only the check under test enabled
fn quiet_config() -> SessionConfig {
    SessionConfig {
        reconnect_interval_ms: 0,
        max_av_drift_ms: 0,
        ping_interval_ms: 0,
        ping_timeout_ms: 0,
        stats_interval_ms: 0,
        ..test_config()
    }
}

/// Test that a remote close of the control channel fails the connection
#[tokio::test(start_paused = true)]
async fn test_control_close() {
    let h = TestHarness::new();
    let m = monitored(&h, quiet_config()).await;

    h.connector.last().remote_close();

    assert_eq!(m.task.await.unwrap(), FailureReason::ControlClosed);
}

/// Test that a terminal transport state fails the connection
#[tokio::test(start_paused = true)]
async fn test_transport_failure() {
    let h = TestHarness::new();
    let m = monitored(&h, quiet_config()).await;

    h.engine.last(TransportRole::Primary).set_state(TransportState::Disconnected);

    assert_eq!(
        m.task.await.unwrap(),
        FailureReason::TransportState {
            role: TransportRole::Primary,
            state: TransportState::Disconnected
        }
    );
}

/// Test that the audio input transport is watched as well
#[tokio::test(start_paused = true)]
async fn test_secondary_transport_failure() {
    let h = TestHarness::new();
    let m = monitored(&h, quiet_config().with_audio_input(true)).await;

    h.engine.last(TransportRole::AudioInput).set_state(TransportState::Failed);

    assert!(matches!(
        m.task.await.unwrap(),
        FailureReason::TransportState {
            role: TransportRole::AudioInput,
            ..
        }
    ));
}

/// Test that an idle avatar rotates exactly at the interval
#[tokio::test(start_paused = true)]
async fn test_rotation_when_idle() {
    let h = TestHarness::new();
    let config = SessionConfig {
        reconnect_interval_ms: 60_000,
        ..quiet_config()
    };
    let start = Instant::now();
    let m = monitored(&h, config).await;

    assert_eq!(m.task.await.unwrap(), FailureReason::Rotation);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(60) && elapsed < Duration::from_secs(61));
}

/// Test that rotation waits for the avatar to return to an idle status
#[tokio::test(start_paused = true)]
async fn test_rotation_deferred_while_busy() {
    let h = TestHarness::new();
    let config = SessionConfig {
        reconnect_interval_ms: 60_000,
        ..quiet_config()
    };
    let m = monitored(&h, config).await;
    let control = h.connector.last();

    control.push_status("speaking");
    settle(90_000).await;
    assert!(!m.task.is_finished());

    control.push_status("thinking");
    settle(10).await;
    assert!(!m.task.is_finished());

    control.push_status("listening");
    assert_eq!(m.task.await.unwrap(), FailureReason::Rotation);
}

/// Test that audio running ahead of video beyond the ceiling fails the connection
#[tokio::test(start_paused = true)]
async fn test_av_drift() {
    let h = TestHarness::new();
    let config = SessionConfig {
        max_av_drift_ms: 10_000,
        ..quiet_config()
    };
    let m = monitored(&h, config).await;

    // 100 frames at 25fps is 4s of video against 9s of audio
    h.engine.last(TransportRole::Primary).set_stats(100, 9.0);
    settle(3_000).await;
    assert!(!m.task.is_finished());

    h.engine.last(TransportRole::Primary).set_stats(100, 14.5);
    assert_eq!(
        m.task.await.unwrap(),
        FailureReason::Drift {
            difference_ms: 10_500
        }
    );
}

/// Test that an unanswered ping fails the connection after the timeout
#[tokio::test(start_paused = true)]
async fn test_ping_timeout() {
    let h = TestHarness::new();
    h.connector.set_ignore_pings(true);
    let config = SessionConfig {
        ping_interval_ms: 10_000,
        ping_timeout_ms: 5_000,
        ..quiet_config()
    };
    let start = Instant::now();
    let m = monitored(&h, config).await;

    assert_eq!(m.task.await.unwrap(), FailureReason::PingTimeout);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(15) && elapsed < Duration::from_secs(16));
    assert_eq!(h.connector.last().sent_types(), vec!["ping"]);
}

/// Test that answered pings keep the connection healthy
#[tokio::test(start_paused = true)]
async fn test_answered_pings() {
    let h = TestHarness::new();
    let config = SessionConfig {
        ping_interval_ms: 10_000,
        ping_timeout_ms: 5_000,
        ..quiet_config()
    };
    let m = monitored(&h, config).await;

    settle(65_000).await;
    assert!(!m.task.is_finished());
    let pings = h.connector.last().sent_types();
    assert_eq!(pings.len(), 6);

    m.scope.trigger();
    assert_eq!(m.task.await.unwrap(), FailureReason::Cancelled);
}

/// Test that received frame counts are reported only when they grow
#[tokio::test(start_paused = true)]
async fn test_stats_reported_on_progress() {
    let h = TestHarness::new();
    let config = SessionConfig {
        stats_interval_ms: 200,
        ..quiet_config()
    };
    let m = monitored(&h, config).await;
    let primary = h.engine.last(TransportRole::Primary);

    primary.set_stats(10, 0.4);
    settle(1_000).await;
    primary.set_stats(15, 0.6);
    settle(1_000).await;

    let sent = h.connector.last().sent();
    assert_eq!(
        sent,
        vec![
            json!({"type": "dh_2d_stats", "played_frames": 10}),
            json!({"type": "dh_2d_stats", "played_frames": 15}),
        ]
    );

    m.scope.trigger();
    assert_eq!(m.task.await.unwrap(), FailureReason::Cancelled);
}

/// Test that stats are not reported when an audio input transport exists
#[tokio::test(start_paused = true)]
async fn test_no_stats_with_audio_input() {
    let h = TestHarness::new();
    let config = SessionConfig {
        stats_interval_ms: 200,
        ..quiet_config().with_audio_input(true)
    };
    let m = monitored(&h, config).await;

    h.engine.last(TransportRole::Primary).set_stats(10, 0.4);
    settle(1_000).await;
    assert!(h.connector.last().sent().is_empty());

    m.scope.trigger();
    m.task.await.unwrap();
}

/// Test that frozen playback with nothing buffered is a starvation stall
#[tokio::test(start_paused = true)]
async fn test_stall_network_starvation() {
    let h = TestHarness::new();
    let config = SessionConfig {
        max_stall_duration_ms: 3_000,
        ..quiet_config()
    };
    let start = Instant::now();
    let m = monitored(&h, config).await;

    match m.task.await.unwrap() {
        FailureReason::Stall(info) => {
            assert_eq!(info.reason, StallReason::NetworkStarvation);
            assert_eq!(info.ready_state, 0);
        }
        other => panic!("unexpected failure: {}", other),
    }
    assert!(start.elapsed() >= Duration::from_secs(3));
}

/// Test that advancing playback keeps the watchdog quiet, and buffered but
/// undecoded data is classified as a decoding delay
#[tokio::test(start_paused = true)]
async fn test_stall_decoding_delay_after_progress() {
    let h = TestHarness::new();
    let config = SessionConfig {
        max_stall_duration_ms: 3_000,
        ..quiet_config()
    };
    let m = monitored(&h, config).await;

    for second in 1..=6 {
        h.surface.play_at(second as f64, second as f64 + 2.0, 4);
        h.surface.emit(PlaybackEvent::TimeUpdate);
        settle(1_000).await;
    }
    assert!(!m.task.is_finished());

    h.surface.play_at(6.0, 8.0, 2);
    match m.task.await.unwrap() {
        FailureReason::Stall(info) => {
            assert_eq!(info.reason, StallReason::DecodingDelay);
            assert_eq!(info.current_time, 6.0);
        }
        other => panic!("unexpected failure: {}", other),
    }
}

/// Test that a waiting event arms a one-shot stall deadline
#[tokio::test(start_paused = true)]
async fn test_stall_after_waiting() {
    let h = TestHarness::new();
    let config = SessionConfig {
        max_stall_duration_ms: 3_000,
        stall_check_interval_ms: 60_000,
        ..quiet_config()
    };
    let start = Instant::now();
    let m = monitored(&h, config).await;

    settle(1_000).await;
    h.surface.play_at(0.5, 3.0, 4);
    h.surface.emit(PlaybackEvent::Waiting);

    assert!(matches!(m.task.await.unwrap(), FailureReason::Stall(_)));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(4) && elapsed < Duration::from_secs(5));
}

/// Test that cancelling the monitor tears down its checks
#[tokio::test(start_paused = true)]
async fn test_cancel_stops_checks() {
    let h = TestHarness::new();
    let config = SessionConfig {
        ping_interval_ms: 1_000,
        ping_timeout_ms: 500,
        ..quiet_config()
    };
    let m = monitored(&h, config).await;
    settle(2_500).await;

    m.scope.trigger();
    assert_eq!(m.task.await.unwrap(), FailureReason::Cancelled);

    let before = h.connector.last().sent().len();
    settle(5_000).await;
    assert_eq!(h.connector.last().sent().len(), before);
    assert!(!m.conn.is_closed());
}
