//! Decode-stall watchdog
//!
//! Pure state machine driven by playback events and periodic checks; the
//! monitor task feeds it and turns a returned [`StallInfo`] into a failure.

use crate::render::{PlaybackSnapshot, TimeRange};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Buffered data must extend this far past the position to rule out starvation
const DATA_AHEAD_MARGIN: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallReason {
    /// Nothing buffered ahead of the playback position
    NetworkStarvation,
    /// Data is buffered but the decoder is not producing frames
    DecodingDelay,
    Unknown,
}

impl StallReason {
    pub fn classify(snapshot: &PlaybackSnapshot) -> Self {
        if !snapshot.has_data_ahead(DATA_AHEAD_MARGIN) {
            StallReason::NetworkStarvation
        } else if snapshot.ready_state <= 2 {
            StallReason::DecodingDelay
        } else {
            StallReason::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StallReason::NetworkStarvation => "network starvation",
            StallReason::DecodingDelay => "decoding or format delay",
            StallReason::Unknown => "unknown",
        }
    }
}

impl fmt::Display for StallReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostics captured when a stall is detected
#[derive(Debug, Clone, PartialEq)]
pub struct StallInfo {
    pub reason: StallReason,
    pub current_time: f64,
    pub duration: f64,
    pub ready_state: u8,
    pub ready_state_desc: &'static str,
    pub buffered: Vec<TimeRange>,
}

impl StallInfo {
    fn capture(snapshot: &PlaybackSnapshot) -> Self {
        Self {
            reason: StallReason::classify(snapshot),
            current_time: snapshot.current_time,
            duration: snapshot.duration,
            ready_state: snapshot.ready_state,
            ready_state_desc: snapshot.ready_state_description(),
            buffered: snapshot.buffered.clone(),
        }
    }
}

/// Tracks playback progress and reports a stall once
#[derive(Debug)]
pub struct StallWatchdog {
    max: Duration,
    started: bool,
    last_time: f64,
    last_update: Instant,
    waiting_deadline: Option<Instant>,
    in_stall: bool,
}

impl StallWatchdog {
    pub fn new(max: Duration, now: Instant) -> Self {
        Self {
            max,
            started: false,
            last_time: 0.0,
            last_update: now,
            waiting_deadline: None,
            in_stall: false,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn in_stall(&self) -> bool {
        self.in_stall
    }

    /// Playback (re)started at position `time`
    pub fn on_playing(&mut self, now: Instant, time: f64) {
        self.started = true;
        self.last_time = time;
        self.last_update = now;
        self.waiting_deadline = None;
        self.in_stall = false;
    }

    /// Position report; only an advancing position counts as progress
    pub fn on_time_update(&mut self, now: Instant, time: f64) {
        if self.started && time != self.last_time {
            self.on_playing(now, time);
        }
    }

    /// Playback is waiting for data; arms a one-shot deadline of `max`
    pub fn on_waiting(&mut self, now: Instant) {
        if self.started && !self.in_stall && self.waiting_deadline.is_none() {
            self.waiting_deadline = Some(now + self.max);
        }
    }

    pub fn waiting_deadline(&self) -> Option<Instant> {
        self.waiting_deadline
    }

    /// Periodic check for a position that has not advanced for `max`
    pub fn check(&mut self, now: Instant, snapshot: &PlaybackSnapshot) -> Option<StallInfo> {
        if !self.started || self.in_stall || snapshot.paused || snapshot.ended {
            return None;
        }
        if now.saturating_duration_since(self.last_update) < self.max {
            return None;
        }
        self.in_stall = true;
        Some(StallInfo::capture(snapshot))
    }

    /// Fires the waiting deadline if it has passed
    pub fn poll_waiting(&mut self, now: Instant, snapshot: &PlaybackSnapshot) -> Option<StallInfo> {
        match self.waiting_deadline {
            Some(deadline) if now >= deadline => {
                self.waiting_deadline = None;
                if self.in_stall {
                    return None;
                }
                self.in_stall = true;
                Some(StallInfo::capture(snapshot))
            }
            _ => None,
        }
    }
}
