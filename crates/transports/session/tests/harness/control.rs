//! In-memory control channel

use async_trait::async_trait;
use dh2d_session::control::{ControlChannel, ControlConnector, ControlEvent, OutgoingFrame};
use dh2d_session::{Error, Result};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

/// Server side of one fake control channel
#[derive(Clone)]
pub struct FakeControl {
    pub url: Url,
    pub channel: ControlChannel,
    sent: Arc<Mutex<Vec<Value>>>,
    closed_locally: Arc<AtomicBool>,
}

impl FakeControl {
    /// JSON messages written by the client, in order
    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().clone()
    }

    /// `type` of every message written by the client
    pub fn sent_types(&self) -> Vec<String> {
        self.sent()
            .iter()
            .map(|m| m["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    pub fn closed_locally(&self) -> bool {
        self.closed_locally.load(Ordering::SeqCst)
    }

    /// Push a JSON frame to the client
    pub fn push(&self, message: Value) {
        self.channel.deliver(ControlEvent::Text(message.to_string()));
    }

    pub fn push_status(&self, status: &str) {
        self.push(json!({"type": "status_change", "status": status}));
    }

    /// Close from the server side
    pub fn remote_close(&self) {
        self.channel.deliver(ControlEvent::Closed);
    }
}

/// Connector handing out [`FakeControl`] channels
#[derive(Default)]
pub struct FakeConnector {
    controls: Mutex<Vec<FakeControl>>,
    attempts: AtomicUsize,
    refuse: AtomicUsize,
    silent: AtomicBool,
    ignore_pings: AtomicBool,
    /// Session ready delay after accepting; `None` means the default 50ms
    ready_delay: Mutex<Option<Duration>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuse the next `n` connects
    pub fn refuse_next(&self, n: usize) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    /// Never send session ready
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Stop answering pings on channels opened from now on
    pub fn set_ignore_pings(&self, ignore: bool) {
        self.ignore_pings.store(ignore, Ordering::SeqCst);
    }

    /// Send session ready `delay` after accepting; zero sends it before
    /// `connect` returns
    pub fn set_ready_delay(&self, delay: Duration) {
        *self.ready_delay.lock() = Some(delay);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn controls(&self) -> Vec<FakeControl> {
        self.controls.lock().clone()
    }

    pub fn last(&self) -> FakeControl {
        self.controls
            .lock()
            .last()
            .cloned()
            .expect("no control channel opened")
    }
}

#[async_trait]
impl ControlConnector for FakeConnector {
    async fn connect(&self, url: &Url) -> Result<ControlChannel> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::ControlChannel("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let channel = ControlChannel::new(url.as_str(), tx);
        let control = FakeControl {
            url: url.clone(),
            channel: channel.clone(),
            sent: Arc::new(Mutex::new(Vec::new())),
            closed_locally: Arc::new(AtomicBool::new(false)),
        };
        self.controls.lock().push(control.clone());

        tokio::spawn(serve(control.clone(), rx, !self.ignore_pings.load(Ordering::SeqCst)));
        if !self.silent.load(Ordering::SeqCst) {
            let ready = json!({
                "type": "dh_2d_session_ready",
                "session_id": format!("srv-{}", attempt),
            });
            let delay = (*self.ready_delay.lock()).unwrap_or(Duration::from_millis(50));
            if delay.is_zero() {
                control.push(ready);
            } else {
                let control = control.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    control.push(ready);
                });
            }
        }
        Ok(channel)
    }
}

async fn serve(control: FakeControl, mut rx: mpsc::UnboundedReceiver<OutgoingFrame>, answer_pings: bool) {
    while let Some(frame) = rx.recv().await {
        match frame {
            OutgoingFrame::Text(text) => {
                let message: Value = serde_json::from_str(&text).expect("client sent invalid JSON");
                if answer_pings && message["type"] == "ping" {
                    control.push(json!({"type": "pong", "timestamp": message["timestamp"]}));
                }
                control.sent.lock().push(message);
            }
            OutgoingFrame::Close => {
                control.closed_locally.store(true, Ordering::SeqCst);
                break;
            }
        }
    }
}
