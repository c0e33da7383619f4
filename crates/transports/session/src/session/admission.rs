//! Admission control
//!
//! Before its first connect a session asks an [`AdmissionGate`] for
//! permission. The shipped [`CapacityGate`] caps how many sessions may be
//! active at once, tracked in an injectable [`SessionRegistry`].

use crate::{Error, Result};
use async_trait::async_trait;
use dh2d_primitives::{Observable, Scope};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Identity a session presents to the admission gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTicket {
    /// Unique per session instance
    pub key: u64,
    pub session_id: String,
    pub video_id: String,
}

impl SessionTicket {
    pub fn new(session_id: impl Into<String>, video_id: impl Into<String>) -> Self {
        Self {
            key: rand::random(),
            session_id: session_id.into(),
            video_id: video_id.into(),
        }
    }
}

/// Decides when a session may start connecting
#[async_trait]
pub trait AdmissionGate: Send + Sync {
    /// Wait until `ticket` is admitted
    ///
    /// # Errors
    ///
    /// `Error::Aborted` if `scope` triggers first.
    async fn admit(&self, ticket: &SessionTicket, scope: &Scope) -> Result<()>;

    /// Give back what `admit` granted
    async fn release(&self, ticket: &SessionTicket);
}

/// Active sessions, shared by every gate that counts them
#[derive(Clone, Default)]
pub struct SessionRegistry {
    active: Observable<Vec<SessionTicket>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<SessionTicket> {
        self.active.get()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add `ticket` if fewer than `max_active` sessions are registered
    pub fn try_add(&self, ticket: &SessionTicket, max_active: usize) -> bool {
        self.active.update_if(|active| {
            if active.len() >= max_active {
                return false;
            }
            active.push(ticket.clone());
            true
        })
    }

    /// Remove `ticket`; returns whether it was registered
    pub fn remove(&self, ticket: &SessionTicket) -> bool {
        self.active.update_if(|active| {
            let before = active.len();
            active.retain(|t| t.key != ticket.key);
            active.len() != before
        })
    }

    pub fn on_change<F>(&self, handler: F) -> dh2d_primitives::Subscription
    where
        F: Fn(&Vec<SessionTicket>) + Send + Sync + 'static,
    {
        self.active.on_change(handler)
    }
}

/// Admits sessions while fewer than `max_active` are registered
#[derive(Clone)]
pub struct CapacityGate {
    registry: SessionRegistry,
    max_active: usize,
    settle: Duration,
}

impl CapacityGate {
    /// One active session at a time
    pub fn new(registry: SessionRegistry) -> Self {
        Self {
            registry,
            max_active: 1,
            settle: Duration::from_secs(1),
        }
    }

    pub fn with_max_active(mut self, max_active: usize) -> Self {
        self.max_active = max_active;
        self
    }

    /// Delay between a registry change and the re-check
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }
}

#[async_trait]
impl AdmissionGate for CapacityGate {
    async fn admit(&self, ticket: &SessionTicket, scope: &Scope) -> Result<()> {
        if self.max_active == 0 {
            return Err(Error::InvalidConfig("max_active must be positive".to_string()));
        }

        let changed = Arc::new(Notify::new());
        let notify = changed.clone();
        let subscription = self.registry.on_change(move |_| notify.notify_one());

        let result = scope
            .until_triggered(async {
                let mut waited = false;
                loop {
                    if self.registry.try_add(ticket, self.max_active) {
                        return;
                    }
                    if !waited {
                        info!(
                            session_id = %ticket.session_id,
                            active = self.registry.len(),
                            max_active = self.max_active,
                            "Waiting for a free session slot"
                        );
                        waited = true;
                    }
                    changed.notified().await;
                    tokio::time::sleep(self.settle).await;
                }
            })
            .await;
        subscription.unsubscribe();

        result?;
        debug!(session_id = %ticket.session_id, "Session admitted");
        Ok(())
    }

    async fn release(&self, ticket: &SessionTicket) {
        if self.registry.remove(ticket) {
            debug!(session_id = %ticket.session_id, "Session slot released");
        }
    }
}

/// Admits every session immediately
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

#[async_trait]
impl AdmissionGate for Unlimited {
    async fn admit(&self, _ticket: &SessionTicket, scope: &Scope) -> Result<()> {
        scope.check()?;
        Ok(())
    }

    async fn release(&self, _ticket: &SessionTicket) {}
}
