//! Session Test Harness
//!
//! In-memory stand-ins for every collaborator of a session:
//! - control channel connector that can refuse connections, stay silent or
//!   ignore pings
//! - media engine/transports with scriptable state and statistics
//! - negotiator recording every offer URL
//! - render surface recording play/cover calls
//!
//! Basic usage pattern:
//!
//! 1. Create a `TestHarness`
//! 2. Build an `Establisher` or `SessionDeps` from it
//! 3. Drive the fakes (`harness.connector.last().remote_close()`, ...)
//! 4. Assert on what the fakes recorded

#![allow(dead_code)]

pub mod control;
pub mod media;
pub mod surface;

use dh2d_session::connection::{Connection, RetryPolicy};
use dh2d_session::session::{AdmissionGate, DefaultLifecycle, Unlimited};
use dh2d_session::{
    ClientConfig, Establisher, Session, SessionConfig, SessionDeps, SessionStatus, StaticAuth,
};
use dh2d_primitives::Scope;
use std::sync::Arc;
use std::time::Duration;

pub use control::{FakeConnector, FakeControl};
pub use media::{FakeEngine, FakeNegotiator, FakeTransport};
pub use surface::FakeSurface;

pub struct TestHarness {
    pub connector: Arc<FakeConnector>,
    pub engine: Arc<FakeEngine>,
    pub negotiator: Arc<FakeNegotiator>,
    pub surface: Arc<FakeSurface>,
    pub auth: Arc<StaticAuth>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self {
            connector: FakeConnector::new(),
            engine: FakeEngine::new(),
            negotiator: FakeNegotiator::new(),
            surface: FakeSurface::new(),
            auth: Arc::new(StaticAuth::new(true)),
        }
    }

    pub fn establisher(&self) -> Establisher {
        Establisher::new(
            ClientConfig::new("https://dh.test"),
            self.connector.clone(),
            self.engine.clone(),
            self.negotiator.clone(),
        )
    }

    pub fn deps(&self) -> SessionDeps {
        self.deps_with_gate(Arc::new(Unlimited))
    }

    pub fn deps_with_gate(&self, admission: Arc<dyn AdmissionGate>) -> SessionDeps {
        SessionDeps {
            lifecycle: Arc::new(DefaultLifecycle::new(self.establisher())),
            auth: self.auth.clone(),
            admission,
        }
    }

    pub fn session(&self, config: SessionConfig) -> Session {
        Session::new(self.deps(), self.surface.clone(), config).expect("valid config")
    }

    /// Connect directly through the establisher
    pub async fn connect(&self, config: &SessionConfig) -> Connection {
        self.establisher()
            .connect(self.surface.clone(), config, &Scope::new())
            .await
            .expect("connect")
    }
}

/// Defaults with deterministic retries
pub fn test_config() -> SessionConfig {
    SessionConfig {
        session_id: Some("client-1".to_string()),
        retry: RetryPolicy::fixed(Duration::from_secs(2)),
        ..Default::default()
    }
}

/// Poll until `session` reaches `status`
pub async fn wait_for_status(session: &Session, status: SessionStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(600);
    while session.status() != status {
        assert!(
            tokio::time::Instant::now() < deadline,
            "session stuck in {} waiting for {}",
            session.status(),
            status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Let spawned tasks run for `ms` of (possibly paused) time
pub async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
