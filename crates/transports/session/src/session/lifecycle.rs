//! Connect / monitor / disconnect strategy used by the orchestrator

use crate::config::SessionConfig;
use crate::connection::{Connection, Establisher};
use crate::monitor::{self, FailureReason};
use crate::render::RenderSurface;
use crate::Result;
use async_trait::async_trait;
use dh2d_primitives::Scope;
use std::sync::Arc;

#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Establish a connection, retrying until `scope` triggers
    async fn connect(
        &self,
        surface: Arc<dyn RenderSurface>,
        config: &SessionConfig,
        scope: &Scope,
    ) -> Result<Connection>;

    /// Resolve once `connection` must be replaced
    async fn until_failed(
        &self,
        connection: &Connection,
        config: &SessionConfig,
        scope: &Scope,
    ) -> FailureReason;

    /// Tear `connection` down
    async fn disconnect(&self, connection: &Connection);
}

/// [`Establisher`] plus the health monitor
pub struct DefaultLifecycle {
    establisher: Establisher,
}

impl DefaultLifecycle {
    pub fn new(establisher: Establisher) -> Self {
        Self { establisher }
    }

    pub fn establisher(&self) -> &Establisher {
        &self.establisher
    }
}

#[async_trait]
impl Lifecycle for DefaultLifecycle {
    async fn connect(
        &self,
        surface: Arc<dyn RenderSurface>,
        config: &SessionConfig,
        scope: &Scope,
    ) -> Result<Connection> {
        self.establisher.connect(surface, config, scope).await
    }

    async fn until_failed(
        &self,
        connection: &Connection,
        config: &SessionConfig,
        scope: &Scope,
    ) -> FailureReason {
        monitor::until_failed(connection, config, scope).await
    }

    async fn disconnect(&self, connection: &Connection) {
        connection.surface().draw_cover();
        connection.close();
    }
}
