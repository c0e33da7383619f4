//! Digital human session transport
//!
//! Maintains a long-lived interactive media session with a DH2D service and
//! keeps it alive across network failures. Callers see a single [`Session`]
//! whose status moves through `pending → connecting → connected →
//! reconnecting → … → closed | failed`, while underneath:
//!
//! - [`connection::Establisher`] opens the WebSocket control channel,
//!   negotiates the media transports and waits for renderable video,
//!   retrying with backoff until it succeeds or is cancelled
//! - [`monitor::until_failed`] watches a live connection for control
//!   channel loss, transport failure, decode stalls, A/V drift, missed pongs
//!   and scheduled rotation
//! - the session buffers outbound messages while disconnected and replays
//!   the last `config` message before draining them on every reconnect
//!
//! Media transports, offer/answer exchange and rendering are injected
//! through the [`media::MediaEngine`], [`media::Negotiator`] and
//! [`render::RenderSurface`] traits.
//!
//! # Example
//!
//! ```no_run
//! use dh2d_session::{ClientConfig, Session, SessionConfig, SessionDeps, SessionEventKind, SessionRegistry};
//! # use std::sync::Arc;
//! # async fn run(
//! #     engine: Arc<dyn dh2d_session::media::MediaEngine>,
//! #     surface: Arc<dyn dh2d_session::render::RenderSurface>,
//! # ) -> dh2d_session::Result<()> {
//! let deps = SessionDeps::http(ClientConfig::default(), engine, SessionRegistry::new());
//! let session = Session::new(deps, surface, SessionConfig::default())?;
//! let _status = session.on(SessionEventKind::StatusChange, |event| println!("{:?}", event));
//!
//! session.send(dh2d_session::protocol::ClientMessage::wakeup(Some("hello")))?;
//! session.close().await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod auth;
pub mod components;
pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod media;
pub mod monitor;
pub mod protocol;
pub mod render;
pub mod session;

pub use auth::{AuthCheck, HttpAuthCheck, StaticAuth};
pub use components::{ComponentFeed, ComponentStatus};
pub use config::{ClientConfig, SessionConfig};
pub use connection::{Connection, Establisher, RetryPolicy};
pub use error::{Error, ErrorKind, Result};
pub use monitor::FailureReason;
pub use session::{
    AdmissionGate, CapacityGate, Session, SessionDeps, SessionEvent, SessionEventKind,
    SessionRegistry, SessionStatus, Unlimited,
};
