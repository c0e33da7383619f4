//! Session orchestration: admission, lifecycle strategy and the session itself

mod admission;
mod lifecycle;
mod orchestrator;

pub use admission::{AdmissionGate, CapacityGate, SessionRegistry, SessionTicket, Unlimited};
pub use lifecycle::{DefaultLifecycle, Lifecycle};
pub use orchestrator::{Session, SessionDeps, SessionEvent, SessionEventKind, SessionStatus};
