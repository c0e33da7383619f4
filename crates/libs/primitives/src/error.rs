//! Error types for the concurrency primitives

use thiserror::Error;

/// Result type alias for primitive operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the primitives
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The governing cancellation scope was triggered
    #[error("Operation aborted")]
    Aborted,

    /// A shared stream upstream could not be started
    #[error("Upstream error: {0}")]
    Upstream(String),
}

impl Error {
    /// Whether this error came from cancellation rather than a failure
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted)
    }
}
