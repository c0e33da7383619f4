//! Error types for the DH2D session transport

/// Result type alias using the session Error
pub type Result<T> = std::result::Result<T, Error>;

/// Failure classes driving retry and terminal-state decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller-initiated cancellation; terminal, never retried
    Aborted,
    /// Timeouts, closed transports, negotiation hiccups; retried by reconnecting
    Transient,
    /// Not (or no longer) authenticated; fails the session
    Authentication,
    /// Malformed inbound payload; logged and dropped
    Protocol,
    /// Invalid configuration supplied by the caller
    Configuration,
    /// Operation on a closed session or channel
    Closed,
}

/// Errors that can occur in session transport operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The governing cancellation scope was triggered
    #[error("Operation aborted")]
    Aborted,

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Authentication check failed or lapsed
    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),

    /// Connection attempt exceeded the connect timeout
    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    /// Control channel error
    #[error("Control channel error: {0}")]
    ControlChannel(String),

    /// Control channel closed by the remote side
    #[error("Control channel closed")]
    ControlClosed,

    /// Media transport error
    #[error("Media transport error: {0}")]
    MediaTransport(String),

    /// Offer/answer exchange failed
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Render surface error
    #[error("Render error: {0}")]
    Render(String),

    /// Malformed inbound message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The session has been closed
    #[error("Session closed")]
    SessionClosed,

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Aborted => ErrorKind::Aborted,
            Error::InvalidConfig(_) => ErrorKind::Configuration,
            Error::NotAuthenticated(_) => ErrorKind::Authentication,
            Error::Protocol(_) | Error::Serialization(_) => ErrorKind::Protocol,
            Error::SessionClosed => ErrorKind::Closed,
            Error::OperationTimeout(_)
            | Error::ControlChannel(_)
            | Error::ControlClosed
            | Error::MediaTransport(_)
            | Error::Negotiation(_)
            | Error::Render(_)
            | Error::Http(_)
            | Error::Io(_)
            | Error::Other(_) => ErrorKind::Transient,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Check if this error came from cancellation
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted)
    }
}

impl From<dh2d_primitives::Error> for Error {
    fn from(err: dh2d_primitives::Error) -> Self {
        match err {
            dh2d_primitives::Error::Aborted => Error::Aborted,
            other => Error::Other(anyhow::anyhow!(other)),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::ControlChannel(err.to_string())
    }
}

impl From<Error> for dh2d_primitives::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Aborted => dh2d_primitives::Error::Aborted,
            other => dh2d_primitives::Error::Upstream(other.to_string()),
        }
    }
}
