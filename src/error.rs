//! D2D Protocol error types.
//!
//! Only *recoverable* conditions are represented here: a request that
//! cannot be satisfied (table full, unknown session), malformed wire
//! data from a peer, or a failure in the platform storage layer.
//!
//! Invariant violations (narrowing a session to the wrong variant,
//! using a cancelled exchange) are programmer errors with potential
//! security impact and deliberately have no `D2dError` variant: they
//! panic so the process terminates instead of continuing with
//! inconsistent state.

use thiserror::Error;

/// D2D Protocol errors.
#[derive(Error, Debug)]
pub enum D2dError {
    /// A fixed-capacity table (sessions, exchanges) has no free slot.
    ///
    /// The specific request fails; the rest of the stack keeps running.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// A session id did not resolve to a live session.
    #[error("Session not found")]
    SessionNotFound,

    /// An exchange key did not resolve to a live exchange.
    #[error("Exchange not found")]
    ExchangeNotFound,

    /// Protocol-level error (invalid operation for the session kind,
    /// message on a closed exchange, and similar).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Inbound wire data could not be decoded.
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    /// Persistent key-value store failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// The downstream reporting engine rejected a dirty-path
    /// notification.
    #[error("Report sink error: {0}")]
    ReportSink(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for D2D operations
pub type Result<T> = std::result::Result<T, D2dError>;

impl From<toml::de::Error> for D2dError {
    fn from(err: toml::de::Error) -> Self {
        D2dError::Config(err.to_string())
    }
}
