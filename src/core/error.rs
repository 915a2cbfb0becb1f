//! Application-wide error types.
//!
//! [`AppError`] covers process-level failures (config, logging, sockets).
//! [`AggregatorError`] is the per-request taxonomy surfaced by dispatch; it is
//! `Clone` so a single failure can be recorded against each backend outcome.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("control error: {0}")]
    Control(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures a logical chat request (or one of its backend legs) can hit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregatorError {
    /// Target backend was not connected at send time.
    #[error("backend '{backend}' is not connected")]
    ConnectionUnavailable { backend: String },

    /// The request-level timer fired before every target settled.
    #[error("request {correlation_id} timed out after {timeout_ms}ms")]
    ResponseTimeout { correlation_id: String, timeout_ms: u64 },

    /// The backend answered with an explicit error frame.
    #[error("backend '{backend}' reported an error: {message}")]
    BackendError { backend: String, message: String },

    /// Inbound payload could not be parsed.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Inbound frame matched no pending request.
    #[error("uncorrelated frame from '{backend}'")]
    UncorrelatedFrame { backend: String },

    /// Routing produced no connected target.
    #[error("no backend available")]
    NoBackendAvailable,

    /// The request was cancelled before it completed.
    #[error("request {correlation_id} was cancelled")]
    Cancelled { correlation_id: String },

    /// The aggregator is not running (not initialised or shut down).
    #[error("aggregator is shut down")]
    Shutdown,
}
