//! Error types for Kavach
//!
//! `EngineError` is what adapters return; its retry flag drives the
//! scheduler. `KavachError` is the orchestration-wide taxonomy.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single engine invocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection reset: {0}")]
    ConnectionReset(String),

    #[error("temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("malformed target: {0}")]
    MalformedTarget(String),

    #[error("authorization rejected: {0}")]
    AuthRejected(String),

    #[error("{0}")]
    Fatal(String),
}

impl EngineError {
    /// Timeouts and transport resets are worth another attempt; everything
    /// else fails the stage run immediately.
    #[inline]
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Timeout(_) | EngineError::ConnectionReset(_) | EngineError::Unavailable(_)
        )
    }

    /// Classify an I/O error coming out of a network probe.
    #[must_use]
    pub fn from_io(err: &io::Error, timeout: Duration) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => EngineError::Timeout(timeout),
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => EngineError::ConnectionReset(err.to_string()),
            io::ErrorKind::InvalidInput | io::ErrorKind::AddrNotAvailable => {
                EngineError::MalformedTarget(err.to_string())
            }
            io::ErrorKind::PermissionDenied => EngineError::AuthRejected(err.to_string()),
            _ => EngineError::Fatal(err.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum KavachError {
    #[error("transient engine error: {0}")]
    TransientEngine(EngineError),

    #[error("fatal engine error: {0}")]
    FatalEngine(EngineError),

    #[error("resolver method '{method}' failed: {reason}")]
    ResolverPartialFailure { method: String, reason: String },

    #[error("scheduler overloaded: queue depth {depth} at ceiling {ceiling}")]
    SchedulerOverload { depth: usize, ceiling: usize },

    #[error("job cancelled")]
    JobCancelled,

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<EngineError> for KavachError {
    fn from(err: EngineError) -> Self {
        if err.is_retryable() {
            KavachError::TransientEngine(err)
        } else {
            KavachError::FatalEngine(err)
        }
    }
}

/// Result type alias for Kavach operations
pub type KavachResult<T> = Result<T, KavachError>;
