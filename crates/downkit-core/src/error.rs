//! Error types for the Downkit core

use thiserror::Error;

/// Errors surfaced by the dispatcher's public operations.
#[derive(Debug, Error)]
pub enum DownkitError {
    /// A required field was missing or invalid at call time. Fatal to the
    /// call, never retried.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A task for this locator is already active. Never retried
    /// automatically.
    #[error("download task already exists for {0}")]
    DuplicateTask(String),

    /// A failure captured by the engine during the transfer.
    #[error("transfer failed: {0}")]
    Engine(#[from] EngineError),

    /// The transfer was cancelled from another thread.
    #[error("download was cancelled")]
    Cancelled,

    /// The transfer was paused before it could complete.
    #[error("download was paused")]
    Paused,
}

/// Failures an engine can capture during a transfer.
///
/// `Clone` so the same failure can be stored on the task, handed to the
/// progress sink, and re-raised in a blocked caller's thread.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("network error: {0}")]
    Network(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("server error: status {status}")]
    Server { status: u16 },

    #[error("transfer timed out")]
    Timeout,

    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl EngineError {
    /// Whether an engine may retry the connection after this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Network(_) | EngineError::Timeout => true,
            EngineError::Server { status } => *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(EngineError::Network("reset".into()).is_retryable());
        assert!(EngineError::Timeout.is_retryable());
        assert!(EngineError::Server { status: 503 }.is_retryable());
        assert!(!EngineError::Server { status: 404 }.is_retryable());
        assert!(!EngineError::InvalidUrl("nope".into()).is_retryable());
    }
}
