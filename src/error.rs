//! Error types for the invalidation client engine.

use thiserror::Error;

/// Result alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors the engine can produce.
///
/// Network/server-caused variants are recoverable locally (see
/// [`EngineError::is_retryable`]); [`EngineError::Internal`] means the
/// engine built a message its own validator rejects, which is an
/// unrecoverable bug rather than an environmental failure.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("transport send failed: {0}")]
    Transport(String),

    #[error("persistent store failed: {0}")]
    Persistence(String),

    #[error("message rejected by validator: {0}")]
    Validation(String),

    #[error("internal invariant violation: {0}")]
    Internal(String),

    #[error("engine is stopped")]
    Stopped,
}

impl EngineError {
    /// Network/server-side failures that a caller may simply retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transport(_))
    }

    /// Invariant violations the engine cannot recover from; the run loop
    /// should log and stop rather than keep operating.
    pub fn is_internal(&self) -> bool {
        matches!(self, EngineError::Internal(_))
    }
}
