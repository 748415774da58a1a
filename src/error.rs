//! Error handling for the reconciliation engine
//!
//! This module provides the error type shared by all engine operations and by
//! [`crate::store::DocumentStore`] implementations.
//!
//! Nothing in this crate is fatal to the process: mapping is total and never
//! fails, subscription errors degrade a single thread view, and write failures
//! are retried on the next natural trigger. The variants here exist so callers
//! can log and classify, not so they can abort.

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur during reconciliation engine operations
///
/// # Examples
///
/// ```rust
/// use chat_reconcile::EngineError;
///
/// let error = EngineError::Store("backend unavailable".to_string());
/// assert_eq!(error.to_string(), "Store error: backend unavailable");
///
/// let error = EngineError::ThreadNotFound("c-missing".to_string());
/// assert_eq!(error.to_string(), "Thread not found: c-missing");
/// ```
#[derive(Error, Debug)]
pub enum EngineError {
    /// Backing store reported a failure for a read or query
    #[error("Store error: {0}")]
    Store(String),

    /// A live subscription reported a failure
    ///
    /// Surfaced as a degraded view for the affected thread only; other
    /// subscriptions continue.
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// A store write failed after all fallback attempts
    #[error("Write failed at {path}: {reason}")]
    WriteFailed { path: String, reason: String },

    /// Requested logical thread is not known to the deduplicator
    #[error("Thread not found: {0}")]
    ThreadNotFound(String),

    /// Operation attempted in an invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl EngineError {
    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        EngineError::InvalidState(msg.into())
    }

    /// Check if this error is recoverable (transient, safe to retry)
    ///
    /// Write and store failures are retried opportunistically on the next
    /// natural trigger; structural errors are not.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use chat_reconcile::EngineError;
    ///
    /// let error = EngineError::Store("timeout".to_string());
    /// assert!(error.is_recoverable());
    ///
    /// let error = EngineError::ThreadNotFound("c1".to_string());
    /// assert!(!error.is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::Store(_)
                | EngineError::Subscription(_)
                | EngineError::WriteFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = EngineError::Store("backend down".to_string());
        assert_eq!(error.to_string(), "Store error: backend down");

        let error = EngineError::WriteFailed {
            path: "conversations/c1".to_string(),
            reason: "offline".to_string(),
        };
        assert_eq!(error.to_string(), "Write failed at conversations/c1: offline");

        let error = EngineError::invalid_state("no thread selected");
        assert_eq!(error.to_string(), "Invalid state: no thread selected");
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(EngineError::Subscription("stream closed".to_string()).is_recoverable());
        assert!(!EngineError::invalid_state("bad call").is_recoverable());
    }
}
