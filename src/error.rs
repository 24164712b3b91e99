//! Error taxonomy for the RAG core.
//!
//! Every failure carries a machine-readable kind plus a message. Components
//! recover locally only where their contracts say so (per-item embedding
//! failure, citation absence); everything else bubbles to the caller with its
//! kind preserved.

use std::time::Duration;

use thiserror::Error;

/// Top-level error type for the RAG core.
#[derive(Debug, Error)]
pub enum RagError {
    /// Bad caller input: missing title, empty question, oversized upload.
    #[error("validation error: {0}")]
    Validation(String),

    /// PDF unparseable or yields no text. Ingestion aborts, no rows written.
    #[error("extraction failed: {0}")]
    ExtractFailed(String),

    /// Provider signaled throttling. Never retried by the dispatch loop; the
    /// queue honors the hint as a one-off extra delay.
    #[error("model provider rate limited")]
    ModelRateLimited { retry_after: Option<Duration> },

    /// 5xx or connection reset. Retried up to the configured cap.
    #[error("transient model error: {0}")]
    ModelTransient(String),

    /// The model client's bounded queue is at capacity.
    #[error("model request queue is full")]
    ModelQueueFull,

    /// The request's deadline expired before a response arrived.
    #[error("model request timed out")]
    ModelTimeout,

    /// Database or transaction failure.
    #[error("store error: {0}")]
    Store(String),

    /// Document id unknown.
    #[error("not found: {0}")]
    NotFound(String),

    /// Anything else. Surfaced generically to callers, logged in detail.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RagError {
    /// Machine-readable kind, stable across messages. Used by the HTTP
    /// error envelope and by tests.
    pub fn kind(&self) -> &'static str {
        match self {
            RagError::Validation(_) => "validation_error",
            RagError::ExtractFailed(_) => "extract_failed",
            RagError::ModelRateLimited { .. } => "model_rate_limited",
            RagError::ModelTransient(_) => "model_transient",
            RagError::ModelQueueFull => "model_queue_full",
            RagError::ModelTimeout => "model_timeout",
            RagError::Store(_) => "store_error",
            RagError::NotFound(_) => "not_found",
            RagError::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for RagError {
    fn from(e: sqlx::Error) -> Self {
        RagError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for RagError {
    fn from(e: serde_json::Error) -> Self {
        RagError::Internal(format!("serialization error: {e}"))
    }
}

/// Determines whether an operation that failed with this error may be retried.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for RagError {
    fn is_retryable(&self) -> bool {
        match self {
            // Transient provider failures are the retry policy's whole domain.
            RagError::ModelTransient(_) => true,
            // Rate limits are handled by queue spacing, never by retry.
            RagError::ModelRateLimited { .. } => false,
            // SQLite lock contention and serialization failures clear on retry.
            RagError::Store(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("database is locked")
                    || msg.contains("database table is locked")
                    || msg.contains("busy")
                    || msg.contains("deadlock")
                    || msg.contains("serialization")
            }
            _ => false,
        }
    }
}

/// Result alias used throughout the core.
pub type Result<T, E = RagError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(RagError::ModelQueueFull.kind(), "model_queue_full");
        assert_eq!(RagError::ModelTimeout.kind(), "model_timeout");
        assert_eq!(
            RagError::Validation("missing title".into()).kind(),
            "validation_error"
        );
    }

    #[test]
    fn transient_is_retryable_rate_limit_is_not() {
        assert!(RagError::ModelTransient("502".into()).is_retryable());
        assert!(!RagError::ModelRateLimited { retry_after: None }.is_retryable());
        assert!(!RagError::ModelTimeout.is_retryable());
    }

    #[test]
    fn locked_store_errors_are_retryable() {
        assert!(RagError::Store("database is locked".into()).is_retryable());
        assert!(!RagError::Store("no such table: documents".into()).is_retryable());
    }
}
