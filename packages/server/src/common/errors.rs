//! Typed error taxonomy for the sync engine.
//!
//! Stage workers use the variant to decide what happens to the job:
//! transient failures park the job for a retry with its checkpoint intact,
//! rate limits drive the `rate_limited` outcome, missing data is benign,
//! and configuration problems fail the job outright.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Retryable I/O failure (network timeout, connection reset, 5xx).
    /// Does not advance the checkpoint.
    #[error("transient i/o failure: {0}")]
    Transient(String),

    /// The upstream throttled us. Drives the `rate_limited` job outcome
    /// instead of a failure, preserving the incremental window.
    #[error("rate limited by upstream: {0}")]
    RateLimited(String),

    /// The unit was deleted upstream between enumeration and processing.
    /// Expected and treated as success by stage workers.
    #[error("not found: {0}")]
    NotFound(String),

    /// Missing credentials or otherwise unrecoverable configuration.
    /// Surfaces as a failed job with no automatic retry.
    #[error("configuration error: {0}")]
    FatalConfig(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("broker error: {0}")]
    Broker(String),
}

impl SyncError {
    /// Whether a retry on the next scheduling cycle may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transient(_) | SyncError::Store(_) | SyncError::Broker(_)
        )
    }

    /// Whether this error is an expected no-op rather than a failure.
    pub fn is_benign(&self) -> bool {
        matches!(self, SyncError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(SyncError::Transient("timeout".into()).is_retryable());
        assert!(SyncError::Broker("disconnected".into()).is_retryable());
    }

    #[test]
    fn fatal_config_is_not_retryable() {
        assert!(!SyncError::FatalConfig("missing token".into()).is_retryable());
    }

    #[test]
    fn rate_limit_is_neither_retryable_nor_benign() {
        let err = SyncError::RateLimited("429".into());
        assert!(!err.is_retryable());
        assert!(!err.is_benign());
    }

    #[test]
    fn not_found_is_benign() {
        assert!(SyncError::NotFound("issue-42".into()).is_benign());
    }
}
