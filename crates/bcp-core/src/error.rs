use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error taxonomy shared by the store, the scheduler, and the HTTP surface.
///
/// `LimitViolated` is internal: the scheduler recovers it by aborting the
/// rest of the pass and re-waking. `Canceled` is a caller-abandonment
/// sentinel and is never logged as an error. Everything else maps to an
/// HTTP status in exactly one place (`bcp-daemon::api_types`).
#[derive(Debug, Error)]
pub enum CoreError {
    /// Input validation failure (negative limit, malformed id). HTTP 400.
    #[error("invalid input: {0}")]
    Invalid(String),

    /// Entity absent, or not visible to the actor's organization. HTTP 404.
    #[error("not found: {0}")]
    NotFound(String),

    /// Identifier collision on enqueue. HTTP 409.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Admission lost a race and would break a concurrency invariant.
    /// Never surfaced over HTTP; triggers an immediate scheduler re-pass.
    #[error("admission would exceed a concurrency limit: {0}")]
    LimitViolated(String),

    /// A store transaction exceeded its deadline. Logged and retried by
    /// the scheduler; HTTP 500 only if it reaches a handler.
    #[error("store operation timed out after {0} ms")]
    Timeout(u64),

    /// The caller abandoned the operation before commit.
    #[error("operation canceled by caller")]
    Canceled,

    /// Any other store failure, with context attached at the failure site.
    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl CoreError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        CoreError::Invalid(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        CoreError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        CoreError::Conflict(msg.into())
    }

    pub fn limit_violated(msg: impl Into<String>) -> Self {
        CoreError::LimitViolated(msg.into())
    }

    /// True for errors the scheduler resolves by re-running the pass.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::LimitViolated(_) | CoreError::Timeout(_))
    }
}

/// Fail fast with `Canceled` when the caller has already abandoned the
/// operation. Store implementations call this at every suspension point
/// that precedes a mutation.
pub fn ensure_live(cancel: &CancellationToken) -> Result<(), CoreError> {
    if cancel.is_cancelled() {
        return Err(CoreError::Canceled);
    }
    Ok(())
}
