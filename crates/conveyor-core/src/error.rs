//! Error taxonomy.
//!
//! Two enums, one per boundary: [`IntakeError`] is what the intake API
//! (§4.6) can return to a caller, and [`HandlerFailure`] is what a
//! registered handler raises back to the dispatcher. Neither leaks
//! `anyhow::Error` detail past its boundary — the teacher's "no
//! `anyhow::Error` ever crosses the bus boundary" rule, applied here to
//! the intake/dispatcher seam instead of an event bus.

use thiserror::Error;

/// Failure modes an `Intake` operation (§4.6) can surface. Each maps to a
/// distinct HTTP status / error code in `conveyor-http` (§6).
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("missing or invalid principal")]
    Unauthorized,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("job not found")]
    NotFound,

    #[error("job is not in a state that allows this operation")]
    InvalidState,

    #[error("rate limit exceeded, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Classification of a handler's failure, mirroring the retryable /
/// non-retryable split §7 draws between transient and permanent handler
/// failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Recoverable: the dispatcher will retry with backoff until the
    /// attempt budget is exhausted.
    Retryable,
    /// Terminal: the dispatcher transitions straight to `failed`
    /// regardless of remaining attempts.
    NonRetryable,
}

/// What a handler raises when it can't complete a job.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerFailure {
    pub message: String,
    pub kind: FailureKind,
}

impl HandlerFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Retryable,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::NonRetryable,
        }
    }
}

/// Failures a `JobStore` or `RateLimiter` implementation can raise.
/// Intentionally a single opaque variant: storage errors are never
/// silently retried inside the store (§4.1), they propagate as-is.
#[derive(Debug, Error)]
#[error("storage error: {0}")]
pub struct StoreError(#[from] pub anyhow::Error);
