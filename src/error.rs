//! Error taxonomy for the dispatch core.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the normalizer, the cache, and the coordinator.
///
/// `Clone` because a single backend outcome is delivered to every caller
/// waiting on the same fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Malformed input. Not retried.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A cache insert was attempted with a zero TTL.
    #[error("Invalid TTL: time-to-live must be greater than zero")]
    InvalidTtl,

    /// The backend could not be reached. Transient; callers may retry.
    #[error("Analysis backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend was reached but the analysis itself failed.
    #[error("Analysis failed: {0}")]
    BackendFailed(String),

    /// This caller stopped waiting. The computation itself keeps running.
    #[error("Timed out after {:.1}s waiting for analysis", .0.as_secs_f64())]
    Timeout(Duration),
}

impl DispatchError {
    /// Short machine-readable code used in API envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::InvalidRequest(_) => "INVALID_REQUEST",
            DispatchError::InvalidTtl => "INVALID_TTL",
            DispatchError::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            DispatchError::BackendFailed(_) => "BACKEND_FAILED",
            DispatchError::Timeout(_) => "TIMEOUT",
        }
    }

    /// HTTP status an API layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            DispatchError::InvalidRequest(_) => 400,
            DispatchError::InvalidTtl => 500,
            DispatchError::BackendFailed(_) => 502,
            DispatchError::BackendUnavailable(_) => 503,
            DispatchError::Timeout(_) => 504,
        }
    }

    /// Whether retrying the same request can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DispatchError::BackendUnavailable(_) | DispatchError::Timeout(_)
        )
    }
}

pub type DispatchResult<T> = std::result::Result<T, DispatchError>;
