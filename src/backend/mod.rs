//! Analysis backends.
//!
//! The dispatch core only knows the [`AnalysisBackend`] trait. Two
//! implementations ship with the binary: an offline heuristic backend and
//! an Ollama-backed LLM backend.

pub mod heuristic;
pub mod ollama;

pub use heuristic::HeuristicBackend;
pub use ollama::{OllamaBackend, OllamaConfig};

use crate::error::DispatchError;
use crate::models::{AnalysisArtifact, AnalysisRequest};
use async_trait::async_trait;
use thiserror::Error;

/// Failure reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The backend could not be reached at all.
    #[error("{0}")]
    Unavailable(String),

    /// The backend answered, but not with a usable analysis.
    #[error("{0}")]
    Failed(String),
}

impl From<BackendError> for DispatchError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable(msg) => DispatchError::BackendUnavailable(msg),
            BackendError::Failed(msg) => DispatchError::BackendFailed(msg),
        }
    }
}

/// Something that can turn a request into an artifact.
///
/// Implementations own their timeout and retry behavior; the coordinator
/// calls `compute` once and waits for it to finish.
#[async_trait]
pub trait AnalysisBackend: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn compute(&self, request: &AnalysisRequest) -> Result<AnalysisArtifact, BackendError>;
}
