//! API response envelopes.
//!
//! Translates resolve outcomes into the JSON shapes HTTP consumers expect,
//! along with the status code each error kind maps to.

use crate::error::DispatchError;
use crate::models::{AnalysisArtifact, Record};
use serde::{Deserialize, Serialize};

/// Payload of a successful response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightData {
    pub insights: Vec<Record>,
    pub predictions: Vec<Record>,
    pub confidence: f64,
}

impl From<&AnalysisArtifact> for InsightData {
    fn from(artifact: &AnalysisArtifact) -> Self {
        Self {
            insights: artifact.insights.clone(),
            predictions: artifact.predictions.clone(),
            confidence: artifact.confidence,
        }
    }
}

/// Error details in a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    /// Whether retrying the same request may succeed.
    pub retryable: bool,
    /// HTTP status, carried by the transport rather than the body.
    #[serde(skip, default = "default_error_status")]
    pub http_status: u16,
}

fn default_error_status() -> u16 {
    500
}

/// The response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ApiResponse {
    Success { data: InsightData },
    Error { error: ErrorBody },
}

impl ApiResponse {
    pub fn success(artifact: &AnalysisArtifact) -> Self {
        ApiResponse::Success {
            data: InsightData::from(artifact),
        }
    }

    pub fn error(err: &DispatchError) -> Self {
        ApiResponse::Error {
            error: ErrorBody {
                code: err.code().to_string(),
                message: err.to_string(),
                retryable: err.is_transient(),
                http_status: err.status_code(),
            },
        }
    }

    /// Build from anything `resolve` can return.
    pub fn from_outcome<A>(outcome: &Result<A, DispatchError>) -> Self
    where
        A: AsRef<AnalysisArtifact>,
    {
        match outcome {
            Ok(artifact) => Self::success(artifact.as_ref()),
            Err(err) => Self::error(err),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ApiResponse::Success { .. })
    }

    /// HTTP status code for this envelope.
    pub fn status_code(&self) -> u16 {
        match self {
            ApiResponse::Success { .. } => 200,
            ApiResponse::Error { error } => error.http_status,
        }
    }
}

/// Service health report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

impl HealthResponse {
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            service: "Earthly AI".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
