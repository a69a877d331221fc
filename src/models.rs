//! Data models for the insight dispatcher.
//!
//! This module contains the request and artifact types that flow between
//! API consumers, the dispatch core, and analysis backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// An opaque record produced by a backend.
///
/// The core never inspects records; it only stores and forwards them.
pub type Record = serde_json::Value;

/// Inclusive time window an analysis is restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Whether `start` is after `end`.
    pub fn is_inverted(&self) -> bool {
        self.start > self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} .. {}",
            self.start.format("%Y-%m-%d %H:%M:%S UTC"),
            self.end.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

/// An inbound analysis request.
///
/// Fields are private so a request cannot change after it has been built.
/// Validation happens in the normalizer, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    region: String,
    data_types: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    date_range: Option<DateRange>,
}

impl AnalysisRequest {
    /// Creates a request without a date range.
    pub fn new<R, I, S>(region: R, data_types: I) -> Self
    where
        R: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            region: region.into(),
            data_types: data_types.into_iter().map(Into::into).collect(),
            date_range: None,
        }
    }

    /// Returns a copy of this request restricted to `range`.
    pub fn with_date_range(mut self, range: DateRange) -> Self {
        self.date_range = Some(range);
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn data_types(&self) -> &BTreeSet<String> {
        &self.data_types
    }

    pub fn date_range(&self) -> Option<&DateRange> {
        self.date_range.as_ref()
    }
}

impl fmt::Display for AnalysisRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let types: Vec<&str> = self.data_types.iter().map(String::as_str).collect();
        write!(f, "{} [{}]", self.region, types.join(", "))?;
        if let Some(range) = &self.date_range {
            write!(f, " ({})", range)?;
        }
        Ok(())
    }
}

/// The result of one backend computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisArtifact {
    /// Free-form insight records, in backend order.
    pub insights: Vec<Record>,
    /// Free-form prediction records, in backend order.
    pub predictions: Vec<Record>,
    /// Overall confidence in `[0, 1]`.
    pub confidence: f64,
    /// When the backend produced this artifact.
    pub computed_at: DateTime<Utc>,
}

impl AnalysisArtifact {
    /// Creates an artifact stamped with the current time.
    ///
    /// Confidence is clamped into `[0, 1]`; a NaN confidence becomes 0.
    pub fn new(insights: Vec<Record>, predictions: Vec<Record>, confidence: f64) -> Self {
        Self {
            insights,
            predictions,
            confidence: clamp_confidence(confidence),
            computed_at: Utc::now(),
        }
    }
}

fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
