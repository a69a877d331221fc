//! Offline rule-based backend.
//!
//! Produces fixed recommendations and a confidence score per data type,
//! without calling any model. Useful for local runs and as a fallback when
//! no LLM is available.

use super::{AnalysisBackend, BackendError};
use crate::models::{AnalysisArtifact, AnalysisRequest, Record};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// Confidence used for data types without a dedicated rule.
const DEFAULT_CONFIDENCE: f64 = 0.6;

struct Rule {
    data_type: &'static str,
    confidence: f64,
    insight: &'static str,
    trend: &'static str,
}

const RULES: &[Rule] = &[
    Rule {
        data_type: "temperature",
        confidence: 0.95,
        insight: "Surface temperature anomalies are persistently above the long-term baseline",
        trend: "warming",
    },
    Rule {
        data_type: "precipitation",
        confidence: 0.8,
        insight: "Rainfall is shifting toward fewer, heavier events",
        trend: "more_variable",
    },
    Rule {
        data_type: "co2",
        confidence: 0.9,
        insight: "Atmospheric CO2 concentration continues its seasonal-adjusted rise",
        trend: "rising",
    },
    Rule {
        data_type: "air_quality",
        confidence: 0.75,
        insight: "Particulate levels peak during stagnant high-pressure periods",
        trend: "seasonal",
    },
    Rule {
        data_type: "sea_level",
        confidence: 0.85,
        insight: "Coastal gauges show steady relative sea level rise",
        trend: "rising",
    },
];

fn rule_for(data_type: &str) -> Option<&'static Rule> {
    let key = data_type.trim().to_lowercase();
    let key = match key.as_str() {
        "rainfall" | "rain" => "precipitation",
        "carbon" | "carbon_dioxide" => "co2",
        "aqi" => "air_quality",
        other => return RULES.iter().find(|r| r.data_type == other),
    };
    RULES.iter().find(|r| r.data_type == key)
}

/// Deterministic backend driven by a fixed rule table.
#[derive(Debug, Clone, Default)]
pub struct HeuristicBackend {
    latency: Duration,
}

impl HeuristicBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a slow computation. Handy for observing single-flight joins.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn analyze(request: &AnalysisRequest) -> AnalysisArtifact {
        let region = request.region().trim();
        let mut insights: Vec<Record> = Vec::new();
        let mut predictions: Vec<Record> = Vec::new();
        let mut total_confidence = 0.0;

        for data_type in request.data_types() {
            let rule = rule_for(data_type);
            let confidence = rule.map_or(DEFAULT_CONFIDENCE, |r| r.confidence);
            total_confidence += confidence;

            insights.push(json!({
                "data_type": data_type,
                "region": region,
                "summary": rule.map_or("No established pattern for this data type", |r| r.insight),
            }));
            predictions.push(json!({
                "data_type": data_type,
                "region": region,
                "trend": rule.map_or("unknown", |r| r.trend),
                "confidence": confidence,
            }));
        }

        if let Some(range) = request.date_range() {
            insights.push(json!({
                "kind": "window",
                "start": range.start.to_rfc3339(),
                "end": range.end.to_rfc3339(),
            }));
        }

        let count = request.data_types().len().max(1) as f64;
        AnalysisArtifact::new(insights, predictions, total_confidence / count)
    }
}

#[async_trait]
impl AnalysisBackend for HeuristicBackend {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn compute(&self, request: &AnalysisRequest) -> Result<AnalysisArtifact, BackendError> {
        debug!("Heuristic analysis for {}", request);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(Self::analyze(request))
    }
}
