//! JSON and Markdown rendering.
//!
//! JSON output is the bare API envelope. Markdown output wraps the same
//! envelope with request metadata and dispatcher statistics.

use crate::api::{ApiResponse, ErrorBody, InsightData};
use crate::dispatch::DispatchStats;
use crate::models::{AnalysisRequest, Record};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Everything needed to render one resolve run.
#[derive(Debug, Clone)]
pub struct ResolveReport {
    pub request: AnalysisRequest,
    /// `None` when the request was rejected before fingerprinting.
    pub fingerprint: Option<String>,
    pub backend: String,
    pub response: ApiResponse,
    pub stats: DispatchStats,
    pub generated_at: DateTime<Utc>,
    pub duration_seconds: f64,
}

/// Generate the JSON envelope.
pub fn generate_json_report(report: &ResolveReport) -> Result<String> {
    serde_json::to_string_pretty(&report.response).map_err(Into::into)
}

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &ResolveReport) -> String {
    let mut output = String::new();

    output.push_str("# Earthly AI Insights\n\n");
    output.push_str(&generate_metadata_section(report));

    match &report.response {
        ApiResponse::Success { data } => output.push_str(&generate_data_section(data)),
        ApiResponse::Error { error } => output.push_str(&generate_error_section(
            error,
            report.response.status_code(),
        )),
    }

    output.push_str(&generate_stats_section(&report.stats));
    output.push_str(&generate_footer());

    output
}

/// Generate the metadata section.
fn generate_metadata_section(report: &ResolveReport) -> String {
    let mut section = String::new();

    section.push_str("## Request\n\n");
    section.push_str(&format!("- **Region:** {}\n", report.request.region()));

    let types: Vec<&str> = report
        .request
        .data_types()
        .iter()
        .map(String::as_str)
        .collect();
    section.push_str(&format!("- **Data Types:** {}\n", types.join(", ")));

    if let Some(range) = report.request.date_range() {
        section.push_str(&format!("- **Date Range:** {}\n", range));
    }
    if let Some(ref fingerprint) = report.fingerprint {
        section.push_str(&format!("- **Fingerprint:** `{}`\n", fingerprint));
    }
    section.push_str(&format!("- **Backend:** `{}`\n", report.backend));
    section.push_str(&format!(
        "- **Generated:** {}\n",
        report.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Duration:** {:.2}s\n\n", report.duration_seconds));

    section
}

fn generate_data_section(data: &InsightData) -> String {
    let mut section = String::new();

    section.push_str(&format!(
        "## Result\n\n**Confidence:** {:.0}%\n\n",
        data.confidence * 100.0
    ));

    section.push_str("### Insights\n\n");
    section.push_str(&generate_record_list(&data.insights));

    section.push_str("### Predictions\n\n");
    section.push_str(&generate_record_list(&data.predictions));

    section
}

fn generate_record_list(records: &[Record]) -> String {
    if records.is_empty() {
        return "_None._\n\n".to_string();
    }

    let mut list = String::new();
    for record in records {
        list.push_str(&format!("- {}\n", describe_record(record)));
    }
    list.push('\n');
    list
}

/// One-line rendering of an opaque record.
///
/// Objects become `key: value` pairs in key order; anything else is shown
/// as compact JSON.
fn describe_record(record: &Record) -> String {
    match record {
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| match value {
                Value::String(s) => format!("**{}:** {}", key, s),
                other => format!("**{}:** {}", key, other),
            })
            .collect::<Vec<_>>()
            .join(" | "),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn generate_error_section(error: &ErrorBody, status_code: u16) -> String {
    let mut section = String::new();

    section.push_str("## Error\n\n");
    section.push_str(&format!("- **Code:** `{}` ({})\n", error.code, status_code));
    section.push_str(&format!("- **Message:** {}\n", error.message));
    if error.retryable {
        section.push_str("- **Retryable:** yes\n");
    }
    section.push('\n');

    section
}

fn generate_stats_section(stats: &DispatchStats) -> String {
    let mut section = String::new();

    section.push_str("## Dispatcher Statistics\n\n");
    section.push_str("| Resolves | Cache Hits | Backend Calls | Joins | Failures | Timeouts |\n");
    section.push_str("|:---:|:---:|:---:|:---:|:---:|:---:|\n");
    section.push_str(&format!(
        "| {} | {} | {} | {} | {} | {} |\n\n",
        stats.resolves,
        stats.cache_hits,
        stats.backend_calls,
        stats.joins,
        stats.failures,
        stats.timeouts
    ));

    section
}

/// Generate the report footer.
fn generate_footer() -> String {
    let mut footer = String::new();

    footer.push_str("---\n\n");
    footer.push_str("*Report generated by Earthly AI*\n");

    footer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use crate::models::AnalysisArtifact;
    use serde_json::json;

    fn create_test_report(response: ApiResponse) -> ResolveReport {
        ResolveReport {
            request: AnalysisRequest::new("global", ["temperature", "co2"]),
            fingerprint: Some("abc123".to_string()),
            backend: "heuristic".to_string(),
            response,
            stats: DispatchStats {
                resolves: 3,
                cache_hits: 2,
                backend_calls: 1,
                ..DispatchStats::default()
            },
            generated_at: Utc::now(),
            duration_seconds: 0.25,
        }
    }

    fn success() -> ApiResponse {
        ApiResponse::success(&AnalysisArtifact::new(
            vec![json!({"data_type": "temperature", "summary": "Above baseline"})],
            vec![json!({"trend": "warming", "confidence": 0.95})],
            0.9,
        ))
    }

    #[test]
    fn test_generate_markdown_report() {
        let markdown = generate_markdown_report(&create_test_report(success()));

        assert!(markdown.contains("# Earthly AI Insights"));
        assert!(markdown.contains("- **Region:** global"));
        assert!(markdown.contains("- **Data Types:** co2, temperature"));
        assert!(markdown.contains("`abc123`"));
        assert!(markdown.contains("**Confidence:** 90%"));
        assert!(markdown.contains("**summary:** Above baseline"));
        assert!(markdown.contains("| 3 | 2 | 1 | 0 | 0 | 0 |"));
    }

    #[test]
    fn test_markdown_error_section() {
        let response = ApiResponse::error(&DispatchError::BackendUnavailable("offline".into()));
        let markdown = generate_markdown_report(&create_test_report(response));

        assert!(markdown.contains("## Error"));
        assert!(markdown.contains("`BACKEND_UNAVAILABLE` (503)"));
        assert!(markdown.contains("Retryable:** yes"));
        assert!(!markdown.contains("### Insights"));
    }

    #[test]
    fn test_describe_record() {
        assert_eq!(
            describe_record(&json!({"a": "x", "b": 2})),
            "**a:** x | **b:** 2"
        );
        assert_eq!(describe_record(&json!("plain")), "plain");
        assert_eq!(describe_record(&json!([1, 2])), "[1,2]");
    }

    #[test]
    fn test_empty_record_list() {
        assert_eq!(generate_record_list(&[]), "_None._\n\n");
    }

    #[test]
    fn test_generate_json_report_is_envelope() {
        let json = generate_json_report(&create_test_report(success())).unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["status"], "success");
        assert_eq!(value["data"]["confidence"], 0.9);
        assert!(value.get("stats").is_none());
    }
}
