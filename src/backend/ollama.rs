//! LLM backend talking to an Ollama server.
//!
//! Sends one chat request per analysis and parses the model's JSON-lines
//! answer into insights, predictions, and a confidence score.

use super::{AnalysisBackend, BackendError};
use crate::models::{AnalysisArtifact, AnalysisRequest, Record};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Confidence assumed when the model does not report one.
const FALLBACK_CONFIDENCE: f64 = 0.5;

/// Configuration for the Ollama backend.
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub ollama_url: String,
    pub model_name: String,
    pub temperature: f32,
    pub timeout_seconds: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            model_name: "llama3.2:latest".to_string(),
            temperature: 0.1,
            timeout_seconds: 120,
        }
    }
}

/// Message in the chat history.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// Ollama chat API request.
#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

/// Ollama chat API response.
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: ChatMessage,
}

/// Backend that asks an Ollama-hosted model for the analysis.
pub struct OllamaBackend {
    config: OllamaConfig,
    http_client: reqwest::Client,
}

impl OllamaBackend {
    pub fn new(config: OllamaConfig) -> anyhow::Result<Self> {
        info!(
            "Initializing Ollama backend with model {} at {}",
            config.model_name, config.ollama_url
        );

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    fn build_prompt(request: &AnalysisRequest) -> String {
        let mut prompt = String::new();
        prompt.push_str("Analyze environmental conditions for the following request.\n\n");
        prompt.push_str(&format!("Region: {}\n", request.region().trim()));

        let types: Vec<&str> = request.data_types().iter().map(String::as_str).collect();
        prompt.push_str(&format!("Data types: {}\n", types.join(", ")));

        if let Some(range) = request.date_range() {
            prompt.push_str(&format!(
                "Date range: {} to {}\n",
                range.start.to_rfc3339(),
                range.end.to_rfc3339()
            ));
        }

        prompt.push_str("\nOutput one JSON object per line, using exactly these shapes:\n");
        prompt.push_str(r#"{"type": "insight", "data_type": "temperature", "summary": "..."}"#);
        prompt.push('\n');
        prompt.push_str(
            r#"{"type": "prediction", "data_type": "temperature", "trend": "...", "horizon_days": 30}"#,
        );
        prompt.push('\n');
        prompt.push_str(r#"{"type": "confidence", "value": 0.8}"#);
        prompt.push_str("\n\nOnly output JSON, no other text.");
        prompt
    }

    /// Send a single prompt and return the model's reply.
    async fn send_prompt(&self, prompt: &str) -> Result<String, BackendError> {
        let url = format!("{}/api/chat", self.config.ollama_url);

        let request = OllamaChatRequest {
            model: self.config.model_name.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            stream: false,
            options: OllamaOptions {
                temperature: self.config.temperature,
            },
        };

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Unavailable(format!(
                        "Request timed out after {}s",
                        self.config.timeout_seconds
                    ))
                } else if e.is_connect() {
                    BackendError::Unavailable(format!(
                        "Cannot connect to Ollama at {}",
                        self.config.ollama_url
                    ))
                } else {
                    BackendError::Unavailable(format!("Failed to send request: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("Ollama API error {}: {}", status, body);
            return Err(if status.is_server_error() {
                BackendError::Unavailable(message)
            } else {
                BackendError::Failed(message)
            });
        }

        let chat_response: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Failed(format!("Failed to parse Ollama response: {}", e)))?;

        Ok(chat_response.message.content)
    }
}

/// Split a JSON-lines reply into an artifact.
///
/// Lines that are not JSON objects are skipped. A reply with no insights
/// and no predictions is treated as a failed analysis.
fn parse_artifact(response: &str) -> Result<AnalysisArtifact, BackendError> {
    let mut insights: Vec<Record> = Vec::new();
    let mut predictions: Vec<Record> = Vec::new();
    let mut confidence: Option<f64> = None;

    for line in response.lines() {
        let line = line.trim();
        if line.is_empty() || !line.starts_with('{') {
            continue;
        }

        let Ok(mut json) = serde_json::from_str::<Value>(line) else {
            debug!("Skipping unparseable line: {}", line);
            continue;
        };

        let kind = json
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("insight")
            .to_lowercase();

        match kind.as_str() {
            "confidence" => {
                confidence = json.get("value").and_then(Value::as_f64);
            }
            "prediction" => {
                strip_type(&mut json);
                predictions.push(json);
            }
            _ => {
                strip_type(&mut json);
                insights.push(json);
            }
        }
    }

    if insights.is_empty() && predictions.is_empty() {
        return Err(BackendError::Failed(
            "Model reply contained no insights or predictions".to_string(),
        ));
    }

    let confidence = confidence.unwrap_or_else(|| {
        warn!("Model did not report a confidence; assuming {}", FALLBACK_CONFIDENCE);
        FALLBACK_CONFIDENCE
    });

    Ok(AnalysisArtifact::new(insights, predictions, confidence))
}

fn strip_type(json: &mut Value) {
    if let Some(obj) = json.as_object_mut() {
        obj.remove("type");
    }
}

#[async_trait]
impl AnalysisBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn compute(&self, request: &AnalysisRequest) -> Result<AnalysisArtifact, BackendError> {
        info!("Requesting analysis from {} for {}", self.config.model_name, request);
        let prompt = Self::build_prompt(request);
        let reply = self.send_prompt(&prompt).await?;
        let artifact = parse_artifact(&reply)?;
        info!(
            "Parsed {} insights and {} predictions",
            artifact.insights.len(),
            artifact.predictions.len()
        );
        Ok(artifact)
    }
}

/// System prompt for the analysis call.
const SYSTEM_PROMPT: &str = r#"You are an environmental data analyst.
Given a region, a set of data types, and an optional date range, report
notable insights and short-term predictions for each data type, plus one
overall confidence value between 0 and 1.
Output each item as a JSON object on its own line.
Only output valid JSON, no explanations or markdown."#;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use crate::models::DateRange;

    #[test]
    fn test_ollama_config_default() {
        let config = OllamaConfig::default();
        assert_eq!(config.model_name, "llama3.2:latest");
        assert_eq!(config.ollama_url, "http://localhost:11434");
    }

    #[test]
    fn test_parse_artifact() {
        let reply = r#"Here you go:
{"type": "insight", "data_type": "temperature", "summary": "Warm spell"}
{"type": "prediction", "data_type": "temperature", "trend": "up", "horizon_days": 30}
not json at all
{"type": "confidence", "value": 0.82}
"#;
        let artifact = parse_artifact(reply).unwrap();

        assert_eq!(artifact.insights.len(), 1);
        assert_eq!(artifact.predictions.len(), 1);
        assert_eq!(artifact.insights[0]["summary"], "Warm spell");
        assert!(artifact.insights[0].get("type").is_none());
        assert_eq!(artifact.predictions[0]["horizon_days"], 30);
        assert_eq!(artifact.confidence, 0.82);
    }

    #[test]
    fn test_parse_artifact_untyped_lines_are_insights() {
        let reply = r#"{"summary": "No type tag"}"#;
        let artifact = parse_artifact(reply).unwrap();

        assert_eq!(artifact.insights.len(), 1);
        assert_eq!(artifact.confidence, FALLBACK_CONFIDENCE);
    }

    #[test]
    fn test_parse_artifact_empty_reply_fails() {
        let err = parse_artifact("I could not analyze that.").unwrap_err();
        assert!(matches!(err, BackendError::Failed(_)));

        let only_confidence = r#"{"type": "confidence", "value": 0.9}"#;
        assert!(parse_artifact(only_confidence).is_err());
    }

    #[test]
    fn test_build_prompt_mentions_request() {
        let request = AnalysisRequest::new("sahel", ["precipitation", "temperature"])
            .with_date_range(DateRange::new(
                Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2023, 12, 31, 0, 0, 0).unwrap(),
            ));

        let prompt = OllamaBackend::build_prompt(&request);

        assert!(prompt.contains("Region: sahel"));
        assert!(prompt.contains("Data types: precipitation, temperature"));
        assert!(prompt.contains("Date range: 2023-01-01T00:00:00+00:00"));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let backend = OllamaBackend::new(OllamaConfig {
            ollama_url: "http://127.0.0.1:9".to_string(),
            timeout_seconds: 2,
            ..OllamaConfig::default()
        })
        .unwrap();

        let request = AnalysisRequest::new("global", ["temperature"]);
        let err = backend.compute(&request).await.unwrap_err();

        assert!(matches!(err, BackendError::Unavailable(_)));
    }
}
