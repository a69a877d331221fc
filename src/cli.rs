//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::config::BackendKind;
use crate::models::{AnalysisRequest, DateRange};
use chrono::{DateTime, Utc};
use clap::Parser;
use std::path::PathBuf;

/// Earthly AI - cached environmental insight dispatcher
///
/// Resolves an analysis request through the result cache, calling the
/// analysis backend at most once per distinct request.
///
/// Examples:
///   earthly-ai --region global --data-types temperature
///   earthly-ai --region arctic --data-types temperature,sea_level --format markdown
///   earthly-ai --region global --data-types co2 --repeat 3 --concurrency 8 --latency-ms 500
///   earthly-ai --region sahel --data-types precipitation --backend ollama --model llama3.2:latest
///   earthly-ai --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Region to analyze
    #[arg(
        short,
        long,
        value_name = "REGION",
        required_unless_present_any = ["init_config", "health"]
    )]
    pub region: Option<String>,

    /// Data types to analyze (comma-separated)
    ///
    /// Example: --data-types temperature,precipitation
    #[arg(short, long, value_name = "TYPES", value_delimiter = ',')]
    pub data_types: Vec<String>,

    /// Start of the analysis window (RFC 3339)
    #[arg(long, value_name = "TIMESTAMP", requires = "end")]
    pub start: Option<DateTime<Utc>>,

    /// End of the analysis window (RFC 3339)
    #[arg(long, value_name = "TIMESTAMP", requires = "start")]
    pub end: Option<DateTime<Utc>>,

    /// Analysis backend
    #[arg(long, value_name = "BACKEND", env = "EARTHLY_BACKEND")]
    pub backend: Option<BackendKind>,

    /// Ollama model to use with the ollama backend
    #[arg(short, long, env = "EARTHLY_MODEL")]
    pub model: Option<String>,

    /// Ollama API endpoint URL
    #[arg(long, env = "OLLAMA_URL")]
    pub ollama_url: Option<String>,

    /// Cache time-to-live in seconds
    #[arg(long, value_name = "SECS")]
    pub ttl: Option<u64>,

    /// Maximum number of cached results (LRU eviction beyond this)
    #[arg(long, value_name = "COUNT")]
    pub max_entries: Option<usize>,

    /// Longest to wait on an in-flight analysis, in seconds
    #[arg(long, value_name = "SECS")]
    pub max_wait: Option<u64>,

    /// Simulated heuristic backend latency in milliseconds
    #[arg(long, value_name = "MS")]
    pub latency_ms: Option<u64>,

    /// Number of sequential rounds to resolve the request
    #[arg(long, default_value = "1", value_name = "N")]
    pub repeat: usize,

    /// Concurrent callers per round
    #[arg(long, default_value = "1", value_name = "NUM")]
    pub concurrency: usize,

    /// Output format (json, markdown)
    #[arg(long, default_value = "json", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Write the rendered response to a file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .earthly.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Print a health report and exit
    #[arg(long)]
    pub health: bool,

    /// Generate a default .earthly.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Output format for the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// JSON envelope (default)
    #[default]
    Json,
    /// Markdown summary
    Markdown,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.init_config || self.health {
            return Ok(());
        }

        if self.repeat == 0 {
            return Err("Repeat must be at least 1".to_string());
        }

        if self.concurrency == 0 {
            return Err("Concurrency must be at least 1".to_string());
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if self.ttl == Some(0) {
            return Err("TTL must be at least 1 second".to_string());
        }

        if self.max_entries == Some(0) {
            return Err("Max entries must be at least 1".to_string());
        }

        if self.max_wait == Some(0) {
            return Err("Max wait must be at least 1 second".to_string());
        }

        if let Some(ref url) = self.ollama_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("Ollama URL must start with 'http://' or 'https://'".to_string());
            }
        }

        Ok(())
    }

    /// Build the analysis request described by the arguments.
    ///
    /// Content validation (empty region, inverted range) is left to the
    /// normalizer so the CLI reports it the same way the API would.
    pub fn analysis_request(&self) -> AnalysisRequest {
        let request = AnalysisRequest::new(
            self.region.clone().unwrap_or_default(),
            self.data_types.iter().cloned(),
        );

        match (self.start, self.end) {
            (Some(start), Some(end)) => request.with_date_range(DateRange::new(start, end)),
            _ => request,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn make_args() -> Args {
        Args::parse_from(["earthly-ai", "--region", "global", "--data-types", "temperature"])
    }

    #[test]
    fn test_parse_minimal() {
        let args = make_args();
        assert_eq!(args.region.as_deref(), Some("global"));
        assert_eq!(args.data_types, vec!["temperature"]);
        assert_eq!(args.repeat, 1);
        assert_eq!(args.format, OutputFormat::Json);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_parse_data_types_and_range() {
        let args = Args::parse_from([
            "earthly-ai",
            "-r",
            "arctic",
            "-d",
            "temperature,sea_level",
            "--start",
            "2024-01-01T00:00:00Z",
            "--end",
            "2024-02-01T00:00:00Z",
            "--backend",
            "ollama",
        ]);

        let request = args.analysis_request();
        assert_eq!(request.data_types().len(), 2);
        assert_eq!(args.backend, Some(BackendKind::Ollama));

        let range = request.date_range().unwrap();
        assert_eq!(range.start, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(range.end, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_start_requires_end() {
        let result = Args::try_parse_from([
            "earthly-ai",
            "--region",
            "global",
            "--start",
            "2024-01-01T00:00:00Z",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_region_optional_for_init_config() {
        let args = Args::try_parse_from(["earthly-ai", "--init-config"]).unwrap();
        assert!(args.init_config);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_validation_conflicting_options() {
        let mut args = make_args();
        args.verbose = true;
        args.quiet = true;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_limits() {
        let mut args = make_args();
        args.ttl = Some(0);
        assert!(args.validate().is_err());

        let mut args = make_args();
        args.concurrency = 0;
        assert!(args.validate().is_err());
    }
}
