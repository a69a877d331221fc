//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.earthly.toml` files.

use crate::backend::OllamaConfig;
use crate::dispatch::DispatchConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Default configuration file name.
pub const CONFIG_FILE: &str = ".earthly.toml";

/// Longest accepted cache TTL (one year).
pub const MAX_TTL_SECONDS: u64 = 365 * 24 * 60 * 60;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Result cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Analysis backend settings.
    #[serde(default)]
    pub backend: BackendConfig,
}

/// General application settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Write the rendered response here instead of stdout.
    #[serde(default)]
    pub output: Option<String>,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,
}

/// Result cache and dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Time-to-live for computed artifacts, in seconds.
    #[serde(default = "default_ttl")]
    pub ttl_seconds: u64,

    /// Maximum number of cached artifacts. Unbounded when absent.
    #[serde(default)]
    pub max_entries: Option<usize>,

    /// Longest a caller waits on an in-flight computation, in seconds.
    /// Waits indefinitely when absent.
    #[serde(default)]
    pub max_wait_seconds: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl(),
            max_entries: None,
            max_wait_seconds: None,
        }
    }
}

fn default_ttl() -> u64 {
    300
}

impl CacheConfig {
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            ttl: Duration::from_secs(self.ttl_seconds),
            max_wait: self.max_wait_seconds.map(Duration::from_secs),
        }
    }
}

/// Which backend computes analyses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Offline rule-based analysis (default)
    #[default]
    Heuristic,
    /// LLM analysis through an Ollama server
    Ollama,
}

/// Analysis backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend implementation.
    #[serde(default)]
    pub kind: BackendKind,

    /// Ollama API URL.
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    /// Model name.
    #[serde(default = "default_model")]
    pub model: String,

    /// Temperature for generation.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Simulated latency for the heuristic backend, in milliseconds.
    #[serde(default)]
    pub simulated_latency_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            ollama_url: default_ollama_url(),
            model: default_model(),
            temperature: default_temperature(),
            timeout_seconds: default_timeout(),
            simulated_latency_ms: 0,
        }
    }
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "llama3.2:latest".to_string()
}

fn default_temperature() -> f32 {
    0.1
}

fn default_timeout() -> u64 {
    120
}

impl BackendConfig {
    pub fn ollama_config(&self) -> OllamaConfig {
        OllamaConfig {
            ollama_url: self.ollama_url.clone(),
            model_name: self.model.clone(),
            temperature: self.temperature,
            timeout_seconds: self.timeout_seconds,
        }
    }
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from `dir/.earthly.toml`.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_from_dir(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(CONFIG_FILE);

        if path.exists() {
            Ok(Some(Self::load(&path)?))
        } else {
            Ok(None)
        }
    }

    /// Load the configuration a run should use.
    ///
    /// An explicit path must exist and parse. Otherwise `dir/.earthly.toml`
    /// is used when present, and defaults when it is absent. A config file
    /// that exists but does not parse is always an error.
    pub fn discover(explicit: Option<&Path>, dir: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            info!("Loading config from: {}", path.display());
            return Self::load(path);
        }

        match Self::load_from_dir(dir)
            .with_context(|| format!("Failed to load {} from {}", CONFIG_FILE, dir.display()))?
        {
            Some(config) => {
                info!("Loaded default config from {}", CONFIG_FILE);
                Ok(config)
            }
            None => {
                debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Reject settings the dispatcher cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.cache.ttl_seconds == 0 {
            anyhow::bail!("cache.ttl_seconds must be at least 1");
        }
        if self.cache.ttl_seconds > MAX_TTL_SECONDS {
            anyhow::bail!(
                "cache.ttl_seconds must be at most {} (one year)",
                MAX_TTL_SECONDS
            );
        }
        if self.cache.max_entries == Some(0) {
            anyhow::bail!("cache.max_entries must be at least 1 when set");
        }
        if self.cache.max_wait_seconds == Some(0) {
            anyhow::bail!("cache.max_wait_seconds must be at least 1 when set");
        }
        if !(0.0..=1.0).contains(&self.backend.temperature) {
            anyhow::bail!("backend.temperature must be between 0.0 and 1.0");
        }
        Ok(())
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings.
    /// This method only overrides config when CLI provides explicit values.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ttl) = args.ttl {
            self.cache.ttl_seconds = ttl;
        }
        if let Some(max_entries) = args.max_entries {
            self.cache.max_entries = Some(max_entries);
        }
        if let Some(max_wait) = args.max_wait {
            self.cache.max_wait_seconds = Some(max_wait);
        }

        if let Some(kind) = args.backend {
            self.backend.kind = kind;
        }
        if let Some(ref url) = args.ollama_url {
            self.backend.ollama_url = url.clone();
        }
        if let Some(ref model) = args.model {
            self.backend.model = model.clone();
        }
        if let Some(latency) = args.latency_ms {
            self.backend.simulated_latency_ms = latency;
        }

        if let Some(ref output) = args.output {
            self.general.output = Some(output.display().to_string());
        }

        // Flags always override
        if args.verbose {
            self.general.verbose = true;
        }
        if args.quiet {
            self.general.verbose = false;
        }
    }

    /// Log level for this run. `quiet` wins over any configured verbosity.
    pub fn log_level(&self, quiet: bool) -> tracing::Level {
        if quiet {
            tracing::Level::ERROR
        } else if self.general.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
