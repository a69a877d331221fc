//! Earthly AI - cached environmental insight dispatcher
//!
//! A CLI front end for the request-keyed cache and single-flight
//! dispatcher that sits between API consumers and analysis backends.
//!
//! Exit codes:
//!   0 - The request resolved successfully
//!   1 - Runtime error (bad arguments, config, I/O)
//!   2 - The request resolved to an error envelope

mod api;
mod backend;
mod cache;
mod cli;
mod config;
mod dispatch;
mod error;
mod models;
mod normalizer;
mod report;

use anyhow::{Context, Result};
use api::{ApiResponse, HealthResponse};
use backend::{AnalysisBackend, HeuristicBackend, OllamaBackend};
use cache::ResultCache;
use chrono::Utc;
use cli::{Args, OutputFormat};
use config::{BackendConfig, BackendKind, Config};
use dispatch::Coordinator;
use futures::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    if args.health {
        println!("{}", serde_json::to_string_pretty(&HealthResponse::healthy())?);
        return Ok(());
    }

    // Config decides the default verbosity, so it is loaded before logging
    let config = match prepare_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(config.log_level(args.quiet));

    info!("Earthly AI v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);
    debug!("Configuration: {:?}", config);

    match run(args, config).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Run failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .earthly.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(config::CONFIG_FILE);

    if path.exists() {
        eprintln!("⚠️  {} already exists. Remove it first or edit it manually.", config::CONFIG_FILE);
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", config::CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", config::CONFIG_FILE);
    println!("   Edit it to customize cache TTL, capacity, and the analysis backend.");
    Ok(())
}

/// Initialize logging at `level`.
///
/// Logs go to stderr so stdout carries only the rendered response.
fn init_logging(level: tracing::Level) {

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Warning: a tracing subscriber was already installed");
    }
}

/// Resolve the requested analysis. Returns the exit code (0 or 2).
async fn run(args: Args, config: Config) -> Result<i32> {
    let start_time = Instant::now();

    let backend = build_backend(&config.backend)?;
    let backend_name = backend.name().to_string();

    let coordinator = Coordinator::new(
        backend,
        ResultCache::with_capacity(config.cache.max_entries),
        config.cache.dispatch_config(),
    )
    .context("Failed to start dispatcher")?;

    let request = args.analysis_request();
    let fingerprint = normalizer::normalize(&request).ok();

    let spinner = if args.quiet {
        None
    } else {
        Some(make_spinner())
    };

    let mut last_outcome = None;
    for round in 1..=args.repeat {
        if let Some(ref pb) = spinner {
            pb.set_message(format!("Round {}/{}: resolving {}", round, args.repeat, request));
        }

        let callers = (0..args.concurrency).map(|_| coordinator.resolve(&request));
        let outcomes = join_all(callers).await;

        let failed = outcomes.iter().filter(|o| o.is_err()).count();
        if failed > 0 {
            warn!("Round {}: {}/{} callers failed", round, failed, outcomes.len());
        } else {
            info!("Round {}: {} callers resolved", round, outcomes.len());
        }

        last_outcome = outcomes.into_iter().last();
    }

    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    let outcome = last_outcome.context("No resolve rounds were run")?;
    let response = ApiResponse::from_outcome(&outcome);
    let stats = coordinator.stats();

    let report = report::ResolveReport {
        request,
        fingerprint: fingerprint.map(|fp| fp.to_string()),
        backend: backend_name,
        response,
        stats,
        generated_at: Utc::now(),
        duration_seconds: start_time.elapsed().as_secs_f64(),
    };

    let output = match args.format {
        OutputFormat::Json => report::generate_json_report(&report)?,
        OutputFormat::Markdown => report::generate_markdown_report(&report),
    };

    match config.general.output {
        Some(ref path) => {
            std::fs::write(path, &output)
                .with_context(|| format!("Failed to write response to {}", path))?;
            if !args.quiet {
                eprintln!("✅ Response saved to: {}", path);
            }
        }
        None => println!("{}", output),
    }

    if !args.quiet {
        eprintln!("\n📊 Dispatcher Summary:");
        eprintln!(
            "   Resolves: {} | Cache hits: {} | Backend calls: {} | Joins: {}",
            stats.resolves, stats.cache_hits, stats.backend_calls, stats.joins
        );
        if stats.failures > 0 || stats.timeouts > 0 {
            eprintln!("   Failures: {} | Timeouts: {}", stats.failures, stats.timeouts);
        }
        let cache_stats = coordinator.cache().stats();
        eprintln!(
            "   Cached entries: {} | Evictions: {} | Expirations: {}",
            cache_stats.entries, cache_stats.evictions, cache_stats.expirations
        );
        eprintln!("   Duration: {:.2}s", report.duration_seconds);
    }

    coordinator.shutdown();

    if report.response.is_success() {
        Ok(0)
    } else {
        Ok(2)
    }
}

fn make_spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Construct the configured analysis backend.
fn build_backend(config: &BackendConfig) -> Result<Arc<dyn AnalysisBackend>> {
    let backend: Arc<dyn AnalysisBackend> = match config.kind {
        BackendKind::Heuristic => Arc::new(
            HeuristicBackend::new()
                .with_latency(Duration::from_millis(config.simulated_latency_ms)),
        ),
        BackendKind::Ollama => Arc::new(OllamaBackend::new(config.ollama_config())?),
    };
    Ok(backend)
}

/// Load the config file (if any), apply CLI overrides, and validate.
fn prepare_config(args: &Args) -> Result<Config> {
    let mut config = Config::discover(args.config.as_deref(), Path::new("."))?;
    config.merge_with_args(args);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}
