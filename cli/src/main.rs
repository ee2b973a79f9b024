//! Keystone CLI - fetch a resource through the data-access core.
//!
//! ```text
//! keystone fetch <url> [--schema FILE] [--cache-key KEY]
//!                      [--max-retries N] [--timeout-ms MS] [--repeat N]
//! ```
//!
//! Configuration comes from `~/.keystone/config.toml` (or `$KEYSTONE_CONFIG`),
//! then `KEYSTONE_*` environment overrides, then command line flags. Each
//! result is printed as JSON on stdout; failures are printed as JSON on
//! stderr and make the process exit non-zero. Logs go to stderr.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use keystone_cache::{CachePolicy, ResultCache};
use keystone_config::{CacheConfig, FetchConfig, KeystoneConfig, LoggingConfig};
use keystone_core::{Execution, Query};
use keystone_fetch::{FetchOptions, FetchRequest, Fetcher, JsonSchemaValidator};
use keystone_types::{CacheKey, Failure};

#[derive(Debug, Parser)]
#[command(name = "keystone", version, about = "Resilient, cached HTTP reads")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch a URL (absolute, or relative to `fetch.base_url`) and print the result.
    Fetch(FetchArgs),
}

#[derive(Debug, Args)]
struct FetchArgs {
    url: String,

    /// JSON Schema the response must satisfy.
    #[arg(long, value_name = "FILE")]
    schema: Option<PathBuf>,

    /// Cache under this key instead of one derived from the request.
    #[arg(long)]
    cache_key: Option<String>,

    #[arg(long)]
    max_retries: Option<u32>,

    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Read the resource this many times; reads within the cache time are
    /// served from the cache.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    repeat: u32,
}

fn init_tracing(level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new(LoggingConfig::DEFAULT_LEVEL));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();
}

/// Load the config file and environment overrides. Problems are returned as
/// warnings so they can be logged once tracing is up.
fn load_config(lookup: impl Fn(&str) -> Option<String>) -> (KeystoneConfig, Vec<String>) {
    let mut warnings = Vec::new();
    let mut config = match KeystoneConfig::load() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            warnings.push(format!("Ignoring config file {}: {e}", e.path().display()));
            KeystoneConfig::default()
        }
    };
    config.apply_env_overrides(lookup);
    (config, warnings)
}

fn load_schema(path: &Path) -> Result<JsonSchemaValidator> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read schema {}", path.display()))?;
    let schema: Value = serde_json::from_str(&raw)
        .with_context(|| format!("schema {} is not valid JSON", path.display()))?;
    JsonSchemaValidator::new(&schema)
        .with_context(|| format!("schema {} is not a valid JSON Schema", path.display()))
}

fn fetch_options(config: &FetchConfig, args: &FetchArgs) -> Result<FetchOptions> {
    let mut options = FetchOptions::from_config(config);
    if let Some(max_retries) = args.max_retries {
        options = options.with_max_retries(max_retries);
    }
    if let Some(timeout_ms) = args.timeout_ms {
        options = options.with_timeout(Duration::from_millis(timeout_ms));
    }
    if let Some(path) = &args.schema {
        options = options.with_validator(load_schema(path)?);
    }
    Ok(options)
}

fn cache_binding(config: &CacheConfig) -> Option<(Arc<ResultCache>, CachePolicy)> {
    config
        .enabled
        .then(|| (ResultCache::global(), CachePolicy::from_config(config)))
}

fn print_failure(failure: &Failure) -> Result<()> {
    eprintln!("{}", serde_json::to_string_pretty(&failure.to_json())?);
    Ok(())
}

async fn run_fetch(config: &KeystoneConfig, args: FetchArgs) -> Result<ExitCode> {
    let options = fetch_options(&config.fetch_or_default(), &args)?;
    let fetcher = Fetcher::new().context("failed to build HTTP client")?;

    let mut builder = Query::<Value>::builder(fetcher, FetchRequest::get(&args.url)).options(options);
    if let Some((cache, policy)) = cache_binding(&config.cache_or_default()) {
        builder = builder.cache(cache, policy);
    }
    if let Some(key) = &args.cache_key {
        builder = builder.key(CacheKey::new(key.as_str()).context("--cache-key must not be empty")?);
    }
    let query = match builder.build() {
        Ok(query) => query,
        Err(failure) => {
            print_failure(&failure)?;
            return Ok(ExitCode::FAILURE);
        }
    };

    let mut exit = ExitCode::SUCCESS;
    for read in 1..=args.repeat {
        let outcome = tokio::select! {
            outcome = query.load() => outcome,
            _ = tokio::signal::ctrl_c() => {
                query.cancel();
                tracing::info!("Interrupted");
                return Ok(ExitCode::FAILURE);
            }
        };

        let snapshot = query.snapshot();
        tracing::info!(read, cached = snapshot.is_cached, stale = snapshot.is_stale, "Read complete");

        match outcome {
            Execution::Settled(Ok(value)) => println!("{}", serde_json::to_string_pretty(&value)?),
            Execution::Settled(Err(failure)) => {
                print_failure(&failure)?;
                exit = ExitCode::FAILURE;
            }
            Execution::Cancelled => {
                print_failure(&Failure::cancelled())?;
                exit = ExitCode::FAILURE;
            }
        }
    }
    Ok(exit)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let (config, warnings) = load_config(|name| env::var(name).ok());
    init_tracing(config.logging_or_default().level());
    for warning in warnings {
        tracing::warn!("{warning}");
    }
    if let Some(path) = KeystoneConfig::path() {
        tracing::debug!(path = %path.display(), "Configuration resolved");
    }

    match cli.command {
        Command::Fetch(args) => run_fetch(&config, args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> FetchArgs {
        let cli = Cli::try_parse_from(args).unwrap();
        let Command::Fetch(args) = cli.command;
        args
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_fetch_flags() {
        let args = parse(&[
            "keystone",
            "fetch",
            "https://api.example.com/contacts",
            "--max-retries",
            "5",
            "--timeout-ms",
            "250",
            "--cache-key",
            "contacts",
            "--repeat",
            "2",
        ]);
        assert_eq!(args.url, "https://api.example.com/contacts");
        assert_eq!(args.max_retries, Some(5));
        assert_eq!(args.timeout_ms, Some(250));
        assert_eq!(args.cache_key.as_deref(), Some("contacts"));
        assert_eq!(args.repeat, 2);
    }

    #[test]
    fn repeat_must_be_positive() {
        assert!(Cli::try_parse_from(["keystone", "fetch", "/x", "--repeat", "0"]).is_err());
    }

    #[test]
    fn flags_override_config() {
        let config = FetchConfig {
            timeout_ms: Some(1_000),
            max_retries: Some(1),
            ..FetchConfig::default()
        };
        let args = parse(&["keystone", "fetch", "/x", "--timeout-ms", "50"]);

        let options = fetch_options(&config, &args).unwrap();
        assert_eq!(options.timeout(), Duration::from_millis(50));
        assert_eq!(options.retry_policy().max_retries, 1);
    }

    #[test]
    fn schema_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("contact.json");
        fs::write(&path, r#"{"type": "object", "required": ["id"]}"#).unwrap();

        let args = parse(&["keystone", "fetch", "/x", "--schema", path.to_str().unwrap()]);
        assert!(fetch_options(&FetchConfig::default(), &args).is_ok());
    }

    #[test]
    fn unreadable_schema_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        let err = load_schema(&missing).unwrap_err();
        assert!(err.to_string().contains("failed to read schema"));

        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{not json").unwrap();
        let err = load_schema(&broken).unwrap_err();
        assert!(err.to_string().contains("not valid JSON"));
    }

    #[test]
    fn disabled_cache_is_not_bound() {
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        assert!(cache_binding(&config).is_none());
        assert!(cache_binding(&CacheConfig::default()).is_some());
    }
}
