//! Backup command arguments and execution

use clap::builder::TypedValueParser;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::CliError;
use crate::downloader::config::{
    DEFAULT_BASE_DELAY_MS, DEFAULT_CHECKPOINT_FILE, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY_MS,
    DEFAULT_MAX_REQUESTS_PER_WINDOW, DEFAULT_PAGE_SIZE, DEFAULT_WINDOW_SECS, DEFAULT_WORKERS,
    MAX_WINDOW_SECS,
};
use crate::downloader::{BackupConfig, BackupExecutor, RetryPolicy, RunSummary};
use crate::remote::cloudflare::{CloudflareCredentials, CloudflareKvClient, DEFAULT_API_BASE};
use crate::resume::CheckpointStore;
use crate::shutdown::SharedShutdown;

/// Maximum allowed worker count
const MAX_WORKERS: usize = 256;

/// Parse and validate worker count
fn parse_workers(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;

    if value == 0 {
        return Err("workers must be at least 1".to_string());
    }
    if value > MAX_WORKERS {
        return Err(format!("workers {value} exceeds maximum of {MAX_WORKERS}"));
    }
    Ok(value)
}

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON output
    Json,
    /// Human-readable output
    Human,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "human" => Ok(OutputFormat::Human),
            _ => Err(format!("Invalid output format: {s}")),
        }
    }
}

/// Mirror a Cloudflare Workers KV namespace to a local directory
#[derive(Debug, Parser)]
#[command(name = "kv-backup")]
#[command(about = "Back up a Cloudflare Workers KV namespace to local files", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Cloudflare API token with KV read permission
    #[arg(long, env = "CF_API_TOKEN", hide_env_values = true)]
    pub api_token: String,

    /// Cloudflare account ID
    #[arg(long, env = "CF_ACCOUNT_ID")]
    pub account_id: String,

    /// KV namespace ID
    #[arg(long, env = "CF_KV_NAMESPACE_ID")]
    pub namespace_id: String,

    /// Destination backup directory
    #[arg(long, default_value = "./data")]
    pub dest: PathBuf,

    /// Checkpoint file
    #[arg(long, default_value = DEFAULT_CHECKPOINT_FILE)]
    pub checkpoint: PathBuf,

    /// Delete the checkpoint and walk the listing from the start
    #[arg(long, default_value_t = false)]
    pub reset: bool,

    /// Number of concurrent download workers
    #[arg(long, alias = "num-workers", default_value_t = DEFAULT_WORKERS, value_parser = parse_workers)]
    pub workers: usize,

    /// Keys requested per listing call (1-1000)
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE, value_parser = clap::value_parser!(u16).range(1..=1000).map(usize::from))]
    pub page_size: usize,

    /// Queue capacity between lister and workers (default: twice the page size)
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Outbound calls allowed in flight at once (default: workers + 1)
    #[arg(long)]
    pub max_concurrent: Option<usize>,

    /// Outbound calls admitted per rate window
    #[arg(long, default_value_t = DEFAULT_MAX_REQUESTS_PER_WINDOW)]
    pub max_requests: usize,

    /// Rate window length in seconds (1-86400)
    #[arg(long, default_value_t = DEFAULT_WINDOW_SECS, value_parser = clap::value_parser!(u64).range(1..=MAX_WINDOW_SECS))]
    pub window_secs: u64,

    /// Total attempts per call, the first one included (1-20)
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS, value_parser = clap::value_parser!(u32).range(1..=20))]
    pub max_attempts: u32,

    /// Initial retry backoff in milliseconds
    #[arg(long, default_value_t = DEFAULT_BASE_DELAY_MS)]
    pub base_delay_ms: u64,

    /// Maximum retry backoff in milliseconds
    #[arg(long, default_value_t = DEFAULT_MAX_DELAY_MS)]
    pub max_delay_ms: u64,

    /// Re-download keys whose file already exists
    #[arg(long, default_value_t = false)]
    pub force: bool,

    /// Exit with status 2 when any key failed
    #[arg(long, default_value_t = false)]
    pub strict: bool,

    /// Per-key diagnostics
    #[arg(long, short, alias = "debug", default_value_t = false)]
    pub verbose: bool,

    /// Summary format (json or human)
    #[arg(long, default_value = "human")]
    pub output_format: OutputFormat,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,

    /// API root (for testing against a stand-in server)
    #[arg(long, default_value = DEFAULT_API_BASE, hide = true)]
    pub api_base: String,
}

impl Cli {
    /// Build the run configuration
    pub fn to_config(&self) -> Result<BackupConfig, CliError> {
        if self.api_token.trim().is_empty() {
            return Err(CliError::InvalidArgument("API token is empty".to_string()));
        }
        if self.account_id.trim().is_empty() || self.namespace_id.trim().is_empty() {
            return Err(CliError::InvalidArgument(
                "account ID and namespace ID are required".to_string(),
            ));
        }

        let mut builder = BackupConfig::builder(&self.dest)
            .checkpoint_path(&self.checkpoint)
            .page_size(self.page_size)
            .workers(self.workers)
            .rate_limit(self.max_requests, Duration::from_secs(self.window_secs))
            .retry(RetryPolicy {
                max_attempts: self.max_attempts,
                base_delay: Duration::from_millis(self.base_delay_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
                jitter: true,
            })
            .force_overwrite(self.force)
            .strict(self.strict)
            .verbose(self.verbose);
        if let Some(capacity) = self.queue_capacity {
            builder = builder.queue_capacity(capacity);
        }
        if let Some(max_concurrent) = self.max_concurrent {
            builder = builder.max_concurrent(max_concurrent);
        }

        builder
            .build()
            .map_err(|e| CliError::ConfigurationError(e.to_string()))
    }

    /// Cloudflare client for the configured namespace
    pub fn client(&self) -> Result<CloudflareKvClient, CliError> {
        let credentials =
            CloudflareCredentials::new(&self.api_token, &self.account_id, &self.namespace_id);
        Ok(CloudflareKvClient::with_base_url(credentials, &self.api_base)?
            .with_page_size(self.page_size))
    }

    /// Run the backup and print the summary
    pub async fn execute(&self, shutdown: SharedShutdown) -> Result<RunSummary, CliError> {
        let config = self.to_config()?;

        if self.reset && CheckpointStore::new(&config.checkpoint_path).reset()? {
            info!("Checkpoint reset, starting from the beginning");
        }

        let remote = Arc::new(self.client()?);
        let executor = BackupExecutor::new(Arc::new(config), remote, shutdown);
        let summary = executor.execute().await?;

        match self.output_format {
            OutputFormat::Json => output_json(&summary)?,
            OutputFormat::Human => print!("{}", summary.format_human()),
        }
        Ok(summary)
    }
}

fn output_json(summary: &RunSummary) -> Result<(), CliError> {
    let json = serde_json::to_string_pretty(summary)
        .map_err(|e| CliError::ConfigurationError(format!("Failed to encode summary: {e}")))?;
    println!("{json}");
    Ok(())
}
