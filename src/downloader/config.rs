//! Backup configuration and defaults
//!
//! [`BackupConfig`] is built once at startup, validated, and shared by
//! reference with every component.

use std::path::PathBuf;
use std::time::Duration;

use super::DownloadError;
use crate::remote::cloudflare::MAX_PAGE_SIZE;

/// Keys requested per listing call.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Concurrent download workers.
pub const DEFAULT_WORKERS: usize = 8;

/// Total attempts per outbound call (initial call included).
/// 5 attempts with exponential backoff rides out short outages without
/// stalling a run on a key that will never succeed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Initial backoff delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000; // 1 second

/// Maximum backoff delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30000; // 30 seconds

/// Requests admitted per rate window.
/// Cloudflare allows 1200 requests per 5 minutes per user; 1000 leaves headroom.
pub const DEFAULT_MAX_REQUESTS_PER_WINDOW: usize = 1000;

/// Rate window length in seconds.
pub const DEFAULT_WINDOW_SECS: u64 = 300;

/// Longest accepted rate window in seconds (one day).
pub const MAX_WINDOW_SECS: u64 = 86_400;

/// Default checkpoint file, relative to the working directory.
pub const DEFAULT_CHECKPOINT_FILE: &str = "checkpoint.json";

/// Calculate the capped exponential backoff delay for a retry.
///
/// `retry` is 0 for the delay after the first failed attempt.
pub fn calculate_backoff(retry: u32, base: Duration, max: Duration) -> Duration {
    let multiplier = 2u32.saturating_pow(retry);
    base.saturating_mul(multiplier).min(max)
}

/// Retry policy applied to every outbound call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Ceiling for the exponential delay
    pub max_delay: Duration,
    /// Add random jitter in `[0, delay)` on top of each delay
    pub jitter: bool,
}

impl RetryPolicy {
    /// Capped delay for the given retry index, before jitter
    pub fn backoff(&self, retry: u32) -> Duration {
        calculate_backoff(retry, self.base_delay, self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            jitter: true,
        }
    }
}

/// Admission limits shared by listing and downloading
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Calls admitted within any window
    pub max_requests_per_window: usize,
    /// Window length
    pub window: Duration,
    /// Calls allowed in flight at once
    pub max_concurrent: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_window: DEFAULT_MAX_REQUESTS_PER_WINDOW,
            window: Duration::from_secs(DEFAULT_WINDOW_SECS),
            max_concurrent: DEFAULT_WORKERS + 1,
        }
    }
}

/// Immutable configuration for one backup run
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Root directory receiving one file per key
    pub destination: PathBuf,
    /// Checkpoint file location
    pub checkpoint_path: PathBuf,
    /// Keys requested per listing call
    pub page_size: usize,
    /// Number of download workers
    pub workers: usize,
    /// Bounded queue capacity between lister and workers
    pub queue_capacity: usize,
    /// Admission limits
    pub rate_limit: RateLimitConfig,
    /// Retry policy
    pub retry: RetryPolicy,
    /// Re-download keys whose destination already exists
    pub force_overwrite: bool,
    /// Treat any failed key as a failed run
    pub strict: bool,
    /// Emit per-key diagnostics
    pub verbose: bool,
    /// Interval between progress log lines
    pub progress_interval: Duration,
}

impl BackupConfig {
    /// Start building a configuration for a destination root
    pub fn builder(destination: impl Into<PathBuf>) -> BackupConfigBuilder {
        BackupConfigBuilder::new(destination)
    }

    /// Check the configuration for values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), DownloadError> {
        let invalid = |msg: String| Err(DownloadError::InvalidConfig(msg));

        if self.workers == 0 {
            return invalid("worker count must be at least 1".to_string());
        }
        if self.queue_capacity == 0 {
            return invalid("queue capacity must be at least 1".to_string());
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return invalid(format!(
                "page size {} must be between 1 and {MAX_PAGE_SIZE}",
                self.page_size
            ));
        }
        if self.rate_limit.max_requests_per_window == 0 {
            return invalid("max requests per window must be at least 1".to_string());
        }
        if self.rate_limit.window.is_zero() {
            return invalid("rate window must be longer than zero".to_string());
        }
        if self.rate_limit.window > Duration::from_secs(MAX_WINDOW_SECS) {
            return invalid(format!(
                "rate window {:?} exceeds {MAX_WINDOW_SECS} seconds",
                self.rate_limit.window
            ));
        }
        if self.rate_limit.max_concurrent == 0 {
            return invalid("max concurrent requests must be at least 1".to_string());
        }
        if self.retry.max_attempts == 0 {
            return invalid("max attempts must be at least 1".to_string());
        }
        if self.retry.base_delay > self.retry.max_delay {
            return invalid(format!(
                "base delay {:?} exceeds max delay {:?}",
                self.retry.base_delay, self.retry.max_delay
            ));
        }
        if self.progress_interval.is_zero() {
            return invalid("progress interval must be longer than zero".to_string());
        }
        Ok(())
    }
}

/// Builder for [`BackupConfig`]
#[derive(Debug, Clone)]
pub struct BackupConfigBuilder {
    config: BackupConfig,
    max_concurrent_set: bool,
    queue_capacity_set: bool,
}

impl BackupConfigBuilder {
    fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            config: BackupConfig {
                destination: destination.into(),
                checkpoint_path: PathBuf::from(DEFAULT_CHECKPOINT_FILE),
                page_size: DEFAULT_PAGE_SIZE,
                workers: DEFAULT_WORKERS,
                queue_capacity: DEFAULT_PAGE_SIZE * 2,
                rate_limit: RateLimitConfig::default(),
                retry: RetryPolicy::default(),
                force_overwrite: false,
                strict: false,
                verbose: false,
                progress_interval: Duration::from_secs(30),
            },
            max_concurrent_set: false,
            queue_capacity_set: false,
        }
    }

    /// Checkpoint file location
    pub fn checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.checkpoint_path = path.into();
        self
    }

    /// Keys per listing call
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.config.page_size = page_size;
        self
    }

    /// Worker count; also sizes concurrency to workers + lister unless set explicitly
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Queue capacity; defaults to twice the page size
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self.queue_capacity_set = true;
        self
    }

    /// Calls admitted per window
    pub fn rate_limit(mut self, max_requests_per_window: usize, window: Duration) -> Self {
        self.config.rate_limit.max_requests_per_window = max_requests_per_window;
        self.config.rate_limit.window = window;
        self
    }

    /// Calls allowed in flight at once
    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.config.rate_limit.max_concurrent = max_concurrent;
        self.max_concurrent_set = true;
        self
    }

    /// Retry policy
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Re-download existing destinations
    pub fn force_overwrite(mut self, force: bool) -> Self {
        self.config.force_overwrite = force;
        self
    }

    /// Fail the run when any key fails
    pub fn strict(mut self, strict: bool) -> Self {
        self.config.strict = strict;
        self
    }

    /// Per-key diagnostics
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.config.verbose = verbose;
        self
    }

    /// Interval between progress log lines
    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.config.progress_interval = interval;
        self
    }

    /// Finalize and validate
    pub fn build(mut self) -> Result<BackupConfig, DownloadError> {
        if !self.max_concurrent_set {
            self.config.rate_limit.max_concurrent = self.config.workers.saturating_add(1);
        }
        if !self.queue_capacity_set {
            self.config.queue_capacity = self.config.page_size.saturating_mul(2);
        }
        self.config.validate()?;
        Ok(self.config)
    }
}
