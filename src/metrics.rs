//! Run metrics for the backup pipeline
//!
//! Tracks outbound call outcomes, retry backoff, rate limiter queue wait,
//! per-key outcomes and checkpoint saves.
//!
//! ## Architecture
//!
//! - Uses `metrics` crate for low-overhead metric collection
//! - Optional Prometheus exporter for a scrape endpoint (`--metrics-addr`)
//! - Without an installed recorder every macro is a no-op

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

static METRICS_INITIALIZED: Lazy<Mutex<bool>> = Lazy::new(|| Mutex::new(false));

/// Metrics setup failures
#[derive(Debug, thiserror::Error)]
#[error("failed to install Prometheus exporter on {addr}: {message}")]
pub struct MetricsError {
    addr: SocketAddr,
    message: String,
}

/// Install the Prometheus exporter and register metric descriptions.
///
/// Idempotent: later calls are ignored once an exporter is installed.
pub fn init_metrics(addr: SocketAddr) -> Result<(), MetricsError> {
    let mut initialized = METRICS_INITIALIZED
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    if *initialized {
        debug!("Metrics already initialized, skipping");
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricsError {
            addr,
            message: e.to_string(),
        })?;

    describe_counter!(
        "kv_requests_total",
        Unit::Count,
        "Outbound KV API calls by operation and outcome"
    );
    describe_counter!(
        "kv_retries_total",
        Unit::Count,
        "Retries scheduled after transient failures"
    );
    describe_histogram!(
        "kv_retry_backoff_seconds",
        Unit::Seconds,
        "Backoff waited before a retry, jitter included"
    );
    describe_counter!(
        "rate_limit_permits_acquired_total",
        Unit::Count,
        "Admissions granted by the rate limiter"
    );
    describe_gauge!(
        "rate_limit_permits_available",
        Unit::Count,
        "Free concurrency slots after the last admission"
    );
    describe_histogram!(
        "rate_limit_queue_wait_seconds",
        Unit::Seconds,
        "Time spent waiting for admission"
    );
    describe_counter!(
        "keys_processed_total",
        Unit::Count,
        "Keys by terminal outcome (downloaded, skipped, failed)"
    );
    describe_counter!(
        "bytes_written_total",
        Unit::Bytes,
        "Value bytes written to the destination"
    );
    describe_counter!(
        "checkpoint_saves_total",
        Unit::Count,
        "Checkpoint save attempts by result"
    );

    *initialized = true;
    info!("Metrics endpoint listening on {}", addr);
    Ok(())
}

/// Whether an exporter was installed
pub fn is_initialized() -> bool {
    *METRICS_INITIALIZED
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

/// Count one outbound call; `outcome` is "ok" or a failure class description
pub fn record_request(operation: &'static str, outcome: &'static str) {
    counter!(
        "kv_requests_total",
        "operation" => operation,
        "outcome" => outcome,
    )
    .increment(1);
}

/// Record retry backoff duration
pub fn record_retry_backoff(operation: &'static str, duration: Duration, attempt: u32) {
    counter!(
        "kv_retries_total",
        "operation" => operation,
        "attempt" => attempt.to_string(),
    )
    .increment(1);

    histogram!(
        "kv_retry_backoff_seconds",
        "operation" => operation,
    )
    .record(duration.as_secs_f64());
}

/// Count a key reaching a terminal outcome
pub fn record_key_outcome(outcome: &'static str, bytes: u64) {
    counter!("keys_processed_total", "outcome" => outcome).increment(1);
    if bytes > 0 {
        counter!("bytes_written_total").increment(bytes);
    }
}

/// Count a checkpoint save attempt
pub fn record_checkpoint_save(succeeded: bool) {
    let result = if succeeded { "ok" } else { "error" };
    counter!("checkpoint_saves_total", "result" => result).increment(1);
}

/// Rate limiter metrics helper
pub struct RateLimiterMetrics {
    start_time: Option<Instant>,
}

impl Default for RateLimiterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiterMetrics {
    /// Create a new rate limiter metrics instance
    pub fn new() -> Self {
        Self { start_time: None }
    }

    /// Start measuring queue wait time
    pub fn start_acquire(&mut self) {
        self.start_time = Some(Instant::now());
    }

    /// Record successful permit acquisition
    pub fn record_acquired(&mut self) {
        if let Some(start) = self.start_time.take() {
            let wait_duration = start.elapsed();

            histogram!("rate_limit_queue_wait_seconds").record(wait_duration.as_secs_f64());
            counter!("rate_limit_permits_acquired_total").increment(1);

            if wait_duration.as_millis() > 100 {
                debug!(
                    wait_ms = wait_duration.as_millis() as u64,
                    "Rate limit permit acquired after wait"
                );
            }
        }
    }

    /// Update available permits gauge
    pub fn update_available_permits(&self, available: usize) {
        gauge!("rate_limit_permits_available").set(available as f64);
    }
}
