//! Run statistics and periodic progress reporting.
//!
//! Workers, the lister and the committer update one shared [`RunStats`];
//! a [`ProgressReporter`] logs a snapshot at a fixed interval.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::info;

use super::task::Resolution;
use crate::metrics::record_key_outcome;

/// Counters shared across the pipeline
#[derive(Debug, Default)]
pub struct RunStats {
    downloaded: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    bytes_written: AtomicU64,
    retries: AtomicU64,
    keys_listed: AtomicU64,
    pages_listed: AtomicU64,
    pages_committed: AtomicU64,
}

impl RunStats {
    /// Create shared counters
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count a terminal task outcome
    pub fn record(&self, resolution: Resolution) {
        match resolution {
            Resolution::Downloaded { bytes } => {
                self.downloaded.fetch_add(1, Ordering::Relaxed);
                self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
                record_key_outcome("downloaded", bytes);
            }
            Resolution::Skipped => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                record_key_outcome("skipped", 0);
            }
            Resolution::Failed => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                record_key_outcome("failed", 0);
            }
            // Derived from keys listed minus terminal outcomes
            Resolution::CarriedOver => {}
        }
    }

    /// Count a scheduled retry
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a listing page and its keys
    pub fn record_page_listed(&self, keys: usize) {
        self.pages_listed.fetch_add(1, Ordering::Relaxed);
        self.keys_listed.fetch_add(keys as u64, Ordering::Relaxed);
    }

    /// Count a committed page
    pub fn record_page_committed(&self) {
        self.pages_committed.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            downloaded: self.downloaded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            keys_listed: self.keys_listed.load(Ordering::Relaxed),
            pages_listed: self.pages_listed.load(Ordering::Relaxed),
            pages_committed: self.pages_committed.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`RunStats`] at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Keys downloaded
    pub downloaded: u64,
    /// Keys skipped because their destination existed
    pub skipped: u64,
    /// Keys that failed permanently or ran out of retries
    pub failed: u64,
    /// Value bytes written
    pub bytes_written: u64,
    /// Retries scheduled across all calls
    pub retries: u64,
    /// Keys returned by the listing
    pub keys_listed: u64,
    /// Listing pages received
    pub pages_listed: u64,
    /// Pages whose cursor was checkpointed
    pub pages_committed: u64,
}

impl StatsSnapshot {
    /// Keys that reached a terminal outcome
    pub fn processed(&self) -> u64 {
        self.downloaded + self.skipped + self.failed
    }

    /// Listed keys left for a later run
    pub fn carried_over(&self) -> u64 {
        self.keys_listed.saturating_sub(self.processed())
    }

    /// One-line progress message
    pub fn format_progress(&self, elapsed: Duration) -> String {
        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 {
            self.processed() as f64 / secs
        } else {
            0.0
        };
        format!(
            "Progress: {} downloaded, {} skipped, {} failed of {} listed ({} pages committed) - {rate:.1} keys/s, {} elapsed",
            self.downloaded,
            self.skipped,
            self.failed,
            self.keys_listed,
            self.pages_committed,
            format_duration(elapsed)
        )
    }
}

/// Periodic progress logger
#[derive(Debug)]
pub struct ProgressReporter {
    handle: JoinHandle<()>,
}

impl ProgressReporter {
    /// Start logging `stats` every `interval`
    pub fn spawn(stats: Arc<RunStats>, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = tokio::time::interval_at(started + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                info!("{}", stats.snapshot().format_progress(started.elapsed()));
            }
        });
        Self { handle }
    }

    /// Stop reporting
    pub fn stop(self) {
        self.handle.abort();
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{:.1}h", secs as f64 / 3600.0)
    }
}
