//! Backup executor wiring the pipeline together
//!
//! One run:
//! 1. validate configuration, take the run lock, prepare the destination root
//! 2. load the start cursor from the checkpoint
//! 3. spawn the committer and the worker pool, run the lister to completion
//! 4. join workers and committer, save the last committed cursor again
//! 5. mark the shutdown coordinator stopped and return a [`RunSummary`]
//!
//! A second termination request (forced exit) abandons steps 3-4 at once;
//! the checkpoint then reflects only pages committed up to that point.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::config::BackupConfig;
use super::lister::{save_checkpoint, CommitOutcome, KeyLister, ListingOutcome, PageCommitter};
use super::progress::{ProgressReporter, RunStats};
use super::rate_limit::RateLimiter;
use super::retry::{RetryController, RetryEvent, RetryObserver};
use super::worker::{FailedKey, WorkerContext, WorkerPool};
use super::DownloadError;
use crate::remote::KvNamespace;
use crate::resume::{Checkpoint, CheckpointStore, RunLock};
use crate::shutdown::SharedShutdown;
use crate::storage;
use crate::Cursor;

/// Outcome of one backup run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Keys downloaded
    pub downloaded: u64,
    /// Keys skipped because their destination existed
    pub skipped: u64,
    /// Keys that failed permanently or ran out of retries
    pub failed: u64,
    /// Listed keys left for a later run
    pub carried_over: u64,
    /// Value bytes written
    pub bytes_written: u64,
    /// Pages whose cursor was checkpointed
    pub pages_committed: u64,
    /// Retries scheduled across all calls
    pub retries: u64,
    /// Per-key failures
    pub failed_keys: Vec<FailedKey>,
    /// Cursor a following run resumes from
    pub final_cursor: Cursor,
    /// Whether shutdown stopped the run before the listing ended
    pub interrupted: bool,
    /// Wall-clock duration in milliseconds
    pub elapsed_ms: u64,
}

impl RunSummary {
    /// Whether the whole listing was walked and committed
    pub fn is_complete(&self) -> bool {
        self.final_cursor.is_end() && !self.interrupted
    }

    /// Human-readable multi-line summary
    pub fn format_human(&self) -> String {
        let mut out = format!(
            "Backup {}: {} downloaded, {} skipped, {} failed, {} carried over\n",
            if self.interrupted {
                "interrupted"
            } else {
                "finished"
            },
            self.downloaded,
            self.skipped,
            self.failed,
            self.carried_over
        );
        out.push_str(&format!(
            "  {} bytes written, {} pages committed, {} retries, {:.1}s\n",
            self.bytes_written,
            self.pages_committed,
            self.retries,
            Duration::from_millis(self.elapsed_ms).as_secs_f64()
        ));
        out.push_str(&format!("  resume cursor: {}\n", self.final_cursor));
        for failed in &self.failed_keys {
            out.push_str(&format!(
                "  failed: {} ({} attempts): {}\n",
                failed.key, failed.attempts, failed.reason
            ));
        }
        out
    }
}

/// Runs one backup
pub struct BackupExecutor {
    config: Arc<BackupConfig>,
    remote: Arc<dyn KvNamespace>,
    shutdown: SharedShutdown,
    observer: Option<RetryObserver>,
}

impl BackupExecutor {
    /// Create an executor
    pub fn new(
        config: Arc<BackupConfig>,
        remote: Arc<dyn KvNamespace>,
        shutdown: SharedShutdown,
    ) -> Self {
        Self {
            config,
            remote,
            shutdown,
            observer: None,
        }
    }

    /// Receive every retry event of the run
    pub fn with_retry_observer(mut self, observer: RetryObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Run the backup to completion, drain, or abort
    pub async fn execute(&self) -> Result<RunSummary, DownloadError> {
        let started = Instant::now();
        let config = self.config.clone();
        config.validate()?;

        let store = CheckpointStore::new(&config.checkpoint_path);
        let _lock = RunLock::try_acquire(store.path())?;
        storage::prepare_root(&config.destination)?;
        let start = store.load();

        info!(
            destination = %config.destination.display(),
            checkpoint = %store.path().display(),
            cursor = %start,
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            max_requests = config.rate_limit.max_requests_per_window,
            window_secs = config.rate_limit.window.as_secs(),
            "Starting backup"
        );

        let stats = RunStats::new();
        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
        let retry = RetryController::new(limiter.clone(), config.retry.clone())
            .with_shutdown(self.shutdown.clone())
            .with_observer(self.retry_observer(stats.clone()));

        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        let (page_tx, page_rx) = mpsc::unbounded_channel();

        let committer = tokio::spawn(PageCommitter::new(store.clone(), stats.clone()).run(page_rx));
        let pool = WorkerPool::spawn(
            WorkerContext {
                remote: self.remote.clone(),
                retry: retry.clone(),
                config: config.clone(),
                shutdown: self.shutdown.clone(),
                stats: stats.clone(),
            },
            queue_rx,
        );
        let reporter = ProgressReporter::spawn(stats.clone(), config.progress_interval);
        let lister = KeyLister::new(
            self.remote.clone(),
            retry,
            config.clone(),
            self.shutdown.clone(),
            stats.clone(),
        );

        let pipeline = async {
            let listing = lister.run(start.clone(), queue_tx, page_tx).await;
            let failed_keys = pool.join().await?;
            let commit = committer
                .await
                .map_err(|e| DownloadError::TaskFailed(format!("checkpoint committer: {e}")))?;
            Ok::<_, DownloadError>((listing, failed_keys, commit))
        };

        let joined = tokio::select! {
            biased;
            _ = self.shutdown.wait_for_force() => Err(DownloadError::ForcedExit),
            joined = pipeline => joined,
        };
        reporter.stop();
        limiter.close();

        let (listing, failed_keys, commit) = match joined {
            Ok(parts) => parts,
            Err(e) => {
                error!(error = %e, "Backup stopped before in-flight work settled");
                return Err(e);
            }
        };

        // Best-effort: the committer already wrote this cursor unless its save failed
        if let Some(cursor) = &commit.last_committed {
            let snapshot = stats.snapshot();
            save_checkpoint(
                &store,
                Checkpoint::new(cursor.clone(), snapshot.processed(), snapshot.pages_committed),
            )
            .await;
        }
        self.shutdown.mark_stopped();

        let listing = listing?;
        if let Some(reason) = self.shutdown.abort_reason() {
            return Err(DownloadError::Aborted(reason));
        }

        let summary = self.summarize(&stats, failed_keys, &commit, &listing, start, started);
        info!(
            downloaded = summary.downloaded,
            skipped = summary.skipped,
            failed = summary.failed,
            carried_over = summary.carried_over,
            pages_committed = summary.pages_committed,
            retries = summary.retries,
            interrupted = summary.interrupted,
            "Backup finished"
        );
        if summary.failed > 0 {
            warn!(failed = summary.failed, "Some keys could not be downloaded");
        }
        Ok(summary)
    }

    fn retry_observer(&self, stats: Arc<RunStats>) -> RetryObserver {
        let external = self.observer.clone();
        Arc::new(move |event: &RetryEvent| {
            stats.record_retry();
            if let Some(observer) = &external {
                observer(event);
            }
        })
    }

    fn summarize(
        &self,
        stats: &RunStats,
        failed_keys: Vec<FailedKey>,
        commit: &CommitOutcome,
        listing: &ListingOutcome,
        start: Cursor,
        started: Instant,
    ) -> RunSummary {
        let snapshot = stats.snapshot();
        RunSummary {
            downloaded: snapshot.downloaded,
            skipped: snapshot.skipped,
            failed: snapshot.failed,
            carried_over: snapshot.carried_over(),
            bytes_written: snapshot.bytes_written,
            pages_committed: commit.pages_committed,
            retries: snapshot.retries,
            failed_keys,
            final_cursor: commit.last_committed.clone().unwrap_or(start),
            interrupted: matches!(listing, ListingOutcome::Drained { .. })
                || commit.blocked_at.is_some(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}
