//! Key listing producer and in-order checkpoint committer
//!
//! [`KeyLister`] walks the listing endpoint page by page. For each page it
//! registers a [`PageTracker`] with the [`PageCommitter`] and then enqueues
//! one [`DownloadTask`] per key into the bounded queue, suspending while the
//! queue is full.
//!
//! [`PageCommitter`] receives trackers in listing order and waits for each to
//! resolve. A page whose tasks all reached a terminal outcome advances the
//! checkpoint to the cursor that follows it; the first page with carried-over
//! tasks freezes the checkpoint for the rest of the run.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::config::BackupConfig;
use super::progress::RunStats;
use super::retry::{RetryController, RetryError};
use super::task::{DownloadTask, PageTracker};
use super::DownloadError;
use crate::metrics::record_checkpoint_save;
use crate::remote::KvNamespace;
use crate::resume::{Checkpoint, CheckpointStore};
use crate::shutdown::SharedShutdown;
use crate::storage::destination_path;
use crate::Cursor;

/// How the listing walk ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingOutcome {
    /// The endpoint reported no further cursor
    Completed {
        /// Pages listed
        pages: u64,
    },
    /// Shutdown stopped the walk before the end
    Drained {
        /// Cursor of the first page not (fully) enqueued
        cursor: Cursor,
    },
}

/// Producer side of the pipeline
pub struct KeyLister {
    remote: Arc<dyn KvNamespace>,
    retry: RetryController,
    config: Arc<BackupConfig>,
    shutdown: SharedShutdown,
    stats: Arc<RunStats>,
}

impl KeyLister {
    /// Create a lister
    pub fn new(
        remote: Arc<dyn KvNamespace>,
        retry: RetryController,
        config: Arc<BackupConfig>,
        shutdown: SharedShutdown,
        stats: Arc<RunStats>,
    ) -> Self {
        Self {
            remote,
            retry,
            config,
            shutdown,
            stats,
        }
    }

    /// Walk the listing from `start` until it ends or shutdown begins.
    ///
    /// A listing call that fails permanently or exhausts its retries aborts
    /// the run through the shutdown coordinator.
    pub async fn run(
        self,
        start: Cursor,
        queue: mpsc::Sender<DownloadTask>,
        pages: mpsc::UnboundedSender<Arc<PageTracker>>,
    ) -> Result<ListingOutcome, DownloadError> {
        let mut cursor = start;
        let mut index = 0u64;

        loop {
            if self.shutdown.is_shutdown_requested() {
                return Ok(self.drained(cursor));
            }

            let remote = &self.remote;
            let current = &cursor;
            let target = cursor.to_string();
            let mut attempt = 0;
            let listed = tokio::select! {
                biased;
                _ = self.shutdown.wait_for_shutdown() => return Ok(self.drained(cursor)),
                r = self.retry.execute("list", &target, &mut attempt, move || remote.list_keys(current)) => r,
            };

            let page = match listed {
                Ok(page) => page,
                Err(RetryError::Cancelled) => return Err(DownloadError::ForcedExit),
                Err(source) => {
                    let err = DownloadError::ListingFailed {
                        cursor: target,
                        source,
                    };
                    self.shutdown.abort(err.to_string());
                    return Err(err);
                }
            };

            let key_count = page.keys.len();
            self.stats.record_page_listed(key_count);
            info!(
                page = index,
                keys = key_count,
                next = %page.next,
                "Listed page"
            );

            let tracker = PageTracker::new(index, key_count, page.next.clone());
            // Every task exists before the first enqueue so that an early exit
            // carries the remainder over instead of leaving the page unresolved
            let tasks: Vec<DownloadTask> = page
                .keys
                .into_iter()
                .map(|key| {
                    let destination = destination_path(&self.config.destination, &key.name);
                    DownloadTask::new(key, destination, tracker.clone())
                })
                .collect();

            if pages.send(tracker).is_err() {
                warn!(page = index, "Checkpoint committer stopped, page will not be committed");
            }

            for task in tasks {
                tokio::select! {
                    biased;
                    _ = self.shutdown.wait_for_shutdown() => {
                        debug!(page = index, "Shutdown while enqueueing, carrying over the rest of the page");
                        return Ok(self.drained(cursor));
                    }
                    sent = queue.send(task) => {
                        if sent.is_err() {
                            return Err(DownloadError::TaskFailed(
                                "download workers stopped while listing".to_string(),
                            ));
                        }
                    }
                }
            }

            if page.next.is_end() {
                info!(pages = index + 1, "Listing complete");
                return Ok(ListingOutcome::Completed { pages: index + 1 });
            }
            cursor = page.next;
            index += 1;
        }
    }

    fn drained(&self, cursor: Cursor) -> ListingOutcome {
        info!(cursor = %cursor, "Listing stopped by shutdown");
        ListingOutcome::Drained { cursor }
    }
}

/// Result of the committer task
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Cursor of the last committed page
    pub last_committed: Option<Cursor>,
    /// Pages committed
    pub pages_committed: u64,
    /// Page that stopped checkpoint advancement, if any
    pub blocked_at: Option<u64>,
}

/// Sequential checkpoint writer
pub struct PageCommitter {
    store: CheckpointStore,
    stats: Arc<RunStats>,
}

impl PageCommitter {
    /// Create a committer writing to `store`
    pub fn new(store: CheckpointStore, stats: Arc<RunStats>) -> Self {
        Self { store, stats }
    }

    /// Commit pages in order until the lister hangs up
    pub async fn run(self, mut pages: mpsc::UnboundedReceiver<Arc<PageTracker>>) -> CommitOutcome {
        let mut outcome = CommitOutcome::default();

        while let Some(page) = pages.recv().await {
            if outcome.blocked_at.is_some() {
                continue;
            }

            let counts = page.wait_resolved().await;
            if counts.carried_over > 0 {
                info!(
                    page = page.index(),
                    carried_over = counts.carried_over,
                    "Page has unfinished keys, checkpoint stays at the previous page"
                );
                outcome.blocked_at = Some(page.index());
                continue;
            }

            self.stats.record_page_committed();
            outcome.pages_committed += 1;
            outcome.last_committed = Some(page.next_cursor().clone());

            let snapshot = self.stats.snapshot();
            let checkpoint = Checkpoint::new(
                page.next_cursor().clone(),
                snapshot.processed(),
                snapshot.pages_committed,
            );
            save_checkpoint(&self.store, checkpoint).await;
            debug!(
                page = page.index(),
                downloaded = counts.downloaded,
                skipped = counts.skipped,
                failed = counts.failed,
                "Page committed"
            );
        }

        outcome
    }
}

/// Best-effort checkpoint write on the blocking pool; failures are logged.
pub async fn save_checkpoint(store: &CheckpointStore, checkpoint: Checkpoint) -> bool {
    let store = store.clone();
    let cursor = checkpoint.cursor().clone();
    let result = tokio::task::spawn_blocking(move || store.save(&checkpoint)).await;
    let saved = match result {
        Ok(Ok(())) => {
            info!(cursor = %cursor, "Checkpoint saved");
            true
        }
        Ok(Err(e)) => {
            warn!(cursor = %cursor, error = %e, "Failed to save checkpoint, continuing");
            false
        }
        Err(e) => {
            warn!(cursor = %cursor, error = %e, "Checkpoint save task failed, continuing");
            false
        }
    };
    record_checkpoint_save(saved);
    saved
}
