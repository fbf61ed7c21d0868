//! Download tasks and per-page resolution tracking
//!
//! Every listed key becomes one [`DownloadTask`] bound to the [`PageTracker`]
//! of the page it came from. A task reports exactly one [`Resolution`] to its
//! page: explicitly through [`DownloadTask::resolve`], or as
//! [`Resolution::CarriedOver`] when it is dropped unresolved (left in the
//! queue at shutdown, never enqueued, ...). A page is safe to checkpoint only
//! when all of its tasks resolved and none were carried over.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::{Cursor, KeyDescriptor};

/// Terminal outcome of one task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Value fetched and written
    Downloaded {
        /// Bytes written
        bytes: u64,
    },
    /// Destination already present and overwrite not forced
    Skipped,
    /// Permanent failure or retries exhausted
    Failed,
    /// Left unfinished for a later run
    CarriedOver,
}

/// Resolution counts for one page
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageCounts {
    /// Tasks downloaded
    pub downloaded: usize,
    /// Tasks skipped
    pub skipped: usize,
    /// Tasks failed
    pub failed: usize,
    /// Tasks carried over
    pub carried_over: usize,
}

impl PageCounts {
    /// Tasks that reached any resolution
    pub fn resolved(&self) -> usize {
        self.downloaded + self.skipped + self.failed + self.carried_over
    }

    /// Tasks that reached a terminal outcome within this run
    pub fn terminal(&self) -> usize {
        self.downloaded + self.skipped + self.failed
    }

    fn record(&mut self, resolution: Resolution) {
        match resolution {
            Resolution::Downloaded { .. } => self.downloaded += 1,
            Resolution::Skipped => self.skipped += 1,
            Resolution::Failed => self.failed += 1,
            Resolution::CarriedOver => self.carried_over += 1,
        }
    }
}

/// Tracks the tasks of one listing page
#[derive(Debug)]
pub struct PageTracker {
    index: u64,
    next_cursor: Cursor,
    expected: usize,
    counts: Mutex<PageCounts>,
    done: Notify,
}

impl PageTracker {
    /// Create a tracker for page `index` holding `expected` tasks
    pub fn new(index: u64, expected: usize, next_cursor: Cursor) -> Arc<Self> {
        Arc::new(Self {
            index,
            next_cursor,
            expected,
            counts: Mutex::new(PageCounts::default()),
            done: Notify::new(),
        })
    }

    /// Zero-based page number within this run
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Cursor the listing returned after this page
    pub fn next_cursor(&self) -> &Cursor {
        &self.next_cursor
    }

    /// Current counts
    pub fn counts(&self) -> PageCounts {
        *self.counts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, resolution: Resolution) {
        let finished = {
            let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
            counts.record(resolution);
            counts.resolved() >= self.expected
        };
        if finished {
            self.done.notify_one();
        }
    }

    /// Wait until every task of the page has resolved
    pub async fn wait_resolved(&self) -> PageCounts {
        loop {
            let notified = self.done.notified();
            let counts = self.counts();
            if counts.resolved() >= self.expected {
                return counts;
            }
            notified.await;
        }
    }
}

/// One key to download
#[derive(Debug)]
pub struct DownloadTask {
    /// Key being mirrored
    pub key: KeyDescriptor,
    /// Local file receiving the value
    pub destination: PathBuf,
    /// Attempts made so far; bounded by the retry policy
    pub attempt: u32,
    page: Option<Arc<PageTracker>>,
}

impl DownloadTask {
    /// Create a task belonging to `page`
    pub fn new(key: KeyDescriptor, destination: PathBuf, page: Arc<PageTracker>) -> Self {
        Self {
            key,
            destination,
            attempt: 0,
            page: Some(page),
        }
    }

    /// Report the terminal outcome to the page tracker
    pub fn resolve(mut self, resolution: Resolution) {
        if let Some(page) = self.page.take() {
            page.record(resolution);
        }
    }
}

impl Drop for DownloadTask {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            page.record(Resolution::CarriedOver);
        }
    }
}
