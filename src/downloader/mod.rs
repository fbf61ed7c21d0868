//! Backup orchestration and rate limiting
//!
//! This module provides the concurrent fetch pipeline: one lister walking the
//! remote listing, a bounded queue, a fixed pool of download workers, a
//! shared rate limiter and a retry controller wrapped around every call.
//!
//! # Overview
//!
//! 1. **Listing**: [`lister::KeyLister`] turns each listing page into
//!    [`task::DownloadTask`]s bound to a [`task::PageTracker`]
//! 2. **Downloading**: [`worker::WorkerPool`] drains the queue, skipping keys
//!    already present unless overwrite is forced
//! 3. **Admission**: every call passes through [`rate_limit::RateLimiter`]
//! 4. **Retries**: [`retry::RetryController`] applies capped exponential backoff
//! 5. **Checkpointing**: a page's cursor is saved only once all its tasks
//!    resolved, in page order
//!
//! # Quick Start
//!
//! ```no_run
//! use kv_backup::downloader::{BackupConfig, BackupExecutor};
//! use kv_backup::remote::KvNamespace;
//! use kv_backup::shutdown::ShutdownCoordinator;
//! use std::sync::Arc;
//!
//! # async fn example(remote: Arc<dyn KvNamespace>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = BackupConfig::builder("./backup")
//!     .workers(4)
//!     .checkpoint_path("./backup.checkpoint.json")
//!     .build()?;
//!
//! let executor = BackupExecutor::new(Arc::new(config), remote, ShutdownCoordinator::shared());
//! let summary = executor.execute().await?;
//! println!("{} downloaded, {} failed", summary.downloaded, summary.failed);
//! # Ok(())
//! # }
//! ```
//!
//! # Error Handling
//!
//! Per-key failures never fail the run; they are collected in
//! [`RunSummary::failed_keys`]. Structural failures (listing, unwritable
//! destination, locked checkpoint) are returned as [`DownloadError`].

pub mod config;
pub mod executor;
pub mod lister;
pub mod progress;
pub mod rate_limit;
pub mod retry;
pub mod task;
pub mod worker;

pub use config::{BackupConfig, BackupConfigBuilder, RateLimitConfig, RetryPolicy};
pub use executor::{BackupExecutor, RunSummary};
pub use rate_limit::{RateLimitError, RateLimiter};
pub use retry::{RetryController, RetryError, RetryEvent};
pub use task::{DownloadTask, PageTracker, Resolution};
pub use worker::{FailedKey, WorkerPool};

use crate::resume::ResumeError;
use crate::storage::StorageError;

/// Run-level failures
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// The listing endpoint failed permanently or ran out of retries
    #[error("listing failed at cursor {cursor}: {source}")]
    ListingFailed {
        /// Cursor the failing request was sent with
        cursor: String,
        /// Retry outcome
        #[source]
        source: RetryError,
    },

    /// Destination root missing or unwritable
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Checkpoint lock or persistence failure
    #[error(transparent)]
    Resume(#[from] ResumeError),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A structural failure outside listing stopped the run
    #[error("run aborted: {0}")]
    Aborted(String),

    /// A second termination request cut the drain short
    #[error("forced exit before in-flight downloads settled")]
    ForcedExit,

    /// A pipeline task panicked or was cancelled
    #[error("pipeline task failed: {0}")]
    TaskFailed(String),
}

impl DownloadError {
    /// Whether the failure came from an interruption rather than an error
    pub fn is_interruption(&self) -> bool {
        matches!(self, DownloadError::ForcedExit)
    }
}
