//! # KV Backup Library
//!
//! Mirrors the full contents of a remote key-value namespace (Cloudflare
//! Workers KV) to local durable storage. Designed for namespaces far larger
//! than a single listing or fetch can cover.
//!
//! ## Features
//!
//! - **Paginated Listing**: Walks the namespace page by page with an opaque cursor
//! - **Bounded Worker Pool**: Concurrent value downloads fed through a bounded queue
//! - **Shared Rate Limiting**: One admission gate for every outbound call
//! - **Retry with Backoff**: Transient failures are retried with capped exponential backoff
//! - **Resume Capability**: Per-page checkpoints that never point past unfinished work
//! - **Graceful Shutdown**: Ctrl+C drains in-flight downloads before exiting
//!
//! ## Quick Start
//!
//! ```no_run
//! use kv_backup::downloader::{BackupConfig, BackupExecutor};
//! use kv_backup::remote::cloudflare::{CloudflareCredentials, CloudflareKvClient};
//! use kv_backup::shutdown::ShutdownCoordinator;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let credentials = CloudflareCredentials::new("token", "account", "namespace");
//! let remote = Arc::new(CloudflareKvClient::new(credentials)?);
//!
//! let config = BackupConfig::builder("./data").workers(8).build()?;
//! let executor = BackupExecutor::new(Arc::new(config), remote, ShutdownCoordinator::shared());
//! let summary = executor.execute().await?;
//! println!("downloaded {} keys", summary.downloaded);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`remote`] - Remote namespace interface and the Cloudflare client
//! - [`downloader`] - Lister, worker pool, rate limiter and retry controller
//! - [`resume`] - Checkpoint persistence and the run lock
//! - [`storage`] - Deterministic destination paths and atomic value writes
//! - [`shutdown`] - Running / Draining / Stopped coordination
//! - [`metrics`] - Counters and histograms for outbound calls and outcomes

#![warn(missing_docs)]
#![warn(clippy::all)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// CLI command implementation
pub mod cli;

/// Backup orchestration
pub mod downloader;

/// Observability metrics
pub mod metrics;

/// Remote namespace access
pub mod remote;

/// Resume capability
pub mod resume;

/// Graceful shutdown coordination shared across modules
pub mod shutdown;

/// Local value storage
pub mod storage;

pub use downloader::{BackupConfig, BackupExecutor, RunSummary};
pub use shutdown::ShutdownCoordinator;

/// Identifies one item in the remote namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyDescriptor {
    /// Key name as stored remotely
    pub name: String,
    /// Size of the value in bytes, when the listing reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_hint: Option<u64>,
}

impl KeyDescriptor {
    /// Create a descriptor without a size hint
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size_hint: None,
        }
    }

    /// Attach a size hint
    pub fn with_size_hint(mut self, size: u64) -> Self {
        self.size_hint = Some(size);
        self
    }
}

/// Opaque pagination position in the remote listing.
///
/// Cursors are never compared or combined; a checkpoint stores exactly one.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Cursor {
    /// Beginning of the listing
    #[default]
    Start,
    /// Token returned by the listing endpoint
    Token(String),
    /// Listing exhausted
    End,
}

impl Cursor {
    /// Build a cursor from a token reported by the remote. Empty tokens mean "end".
    pub fn from_remote(token: Option<String>) -> Self {
        match token {
            Some(t) if !t.is_empty() => Cursor::Token(t),
            _ => Cursor::End,
        }
    }

    /// Token to send with a listing request, if any
    pub fn token(&self) -> Option<&str> {
        match self {
            Cursor::Token(t) => Some(t),
            Cursor::Start | Cursor::End => None,
        }
    }

    /// Whether the listing has been exhausted
    pub fn is_end(&self) -> bool {
        matches!(self, Cursor::End)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::Start => write!(f, "<start>"),
            Cursor::Token(t) => write!(f, "{t}"),
            Cursor::End => write!(f, "<end>"),
        }
    }
}
