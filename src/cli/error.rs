//! CLI error types and conversions

use crate::downloader::DownloadError;
use crate::remote::KvError;
use crate::resume::ResumeError;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Backup run failed
    #[error("backup error: {0}")]
    DownloadError(#[from] DownloadError),

    /// Remote client setup failed
    #[error("remote error: {0}")]
    RemoteError(#[from] KvError),

    /// Resume error
    #[error("resume error: {0}")]
    ResumeError(#[from] ResumeError),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigurationError(String),
}

impl CliError {
    /// Whether the run was cut short by a termination request
    pub fn is_interruption(&self) -> bool {
        matches!(self, CliError::DownloadError(e) if e.is_interruption())
    }
}
