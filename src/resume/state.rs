//! Checkpoint persistence
//!
//! Writes are atomic (temp file in the same directory, fsync, rename, parent
//! fsync). Loading never fails the run: a missing, oversized, unparsable or
//! unknown-version file is logged and treated as "start from the beginning".

use super::checkpoint::{Checkpoint, SCHEMA_VERSION};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::Cursor;

/// Maximum accepted checkpoint size (1 MiB)
pub const MAX_STATE_FILE_SIZE: u64 = 1024 * 1024;

/// Loads and saves the run checkpoint
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// Store backed by `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Checkpoint file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cursor to start this run from.
    ///
    /// A checkpoint whose cursor is `end` belongs to a completed run, so the
    /// walk restarts from the beginning.
    pub fn load(&self) -> Cursor {
        match self.load_checkpoint() {
            Ok(Some(checkpoint)) if checkpoint.is_complete() => {
                info!(
                    path = %self.path.display(),
                    "Previous run completed, walking the listing from the start"
                );
                Cursor::Start
            }
            Ok(Some(checkpoint)) => {
                info!(
                    cursor = %checkpoint.cursor(),
                    pages_committed = checkpoint.pages_committed(),
                    "Resuming from checkpoint"
                );
                checkpoint.cursor().clone()
            }
            Ok(None) => {
                debug!(path = %self.path.display(), "No checkpoint found, starting from the beginning");
                Cursor::Start
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Ignoring unreadable checkpoint, starting from the beginning"
                );
                Cursor::Start
            }
        }
    }

    /// Read the checkpoint file without interpreting its cursor.
    ///
    /// Returns `Ok(None)` when no file exists. A bare cursor string left by
    /// older tooling is read as a token checkpoint.
    pub fn load_checkpoint(&self) -> Result<Option<Checkpoint>, ResumeError> {
        let metadata = match std::fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ResumeError::IoError(e.to_string())),
        };
        if metadata.len() > MAX_STATE_FILE_SIZE {
            return Err(ResumeError::StateTooLarge {
                size: metadata.len(),
                max: MAX_STATE_FILE_SIZE,
            });
        }

        let contents =
            std::fs::read_to_string(&self.path).map_err(|e| ResumeError::IoError(e.to_string()))?;
        let trimmed = contents.trim();

        if !trimmed.starts_with('{') {
            return Ok(Some(parse_legacy(trimmed)?));
        }

        let checkpoint: Checkpoint = serde_json::from_str(trimmed)
            .map_err(|e| ResumeError::DeserializationError(e.to_string()))?;
        if checkpoint.schema_version() != SCHEMA_VERSION {
            return Err(ResumeError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION.to_string(),
                found: checkpoint.schema_version().to_string(),
            });
        }
        Ok(Some(checkpoint))
    }

    /// Atomically replace the checkpoint file
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), ResumeError> {
        let json = serde_json::to_string_pretty(checkpoint)
            .map_err(|e| ResumeError::SerializationError(e.to_string()))?;

        let parent_dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent_dir).map_err(|e| ResumeError::IoError(e.to_string()))?;

        let mut temp_file = tempfile::NamedTempFile::new_in(parent_dir)
            .map_err(|e| ResumeError::IoError(format!("Failed to create temp file: {e}")))?;
        temp_file
            .write_all(json.as_bytes())
            .map_err(|e| ResumeError::IoError(format!("Failed to write to temp file: {e}")))?;
        temp_file
            .flush()
            .map_err(|e| ResumeError::IoError(format!("Failed to flush temp file: {e}")))?;
        temp_file
            .as_file()
            .sync_all()
            .map_err(|e| ResumeError::IoError(format!("Failed to sync temp file: {e}")))?;
        temp_file
            .persist(&self.path)
            .map_err(|e| ResumeError::IoError(format!("Failed to persist temp file: {e}")))?;

        if let Ok(dir) = std::fs::File::open(parent_dir) {
            let _ = dir.sync_all();
        }

        debug!(
            path = %self.path.display(),
            cursor = %checkpoint.cursor(),
            pages_committed = checkpoint.pages_committed(),
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Delete the checkpoint file. Returns whether one existed.
    pub fn reset(&self) -> Result<bool, ResumeError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Checkpoint removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ResumeError::IoError(e.to_string())),
        }
    }
}

fn parse_legacy(contents: &str) -> Result<Checkpoint, ResumeError> {
    if contents.is_empty() {
        return Ok(Checkpoint::new(Cursor::Start, 0, 0));
    }
    if contents.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ResumeError::DeserializationError(
            "not a checkpoint document or bare cursor".to_string(),
        ));
    }
    debug!("Read legacy plain-text cursor file");
    Ok(Checkpoint::new(Cursor::Token(contents.to_string()), 0, 0))
}

/// Errors related to checkpoint persistence
#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    /// Schema version mismatch
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch {
        /// Expected schema version
        expected: String,
        /// Found schema version
        found: String,
    },

    /// State file too large
    #[error("checkpoint file too large: {size} bytes (max: {max} bytes)")]
    StateTooLarge {
        /// Actual file size
        size: u64,
        /// Maximum allowed size
        max: u64,
    },

    /// Another process holds the run lock
    #[error("checkpoint is locked by another run: {}", .0.display())]
    Locked(PathBuf),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("deserialization error: {0}")]
    DeserializationError(String),

    /// Lock error
    #[error("lock error: {0}")]
    LockError(String),
}
