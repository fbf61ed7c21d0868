//! Local value storage
//!
//! Values are written to a temp file inside the destination root and renamed
//! into place, so a destination file either holds a complete value or does
//! not exist. The data is synced before the rename and the directory after
//! it, so a checkpoint written later never outlives the value on disk.
//! Temp files start with `.` and never collide with key files.

use std::io::Write;
use std::path::Path;
use tracing::debug;

pub mod path;

pub use path::{destination_path, encode_key_name};

const TEMP_PREFIX: &str = ".partial-";

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Destination root missing or not writable
    #[error("destination root {path} is not writable: {message}")]
    RootUnwritable {
        /// Root directory
        path: String,
        /// Underlying failure
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Create the destination root and check that files can be created in it
pub fn prepare_root(root: &Path) -> StorageResult<()> {
    let unwritable = |e: std::io::Error| StorageError::RootUnwritable {
        path: root.display().to_string(),
        message: e.to_string(),
    };

    std::fs::create_dir_all(root).map_err(unwritable)?;
    let probe = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(root)
        .map_err(unwritable)?;
    probe.close().map_err(unwritable)?;

    debug!(root = %root.display(), "Destination root ready");
    Ok(())
}

/// Whether a destination file is already present
pub fn exists(destination: &Path) -> bool {
    std::fs::symlink_metadata(destination).is_ok()
}

/// Atomically write `value` to `destination`, returning the bytes written.
///
/// The temp file is removed on every error path.
pub fn write_value(destination: &Path, value: &[u8]) -> StorageResult<u64> {
    let dir = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut temp_file = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(dir)
        .map_err(|e| StorageError::IoError(format!("Failed to create temp file: {e}")))?;
    temp_file
        .write_all(value)
        .map_err(|e| StorageError::IoError(format!("Failed to write value: {e}")))?;
    temp_file
        .flush()
        .map_err(|e| StorageError::IoError(format!("Failed to flush value: {e}")))?;
    temp_file
        .as_file()
        .sync_all()
        .map_err(|e| StorageError::IoError(format!("Failed to sync value: {e}")))?;
    temp_file
        .persist(destination)
        .map_err(|e| StorageError::IoError(format!("Failed to persist value: {e}")))?;
    sync_dir(dir)?;

    Ok(value.len() as u64)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> StorageResult<()> {
    std::fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| StorageError::IoError(format!("Failed to sync {}: {e}", dir.display())))
}

// Directories cannot be opened for syncing here
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> StorageResult<()> {
    Ok(())
}
