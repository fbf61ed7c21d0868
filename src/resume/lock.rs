//! Advisory run lock next to the checkpoint file
//!
//! Two processes sharing one checkpoint would overwrite each other's
//! progress, so a run holds an exclusive fd-lock on `<checkpoint>.lock`
//! for its whole lifetime.

use super::state::ResumeError;
use fd_lock::RwLock;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Exclusive lock held for the duration of a run
pub struct RunLock {
    // Released when the file handle closes
    _lock: RwLock<File>,
    path: PathBuf,
}

impl RunLock {
    /// Lock file path for a checkpoint path
    pub fn lock_path(checkpoint: &Path) -> PathBuf {
        let mut name = checkpoint
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        checkpoint.with_file_name(name)
    }

    /// Try to acquire the lock without blocking
    ///
    /// Returns [`ResumeError::Locked`] immediately if another process holds it.
    pub fn try_acquire(checkpoint: &Path) -> Result<Self, ResumeError> {
        if let Some(parent) = checkpoint.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ResumeError::IoError(e.to_string()))?;
        }

        let path = Self::lock_path(checkpoint);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| ResumeError::LockError(format!("Failed to open lock file: {e}")))?;

        let mut lock = RwLock::new(file);
        match lock.try_write() {
            // Keep the OS lock after the guard goes away; closing the file releases it
            Ok(guard) => std::mem::forget(guard),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(ResumeError::Locked(path));
            }
            Err(e) => {
                return Err(ResumeError::LockError(format!(
                    "Failed to acquire lock: {e}"
                )))
            }
        }

        debug!(path = %path.display(), "Acquired run lock");
        Ok(Self { _lock: lock, path })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLock").field("path", &self.path).finish()
    }
}
