//! The inter-process advisory lock protocol.
//!
//! One lock file per URL digest (`downloading_url_<URL_HEX>.lock`) is used
//! to serialize "am I the one who should fetch this?" across processes. The
//! lock is acquired with a blocking OS call, so acquisition is always run on
//! a blocking-friendly executor thread via `simple_spawn_blocking`.

use std::{fs::File, path::PathBuf};

use fs4::fs_std::FileExt;

use crate::error::CacheError;

/// A held exclusive advisory lock on a `downloading_url_<digest>.lock` file.
/// Released automatically when dropped.
pub(crate) struct UrlFileLock {
    file: File,
    path: PathBuf,
}

impl UrlFileLock {
    /// Blocks (on a dedicated blocking thread) until the exclusive lock on
    /// `path` is acquired, creating the lock file if it doesn't exist yet.
    pub(crate) async fn acquire(path: PathBuf) -> Result<Self, CacheError> {
        let lock_path = path.clone();
        simple_spawn_blocking::tokio::run_blocking_task(move || {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&lock_path)
                .map_err(|e| {
                    CacheError::lock(
                        format!("failed to open lock file '{}'", lock_path.display()),
                        e,
                    )
                })?;
            file.lock_exclusive().map_err(|e| {
                CacheError::lock(
                    format!(
                        "failed to acquire exclusive lock on '{}'",
                        lock_path.display()
                    ),
                    e,
                )
            })?;
            Ok(UrlFileLock {
                file,
                path: lock_path,
            })
        })
        .await
    }
}

impl Drop for UrlFileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(
                "failed to release lock file '{}': {e}",
                self.path.display()
            );
        }
    }
}
