//! Crate-wide error type.

use std::{path::PathBuf, sync::Arc};

/// Errors that can be returned from a [`crate::Cache`] implementation.
#[derive(Debug, thiserror::Error, Clone)]
#[non_exhaustive]
pub enum CacheError {
    /// Returned to a waiter that woke up and found no published entry: the
    /// thread or process that was leading the fetch did not succeed, and
    /// this call did not retry at this layer.
    #[error("fetching '{url}' was interrupted")]
    FetchInterrupted {
        /// A display-formatted rendering of the key that was being fetched.
        url: String,
    },

    /// A [`crate::DiskCache`] was requested for a directory that is already
    /// registered in this process under a different key type.
    #[error(
        "cache directory '{}' was already opened with key type `{expected}`, not `{found}`",
        cache_dir.display()
    )]
    CacheUrlTypeMismatch {
        /// The cache directory for which the mismatch was detected.
        cache_dir: PathBuf,
        /// The key type the directory was first opened with.
        expected: &'static str,
        /// The key type requested this time.
        found: &'static str,
    },

    /// [`crate::Cache::fetch`] observed `FetchInterrupted` on every attempt.
    #[error("number of retries exhausted without a successful fetch")]
    RetriesExhausted,

    /// An advisory-lock or cache-directory filesystem operation failed.
    #[error("{0}")]
    Lock(String, #[source] Arc<std::io::Error>),

    /// The caller-supplied fetcher, or a write to the cache, failed. Only
    /// ever surfaced to the leader of a fetch; waiters see
    /// [`CacheError::FetchInterrupted`] instead.
    #[error(transparent)]
    Fetch(#[from] Arc<dyn std::error::Error + Send + Sync + 'static>),

    /// A filesystem operation unrelated to locking (opening, renaming,
    /// creating the cache directory) failed.
    #[error(transparent)]
    Io(#[from] Arc<std::io::Error>),
}

impl CacheError {
    pub(crate) fn lock(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Lock(message.into(), Arc::new(source))
    }

    pub(crate) fn io(source: std::io::Error) -> Self {
        Self::Io(Arc::new(source))
    }

    /// True if this is a [`CacheError::FetchInterrupted`], the only variant
    /// that [`crate::Cache::fetch`]'s retry loop acts on.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, CacheError::FetchInterrupted { .. })
    }
}
