//! The [`Cache`] capability: the contract implemented by [`crate::DiskCache`],
//! [`crate::MemoryCache`], and [`crate::NoopCache`].

use std::{fmt::Debug, pin::Pin, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::io::{AsyncRead, AsyncSeek};

use crate::{
    digest::{ContentDigest, UrlDigest},
    error::CacheError,
};

/// A finite, possibly-failing sequence of byte chunks, the Rust rendering of
/// "a lazy sequence of byte chunks from a URL". Chunk size is entirely up to
/// the fetcher; the cache imposes no upper bound.
pub type ChunkStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// A caller-provided function that produces a [`ChunkStream`] for a key.
///
/// Fetchers are invoked at most once per successful unique key resolution in
/// the presence of concurrent callers, but the *same* fetcher value may be
/// reused across separate top-level calls to [`Cache::fetch`] (its bounded
/// retry loop calls the fetcher again on every attempt that becomes leader),
/// so fetchers must be side-effect-free to call more than once.
pub type BoxFetcher<U> = Arc<dyn Fn(&U) -> ChunkStream + Send + Sync>;

/// A boxed, owned, independently seekable reader over a stored payload.
pub type BoxReader = Pin<Box<dyn AsyncRead + AsyncSeek + Send>>;

/// An entry returned by a successful cache lookup or fetch: an open reader
/// over the stored payload, plus the digests that identify it. Closing the
/// reader does not affect the store.
pub struct CacheEntry {
    reader: BoxReader,
    url_digest: UrlDigest,
    content_digest: ContentDigest,
}

impl CacheEntry {
    /// Constructs a new entry from its parts.
    pub fn new(reader: BoxReader, url_digest: UrlDigest, content_digest: ContentDigest) -> Self {
        Self {
            reader,
            url_digest,
            content_digest,
        }
    }

    /// The digest of the key this entry was stored under.
    pub fn url_digest(&self) -> UrlDigest {
        self.url_digest
    }

    /// The digest of the payload bytes.
    pub fn content_digest(&self) -> ContentDigest {
        self.content_digest
    }

    /// Consumes the entry, returning its reader.
    pub fn into_reader(self) -> BoxReader {
        self.reader
    }

    /// Borrows the entry's reader.
    pub fn reader(&mut self) -> &mut BoxReader {
        &mut self.reader
    }
}

impl Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("url_digest", &self.url_digest)
            .field("content_digest", &self.content_digest)
            .finish_non_exhaustive()
    }
}

/// The default number of times [`Cache::fetch`] retries a `FetchInterrupted`
/// outcome before giving up.
pub const DEFAULT_RETRIES: u32 = 3;

/// A cache that memoizes the result of fetching bytes identified by a key of
/// type `U`, deduplicating concurrent fetches of the same key.
///
/// All three backings ([`crate::DiskCache`], [`crate::MemoryCache`],
/// [`crate::NoopCache`]) implement this one capability so that callers can
/// depend on `Arc<dyn Cache<U>>` and swap backings without changing call
/// sites.
#[async_trait]
pub trait Cache<U>: Send + Sync
where
    U: Clone + Send + Sync + 'static,
{
    /// The number of calls that found an existing entry without invoking the
    /// fetcher. Monotonically non-decreasing; readable at any time without
    /// synchronization with in-flight fetches.
    fn hits(&self) -> u64;

    /// The number of calls that invoked the fetcher (successfully or not).
    /// Monotonically non-decreasing.
    fn misses(&self) -> u64;

    /// Cheap lookup by key. Returns an open reader if an entry exists, else
    /// `None`. Never triggers a fetch and never updates `hits`/`misses`.
    async fn get_by_url(&self, url: &U) -> Option<CacheEntry>;

    /// Cheap lookup by content digest. Returns an open reader if an entry
    /// exists, else `None`. Never triggers a fetch and never updates
    /// `hits`/`misses`.
    async fn get_by_digest(&self, digest: ContentDigest) -> Option<BoxReader>;

    /// The coordinated fetch-or-join operation. See the crate documentation
    /// for the full coordination protocol.
    async fn try_fetch(&self, url: U, fetcher: BoxFetcher<U>) -> Result<CacheEntry, CacheError>;

    /// Retries [`Cache::try_fetch`] up to `retries` times as long as it keeps
    /// returning [`CacheError::FetchInterrupted`]. Any other error, or a
    /// success, returns immediately. After `retries` consecutive
    /// interruptions, fails with [`CacheError::RetriesExhausted`].
    async fn fetch(
        &self,
        url: U,
        fetcher: BoxFetcher<U>,
        retries: u32,
    ) -> Result<CacheEntry, CacheError> {
        for _ in 0..retries {
            match self.try_fetch(url.clone(), fetcher.clone()).await {
                Ok(entry) => return Ok(entry),
                Err(e) if e.is_interrupted() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CacheError::RetriesExhausted)
    }
}
