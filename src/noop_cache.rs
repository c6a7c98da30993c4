//! A [`Cache`] backing that caches nothing. See [`NoopCache`].

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use futures::StreamExt;

use crate::{
    cache::{BoxFetcher, BoxReader, Cache, CacheEntry},
    digest::{ContentDigest, ContentHasher, UrlDigest},
    error::CacheError,
    reader::BytesReader,
};

/// A `Cache` that runs the fetcher on every call and never stores or
/// deduplicates anything. Useful as a drop-in when a caller wants a uniform
/// `Arc<dyn Cache<U>>` call site but caching is disabled (for example, in a
/// test harness or a CLI `--no-cache` flag), so call sites never branch on
/// which backing is active.
pub struct NoopCache<U> {
    url_hasher: Arc<dyn Fn(&U) -> UrlDigest + Send + Sync>,
    misses: AtomicU64,
}

impl<U> NoopCache<U> {
    /// Creates a `NoopCache`. `url_hasher` is only used to compute the
    /// digest reported in [`CacheError::FetchInterrupted`]; no cached state
    /// is ever kept.
    pub fn new(url_hasher: impl Fn(&U) -> UrlDigest + Send + Sync + 'static) -> Self {
        Self {
            url_hasher: Arc::new(url_hasher),
            misses: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl<U> Cache<U> for NoopCache<U>
where
    U: Clone + Send + Sync + 'static,
{
    fn hits(&self) -> u64 {
        0
    }

    fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    async fn get_by_url(&self, _url: &U) -> Option<CacheEntry> {
        None
    }

    async fn get_by_digest(&self, _digest: ContentDigest) -> Option<BoxReader> {
        None
    }

    async fn try_fetch(&self, url: U, fetcher: BoxFetcher<U>) -> Result<CacheEntry, CacheError> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        let url_digest = (self.url_hasher)(&url);

        let mut buf = Vec::new();
        let mut hasher = ContentHasher::new();
        let mut chunks = fetcher(&url);
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(CacheError::io)?;
            hasher.update(&chunk);
            buf.extend_from_slice(&chunk);
        }
        let content_digest = hasher.finalize();

        Ok(CacheEntry::new(
            Box::pin(BytesReader::new(Arc::from(buf.into_boxed_slice()))) as BoxReader,
            url_digest,
            content_digest,
        ))
    }
}
