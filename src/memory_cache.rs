//! An in-memory backing for the fetch cache. See [`MemoryCache`].
//!
//! Same coordination shape as [`crate::DiskCache`] minus the inter-process
//! half: one short-held mutex guards both the ongoing-downloads map and the
//! two lookup tables (by URL digest, by content digest), and entries are
//! plain `Arc<[u8]>` buffers rather than files.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{
    cache::{BoxFetcher, BoxReader, Cache, CacheEntry},
    digest::{ContentDigest, ContentHasher, UrlDigest},
    error::CacheError,
    reader::BytesReader,
};

#[derive(Clone)]
struct StoredEntry {
    bytes: Arc<[u8]>,
    url_digest: UrlDigest,
    content_digest: ContentDigest,
}

impl StoredEntry {
    fn open(&self) -> CacheEntry {
        CacheEntry::new(
            Box::pin(BytesReader::new(self.bytes.clone())) as BoxReader,
            self.url_digest,
            self.content_digest,
        )
    }
}

enum Slot {
    InFlight(Arc<Notify>),
    Done(StoredEntry),
}

struct State {
    by_url: HashMap<UrlDigest, Slot>,
    by_content: HashMap<ContentDigest, StoredEntry>,
}

/// A cache that keeps fetched payloads as plain buffers for the lifetime of
/// the process. Useful for tests and for callers that want deduplication
/// without touching disk; see [`crate::NoopCache`] for no caching at all.
///
/// Unlike [`crate::DiskCache`], a `MemoryCache` is private to the `Arc` that
/// holds it — there is no cross-process coordination, and no process-wide
/// registry is needed since cloning the handle is the only way to share
/// state.
pub struct MemoryCache<U> {
    url_hasher: Arc<dyn Fn(&U) -> UrlDigest + Send + Sync>,
    state: Mutex<State>,
    hits: std::sync::atomic::AtomicU64,
    misses: std::sync::atomic::AtomicU64,
}

impl<U> MemoryCache<U> {
    /// Creates an empty, process-local cache keyed by `url_hasher`.
    pub fn new(url_hasher: impl Fn(&U) -> UrlDigest + Send + Sync + 'static) -> Self {
        Self {
            url_hasher: Arc::new(url_hasher),
            state: Mutex::new(State {
                by_url: HashMap::new(),
                by_content: HashMap::new(),
            }),
            hits: std::sync::atomic::AtomicU64::new(0),
            misses: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl<U> Cache<U> for MemoryCache<U>
where
    U: Clone + Send + Sync + 'static,
{
    fn hits(&self) -> u64 {
        self.hits.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn misses(&self) -> u64 {
        self.misses.load(std::sync::atomic::Ordering::Relaxed)
    }

    async fn get_by_url(&self, url: &U) -> Option<CacheEntry> {
        let digest = (self.url_hasher)(url);
        match self.state.lock().by_url.get(&digest) {
            Some(Slot::Done(entry)) => Some(entry.open()),
            _ => None,
        }
    }

    async fn get_by_digest(&self, digest: ContentDigest) -> Option<BoxReader> {
        self.state
            .lock()
            .by_content
            .get(&digest)
            .map(|entry| entry.open().into_reader())
    }

    async fn try_fetch(&self, url: U, fetcher: BoxFetcher<U>) -> Result<CacheEntry, CacheError> {
        let digest = (self.url_hasher)(&url);

        let leader_notify = {
            let mut state = self.state.lock();
            match state.by_url.get(&digest) {
                Some(Slot::Done(entry)) => {
                    self.hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    return Ok(entry.open());
                }
                Some(Slot::InFlight(notify)) => {
                    let notify = notify.clone();
                    drop(state);
                    notify.notified().await;
                    return match self.state.lock().by_url.get(&digest) {
                        Some(Slot::Done(entry)) => {
                            self.hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            Ok(entry.open())
                        }
                        _ => Err(CacheError::FetchInterrupted {
                            url: digest.to_string(),
                        }),
                    };
                }
                None => {
                    let notify = Arc::new(Notify::new());
                    state.by_url.insert(digest, Slot::InFlight(notify.clone()));
                    notify
                }
            }
        };

        self.misses.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let result = self.drive_fetch(digest, &url, fetcher).await;

        if result.is_err() {
            // Remove the in-flight marker before waking waiters, so a
            // waiter who finds no entry and retries can become leader.
            self.state.lock().by_url.remove(&digest);
        }
        leader_notify.notify_waiters();

        result
    }
}

impl<U: Send + Sync> MemoryCache<U> {
    async fn drive_fetch(
        &self,
        digest: UrlDigest,
        url: &U,
        fetcher: BoxFetcher<U>,
    ) -> Result<CacheEntry, CacheError> {
        let mut buf = Vec::new();
        let mut hasher = ContentHasher::new();
        let mut chunks = fetcher(url);
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(CacheError::io)?;
            hasher.update(&chunk);
            buf.extend_from_slice(&chunk);
        }
        let content_digest = hasher.finalize();
        let stored = StoredEntry {
            bytes: Arc::from(buf.into_boxed_slice()),
            url_digest: digest,
            content_digest,
        };

        let mut state = self.state.lock();
        state.by_url.insert(digest, Slot::Done(stored.clone()));
        state.by_content.insert(content_digest, stored.clone());

        Ok(stored.open())
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU64, Ordering};

    use bytes::Bytes;
    use futures::stream;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::digest::url_digest_of_str;

    fn constant_fetcher(payload: &'static [u8]) -> BoxFetcher<String> {
        Arc::new(move |_url: &String| {
            Box::pin(stream::iter(vec![Ok::<_, std::io::Error>(
                Bytes::from_static(payload),
            )])) as crate::cache::ChunkStream
        })
    }

    #[tokio::test]
    async fn fetch_then_hit() {
        let cache = MemoryCache::new(url_digest_of_str);
        let fetcher = constant_fetcher(b"hello");
        let entry = cache
            .fetch("u1".to_string(), fetcher.clone(), 3)
            .await
            .unwrap();
        assert_eq!(cache.misses(), 1);

        let mut hasher = ContentHasher::new();
        hasher.update(b"hello");
        assert_eq!(entry.content_digest(), hasher.finalize());

        let entry2 = cache.fetch("u1".to_string(), fetcher, 3).await.unwrap();
        assert_eq!(cache.hits(), 1);
        assert_eq!(entry2.content_digest(), entry.content_digest());
    }

    #[tokio::test]
    async fn concurrent_fetches_of_one_url_run_the_fetcher_once() {
        let cache = Arc::new(MemoryCache::new(url_digest_of_str));
        let fetch_count = Arc::new(AtomicU64::new(0));

        let fetcher: BoxFetcher<String> = {
            let fetch_count = fetch_count.clone();
            Arc::new(move |_url: &String| {
                fetch_count.fetch_add(1, Ordering::SeqCst);
                Box::pin(stream::once(async {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    Ok::<_, std::io::Error>(Bytes::from_static(b"x"))
                })) as crate::cache::ChunkStream
            })
        };

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let fetcher = fetcher.clone();
            handles.push(tokio::spawn(async move {
                cache.fetch("u".to_string(), fetcher, 3).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(fetch_count.load(Ordering::SeqCst), 1);
        assert_eq!(cache.hits(), 7);
    }

    #[tokio::test]
    async fn lookup_by_content_digest_finds_deduplicated_blobs() {
        let cache = MemoryCache::new(url_digest_of_str);
        let fetcher = constant_fetcher(b"same");
        let a = cache.fetch("a".to_string(), fetcher.clone(), 3).await.unwrap();
        let _b = cache.fetch("b".to_string(), fetcher, 3).await.unwrap();

        let mut reader = cache.get_by_digest(a.content_digest()).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"same");
    }

    #[tokio::test]
    async fn a_failed_fetch_is_not_cached_and_can_be_retried() {
        let cache = MemoryCache::new(url_digest_of_str);
        let failing: BoxFetcher<String> = Arc::new(|_: &String| {
            Box::pin(stream::once(async {
                Err::<Bytes, _>(std::io::Error::other("nope"))
            })) as crate::cache::ChunkStream
        });
        assert!(cache.try_fetch("u".to_string(), failing).await.is_err());
        assert!(cache.get_by_url(&"u".to_string()).await.is_none());

        let good = constant_fetcher(b"ok");
        assert!(cache.fetch("u".to_string(), good, 3).await.is_ok());
    }
}
