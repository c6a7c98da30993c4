//! On-disk backing for the fetch cache. See [`DiskCache`].
//!
//! This is where the real engineering of the crate lives: deduplicating
//! fetches both within a process (a [`DashMap`] of [`tokio::sync::Notify`]
//! wait-handles, one entry per URL digest currently being fetched) and
//! across processes (an advisory file lock per URL digest, built on `fs4`),
//! with atomic content-addressed publication via a same-directory tempfile
//! rename.

mod entry_path;
mod lock;

use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use entry_path::EntryPath;
use fs_err::tokio as tokio_fs;
use futures::StreamExt;
use tokio::{fs::File, io::AsyncWriteExt, sync::Notify};

use crate::{
    cache::{BoxFetcher, BoxReader, Cache, CacheEntry},
    digest::{ContentDigest, ContentHasher, UrlDigest},
    error::CacheError,
    registry,
};

/// A cache that durably stores fetched payloads under a single directory,
/// shared across any number of processes that agree on it.
///
/// `DiskCache<U>` instances constructed for the same directory within one
/// process are deduplicated through a process-wide registry (see
/// [`crate::registry`]) so they share one ongoing-downloads map; without
/// that, two handles to the same directory would each believe themselves
/// leader for the same URL digest.
pub struct DiskCache<U> {
    inner: Arc<Inner<U>>,
}

impl<U> Clone for DiskCache<U> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<U> {
    dir: PathBuf,
    url_hasher: Arc<dyn Fn(&U) -> UrlDigest + Send + Sync>,
    ongoing_downloads: DashMap<UrlDigest, Arc<Notify>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<U: 'static> DiskCache<U> {
    /// Returns the `DiskCache` for `cache_dir`, constructing and
    /// registering a new one if this process hasn't opened that directory
    /// yet for this key type `U`.
    ///
    /// Fails with [`CacheError::CacheUrlTypeMismatch`] if `cache_dir` is
    /// already registered in this process under a different key type.
    pub fn try_create(
        cache_dir: impl Into<PathBuf>,
        url_hasher: impl Fn(&U) -> UrlDigest + Send + Sync + 'static,
    ) -> Result<Self, CacheError>
    where
        U: Send + Sync,
    {
        let dir = cache_dir.into();
        registry::get_or_insert_with::<U, Self, _>(&dir, || {
            Self::new_uncached(dir.clone(), url_hasher)
        })
    }

    fn new_uncached(
        dir: PathBuf,
        url_hasher: impl Fn(&U) -> UrlDigest + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                dir,
                url_hasher: Arc::new(url_hasher),
                ongoing_downloads: DashMap::new(),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    /// The cache directory this instance manages.
    pub fn path(&self) -> &Path {
        &self.inner.dir
    }

    fn lock_path(&self, digest: UrlDigest) -> PathBuf {
        self.inner
            .dir
            .join(format!("downloading_url_{digest}.lock"))
    }

    /// Scans the cache directory for entries matching `predicate`, keeping
    /// the most recently modified match, on a blocking-friendly thread
    /// since directory iteration is a synchronous filesystem call. Files
    /// whose name doesn't parse as an entry are ignored, never removed.
    async fn scan_async(
        &self,
        predicate: impl Fn(&EntryPath) -> bool + Send + 'static,
    ) -> io::Result<Option<EntryPath>> {
        let dir = self.inner.dir.clone();
        simple_spawn_blocking::tokio::run_blocking_task(move || {
            let cache = DiskCacheDirScan { dir: &dir };
            cache.scan(predicate)
        })
        .await
    }

    async fn open_entry(entry: &EntryPath) -> Result<CacheEntry, CacheError> {
        let file = File::open(&entry.path).await.map_err(CacheError::io)?;
        Ok(CacheEntry::new(
            Box::pin(file) as BoxReader,
            entry.url_digest,
            entry.content_digest,
        ))
    }
}

/// A standalone scan helper so [`DiskCache::scan_async`] can move a borrowed
/// path into a blocking closure without cloning `Inner`.
struct DiskCacheDirScan<'a> {
    dir: &'a Path,
}

impl DiskCacheDirScan<'_> {
    fn scan(&self, predicate: impl Fn(&EntryPath) -> bool) -> io::Result<Option<EntryPath>> {
        let mut best: Option<(EntryPath, std::time::SystemTime)> = None;
        let read_dir = match std::fs::read_dir(self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        for entry in read_dir {
            let entry = entry?;
            let Some(candidate) = EntryPath::try_from_path(&entry.path()) else {
                continue;
            };
            if !predicate(&candidate) {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::UNIX_EPOCH);
            match &best {
                Some((_, best_modified)) if *best_modified >= modified => {}
                _ => best = Some((candidate, modified)),
            }
        }
        Ok(best.map(|(entry, _)| entry))
    }
}

#[async_trait]
impl<U> Cache<U> for DiskCache<U>
where
    U: Clone + Send + Sync + 'static,
{
    fn hits(&self) -> u64 {
        self.inner.hits.load(Ordering::Relaxed)
    }

    fn misses(&self) -> u64 {
        self.inner.misses.load(Ordering::Relaxed)
    }

    async fn get_by_url(&self, url: &U) -> Option<CacheEntry> {
        let digest = (self.inner.url_hasher)(url);
        let entry = self.scan_async(move |e| e.url_digest == digest).await.ok().flatten()?;
        Self::open_entry(&entry).await.ok()
    }

    async fn get_by_digest(&self, digest: ContentDigest) -> Option<BoxReader> {
        let entry = self
            .scan_async(move |e| e.content_digest == digest)
            .await
            .ok()
            .flatten()?;
        Self::open_entry(&entry)
            .await
            .ok()
            .map(CacheEntry::into_reader)
    }

    #[tracing::instrument(skip_all, fields(dir = %self.inner.dir.display()))]
    async fn try_fetch(&self, url: U, fetcher: BoxFetcher<U>) -> Result<CacheEntry, CacheError> {
        let digest = (self.inner.url_hasher)(&url);

        // Step 1: intra-process dedup. The shard lock `entry()` holds is
        // never held across an `.await`.
        let notify = match self.inner.ongoing_downloads.entry(digest) {
            Entry::Occupied(entry) => Some(entry.get().clone()),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Notify::new()));
                None
            }
        };

        if let Some(notify) = notify {
            tracing::debug!(%digest, "waiting for an in-flight fetch of this URL");
            notify.notified().await;
            return match self.get_by_url(&url).await {
                Some(entry) => {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    Ok(entry)
                }
                None => Err(CacheError::FetchInterrupted {
                    url: digest.to_string(),
                }),
            };
        }

        // We won the race to become the intra-process leader. Everything
        // below runs with the guarantee that no other task in this process
        // is concurrently fetching `digest`.
        let result = self.lead_fetch(digest, &url, fetcher).await;

        // Whether we succeeded or failed, remove ourselves from the
        // ongoing-downloads map before waking waiters, so that a waiter who
        // wakes up, finds no entry, and retries becomes the new leader
        // rather than racing the old bookkeeping.
        let notify = self.inner.ongoing_downloads.remove(&digest).map(|(_, n)| n);
        if let Some(notify) = notify {
            notify.notify_waiters();
        }

        result
    }
}

impl<U: Send + Sync + 'static> DiskCache<U> {
    /// Runs the leader's half of [`Cache::try_fetch`]: acquire the
    /// inter-process lock, re-check for a concurrently published entry,
    /// stream the fetch into a tempfile, and atomically publish it.
    async fn lead_fetch(
        &self,
        digest: UrlDigest,
        url: &U,
        fetcher: BoxFetcher<U>,
    ) -> Result<CacheEntry, CacheError> {
        if let Err(e) = tokio_fs::create_dir_all(&self.inner.dir).await {
            return Err(CacheError::io(e));
        }

        let lock = match lock::UrlFileLock::acquire(self.lock_path(digest)).await {
            Ok(lock) => lock,
            Err(e) => return Err(e),
        };

        // Step 2a: someone else (another process) may have published this
        // entry while we were waiting for the lock.
        if let Ok(Some(entry)) = self.scan_async(move |e| e.url_digest == digest).await {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            drop(lock);
            tracing::debug!(%digest, "another process already published this entry");
            return Self::open_entry(&entry).await;
        }

        self.inner.misses.fetch_add(1, Ordering::Relaxed);

        let fetch_result = self.stream_to_tempfile(digest, url, fetcher).await;

        drop(lock);

        fetch_result
    }

    /// Step 3+4: drives the fetcher into a tempfile within the cache
    /// directory (so the final rename is same-filesystem and atomic),
    /// computing the content digest incrementally, then renames it into
    /// place under its final content-addressed name.
    async fn stream_to_tempfile(
        &self,
        digest: UrlDigest,
        url: &U,
        fetcher: BoxFetcher<U>,
    ) -> Result<CacheEntry, CacheError> {
        let dir = self.inner.dir.clone();
        let temp_file = simple_spawn_blocking::tokio::run_blocking_task(move || {
            tempfile::NamedTempFile::new_in(&dir)
                .map_err(|e| CacheError::lock("failed to create temp file in cache dir".to_string(), e))
        })
        .await?;

        let std_file = temp_file.reopen().map_err(CacheError::io)?;
        let mut file = File::from_std(std_file);

        let mut hasher = ContentHasher::new();
        let mut chunks = fetcher(url);
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(CacheError::io)?;
            hasher.update(&chunk);
            file.write_all(&chunk).await.map_err(CacheError::io)?;
        }
        file.flush().await.map_err(CacheError::io)?;
        drop(file);

        let content_digest = hasher.finalize();
        let entry = EntryPath::new(&self.inner.dir, digest, content_digest);

        let target = entry.path.clone();
        simple_spawn_blocking::tokio::run_blocking_task(move || {
            temp_file.persist(&target).map_err(|e| {
                CacheError::lock(
                    format!("failed to publish entry '{}'", target.display()),
                    e.error,
                )
            })
        })
        .await?;

        Self::open_entry(&entry).await
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use bytes::Bytes;
    use futures::stream;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::digest::url_digest_of_str;

    fn string_cache(dir: &Path) -> DiskCache<String> {
        DiskCache::new_uncached(dir.to_path_buf(), url_digest_of_str)
    }

    fn expected_digest(payload: &[u8]) -> ContentDigest {
        let mut hasher = ContentHasher::new();
        hasher.update(payload);
        hasher.finalize()
    }

    fn constant_fetcher(payload: &'static [u8]) -> BoxFetcher<String> {
        Arc::new(move |_url: &String| {
            Box::pin(stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(
                payload,
            ))])) as crate::cache::ChunkStream
        })
    }

    #[tokio::test]
    async fn single_thread_happy_path() {
        let dir = tempdir().unwrap();
        let cache = string_cache(dir.path());

        let fetcher = constant_fetcher(b"hello");
        let mut entry = cache
            .fetch("u1".to_string(), fetcher.clone(), 3)
            .await
            .unwrap();
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 0);
        assert_eq!(entry.content_digest(), expected_digest(b"hello"));

        let mut buf = Vec::new();
        entry.reader().read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");

        let entry2 = cache.fetch("u1".to_string(), fetcher, 3).await.unwrap();
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
        assert_eq!(entry2.content_digest(), entry.content_digest());
    }

    #[tokio::test]
    async fn ten_tasks_one_url_fetch_runs_once() {
        let dir = tempdir().unwrap();
        let cache = string_cache(dir.path());
        let fetch_count = Arc::new(AtomicU64::new(0));

        let fetcher: BoxFetcher<String> = {
            let fetch_count = fetch_count.clone();
            Arc::new(move |_url: &String| {
                fetch_count.fetch_add(1, Ordering::SeqCst);
                Box::pin(stream::once(async {
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    Ok::<_, io::Error>(Bytes::from_static(b"payload"))
                })) as crate::cache::ChunkStream
            })
        };

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let fetcher = fetcher.clone();
            handles.push(tokio::spawn(async move {
                cache.fetch("u1".to_string(), fetcher, 3).await.unwrap()
            }));
        }

        let mut digests = Vec::new();
        for h in handles {
            digests.push(h.await.unwrap().content_digest());
        }

        assert_eq!(fetch_count.load(Ordering::SeqCst), 1);
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 9);
        assert!(digests.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn leader_failure_then_retry_succeeds() {
        let dir = tempdir().unwrap();
        let cache = string_cache(dir.path());

        let failing: BoxFetcher<String> = Arc::new(|_url: &String| {
            Box::pin(stream::once(async {
                Err::<Bytes, _>(io::Error::other("boom"))
            })) as crate::cache::ChunkStream
        });

        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = cache.clone();
            let failing = failing.clone();
            handles.push(tokio::spawn(async move {
                cache.fetch("u1".to_string(), failing, 1).await
            }));
        }

        let mut ok_count = 0;
        let mut err_count = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok_count += 1,
                Err(_) => err_count += 1,
            }
        }
        // Exactly one task became leader and surfaced the raw error; the
        // rest saw FetchInterrupted and (with retries=1) exhausted.
        assert_eq!(ok_count, 0);
        assert_eq!(err_count, 5);

        let good = constant_fetcher(b"payload");
        let entry = cache.fetch("u1".to_string(), good, 3).await.unwrap();
        assert_eq!(cache.misses(), 2);
        assert_eq!(entry.content_digest(), expected_digest(b"payload"));
    }

    #[tokio::test]
    async fn zero_length_payload_is_allowed() {
        let dir = tempdir().unwrap();
        let cache = string_cache(dir.path());
        let empty: BoxFetcher<String> =
            Arc::new(|_: &String| Box::pin(stream::empty()) as crate::cache::ChunkStream);
        let entry = cache.fetch("empty".to_string(), empty, 3).await.unwrap();
        assert_eq!(entry.content_digest(), expected_digest(b""));
    }

    #[tokio::test]
    async fn content_addressing_shares_blobs_across_urls() {
        let dir = tempdir().unwrap();
        let cache = string_cache(dir.path());
        let fetcher = constant_fetcher(b"same");

        let a = cache
            .fetch("a".to_string(), fetcher.clone(), 3)
            .await
            .unwrap();
        let b = cache.fetch("b".to_string(), fetcher, 3).await.unwrap();
        assert_eq!(a.content_digest(), b.content_digest());
        assert_ne!(a.url_digest(), b.url_digest());

        let mut by_digest = cache.get_by_digest(a.content_digest()).await.unwrap();
        let mut buf = Vec::new();
        by_digest.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"same");
    }

    #[tokio::test]
    async fn unrelated_files_are_ignored_not_removed() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("README.txt"), b"not an entry").unwrap();
        let cache = string_cache(dir.path());
        assert!(cache.get_by_url(&"anything".to_string()).await.is_none());
        assert!(dir.path().join("README.txt").exists());
    }

    #[tokio::test]
    async fn a_fetcher_that_fails_before_any_bytes_leaves_no_entry_and_a_retry_can_succeed() {
        let dir = tempdir().unwrap();
        let cache = string_cache(dir.path());
        let failing: BoxFetcher<String> = Arc::new(|_: &String| {
            Box::pin(stream::once(async { Err::<Bytes, _>(io::Error::other("nope")) }))
                as crate::cache::ChunkStream
        });
        assert!(cache
            .try_fetch("u1".to_string(), failing)
            .await
            .is_err());
        assert!(cache.get_by_url(&"u1".to_string()).await.is_none());

        let good = constant_fetcher(b"ok");
        let entry = cache.fetch("u1".to_string(), good, 3).await.unwrap();
        assert_eq!(entry.content_digest(), expected_digest(b"ok"));
    }

    #[tokio::test]
    async fn get_by_url_prefers_the_most_recently_modified_entry_for_a_stale_url_digest() {
        use std::time::{Duration, SystemTime};

        let dir = tempdir().unwrap();
        let cache = string_cache(dir.path());
        let digest = url_digest_of_str("u1");

        let stale = EntryPath::new(dir.path(), digest, expected_digest(b"old"));
        let fresh = EntryPath::new(dir.path(), digest, expected_digest(b"new"));
        std::fs::write(&stale.path, b"old").unwrap();
        std::fs::write(&fresh.path, b"new").unwrap();

        // Filesystem mtime resolution can be coarser than the time it takes
        // to write two files back to back, so set the timestamps explicitly
        // rather than relying on write order alone.
        let now = SystemTime::now();
        std::fs::File::open(&stale.path)
            .unwrap()
            .set_modified(now - Duration::from_secs(60))
            .unwrap();
        std::fs::File::open(&fresh.path)
            .unwrap()
            .set_modified(now)
            .unwrap();

        let mut entry = cache.get_by_url(&"u1".to_string()).await.unwrap();
        assert_eq!(entry.content_digest(), expected_digest(b"new"));
        let mut buf = Vec::new();
        entry.reader().read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"new");
    }
}
