//! A content-addressed cache that deduplicates concurrent fetches of the
//! same key.
//!
//! Three backings implement the one [`Cache`] capability:
//!
//! - [`DiskCache`] persists entries under a directory, coordinating with
//!   other processes that share it via an advisory file lock.
//! - [`MemoryCache`] keeps entries in a process-local buffer.
//! - [`NoopCache`] runs the fetcher every time and caches nothing.
//!
//! All three deduplicate concurrent callers asking for the same key within
//! a process: the first caller becomes the leader and runs the fetcher,
//! the rest wait for it to finish and then read what it produced.

mod cache;
mod disk_cache;
mod error;
mod memory_cache;
mod noop_cache;
mod reader;
mod registry;

pub mod digest;
pub mod url_hasher;

pub use cache::{BoxFetcher, BoxReader, Cache, CacheEntry, ChunkStream, DEFAULT_RETRIES};
pub use disk_cache::DiskCache;
pub use error::CacheError;
pub use memory_cache::MemoryCache;
pub use noop_cache::NoopCache;
