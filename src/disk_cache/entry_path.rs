//! The on-disk entry file naming scheme.
//!
//! An entry file's name encodes both the URL digest and the content digest
//! of the bytes it contains, so that an entry can be found by iterating the
//! cache directory and matching on either half of the name — the same
//! scheme the Python original used, noted there as necessary because
//! symlinking content by hash doesn't work out of the box on Windows.

use std::path::{Path, PathBuf};

use crate::digest::{ContentDigest, UrlDigest};

const PREFIX: &str = "entry__url_";
const INFIX: &str = "_contents_";

/// A parsed or constructed entry file name inside a cache directory.
#[derive(Debug, Clone)]
pub(crate) struct EntryPath {
    pub(crate) url_digest: UrlDigest,
    pub(crate) content_digest: ContentDigest,
    pub(crate) path: PathBuf,
}

impl EntryPath {
    /// Builds the path an entry for `(url_digest, content_digest)` would
    /// live at inside `cache_dir`. Does not touch the filesystem.
    pub(crate) fn new(cache_dir: &Path, url_digest: UrlDigest, content_digest: ContentDigest) -> Self {
        let path = cache_dir.join(format!("{PREFIX}{url_digest}{INFIX}{content_digest}"));
        Self {
            url_digest,
            content_digest,
            path,
        }
    }

    /// Parses `path` as an entry file name. Returns `None` (never an error)
    /// for anything that doesn't match the schema — such files are ignored,
    /// not removed, per the cache directory's invariants.
    pub(crate) fn try_from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let rest = name.strip_prefix(PREFIX)?;
        let (url_hex, content_hex) = rest.split_once(INFIX)?;
        let url_digest = UrlDigest::parse(url_hex).ok()?;
        let content_digest = ContentDigest::parse(content_hex).ok()?;
        Some(Self {
            url_digest,
            content_digest,
            path: path.to_path_buf(),
        })
    }
}
