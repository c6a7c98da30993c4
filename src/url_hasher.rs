//! Canonical hashers for the common case of a string-shaped key.
//!
//! `Cache<U>` is generic over the key type, so most constructors take a
//! caller-supplied `url_hasher` closure; this module provides the one
//! every caller with a plain URL string reaches for.

use crate::digest::{url_digest_of_str, UrlDigest};

/// Hashes a UTF-8 URL string the same way every `Cache<String>` /
/// `Cache<&str>` instance in this crate's tests does: SHA-256 over the raw
/// UTF-8 bytes, no normalization.
pub fn sha256_utf8(url: impl AsRef<str>) -> UrlDigest {
    url_digest_of_str(url)
}
