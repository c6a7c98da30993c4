//! Fixed-width SHA-256 identities used throughout the cache.
//!
//! [`UrlDigest`] identifies a cache key (the caller's URL-like value);
//! [`ContentDigest`] identifies the bytes actually stored. Both are plain
//! 32-byte values with a stable lowercase-hex wire encoding so that entries
//! written by one process can be parsed by another.

use std::{fmt, str::FromStr};

use sha2::{Digest, Sha256};

/// Number of bytes in a SHA-256 digest.
const DIGEST_LEN: usize = 32;

/// Number of hex characters needed to encode a SHA-256 digest.
pub const HEX_LEN: usize = DIGEST_LEN * 2;

/// Error returned when a hex string cannot be parsed into a digest.
#[derive(Debug, thiserror::Error)]
#[error("invalid digest: expected {HEX_LEN} lowercase hex characters, got {0:?}")]
pub struct ParseDigestError(String);

macro_rules! digest_newtype {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        #[cfg_attr(feature = "serde", serde(into = "String", try_from = "String"))]
        pub struct $name([u8; DIGEST_LEN]);

        impl $name {
            /// Wraps a raw 32-byte SHA-256 digest.
            pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
                Self(bytes)
            }

            /// Returns the raw bytes of this digest.
            pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
                &self.0
            }

            /// Parses a digest from its 64-character lowercase hex encoding.
            pub fn parse(hexdigest: &str) -> Result<Self, ParseDigestError> {
                if hexdigest.len() != HEX_LEN
                    || !hexdigest.bytes().all(|b| b.is_ascii_hexdigit())
                {
                    return Err(ParseDigestError(hexdigest.to_string()));
                }
                let mut bytes = [0u8; DIGEST_LEN];
                hex::decode_to_slice(hexdigest, &mut bytes)
                    .map_err(|_| ParseDigestError(hexdigest.to_string()))?;
                Ok(Self(bytes))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = ParseDigestError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        #[cfg(feature = "serde")]
        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.to_string()
            }
        }

        #[cfg(feature = "serde")]
        impl TryFrom<String> for $name {
            type Error = ParseDigestError;
            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }
    };
}

digest_newtype!(
    UrlDigest,
    "The SHA-256 of a canonical byte encoding of a cache key."
);
digest_newtype!(
    ContentDigest,
    "The SHA-256 of the payload bytes stored under an entry."
);

/// Hashes arbitrary bytes into a [`UrlDigest`].
///
/// This is the canonical url-hasher for string-like keys mentioned in the
/// cache's external interface: string keys are encoded as UTF-8 and hashed
/// directly.
pub fn url_digest_of_bytes(bytes: impl AsRef<[u8]>) -> UrlDigest {
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_ref());
    UrlDigest(hasher.finalize().into())
}

/// Hashes a UTF-8 string into a [`UrlDigest`]. The canonical url-hasher for
/// `Cache<String>` and `Cache<&str>` instances.
pub fn url_digest_of_str(s: impl AsRef<str>) -> UrlDigest {
    url_digest_of_bytes(s.as_ref().as_bytes())
}

/// Incrementally computes a [`ContentDigest`] over a stream of byte chunks.
#[derive(Default)]
pub struct ContentHasher(Sha256);

impl ContentHasher {
    /// Creates a new, empty hasher.
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    /// Feeds another chunk of the payload into the running hash.
    pub fn update(&mut self, chunk: &[u8]) {
        self.0.update(chunk);
    }

    /// Consumes the hasher and returns the final digest.
    pub fn finalize(self) -> ContentDigest {
        ContentDigest(self.0.finalize().into())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_payload_hashes_to_the_well_known_sha256_of_empty_string() {
        let digest = ContentHasher::new().finalize();
        assert_eq!(
            digest.to_string(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b85"
        );
    }

    #[test]
    fn hex_round_trips() {
        let d = url_digest_of_str("hello");
        let parsed = UrlDigest::parse(&d.to_string()).unwrap();
        assert_eq!(d, parsed);
    }

    #[test]
    fn rejects_wrong_length_and_non_hex() {
        assert!(UrlDigest::parse("deadbeef").is_err());
        assert!(UrlDigest::parse(&"z".repeat(HEX_LEN)).is_err());
    }

    #[test]
    fn ordering_is_total_and_consistent_with_bytes() {
        let a = UrlDigest::from_bytes([0u8; 32]);
        let mut b_bytes = [0u8; 32];
        b_bytes[31] = 1;
        let b = UrlDigest::from_bytes(b_bytes);
        assert!(a < b);
    }
}
