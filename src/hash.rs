use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// An opaque, fixed-width content hash.
///
/// The store never interprets the bytes of a `ContentHash` -- it only
/// compares them for equality/ordering and uses the canonical encoding as a
/// filename fragment. Callers (the workflow engine's hasher, or the code that
/// derives an input hash from a job's arguments) are the only parties that
/// know what algorithm produced the bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash(Vec<u8>);

impl ContentHash {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> ContentHash {
        ContentHash(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The canonical URL-safe, unpadded base64 encoding used as a filename
    /// fragment for `pending-`, `complete-`, and `item-` entries.
    pub fn encode(&self) -> String {
        data_encoding::BASE64URL_NOPAD.encode(&self.0)
    }

    /// Parse a previously-`encode`d string back into a `ContentHash`.
    ///
    /// Used internally to classify top-level directory entries; entries that
    /// don't decode are treated as foreign and simply skipped rather than
    /// surfaced as an error, since an unrelated file dropped into `root/`
    /// (e.g. by an operator poking around) isn't this crate's problem.
    pub(crate) fn try_decode(s: &str) -> Option<ContentHash> {
        data_encoding::BASE64URL_NOPAD
            .decode(s.as_bytes())
            .ok()
            .map(ContentHash)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Returned by [`ContentHash::from_str`] when the input isn't valid
/// URL-safe unpadded base64. Deliberately not one of [`crate::StoreError`]'s
/// variants: this is a caller-facing parsing convenience, not a store
/// state-machine failure.
#[derive(Debug, Error)]
#[error("invalid content hash encoding: {0}")]
pub struct InvalidEncoding(#[from] data_encoding::DecodeError);

impl FromStr for ContentHash {
    type Err = InvalidEncoding;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(ContentHash(data_encoding::BASE64URL_NOPAD.decode(s.as_bytes())?))
    }
}
