//! Object metadata
//!
//! Every object carries a string-to-string attribute map stored out of band
//! in the extended attributes of its data file:
//!
//! ```text
//!   data file ──┬── user.swift.metadata    (bytes 0 .. 65536)
//!               ├── user.swift.metadata1   (bytes 65536 .. 131072)
//!               └── user.swift.metadataN   (final partial chunk)
//! ```
//!
//! The concatenated chunks hold the map pickled the same way every other
//! reader of the volume pickles it.
//!
//! - [`codec`]: serialisation and chunked attribute I/O
//! - [`generate`]: rebuild a record from file content and stat
//! - [`freshness`]: decide whether a stored record still matches the file

pub mod codec;
pub mod freshness;
pub mod generate;

pub use codec::{METADATA_CHUNK_SIZE, METADATA_KEY, read_metadata, write_metadata};
pub use freshness::{Freshness, StaleReason, verify};
pub use generate::generate;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use volstore_common::meta;

/// Attribute map attached to an object
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectMetadata(HashMap<String, String>);

impl ObjectMetadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Recorded content length, if present and numeric
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.get(meta::CONTENT_LENGTH)?.trim().parse().ok()
    }

    #[must_use]
    pub fn etag(&self) -> Option<&str> {
        self.get(meta::ETAG)
    }

    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.get(meta::CONTENT_TYPE)
    }

    #[must_use]
    pub fn timestamp(&self) -> Option<&str> {
        self.get(meta::TIMESTAMP)
    }

    /// Last-write timestamp recorded with the metadata
    #[must_use]
    pub fn put_mtime(&self) -> Option<&str> {
        self.get(meta::PUT_MTIME)
    }

    /// Caller-supplied `X-Object-Meta-*` entries
    pub fn user_metadata(&self) -> impl Iterator<Item = (&str, &str)> {
        self.iter().filter(|(k, _)| {
            k.len() > meta::USER_META_PREFIX.len()
                && k[..meta::USER_META_PREFIX.len()].eq_ignore_ascii_case(meta::USER_META_PREFIX)
        })
    }

    #[must_use]
    pub fn into_inner(self) -> HashMap<String, String> {
        self.0
    }
}

impl From<HashMap<String, String>> for ObjectMetadata {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ObjectMetadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl IntoIterator for ObjectMetadata {
    type Item = (String, String);
    type IntoIter = std::collections::hash_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        let md: ObjectMetadata = [
            (meta::CONTENT_LENGTH, "42"),
            (meta::ETAG, "d41d8cd98f00b204e9800998ecf8427e"),
            (meta::CONTENT_TYPE, "text/plain"),
            ("X-Object-Meta-Color", "blue"),
            ("x-object-meta-shape", "round"),
            ("X-Object-Meta-", "empty suffix"),
        ]
        .into_iter()
        .collect();

        assert_eq!(md.content_length(), Some(42));
        assert_eq!(md.etag(), Some("d41d8cd98f00b204e9800998ecf8427e"));
        assert_eq!(md.content_type(), Some("text/plain"));
        assert_eq!(md.put_mtime(), None);

        let mut user: Vec<_> = md.user_metadata().collect();
        user.sort_unstable();
        assert_eq!(
            user,
            vec![("X-Object-Meta-Color", "blue"), ("x-object-meta-shape", "round")]
        );
    }

    #[test]
    fn test_non_numeric_length() {
        let mut md = ObjectMetadata::new();
        md.insert(meta::CONTENT_LENGTH, "lots");
        assert_eq!(md.content_length(), None);
    }
}
