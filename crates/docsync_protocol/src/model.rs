//! Document model.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Field values of a document.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// A slash-separated path identifying one document, e.g. `rooms/a`.
///
/// Keys order lexicographically by path segment, which is the default
/// ordering for listener-facing changes when no query order applies.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentKey(String);

impl DocumentKey {
    /// Creates a key from a path.
    ///
    /// Leading and trailing slashes are trimmed.
    pub fn new(path: impl AsRef<str>) -> Self {
        Self(path.as_ref().trim_matches('/').to_string())
    }

    /// Returns the full path.
    pub fn path(&self) -> &str {
        &self.0
    }

    /// Returns the collection path containing this document, or `""` for a
    /// top-level key.
    pub fn collection(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[..idx],
            None => "",
        }
    }

    /// Returns the last path segment.
    pub fn id(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentKey {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for DocumentKey {
    fn from(path: String) -> Self {
        Self::new(path)
    }
}

/// Logical server timestamp.
///
/// Versions are monotonic per document and per snapshot.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version(pub u64);

impl Version {
    /// The version before anything was written.
    pub const MIN: Version = Version(0);

    /// Returns the raw value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A server-addressable record.
///
/// `data == None` is the "does not exist" marker: the server confirmed the
/// document is absent at `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document key.
    pub key: DocumentKey,
    /// Version at which this state was observed.
    pub version: Version,
    /// Contents, or `None` if the document does not exist.
    pub data: Option<Fields>,
    /// True when unacknowledged local writes are overlaid on this state.
    #[serde(default)]
    pub has_local_mutations: bool,
}

impl Document {
    /// Creates an existing document.
    pub fn new(key: impl Into<DocumentKey>, version: Version, data: Fields) -> Self {
        Self {
            key: key.into(),
            version,
            data: Some(data),
            has_local_mutations: false,
        }
    }

    /// Creates a "does not exist" marker.
    pub fn missing(key: impl Into<DocumentKey>, version: Version) -> Self {
        Self {
            key: key.into(),
            version,
            data: None,
            has_local_mutations: false,
        }
    }

    /// Returns true if the document exists.
    pub fn exists(&self) -> bool {
        self.data.is_some()
    }

    /// Returns a field value.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.data.as_ref().and_then(|data| data.get(name))
    }

    /// Returns true if both documents carry the same contents, ignoring
    /// version and local-mutation metadata.
    pub fn same_contents(&self, other: &Document) -> bool {
        self.data == other.data
    }
}
