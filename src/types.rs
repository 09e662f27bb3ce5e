//! Core type definitions for NoteMesh keys, spans, and embedding records.
//!
//! Entity identity is the hierarchical path string: a source is keyed by its
//! vault-relative path (`"folder/doc.md"`), a block by the source key
//! followed by a `#`-delimited chain of heading labels
//! (`"folder/doc.md#Heading#Subheading"`).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Delimiter between a source path and its heading chain.
pub const BLOCK_DELIMITER: char = '#';

/// Hierarchical entity key.
///
/// A thin wrapper over the path string that knows how to split itself into
/// the owning source key and heading labels.
///
/// # Example
/// ```
/// use notemesh::EntityKey;
///
/// let key = EntityKey::new("notes/rust.md#Ownership#Borrowing");
/// assert!(key.is_block());
/// assert_eq!(key.source_key(), "notes/rust.md");
/// assert_eq!(key.breadcrumbs(), "notes > rust > Ownership > Borrowing");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(pub String);

impl EntityKey {
    /// Creates a key from any string-like value.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this key identifies a block (contains `#`).
    #[inline]
    pub fn is_block(&self) -> bool {
        self.0.contains(BLOCK_DELIMITER)
    }

    /// Returns the owning source's key (everything before the first `#`).
    ///
    /// For a source key, returns the key itself.
    pub fn source_key(&self) -> &str {
        match self.0.find(BLOCK_DELIMITER) {
            Some(i) => &self.0[..i],
            None => &self.0,
        }
    }

    /// Renders the key as a human-readable breadcrumb trail.
    ///
    /// Path separators and heading delimiters are both joined with `" > "`,
    /// and a trailing `.md` on the file segment is stripped. Used as the
    /// prefix of embed inputs so the model sees where a chunk lives.
    pub fn breadcrumbs(&self) -> String {
        let (source, headings) = match self.0.split_once(BLOCK_DELIMITER) {
            Some((source, headings)) => (source, Some(headings)),
            None => (self.0.as_str(), None),
        };
        let source = source.strip_suffix(".md").unwrap_or(source);
        let mut parts: Vec<&str> = source.split('/').collect();
        if let Some(headings) = headings {
            parts.extend(headings.split(BLOCK_DELIMITER));
        }
        parts.join(" > ")
    }

    /// Returns the deterministic log file stem for the owning source.
    ///
    /// Non-alphanumeric characters are replaced with `_` so the stem is a
    /// safe file name on every platform. Two sources with keys differing
    /// only in punctuation share a stem; the fold keyed on full entity keys
    /// keeps their records separate regardless.
    pub fn log_file_stem(&self) -> String {
        self.source_key()
            .trim_end_matches(".md")
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    }

    /// Returns the heading labels of a block key (empty for sources).
    pub fn headings(&self) -> Vec<&str> {
        let mut parts = self.0.split(BLOCK_DELIMITER);
        parts.next(); // source path
        parts.collect()
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// File metadata supplied by the host storage primitive.
///
/// `mtime` is Unix seconds; `size` is the byte length. Both feed the
/// cheap change-detection path that avoids re-hashing unchanged files.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    /// Modification time in Unix seconds.
    pub mtime: i64,
    /// File size in bytes.
    pub size: u64,
}

/// Inclusive line range of a block within its source's raw content.
///
/// Serialized as a two-element array `[start, end]` to keep log fragments
/// compact.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u32; 2]", into = "[u32; 2]")]
pub struct LineSpan {
    /// First line of the block (0-based).
    pub start: u32,
    /// Last line of the block (0-based, inclusive).
    pub end: u32,
}

impl LineSpan {
    /// Creates a span covering `start..=end`.
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Returns true if the given line falls inside this span.
    pub fn contains(&self, line: u32) -> bool {
        self.start <= line && line <= self.end
    }
}

impl From<[u32; 2]> for LineSpan {
    fn from([start, end]: [u32; 2]) -> Self {
        Self { start, end }
    }
}

impl From<LineSpan> for [u32; 2] {
    fn from(span: LineSpan) -> Self {
        [span.start, span.end]
    }
}

/// Stored embedding result for one entity under one model.
///
/// Vectors are rounded to 8 decimal digits before storage to bound
/// serialized size and avoid floating-point noise across runs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// The embedding vector. Empty when the entity failed to embed.
    #[serde(default)]
    pub vec: Vec<f32>,
    /// Token count the model reported for the input.
    #[serde(default)]
    pub tokens: u32,
    /// Error marker from a failed embed attempt, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EmbeddingRecord {
    /// Creates a successful record from a vector and token count.
    pub fn new(vec: Vec<f32>, tokens: u32) -> Self {
        Self {
            vec,
            tokens,
            error: None,
        }
    }

    /// Creates a failure marker record (empty vector, error message).
    ///
    /// A failed entity stores this instead of blocking the rest of its
    /// batch; it is not retried until its content changes.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            vec: Vec::new(),
            tokens: 0,
            error: Some(error.into()),
        }
    }

    /// Returns true if this record holds a usable vector.
    pub fn has_vec(&self) -> bool {
        !self.vec.is_empty()
    }
}
