//! Content fingerprints and cheap change detection.
//!
//! A source's identity over time is tracked as a history of [`Snapshot`]s,
//! each pairing a content hash with the file metadata observed when the
//! hash was taken. Change detection runs in two tiers:
//!
//! 1. **Metadata tier** ([`meta_changed`]): mtime and size only, no I/O on
//!    the content. An unchanged mtime, or a size delta within the
//!    configured noise ratio, short-circuits to "unchanged".
//! 2. **Content tier**: the import path re-hashes the file and compares
//!    against the last snapshot's hash. Only a hash mismatch pushes a new
//!    snapshot and clears embeddings.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::FileStat;

/// Computes the content fingerprint: blake3 over trimmed content bytes.
///
/// Trimming means leading/trailing whitespace does not count as a change,
/// matching how editors and sync tools shuffle trailing newlines.
///
/// # Example
/// ```
/// use notemesh::fingerprint::fingerprint;
///
/// assert_eq!(fingerprint("hello\n"), fingerprint("hello"));
/// assert_ne!(fingerprint("hello"), fingerprint("hellp"));
/// ```
pub fn fingerprint(content: &str) -> String {
    blake3::hash(content.trim().as_bytes()).to_hex().to_string()
}

/// One entry of a source's fingerprint history.
///
/// The last entry is "current". `blocks` records the set of live child
/// block keys at the time of the snapshot; any block key not in the current
/// snapshot is orphaned and gets removed on reparenting.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Content hash (blake3 hex) of the trimmed source content.
    pub hash: String,
    /// Modification time observed when the hash was taken (Unix seconds).
    pub mtime: i64,
    /// File size observed when the hash was taken (bytes).
    pub size: u64,
    /// Keys of the child blocks produced by the parse at snapshot time.
    #[serde(default)]
    pub blocks: BTreeSet<String>,
}

impl Snapshot {
    /// Creates a snapshot from a hash and the stat it was taken under.
    pub fn new(hash: String, stat: FileStat) -> Self {
        Self {
            hash,
            mtime: stat.mtime,
            size: stat.size,
            blocks: BTreeSet::new(),
        }
    }

    /// Refreshes metadata in place without re-hashing.
    ///
    /// Used when the content tier confirmed the hash is unchanged but the
    /// file's mtime/size drifted (metadata noise).
    pub fn refresh_stat(&mut self, stat: FileStat) {
        self.mtime = stat.mtime;
        self.size = stat.size;
    }
}

/// Metadata-tier change check.
///
/// Returns true when the file *may* have changed and the content tier must
/// run. Steps, in order:
///
/// 1. No prior snapshot: changed (first-ever import).
/// 2. mtime unchanged since the snapshot: unchanged, skip re-hash.
/// 3. Size delta ratio `|new - old| / max(old, 1)` at most `ratio`:
///    treated as metadata noise, unchanged. This deliberately trades
///    precision for not re-reading large vaults on every touch.
/// 4. Otherwise: possibly changed; the caller hashes the content to decide.
pub fn meta_changed(last: Option<&Snapshot>, stat: &FileStat, ratio: f64) -> bool {
    let Some(last) = last else {
        return true;
    };
    if last.mtime >= stat.mtime {
        return false;
    }
    let delta = stat.size.abs_diff(last.size) as f64;
    let base = last.size.max(1) as f64;
    delta / base > ratio
}
