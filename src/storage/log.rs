//! Append-only entity log files.
//!
//! Each source owns one log file of newline-delimited fragments. A fragment
//! is a single-key JSON object: `{"<key>": <record>}` to upsert, or
//! `{"<key>": null}` to delete. Load folds fragments left to right with
//! last-write-wins, then rewrites the file in canonical form when the two
//! differ (compaction).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::StorageBackend;
use crate::error::Result;
use crate::types::EntityKey;

/// Extension used for entity log files.
pub const LOG_EXTENSION: &str = "jsonl";

/// Outcome of reconciling one log file.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Log file path (relative to the backend root).
    pub path: PathBuf,
    /// Folded state: key to live record. Keys whose last fragment was a
    /// null tombstone are absent.
    pub entries: BTreeMap<String, Value>,
    /// Lines dropped for JSON syntax errors.
    pub skipped: usize,
    /// Whether the file was rewritten (compacted or removed).
    pub rewritten: bool,
}

/// Reads, folds, compacts, and appends entity log files under one
/// directory.
pub struct LogStore {
    backend: Arc<dyn StorageBackend>,
    dir: PathBuf,
}

impl LogStore {
    /// Creates a log store over `backend`, with logs under `dir`.
    pub fn new(backend: Arc<dyn StorageBackend>, dir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            dir: dir.into(),
        }
    }

    /// The log file path for a source key.
    pub fn log_path(&self, source_key: &str) -> PathBuf {
        let stem = EntityKey::new(source_key).log_file_stem();
        self.dir.join(format!("{stem}.{LOG_EXTENSION}"))
    }

    /// Renders one fragment line. `None` renders the null tombstone.
    pub fn fragment_line(key: &str, value: Option<&Value>) -> String {
        let mut map = serde_json::Map::with_capacity(1);
        map.insert(
            key.to_string(),
            value.cloned().unwrap_or(Value::Null),
        );
        // Serializing a Map<String, Value> cannot fail.
        let mut line = Value::Object(map).to_string();
        line.push('\n');
        line
    }

    /// Appends fragments to the source's log file in order.
    pub async fn append_fragments(
        &self,
        source_key: &str,
        fragments: &[(String, Option<Value>)],
    ) -> Result<()> {
        if fragments.is_empty() {
            return Ok(());
        }
        let mut buf = String::new();
        for (key, value) in fragments {
            buf.push_str(&Self::fragment_line(key, value.as_ref()));
        }
        self.backend.append(&self.log_path(source_key), &buf).await
    }

    /// Deletes the source's log file (used for vault deletes and orphans).
    pub async fn remove_log(&self, source_key: &str) -> Result<()> {
        self.backend.remove(&self.log_path(source_key)).await
    }

    /// Ensures the log directory exists.
    pub async fn ensure_dir(&self) -> Result<()> {
        self.backend.mkdir(&self.dir).await
    }

    /// All log files currently on disk.
    pub async fn list_logs(&self) -> Result<Vec<PathBuf>> {
        let files = self.backend.list(&self.dir).await?;
        Ok(files
            .into_iter()
            .filter(|p| {
                p.extension()
                    .map(|e| e == LOG_EXTENSION)
                    .unwrap_or(false)
            })
            .collect())
    }

    /// Reconciles one log file: folds all fragments, drops unparseable
    /// lines, and rewrites the file when the folded form differs from what
    /// is on disk. A file folding to nothing is removed.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn reconcile_file(&self, path: &Path) -> Result<ReconcileReport> {
        let content = self.backend.read(path).await?;
        let mut report = ReconcileReport {
            path: path.to_path_buf(),
            ..Default::default()
        };

        let (entries, skipped) = fold_lines(&content);
        report.entries = entries;
        report.skipped = skipped;

        let canonical = Self::canonical_text(&report.entries);
        if canonical != content {
            if canonical.is_empty() {
                debug!("log folded to nothing, removing file");
                self.backend.remove(path).await?;
            } else {
                debug!(
                    before = content.len(),
                    after = canonical.len(),
                    "compacting log file"
                );
                self.backend.write(path, &canonical).await?;
            }
            report.rewritten = true;
        }
        Ok(report)
    }

    /// Reconciles every log file under the directory.
    pub async fn reconcile_all(&self) -> Result<Vec<ReconcileReport>> {
        let mut reports = Vec::new();
        for path in self.list_logs().await? {
            reports.push(self.reconcile_file(&path).await?);
        }
        Ok(reports)
    }

    fn canonical_text(entries: &BTreeMap<String, Value>) -> String {
        let mut out = String::new();
        for (key, value) in entries {
            out.push_str(&Self::fragment_line(key, Some(value)));
        }
        out
    }
}

/// Folds raw log text left to right with last-write-wins and null-delete.
/// Returns the surviving entries and the count of unparseable lines.
fn fold_lines(content: &str) -> (BTreeMap<String, Value>, usize) {
    let mut entries = BTreeMap::new();
    let mut skipped = 0;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Map<String, Value>>(line) {
            Ok(map) => {
                for (key, value) in map {
                    if value.is_null() {
                        entries.remove(&key);
                    } else {
                        entries.insert(key, value);
                    }
                }
            }
            Err(e) => {
                warn!(line = %line, error = %e, "dropping malformed log line");
                skipped += 1;
            }
        }
    }
    (entries, skipped)
}
