//! Storage backends for entity data files.
//!
//! The backend abstracts the filesystem so the log layer and tests can run
//! against anything that serves bytes by relative path.

mod log;

pub use log::{LogStore, ReconcileReport, LOG_EXTENSION};

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::instrument;

use crate::error::Result;
use crate::types::FileStat;

// ============================================================================
// Backend Trait
// ============================================================================

/// Byte-level storage for log files, keyed by path relative to the backend
/// root.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Returns true if the path exists.
    async fn exists(&self, path: &Path) -> bool;

    /// Reads the whole file as UTF-8 text.
    async fn read(&self, path: &Path) -> Result<String>;

    /// Writes the file, replacing any prior contents.
    async fn write(&self, path: &Path, content: &str) -> Result<()>;

    /// Appends to the file, creating it when absent.
    async fn append(&self, path: &Path, content: &str) -> Result<()>;

    /// Lists the files directly under the given directory.
    async fn list(&self, dir: &Path) -> Result<Vec<PathBuf>>;

    /// Removes the file; missing files are not an error.
    async fn remove(&self, path: &Path) -> Result<()>;

    /// Creates the directory and its parents.
    async fn mkdir(&self, path: &Path) -> Result<()>;

    /// Returns mtime (seconds) and size for the path.
    async fn stat(&self, path: &Path) -> Result<FileStat>;
}

// ============================================================================
// Local Filesystem Backend
// ============================================================================

/// Backend over the local filesystem, rooted at a base directory.
#[derive(Debug)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    /// Creates a backend rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn full(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl StorageBackend for LocalFs {
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(self.full(path)).await.unwrap_or(false)
    }

    async fn read(&self, path: &Path) -> Result<String> {
        Ok(tokio::fs::read_to_string(self.full(path)).await?)
    }

    #[instrument(skip(self, content), fields(path = %path.display(), bytes = content.len()))]
    async fn write(&self, path: &Path, content: &str) -> Result<()> {
        let full = self.full(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(full, content).await?;
        Ok(())
    }

    async fn append(&self, path: &Path, content: &str) -> Result<()> {
        let full = self.full(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(full)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn list(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let full = self.full(dir);
        if !tokio::fs::try_exists(&full).await? {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&full).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(dir.join(entry.file_name()));
            }
        }
        files.sort();
        Ok(files)
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(self.full(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn mkdir(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(self.full(path)).await?;
        Ok(())
    }

    async fn stat(&self, path: &Path) -> Result<FileStat> {
        let meta = tokio::fs::metadata(self.full(path)).await?;
        let mtime = meta
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(FileStat {
            mtime,
            size: meta.len(),
        })
    }
}
