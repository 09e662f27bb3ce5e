//! Configuration types for NoteMesh.
//!
//! The [`Config`] struct controls index behavior including:
//! - Where per-source append logs are stored
//! - Change-detection thresholds
//! - Embedding policy (minimum entity size, excluded headings)
//! - Flush debouncing and prune confirmation
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use notemesh::Config;
//!
//! // Use defaults, pointing at a data directory
//! let config = Config::new("/tmp/notemesh-data");
//!
//! // Customize
//! let config = Config {
//!     min_chars: 100,
//!     save_debounce: Duration::from_secs(2),
//!     ..Config::new("/tmp/notemesh-data")
//! };
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::error::NoteMeshError;

/// Index configuration options.
///
/// All fields except `data_dir` have sensible defaults. Use struct update
/// syntax to override specific settings:
///
/// ```rust
/// use notemesh::Config;
///
/// let config = Config {
///     min_chars: 100,
///     ..Config::new("./data")
/// };
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory holding the per-source append-log files.
    pub data_dir: PathBuf,

    /// Minimum character size for an entity to be embedded.
    ///
    /// Sub-threshold entities are permanently skipped, not queued.
    /// Default: 300.
    pub min_chars: usize,

    /// Size-delta ratio below which a metadata change is treated as noise.
    ///
    /// When a source's mtime moved but its size changed by at most this
    /// fraction of the previous size, the file is assumed unchanged and the
    /// content hash is not recomputed. This is a known approximation: a
    /// same-size edit slips past it until the next real size change. Set to
    /// 0.0 to always fall through to the hash comparison. Default: 0.01.
    pub size_delta_ratio: f64,

    /// Sources larger than this many bytes are skipped at import.
    ///
    /// Default: 1 MB.
    pub max_source_bytes: u64,

    /// Coalescing window for the debounced save queue. Default: 10 s.
    pub save_debounce: Duration,

    /// During an embedding pass, force a flush every this many batches.
    ///
    /// Bounds data loss if the process dies mid-pass. Default: 20.
    pub flush_every_batches: usize,

    /// Prune removals above this fraction of vectorized entities require
    /// explicit confirmation (`force = true`). Default: 0.5.
    pub prune_confirm_ratio: f64,

    /// Heading labels whose blocks are excluded from embedding.
    pub excluded_headings: Vec<String>,
}

impl Config {
    /// Creates a Config with default settings for the given data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            min_chars: 300,
            size_delta_ratio: 0.01,
            max_source_bytes: 1_000_000,
            save_debounce: Duration::from_secs(10),
            flush_every_batches: 20,
            prune_confirm_ratio: 0.5,
            excluded_headings: Vec::new(),
        }
    }

    /// Validates the configuration.
    ///
    /// Called automatically by `NoteMesh::open()`. A bad configuration is a
    /// startup error, never a runtime-recoverable one.
    ///
    /// # Errors
    /// Returns `NoteMeshError::Config` if:
    /// - `data_dir` is empty
    /// - `size_delta_ratio` or `prune_confirm_ratio` is outside `[0, 1]`
    /// - `flush_every_batches` is 0
    pub fn validate(&self) -> Result<(), NoteMeshError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(NoteMeshError::config("data_dir must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.size_delta_ratio) {
            return Err(NoteMeshError::config(
                "size_delta_ratio must be between 0.0 and 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.prune_confirm_ratio) {
            return Err(NoteMeshError::config(
                "prune_confirm_ratio must be between 0.0 and 1.0",
            ));
        }
        if self.flush_every_batches == 0 {
            return Err(NoteMeshError::config(
                "flush_every_batches must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Returns true if any heading label in the chain is excluded.
    pub fn heading_excluded(&self, headings: &[&str]) -> bool {
        headings
            .iter()
            .any(|h| self.excluded_headings.iter().any(|x| x == h))
    }
}
