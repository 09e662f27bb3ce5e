//! Error types for NoteMesh.
//!
//! NoteMesh uses a single top-level error enum:
//! - [`NoteMeshError`] is returned by all public APIs
//! - Entity-local failures (a bad log line, one unembeddable input) are
//!   recorded on the affected entity and logged; they never unwind a batch
//!   or a directory scan
//!
//! # Error Handling Pattern
//! ```rust,ignore
//! use notemesh::{NoteMesh, Config, Result};
//!
//! async fn example(mesh: &NoteMesh) -> Result<()> {
//!     mesh.load().await?;
//!     mesh.flush().await?;
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Result type alias for NoteMesh operations.
pub type Result<T> = std::result::Result<T, NoteMeshError>;

/// Top-level error enum for all NoteMesh operations.
///
/// This is the only error type returned by public APIs.
/// Use pattern matching to handle specific error cases.
#[derive(Debug, Error)]
pub enum NoteMeshError {
    /// Configuration error (startup-time, never recoverable at runtime).
    #[error("Configuration error: {reason}")]
    Config {
        /// Description of what's wrong with the configuration.
        reason: String,
    },

    /// General I/O error from a storage primitive.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Content could not be chunked into blocks.
    ///
    /// The affected source is left untouched in memory and re-queued for
    /// import on the next cycle.
    #[error("Parse error for '{path}': {reason}")]
    Parse {
        /// Source path that failed to parse.
        path: String,
        /// Parser-reported reason.
        reason: String,
    },

    /// Embedding model call failed.
    #[error("Model error: {0}")]
    Model(String),

    /// A log file (or a region of one) failed to reconcile.
    ///
    /// Single-line syntax errors are tolerated inline and never surface as
    /// this variant; this is reserved for whole-file failures.
    #[error("Log corruption in '{path}': {reason}")]
    LogCorruption {
        /// Log file that failed.
        path: String,
        /// What went wrong.
        reason: String,
    },

    /// The data directory is locked by another writer.
    #[error("Data directory is locked by another writer: {0}")]
    Lock(String),

    /// JSON serialization error while encoding a fragment or cache key.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NoteMeshError {
    /// Creates a configuration error with the given reason.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Creates a parse error for the given source path.
    pub fn parse(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a model error with the given message.
    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    /// Creates a log corruption error for the given log file.
    pub fn log_corruption(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LogCorruption {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if this error wraps a not-found I/O error.
    ///
    /// The persistence layer treats not-found on read as "log absent,
    /// start fresh" rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    /// Returns true if this is a parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self, Self::Parse { .. })
    }

    /// Returns true if this is a model error.
    pub fn is_model(&self) -> bool {
        matches!(self, Self::Model(_))
    }

    /// Returns true if this is a configuration error.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// Returns true if this is a log corruption error.
    pub fn is_log_corruption(&self) -> bool {
        matches!(self, Self::LogCorruption { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = NoteMeshError::config("data_dir must not be empty");
        assert_eq!(
            err.to_string(),
            "Configuration error: data_dir must not be empty"
        );
        assert!(err.is_config());
    }

    #[test]
    fn test_parse_error_display() {
        let err = NoteMeshError::parse("notes/a.md", "unbalanced heading");
        assert_eq!(
            err.to_string(),
            "Parse error for 'notes/a.md': unbalanced heading"
        );
        assert!(err.is_parse());
        assert!(!err.is_model());
    }

    #[test]
    fn test_log_corruption_display() {
        let err = NoteMeshError::log_corruption("notes_a.jsonl", "unreadable");
        assert_eq!(
            err.to_string(),
            "Log corruption in 'notes_a.jsonl': unreadable"
        );
        assert!(err.is_log_corruption());
    }

    #[test]
    fn test_is_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = NoteMeshError::from(io);
        assert!(err.is_not_found());

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err = NoteMeshError::from(io);
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_error_conversion_chain() {
        fn inner() -> Result<()> {
            Err(std::io::Error::other("disk on fire"))?
        }

        let result = inner();
        assert!(matches!(result.unwrap_err(), NoteMeshError::Io(_)));
    }
}
