//! Incremental semantic index over a directory of notes.
//!
//! `notemesh` watches a vault of plain-text documents, detects which ones
//! actually changed (a two-tier fingerprint: cheap file metadata first,
//! content hash second), splits them into addressable blocks, embeds the
//! changed pieces through a pluggable model, and serves nearest-neighbor
//! "connections" queries over the result. All derived state persists as
//! append-only JSON log files that self-compact on load, so the index
//! survives restarts without a database.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use notemesh::prelude::*;
//!
//! # async fn run(chunker: Arc<dyn Chunker>, model: Arc<dyn EmbedModel>) -> notemesh::Result<()> {
//! let config = Config::new(".notemesh/multi");
//! let mesh = NoteMesh::open(
//!     "/path/to/vault",
//!     config,
//!     chunker,
//!     ModelContext::new(model),
//!     Arc::new(NullNotices),
//! )
//! .await?;
//!
//! mesh.load().await?;
//! mesh.scan(&["notes/today.md".to_string()]).await?;
//! mesh.import().await?;
//! mesh.embed_pending().await?;
//!
//! let related = mesh.find_connections("notes/today.md", &QueryFilter::default())?;
//! for conn in related {
//!     println!("{} ({:.3})", conn.key, conn.score);
//! }
//! mesh.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod embed;
pub mod entity;
pub mod error;
pub mod fingerprint;
pub mod mesh;
pub mod notify;
pub mod search;
pub mod storage;
pub mod types;

pub use config::Config;
pub use embed::{EmbedModel, EmbedOutput, ModelContext};
pub use entity::{Block, Chunker, Entity, EntityStore, ParsedBlock, ParsedDoc, Source};
pub use error::{NoteMeshError, Result};
pub use fingerprint::{fingerprint, Snapshot};
pub use mesh::{LoadReport, NoteMesh, PruneOutcome, ScanReport};
pub use notify::{Notice, NoticeSink, NullNotices};
pub use search::{Connection, QueryFilter};
pub use storage::{LocalFs, LogStore, StorageBackend};
pub use types::{EmbeddingRecord, EntityKey, FileStat, LineSpan};

/// Commonly used types, importable in one line.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::embed::{EmbedModel, ModelContext};
    pub use crate::entity::{Chunker, ParsedBlock, ParsedDoc};
    pub use crate::error::{NoteMeshError, Result};
    pub use crate::mesh::{NoteMesh, PruneOutcome};
    pub use crate::notify::{NoticeSink, NullNotices};
    pub use crate::search::{Connection, QueryFilter};
    pub use crate::storage::StorageBackend;
    pub use crate::types::{EmbeddingRecord, EntityKey};
}
