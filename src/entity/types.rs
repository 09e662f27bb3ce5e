//! Source and Block entity records.
//!
//! These structs are the exact payloads persisted in log fragments; runtime
//! bookkeeping (queue flags, the transient embed-input cache) is
//! `#[serde(skip)]` so it never reaches disk.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{NoteMeshError, Result};
use crate::fingerprint::Snapshot;
use crate::types::{EmbeddingRecord, EntityKey, LineSpan};

/// Runtime-only entity state, never persisted.
#[derive(Clone, Debug, Default)]
pub struct EntityFlags {
    /// Entity has unsaved changes; its key is in the save queue.
    pub queue_save: bool,
    /// Entity needs (re-)embedding for the active model.
    pub queue_embed: bool,
    /// Source must be re-imported on the next cycle (parse failed, or the
    /// backing file reappeared).
    pub queue_import: bool,
    /// Logical delete; the record survives until its null fragment lands.
    pub deleted: bool,
    /// Resolved embed input cached for the duration of one batch window.
    pub embed_input: Option<String>,
}

/// Document-level entity.
///
/// A source owns zero or more blocks; the set of live child keys is the
/// `blocks` field of the current (last) fingerprint snapshot.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Source {
    /// Vault-relative path, also the entity key.
    pub path: String,
    /// Fingerprint history; the last entry is current.
    #[serde(default)]
    pub history: Vec<Snapshot>,
    /// Per-model embedding records.
    #[serde(default)]
    pub embeddings: BTreeMap<String, EmbeddingRecord>,
    /// Link targets parsed from content, used for exclusion filters.
    #[serde(default)]
    pub outlinks: Vec<String>,
    /// Runtime bookkeeping, not persisted.
    #[serde(skip)]
    pub flags: EntityFlags,
}

impl Source {
    /// Creates an empty source record for the given path.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Returns the current (last) fingerprint snapshot, if any.
    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        self.history.last()
    }

    /// Mutable access to the current snapshot.
    pub fn last_snapshot_mut(&mut self) -> Option<&mut Snapshot> {
        self.history.last_mut()
    }

    /// Byte size from the current snapshot (0 before the first import).
    pub fn size(&self) -> u64 {
        self.last_snapshot().map(|s| s.size).unwrap_or(0)
    }
}

/// Sub-document entity, child of exactly one source.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Block {
    /// Hierarchical key: source path + `#`-joined heading chain.
    pub path: String,
    /// Line range into the owning source's raw content.
    #[serde(default)]
    pub lines: LineSpan,
    /// Character length of the block's slice; cheap change proxy.
    #[serde(default)]
    pub length: usize,
    /// Per-model embedding records.
    #[serde(default)]
    pub embeddings: BTreeMap<String, EmbeddingRecord>,
    /// Runtime bookkeeping, not persisted.
    #[serde(skip)]
    pub flags: EntityFlags,
}

impl Block {
    /// Creates a block record for the given key, span, and length.
    pub fn new(path: impl Into<String>, lines: LineSpan, length: usize) -> Self {
        Self {
            path: path.into(),
            lines,
            length,
            ..Default::default()
        }
    }
}

/// Either kind of indexed entity.
///
/// The variant is determined by the key shape (`#` present means block),
/// which is how log reconciliation decides how to materialize a fragment.
#[derive(Clone, Debug)]
pub enum Entity {
    /// Document-level record.
    Source(Source),
    /// Sub-document record.
    Block(Block),
}

impl Entity {
    /// Materializes an entity from a reconciled log fragment value.
    ///
    /// The key decides the variant; a value whose shape doesn't match the
    /// key's kind is a data error, surfaced to the caller (spec: only
    /// syntax errors are discarded silently).
    pub fn from_value(key: &str, value: serde_json::Value) -> Result<Self> {
        if EntityKey::new(key).is_block() {
            let block: Block = serde_json::from_value(value)?;
            Ok(Entity::Block(block))
        } else {
            let source: Source = serde_json::from_value(value)?;
            Ok(Entity::Source(source))
        }
    }

    /// Serializes the persisted record to a JSON value.
    pub fn to_value(&self) -> Result<serde_json::Value> {
        let value = match self {
            Entity::Source(s) => serde_json::to_value(s)?,
            Entity::Block(b) => serde_json::to_value(b)?,
        };
        Ok(value)
    }

    /// The entity key (path).
    pub fn key(&self) -> &str {
        match self {
            Entity::Source(s) => &s.path,
            Entity::Block(b) => &b.path,
        }
    }

    /// Returns true for the block variant.
    pub fn is_block(&self) -> bool {
        matches!(self, Entity::Block(_))
    }

    /// Character size used by the minimum-size embedding policy.
    pub fn size(&self) -> u64 {
        match self {
            Entity::Source(s) => s.size(),
            Entity::Block(b) => b.length as u64,
        }
    }

    /// Shared runtime flags.
    pub fn flags(&self) -> &EntityFlags {
        match self {
            Entity::Source(s) => &s.flags,
            Entity::Block(b) => &b.flags,
        }
    }

    /// Mutable runtime flags.
    pub fn flags_mut(&mut self) -> &mut EntityFlags {
        match self {
            Entity::Source(s) => &mut s.flags,
            Entity::Block(b) => &mut b.flags,
        }
    }

    /// Per-model embedding map.
    pub fn embeddings(&self) -> &BTreeMap<String, EmbeddingRecord> {
        match self {
            Entity::Source(s) => &s.embeddings,
            Entity::Block(b) => &b.embeddings,
        }
    }

    /// Mutable per-model embedding map.
    pub fn embeddings_mut(&mut self) -> &mut BTreeMap<String, EmbeddingRecord> {
        match self {
            Entity::Source(s) => &mut s.embeddings,
            Entity::Block(b) => &mut b.embeddings,
        }
    }

    /// The stored vector for the given model, if present and non-empty.
    pub fn vec(&self, model_key: &str) -> Option<&[f32]> {
        self.embeddings()
            .get(model_key)
            .filter(|r| r.has_vec())
            .map(|r| r.vec.as_slice())
    }

    /// Stores an embedding record under the given model key and clears the
    /// transient input cache (it must never be persisted, only the vector
    /// survives to disk).
    pub fn set_embedding(&mut self, model_key: &str, record: EmbeddingRecord) {
        self.embeddings_mut().insert(model_key.to_string(), record);
        let flags = self.flags_mut();
        flags.embed_input = None;
        flags.queue_embed = false;
        flags.queue_save = true;
    }

    /// Returns true if this entity should be queued for embedding:
    /// no vector for the active model, size at or above the minimum, not
    /// tombstoned, and no sticky error marker from a prior failed attempt.
    pub fn is_unembedded(&self, model_key: &str, min_chars: usize) -> bool {
        if self.flags().deleted {
            return false;
        }
        if self.size() < min_chars as u64 {
            return false;
        }
        match self.embeddings().get(model_key) {
            Some(rec) => !rec.has_vec() && rec.error.is_none(),
            None => true,
        }
    }

    /// Drops embeddings stored for models other than the active one.
    ///
    /// Run at load time so stale vectors from a previous model
    /// configuration don't linger on disk forever.
    pub fn retain_model(&mut self, model_key: &str) {
        let map = self.embeddings_mut();
        if map.keys().any(|k| k != model_key) {
            map.retain(|k, _| k == model_key);
            self.flags_mut().queue_save = true;
        }
    }

    /// Borrows the inner source record, or errors for a block.
    pub fn as_source(&self) -> Result<&Source> {
        match self {
            Entity::Source(s) => Ok(s),
            Entity::Block(b) => Err(NoteMeshError::parse(
                b.path.clone(),
                "expected a source entity",
            )),
        }
    }

    /// Borrows the inner source record mutably, or errors for a block.
    pub fn as_source_mut(&mut self) -> Result<&mut Source> {
        match self {
            Entity::Source(s) => Ok(s),
            Entity::Block(b) => Err(NoteMeshError::parse(
                b.path.clone(),
                "expected a source entity",
            )),
        }
    }
}
