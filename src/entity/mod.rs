//! In-memory entity store and the content-parsing seam.
//!
//! The store is a flat map from hierarchical key to entity; block membership
//! is tracked on the owning source's current fingerprint snapshot rather
//! than in a second index.

mod types;

pub use types::{Block, Entity, EntityFlags, Source};

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::fingerprint::Snapshot;
use crate::types::{EntityKey, FileStat, LineSpan};

// ============================================================================
// Chunker Seam
// ============================================================================

/// One parsed sub-document slice.
#[derive(Clone, Debug)]
pub struct ParsedBlock {
    /// Full hierarchical key (source path + heading chain).
    pub path: String,
    /// Line range within the source content.
    pub lines: LineSpan,
    /// Character length of the slice.
    pub length: usize,
    /// The slice text, used as embed input.
    pub text: String,
}

/// Result of parsing one source document.
#[derive(Clone, Debug, Default)]
pub struct ParsedDoc {
    /// Sub-document slices in document order.
    pub blocks: Vec<ParsedBlock>,
    /// Link targets found in the content.
    pub outlinks: Vec<String>,
}

/// Splits raw document content into addressable blocks.
///
/// Implementations decide the block grammar; the store only cares about
/// keys, spans, and lengths.
pub trait Chunker: Send + Sync {
    /// Parses `content` of the document at `path` into blocks and outlinks.
    fn parse(&self, path: &str, content: &str) -> crate::error::Result<ParsedDoc>;
}

// ============================================================================
// Entity Store
// ============================================================================

/// Flat keyed store of all sources and blocks.
#[derive(Debug, Default)]
pub struct EntityStore {
    items: HashMap<String, Entity>,
}

impl EntityStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-tombstoned) entities.
    pub fn len(&self) -> usize {
        self.items.values().filter(|e| !e.flags().deleted).count()
    }

    /// True when no live entities exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up an entity by key.
    pub fn get(&self, key: &str) -> Option<&Entity> {
        self.items.get(key)
    }

    /// Looks up an entity mutably by key.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Entity> {
        self.items.get_mut(key)
    }

    /// Inserts a materialized entity, replacing any prior record.
    pub fn insert(&mut self, entity: Entity) {
        self.items.insert(entity.key().to_string(), entity);
    }

    /// Physically removes an entity.
    pub fn remove(&mut self, key: &str) -> Option<Entity> {
        self.items.remove(key)
    }

    /// Iterates all entities, tombstoned included.
    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.items.values()
    }

    /// Iterates all entities mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Entity> {
        self.items.values_mut()
    }

    /// All keys currently present, tombstoned included.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }

    /// Live source entities.
    pub fn sources(&self) -> impl Iterator<Item = &Source> {
        self.items.values().filter_map(|e| match e {
            Entity::Source(s) if !s.flags.deleted => Some(s),
            _ => None,
        })
    }

    /// Live blocks belonging to the given source.
    pub fn blocks_of<'a>(&'a self, source_key: &'a str) -> impl Iterator<Item = &'a Block> + 'a {
        self.items.values().filter_map(move |e| match e {
            Entity::Block(b)
                if !b.flags.deleted
                    && EntityKey::new(&b.path).source_key() == source_key =>
            {
                Some(b)
            }
            _ => None,
        })
    }

    /// Keys of all entities needing an embedding for `model_key`.
    ///
    /// The pending set is derived from queue flags on each pass rather
    /// than held as an arrival-ordered queue, so keys come back in sorted
    /// key order. Every pending entity is still visited exactly once per
    /// pass, and the order is stable across runs.
    pub fn unembedded_keys(&self, model_key: &str, min_chars: usize) -> Vec<String> {
        let mut keys: Vec<String> = self
            .items
            .values()
            .filter(|e| e.is_unembedded(model_key, min_chars))
            .map(|e| e.key().to_string())
            .collect();
        keys.sort();
        keys
    }

    /// Returns the source record for `key`, creating an empty one when
    /// absent (first sighting of a file).
    pub fn source_entry(&mut self, key: &str) -> &mut Source {
        let entity = self
            .items
            .entry(key.to_string())
            .or_insert_with(|| Entity::Source(Source::new(key)));
        match entity {
            Entity::Source(s) => s,
            // A block under a source-shaped key can't be inserted above.
            Entity::Block(_) => unreachable!("source key mapped to block"),
        }
    }

    /// Applies a parse result to a source: pushes a fresh snapshot, clears
    /// the source's embeddings, upserts all parsed blocks, and tombstones
    /// blocks that disappeared.
    ///
    /// Block embeddings survive when the block's character length is
    /// unchanged; a changed length clears them and re-queues embedding.
    /// Returns the keys of newly tombstoned blocks.
    pub fn apply_parse(
        &mut self,
        key: &str,
        hash: String,
        stat: FileStat,
        doc: ParsedDoc,
    ) -> Vec<String> {
        let block_keys: BTreeSet<String> = doc.blocks.iter().map(|b| b.path.clone()).collect();
        let previous: BTreeSet<String> = {
            let source = self.source_entry(key);
            let prior = source
                .last_snapshot()
                .map(|s| s.blocks.clone())
                .unwrap_or_default();
            let mut snapshot = Snapshot::new(hash, stat);
            snapshot.blocks = block_keys.clone();
            source.history.push(snapshot);
            source.embeddings.clear();
            source.outlinks = doc.outlinks;
            source.flags.queue_embed = true;
            source.flags.queue_save = true;
            source.flags.queue_import = false;
            source.flags.deleted = false;
            prior
        };

        for parsed in doc.blocks {
            self.upsert_block(parsed);
        }

        let mut tombstoned = Vec::new();
        for stale in previous.difference(&block_keys) {
            if let Some(entity) = self.items.get_mut(stale) {
                if !entity.flags().deleted {
                    entity.flags_mut().deleted = true;
                    entity.flags_mut().queue_save = true;
                    tombstoned.push(stale.clone());
                }
            }
        }
        if !tombstoned.is_empty() {
            debug!(source = key, count = tombstoned.len(), "tombstoned stale blocks");
        }
        tombstoned
    }

    fn upsert_block(&mut self, parsed: ParsedBlock) {
        match self.items.get_mut(&parsed.path) {
            Some(Entity::Block(block)) => {
                let unchanged = block.length == parsed.length && !block.flags.deleted;
                block.lines = parsed.lines;
                block.flags.deleted = false;
                block.flags.queue_save = true;
                if !unchanged {
                    block.length = parsed.length;
                    block.embeddings.clear();
                    block.flags.queue_embed = true;
                }
                block.flags.embed_input = Some(parsed.text);
            }
            _ => {
                let mut block = Block::new(parsed.path, parsed.lines, parsed.length);
                block.flags.queue_embed = true;
                block.flags.queue_save = true;
                block.flags.embed_input = Some(parsed.text);
                self.items.insert(block.path.clone(), Entity::Block(block));
            }
        }
    }

    /// Tombstones a source and all of its live blocks. Returns the affected
    /// keys (source first) so the caller can queue their null fragments.
    pub fn tombstone_source(&mut self, key: &str) -> Vec<String> {
        let mut affected = Vec::new();
        let child_keys: Vec<String> = self
            .blocks_of(key)
            .map(|b| b.path.clone())
            .collect();
        if let Some(entity) = self.items.get_mut(key) {
            if !entity.flags().deleted {
                entity.flags_mut().deleted = true;
                entity.flags_mut().queue_save = true;
                affected.push(key.to_string());
            }
        }
        for child in child_keys {
            if let Some(entity) = self.items.get_mut(&child) {
                entity.flags_mut().deleted = true;
                entity.flags_mut().queue_save = true;
                affected.push(child);
            }
        }
        affected
    }

    /// Drops embeddings for models other than `model_key` across the whole
    /// store; run once after load.
    pub fn retain_active_model(&mut self, model_key: &str) {
        for entity in self.items.values_mut() {
            entity.retain_model(model_key);
        }
    }

    /// Physically removes a source and its blocks without queueing any
    /// fragments; used when the whole log file is being deleted.
    pub fn purge_source(&mut self, key: &str) {
        let child_keys: Vec<String> = self
            .items
            .keys()
            .filter(|k| {
                let k = EntityKey::new(k.as_str());
                k.is_block() && k.source_key() == key
            })
            .cloned()
            .collect();
        self.items.remove(key);
        for child in child_keys {
            self.items.remove(&child);
        }
    }
}
