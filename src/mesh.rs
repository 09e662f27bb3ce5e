//! The `NoteMesh` facade: one handle owning the entity store, the log
//! store, the embedding pipeline, and search.
//!
//! All operations take `&self`; the handle is cheap to clone and safe to
//! share across tasks. Internal std locks are only held inside synchronous
//! sections, never across awaits.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use fs2::FileExt;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::embed::{embed_jobs, EmbedJob, ModelContext};
use crate::entity::{Chunker, Entity, EntityStore, ParsedDoc};
use crate::error::{NoteMeshError, Result};
use crate::fingerprint::{fingerprint, meta_changed};
use crate::notify::{Notice, NoticeSink};
use crate::search::{cos_sim, median_vec, nearest, Connection, QueryFilter, TopK};
use crate::storage::{LocalFs, LogStore, StorageBackend};
use crate::types::EntityKey;

const LOCK_FILE: &str = ".lock";

// ============================================================================
// Reports
// ============================================================================

/// Outcome of loading the persisted index.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Sources materialized.
    pub sources: usize,
    /// Blocks materialized.
    pub blocks: usize,
    /// Malformed log lines dropped during reconciliation.
    pub skipped_lines: usize,
    /// Log files removed because their backing file is gone.
    pub orphans: usize,
    /// Wrong-shaped records dropped during materialization.
    pub corrupt: usize,
}

/// Outcome of scanning vault files for changes.
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Sources queued for re-import.
    pub queued: usize,
    /// Sources whose change turned out to be metadata noise.
    pub unchanged: usize,
    /// Sources tombstoned because their file disappeared.
    pub tombstoned: usize,
    /// Files skipped for exceeding the size ceiling.
    pub skipped_large: usize,
}

/// Outcome of a prune pass.
#[derive(Debug)]
pub enum PruneOutcome {
    /// Stale entities were tombstoned and flushed.
    Pruned {
        /// Sources removed.
        sources: usize,
        /// Blocks removed.
        blocks: usize,
    },
    /// The removal set was large enough to require explicit confirmation;
    /// nothing was changed. Re-run with `confirmed = true` to proceed.
    NeedsConfirmation {
        /// Entities that would be removed.
        would_remove: usize,
        /// Live entities before the prune.
        total: usize,
    },
}

#[derive(Default)]
struct SaveState {
    keys: HashSet<String>,
    last_queued: Option<Instant>,
}

struct Inner {
    config: Config,
    backend: Arc<dyn StorageBackend>,
    logs: LogStore,
    chunker: Arc<dyn Chunker>,
    ctx: ModelContext,
    notices: Arc<dyn NoticeSink>,
    store: RwLock<EntityStore>,
    save: Mutex<SaveState>,
    embed_gate: tokio::sync::Mutex<()>,
    pause: AtomicBool,
    connections_cache: Mutex<HashMap<String, Vec<Connection>>>,
    inbound: RwLock<HashMap<String, Vec<String>>>,
    lock_file: Option<std::fs::File>,
}

/// Shared handle to one note index.
#[derive(Clone)]
pub struct NoteMesh {
    inner: Arc<Inner>,
}

impl NoteMesh {
    /// Opens an index over a vault directory on the local filesystem.
    ///
    /// Takes an exclusive advisory lock on the data directory so two
    /// processes cannot interleave appends into the same log files.
    #[instrument(skip_all, fields(vault = %vault_root.as_ref().display()))]
    pub async fn open(
        vault_root: impl AsRef<Path>,
        config: Config,
        chunker: Arc<dyn Chunker>,
        ctx: ModelContext,
        notices: Arc<dyn NoticeSink>,
    ) -> Result<Self> {
        config.validate()?;
        let root = vault_root.as_ref();
        let data_dir = root.join(&config.data_dir);
        std::fs::create_dir_all(&data_dir)?;
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(data_dir.join(LOCK_FILE))?;
        lock_file.try_lock_exclusive().map_err(|e| {
            NoteMeshError::Lock(format!(
                "data directory {} is locked by another process: {e}",
                data_dir.display()
            ))
        })?;
        info!(data_dir = %data_dir.display(), "index opened");
        let backend: Arc<dyn StorageBackend> = Arc::new(LocalFs::new(root));
        Self::build(backend, Some(lock_file), config, chunker, ctx, notices).await
    }

    /// Opens an index over an arbitrary backend without an advisory lock.
    /// Intended for custom backends and tests; callers own exclusivity.
    pub async fn open_with_backend(
        backend: Arc<dyn StorageBackend>,
        config: Config,
        chunker: Arc<dyn Chunker>,
        ctx: ModelContext,
        notices: Arc<dyn NoticeSink>,
    ) -> Result<Self> {
        config.validate()?;
        Self::build(backend, None, config, chunker, ctx, notices).await
    }

    async fn build(
        backend: Arc<dyn StorageBackend>,
        lock_file: Option<std::fs::File>,
        config: Config,
        chunker: Arc<dyn Chunker>,
        ctx: ModelContext,
        notices: Arc<dyn NoticeSink>,
    ) -> Result<Self> {
        let logs = LogStore::new(backend.clone(), config.data_dir.clone());
        logs.ensure_dir().await?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                backend,
                logs,
                chunker,
                ctx,
                notices,
                store: RwLock::new(EntityStore::new()),
                save: Mutex::new(SaveState::default()),
                embed_gate: tokio::sync::Mutex::new(()),
                pause: AtomicBool::new(false),
                connections_cache: Mutex::new(HashMap::new()),
                inbound: RwLock::new(HashMap::new()),
                lock_file,
            }),
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The active model's key.
    pub fn model_key(&self) -> &str {
        self.inner.ctx.model_key()
    }

    /// Flushes pending saves and releases the advisory lock.
    pub async fn close(&self) -> Result<()> {
        self.flush().await?;
        if let Some(file) = &self.inner.lock_file {
            let _ = fs2::FileExt::unlock(file);
        }
        info!("index closed");
        Ok(())
    }

    // ========================================================================
    // Load
    // ========================================================================

    /// Loads the persisted index: reconciles every log file, drops logs
    /// whose backing file no longer exists, and materializes the rest.
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<LoadReport> {
        let reports = self.inner.logs.reconcile_all().await?;
        let mut out = LoadReport::default();
        let model_key = self.model_key().to_string();

        for report in reports {
            out.skipped_lines += report.skipped;
            let source_key = report
                .entries
                .keys()
                .find(|k| !EntityKey::new(k.as_str()).is_block())
                .cloned();
            let Some(source_key) = source_key else {
                if !report.entries.is_empty() {
                    warn!(path = %report.path.display(), "log has blocks but no source record, leaving file");
                }
                continue;
            };

            if !self.inner.backend.exists(Path::new(&source_key)).await {
                debug!(source = %source_key, "backing file gone, dropping orphaned log");
                self.inner.backend.remove(&report.path).await?;
                out.orphans += 1;
                continue;
            }

            // A wrong-shaped record is dropped rather than aborting the
            // load; the entity rebuilds from vault content on the next
            // scan. An unreadable source record voids its whole file.
            let mut entities = Vec::with_capacity(report.entries.len());
            let mut source_ok = true;
            for (key, value) in report.entries {
                match Entity::from_value(&key, value) {
                    Ok(entity) => entities.push(entity),
                    Err(e) => {
                        let err = NoteMeshError::log_corruption(
                            report.path.display().to_string(),
                            format!("record for '{key}' has the wrong shape: {e}"),
                        );
                        warn!(error = %err, "dropping corrupt record");
                        out.corrupt += 1;
                        if key == source_key {
                            source_ok = false;
                        }
                    }
                }
            }
            if !source_ok {
                warn!(path = %report.path.display(), "source record unreadable, skipping log");
                continue;
            }
            let mut store = self.write_store();
            for mut entity in entities {
                entity.retain_model(&model_key);
                if entity.is_block() {
                    out.blocks += 1;
                } else {
                    out.sources += 1;
                }
                store.insert(entity);
            }
        }

        self.rebuild_inbound_links();
        info!(
            sources = out.sources,
            blocks = out.blocks,
            orphans = out.orphans,
            skipped = out.skipped_lines,
            corrupt = out.corrupt,
            "load complete"
        );
        Ok(out)
    }

    // ========================================================================
    // Scan and Import
    // ========================================================================

    /// Compares the given vault files against stored fingerprints and
    /// queues changed ones for import. A listed path whose backing file
    /// has vanished is tombstoned; sources not listed are left untouched,
    /// so partial scans are safe.
    #[instrument(skip_all, fields(paths = paths.len()))]
    pub async fn scan(&self, paths: &[String]) -> Result<ScanReport> {
        let mut out = ScanReport::default();

        for path in paths {
            // The file can vanish between enumeration and stat; treat that
            // as a delete rather than a scan failure.
            let stat = match self.inner.backend.stat(Path::new(path)).await {
                Ok(stat) => stat,
                Err(e) if e.is_not_found() => {
                    if self.read_store().get(path).is_some() {
                        self.tombstone(path);
                        out.tombstoned += 1;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            if stat.size > self.inner.config.max_source_bytes {
                warn!(path = %path, size = stat.size, "skipping oversized file");
                out.skipped_large += 1;
                continue;
            }

            let last = {
                let store = self.read_store();
                store
                    .get(path)
                    .and_then(|e| e.as_source().ok().and_then(|s| s.last_snapshot().cloned()))
            };
            if !meta_changed(last.as_ref(), &stat, self.inner.config.size_delta_ratio) {
                continue;
            }

            // Metadata tier fired; confirm with the content tier.
            let content = self.inner.backend.read(Path::new(path)).await?;
            let hash = fingerprint(&content);
            let mut store = self.write_store();
            let source = store.source_entry(path);
            match source.last_snapshot_mut() {
                Some(snapshot) if snapshot.hash == hash => {
                    snapshot.refresh_stat(stat);
                    source.flags.queue_save = true;
                    drop(store);
                    self.queue_save_key(path);
                    out.unchanged += 1;
                }
                _ => {
                    source.flags.queue_import = true;
                    out.queued += 1;
                }
            }
        }

        debug!(
            queued = out.queued,
            unchanged = out.unchanged,
            tombstoned = out.tombstoned,
            "scan complete"
        );
        Ok(out)
    }

    /// Parses every source queued for import and updates its block set.
    /// Returns the number of sources imported.
    ///
    /// A source that fails to read or parse stays queued and is retried
    /// on the next cycle; the remaining sources still import.
    #[instrument(skip(self))]
    pub async fn import(&self) -> Result<usize> {
        let queued: Vec<String> = {
            let store = self.read_store();
            store
                .sources()
                .filter(|s| s.flags.queue_import)
                .map(|s| s.path.clone())
                .collect()
        };

        let mut imported = 0;
        for path in queued {
            let stat = match self.inner.backend.stat(Path::new(&path)).await {
                Ok(stat) => stat,
                Err(e) if e.is_not_found() => {
                    self.tombstone(&path);
                    continue;
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "stat failed, source stays queued");
                    continue;
                }
            };
            let content = match self.inner.backend.read(Path::new(&path)).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path, error = %e, "read failed, source stays queued");
                    continue;
                }
            };
            let hash = fingerprint(&content);
            let doc = match self.parse_filtered(&path, &content) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(path = %path, error = %e, "parse failed, source stays queued");
                    continue;
                }
            };

            let affected: Vec<String> = {
                let mut store = self.write_store();
                let tombstoned = store.apply_parse(&path, hash, stat, doc);
                let mut keys: Vec<String> = store
                    .blocks_of(&path)
                    .map(|b| b.path.clone())
                    .collect();
                keys.push(path.clone());
                keys.extend(tombstoned);
                keys
            };
            for key in affected {
                self.queue_save_key(&key);
            }
            imported += 1;
        }

        if imported > 0 {
            self.rebuild_inbound_links();
            self.invalidate_connections();
        }
        Ok(imported)
    }

    /// Runs the chunker and drops blocks under excluded headings.
    fn parse_filtered(&self, path: &str, content: &str) -> Result<ParsedDoc> {
        let mut doc = self.inner.chunker.parse(path, content)?;
        doc.blocks.retain(|b| {
            let key = EntityKey::new(b.path.as_str());
            !self.inner.config.heading_excluded(&key.headings())
        });
        Ok(doc)
    }

    /// Tombstones a source and its blocks, queueing their null fragments.
    pub fn tombstone(&self, source_key: &str) {
        let affected = {
            let mut store = self.write_store();
            store.tombstone_source(source_key)
        };
        for key in &affected {
            self.queue_save_key(key);
        }
        if !affected.is_empty() {
            self.invalidate_connections();
        }
    }

    // ========================================================================
    // Save Queue
    // ========================================================================

    /// Queues an entity key for persistence on the next flush.
    pub fn queue_save_key(&self, key: &str) {
        let mut save = self.inner.save.lock().unwrap_or_else(|e| e.into_inner());
        save.keys.insert(key.to_string());
        save.last_queued = Some(Instant::now());
    }

    /// Flushes only when the debounce window has elapsed since the last
    /// queue activity. Returns the number of fragments written.
    pub async fn flush_if_due(&self) -> Result<usize> {
        let due = {
            let save = self.inner.save.lock().unwrap_or_else(|e| e.into_inner());
            match save.last_queued {
                Some(last) if !save.keys.is_empty() => {
                    last.elapsed() >= self.inner.config.save_debounce
                }
                _ => false,
            }
        };
        if due {
            self.flush().await
        } else {
            Ok(0)
        }
    }

    /// Writes all queued fragments, grouped per source into one append
    /// each. A tombstoned source removes its whole log file instead.
    /// Every group is attempted; a group whose write fails re-queues its
    /// keys for the next cycle, and the first error is returned after the
    /// rest have been processed. Returns fragments written.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> Result<usize> {
        let keys: Vec<String> = {
            let mut save = self.inner.save.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut save.keys).into_iter().collect()
        };
        if keys.is_empty() {
            return Ok(0);
        }

        // Group queued keys by owning source; source key first so its
        // fragment leads the batch.
        let mut groups: HashMap<String, Vec<String>> = HashMap::new();
        for key in keys {
            let source = EntityKey::new(key.as_str()).source_key().to_string();
            groups.entry(source).or_default().push(key);
        }
        for group in groups.values_mut() {
            group.sort();
        }

        let mut written = 0;
        let mut first_err: Option<NoteMeshError> = None;
        for (source_key, group) in groups {
            let plan = self.plan_group(&source_key, &group);
            match plan {
                GroupPlan::RemoveLog { purge } => {
                    if let Err(e) = self.inner.logs.remove_log(&source_key).await {
                        warn!(source = %source_key, error = %e, "log removal failed, re-queueing");
                        self.requeue(&group);
                        first_err.get_or_insert(e);
                        continue;
                    }
                    let mut store = self.write_store();
                    for key in purge {
                        store.remove(&key);
                    }
                }
                GroupPlan::Append { fragments, purge } => {
                    if fragments.is_empty() {
                        continue;
                    }
                    if let Err(e) = self
                        .inner
                        .logs
                        .append_fragments(&source_key, &fragments)
                        .await
                    {
                        warn!(source = %source_key, error = %e, "append failed, re-queueing");
                        self.requeue(&group);
                        first_err.get_or_insert(e);
                        continue;
                    }
                    written += fragments.len();
                    let mut store = self.write_store();
                    for key in &group {
                        if let Some(entity) = store.get_mut(key) {
                            entity.flags_mut().queue_save = false;
                        }
                    }
                    for key in purge {
                        store.remove(&key);
                    }
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }
        debug!(written, "flush complete");
        Ok(written)
    }

    fn plan_group(&self, source_key: &str, group: &[String]) -> GroupPlan {
        let store = self.read_store();
        let source_deleted = store
            .get(source_key)
            .map(|e| e.flags().deleted)
            .unwrap_or(false);
        if source_deleted {
            // The whole subtree goes with the log file.
            let purge = group.to_vec();
            return GroupPlan::RemoveLog { purge };
        }
        let mut fragments: Vec<(String, Option<Value>)> = Vec::with_capacity(group.len());
        let mut purge = Vec::new();
        for key in group {
            match store.get(key) {
                Some(entity) if entity.flags().deleted => {
                    fragments.push((key.clone(), None));
                    purge.push(key.clone());
                }
                Some(entity) => match entity.to_value() {
                    Ok(value) => fragments.push((key.clone(), Some(value))),
                    Err(e) => warn!(key = %key, error = %e, "unserializable entity skipped"),
                },
                // Queued then physically removed; nothing to persist.
                None => {}
            }
        }
        GroupPlan::Append { fragments, purge }
    }

    fn requeue(&self, keys: &[String]) {
        let mut save = self.inner.save.lock().unwrap_or_else(|e| e.into_inner());
        for key in keys {
            save.keys.insert(key.clone());
        }
        save.last_queued = Some(Instant::now());
    }

    // ========================================================================
    // Embedding
    // ========================================================================

    /// Requests that the running embed pass stop at the next batch
    /// boundary.
    pub fn pause_embedding(&self) {
        self.inner.pause.store(true, Ordering::SeqCst);
    }

    /// Clears a pause request.
    pub fn resume_embedding(&self) {
        self.inner.pause.store(false, Ordering::SeqCst);
    }

    /// Embeds every queued entity for the active model, in batches sized by
    /// the model. Single-flight: a second concurrent call returns
    /// immediately with 0. Returns the number of entities embedded.
    #[instrument(skip(self))]
    pub async fn embed_pending(&self) -> Result<usize> {
        let Ok(_gate) = self.inner.embed_gate.try_lock() else {
            debug!("embed pass already running");
            return Ok(0);
        };

        let model = self.inner.ctx.model.clone();
        let model_key = model.model_key().to_string();
        let pending: Vec<String> = {
            let store = self.read_store();
            store.unembedded_keys(&model_key, self.inner.config.min_chars)
        };
        let total = pending.len();
        if total == 0 {
            return Ok(0);
        }
        info!(total, model = %model_key, "embedding pass started");

        let jobs = self.resolve_inputs(&pending).await?;
        let batch_size = model.batch_size().max(1);
        let started = Instant::now();
        let mut done = 0usize;
        let mut tokens = 0u64;
        let mut batches = 0usize;

        for batch in jobs.chunks(batch_size) {
            if self.inner.pause.load(Ordering::SeqCst) {
                info!(done, total, "embedding paused");
                self.flush().await?;
                self.inner.notices.notify(Notice::EmbedPaused { done, total });
                return Ok(done);
            }

            let results = embed_jobs(model.as_ref(), batch).await;
            {
                let mut store = self.write_store();
                for (key, record) in results {
                    tokens += record.tokens as u64;
                    if let Some(entity) = store.get_mut(&key) {
                        entity.set_embedding(&model_key, record);
                    }
                }
            }
            for job in batch {
                self.queue_save_key(&job.key);
            }
            done += batch.len();
            batches += 1;

            let tokens_per_sec = tokens as f64 / started.elapsed().as_secs_f64().max(1e-6);
            self.inner.notices.notify(Notice::EmbedProgress {
                done,
                total,
                tokens_per_sec,
            });
            if batches % self.inner.config.flush_every_batches == 0 {
                self.flush().await?;
            }
        }

        self.flush().await?;
        self.invalidate_connections();
        self.inner.notices.notify(Notice::EmbedComplete { total: done });
        info!(done, tokens, "embedding pass complete");
        Ok(done)
    }

    /// Resolves embed inputs for the given keys: cached parse slices when
    /// present, re-read from the vault otherwise.
    async fn resolve_inputs(&self, keys: &[String]) -> Result<Vec<EmbedJob>> {
        let max_chars = self.inner.ctx.model.max_tokens() as usize * 4;

        // Which sources need a content read.
        let (cached, need_read): (Vec<(String, String)>, Vec<String>) = {
            let store = self.read_store();
            let mut cached = Vec::new();
            let mut need: HashSet<String> = HashSet::new();
            for key in keys {
                let entity_key = EntityKey::new(key.as_str());
                match store.get(key).and_then(|e| e.flags().embed_input.clone()) {
                    Some(text) => cached.push((key.clone(), text)),
                    None => {
                        need.insert(entity_key.source_key().to_string());
                    }
                }
            }
            (cached, need.into_iter().collect())
        };

        let mut contents: HashMap<String, String> = HashMap::new();
        for source in need_read {
            match self.inner.backend.read(Path::new(&source)).await {
                Ok(content) => {
                    contents.insert(source, content);
                }
                Err(e) if e.is_not_found() => {
                    warn!(source = %source, "backing file gone, skipping embed inputs");
                }
                Err(e) => return Err(e),
            }
        }

        let cached: HashMap<String, String> = cached.into_iter().collect();
        let store = self.read_store();
        let mut jobs = Vec::with_capacity(keys.len());
        for key in keys {
            let entity_key = EntityKey::new(key.as_str());
            let breadcrumbs = entity_key.breadcrumbs();
            let body = if let Some(text) = cached.get(key) {
                Some(text.clone())
            } else if let Some(content) = contents.get(entity_key.source_key()) {
                if entity_key.is_block() {
                    store
                        .get(key)
                        .and_then(|e| match e {
                            Entity::Block(b) => Some(slice_lines(content, b.lines.start, b.lines.end)),
                            _ => None,
                        })
                } else {
                    Some(clamp_chars(content, max_chars))
                }
            } else {
                None
            };
            if let Some(body) = body {
                jobs.push(EmbedJob {
                    key: key.clone(),
                    input: format!("{breadcrumbs}\n{body}"),
                });
            }
        }
        Ok(jobs)
    }

    // ========================================================================
    // Prune
    // ========================================================================

    /// Tombstones sources whose backing file is gone and blocks no longer
    /// in their source's current block set, then flushes. When the removal
    /// set exceeds the configured ratio of live entities, nothing changes
    /// until called again with `confirmed`.
    #[instrument(skip(self))]
    pub async fn prune(&self, confirmed: bool) -> Result<PruneOutcome> {
        let candidates: Vec<String> = {
            let store = self.read_store();
            store.sources().map(|s| s.path.clone()).collect()
        };
        let mut gone_sources = Vec::new();
        for path in candidates {
            if !self.inner.backend.exists(Path::new(&path)).await {
                gone_sources.push(path);
            }
        }

        let (stale_blocks, total) = {
            let store = self.read_store();
            let mut stale = Vec::new();
            for source in store.sources() {
                let live = source
                    .last_snapshot()
                    .map(|s| s.blocks.clone())
                    .unwrap_or_default();
                for block in store.blocks_of(&source.path) {
                    if !live.contains(&block.path) {
                        stale.push(block.path.clone());
                    }
                }
            }
            (stale, store.len())
        };

        let would_remove = gone_sources.len() + stale_blocks.len();
        if would_remove == 0 {
            return Ok(PruneOutcome::Pruned {
                sources: 0,
                blocks: 0,
            });
        }
        let ratio = would_remove as f64 / total.max(1) as f64;
        if ratio > self.inner.config.prune_confirm_ratio && !confirmed {
            warn!(would_remove, total, "prune needs confirmation");
            return Ok(PruneOutcome::NeedsConfirmation {
                would_remove,
                total,
            });
        }

        let sources = gone_sources.len();
        let blocks = stale_blocks.len();
        for path in gone_sources {
            self.tombstone(&path);
        }
        {
            let mut store = self.write_store();
            for key in &stale_blocks {
                if let Some(entity) = store.get_mut(key) {
                    entity.flags_mut().deleted = true;
                    entity.flags_mut().queue_save = true;
                }
            }
        }
        for key in &stale_blocks {
            self.queue_save_key(key);
        }
        self.flush().await?;
        self.rebuild_inbound_links();
        self.invalidate_connections();
        info!(sources, blocks, "prune complete");
        Ok(PruneOutcome::Pruned { sources, blocks })
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// Nearest entities to an arbitrary query vector.
    pub fn nearest(&self, query: &[f32], filter: &QueryFilter) -> Vec<Connection> {
        let store = self.read_store();
        nearest(&store, self.model_key(), query, filter)
    }

    /// Entities most related to the given entity.
    ///
    /// For a source query the results are its nearest blocks and sources,
    /// with block scores blended with their parent source's own similarity.
    /// The query entity's subtree is always excluded; its link partners
    /// are excluded when the filter requests it. Results are cached until
    /// the next import, embed pass, or prune.
    pub fn find_connections(&self, key: &str, filter: &QueryFilter) -> Result<Vec<Connection>> {
        let cache_key = format!("{key}{}", serde_json::to_string(filter)?);
        {
            let cache = self
                .inner
                .connections_cache
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(hit) = cache.get(&cache_key) {
                return Ok(hit.clone());
            }
        }

        let results = self.compute_connections(key, filter)?;
        let mut cache = self
            .inner
            .connections_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        cache.insert(cache_key, results.clone());
        Ok(results)
    }

    fn compute_connections(&self, key: &str, filter: &QueryFilter) -> Result<Vec<Connection>> {
        let model_key = self.model_key().to_string();
        let store = self.read_store();
        let entity_key = EntityKey::new(key);
        let source_key = entity_key.source_key().to_string();

        let query = self
            .query_vec(&store, key, &model_key)
            .ok_or_else(|| NoteMeshError::model(format!("no embedding available for {key}")))?;

        // The query's own subtree is always excluded; link partners only
        // when the filter asks for it.
        let mut exclude_prefixes = filter.exclude_key_starts_with.clone();
        exclude_prefixes.push(source_key.clone());
        if filter.exclude_outlinks {
            if let Some(Entity::Source(source)) = store.get(&source_key) {
                exclude_prefixes.extend(source.outlinks.iter().cloned());
            }
        }
        if filter.exclude_inlinks {
            let inbound = self.inner.inbound.read().unwrap_or_else(|e| e.into_inner());
            if let Some(links) = inbound.get(&source_key) {
                exclude_prefixes.extend(links.iter().cloned());
            }
        }
        let scoped = QueryFilter {
            exclude_key_starts_with: exclude_prefixes,
            ..filter.clone()
        };

        let mut acc = TopK::new(scoped.limit);
        let mut parent_sims: HashMap<String, Option<f32>> = HashMap::new();
        for entity in store.iter() {
            if entity.flags().deleted || !scoped.matches(entity.key()) {
                continue;
            }
            let Some(vec) = entity.vec(&model_key) else {
                continue;
            };
            let mut score = cos_sim(&query, vec);
            if entity.is_block() {
                let parent = EntityKey::new(entity.key()).source_key().to_string();
                let parent_sim = *parent_sims.entry(parent.clone()).or_insert_with(|| {
                    self.query_vec(&store, &parent, &model_key)
                        .map(|pv| cos_sim(&query, &pv))
                });
                if let Some(parent_sim) = parent_sim {
                    score = (score + parent_sim) / 2.0;
                }
            }
            acc.push(Connection {
                key: entity.key().to_string(),
                score,
            });
        }
        Ok(acc.into_sorted())
    }

    /// The effective vector for an entity: its own embedding, or for a
    /// source without one, the per-dimension median of its blocks' vectors.
    fn query_vec(&self, store: &EntityStore, key: &str, model_key: &str) -> Option<Vec<f32>> {
        if let Some(vec) = store.get(key).and_then(|e| e.vec(model_key)) {
            return Some(vec.to_vec());
        }
        if EntityKey::new(key).is_block() {
            return None;
        }
        let block_vecs: Vec<&[f32]> = store
            .blocks_of(key)
            .filter_map(|b| {
                b.embeddings
                    .get(model_key)
                    .filter(|r| r.has_vec())
                    .map(|r| r.vec.as_slice())
            })
            .collect();
        median_vec(&block_vecs)
    }

    /// Sources that link to the given source.
    pub fn inbound_links(&self, source_key: &str) -> Vec<String> {
        let inbound = self.inner.inbound.read().unwrap_or_else(|e| e.into_inner());
        inbound.get(source_key).cloned().unwrap_or_default()
    }

    /// Number of live entities in the store.
    pub fn len(&self) -> usize {
        self.read_store().len()
    }

    /// True when the store holds no live entities.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn read_store(&self) -> std::sync::RwLockReadGuard<'_, EntityStore> {
        self.inner.store.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_store(&self) -> std::sync::RwLockWriteGuard<'_, EntityStore> {
        self.inner.store.write().unwrap_or_else(|e| e.into_inner())
    }

    fn rebuild_inbound_links(&self) {
        let map = {
            let store = self.read_store();
            let mut map: HashMap<String, Vec<String>> = HashMap::new();
            for source in store.sources() {
                for target in &source.outlinks {
                    map.entry(target.clone()).or_default().push(source.path.clone());
                }
            }
            for links in map.values_mut() {
                links.sort();
                links.dedup();
            }
            map
        };
        *self.inner.inbound.write().unwrap_or_else(|e| e.into_inner()) = map;
    }

    fn invalidate_connections(&self) {
        self.inner
            .connections_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

enum GroupPlan {
    RemoveLog {
        purge: Vec<String>,
    },
    Append {
        fragments: Vec<(String, Option<Value>)>,
        purge: Vec<String>,
    },
}

/// Inclusive line slice of `content`, clamped to its bounds.
fn slice_lines(content: &str, start: u32, end: u32) -> String {
    content
        .lines()
        .skip(start as usize)
        .take((end.saturating_sub(start) as usize) + 1)
        .collect::<Vec<_>>()
        .join("\n")
}

/// First `max_chars` characters of `content`, on a char boundary.
fn clamp_chars(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        content.to_string()
    } else {
        content.chars().take(max_chars).collect()
    }
}
