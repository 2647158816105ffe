//! Concurrent owner of the vector index.
//!
//! One `tokio::sync::Mutex` guards the index. Public methods take the lock
//! once and hand the guarded state to `*_locked` helpers; they never call
//! each other. Database transactions are opened while the lock is held and
//! never the other way round.

use super::files::{Bundle, IndexFiles};
use super::vector::{IndexError, Sidecar, VectorIndex};
use crate::config::{Config, PersistencePolicy};
use crate::error::{Error, Result};
use crate::meta::{self, MetaDb};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Settings the manager needs; the dimension comes from the live embedder
#[derive(Debug, Clone)]
pub struct IndexManagerOptions {
    pub model_key: String,
    pub dimension: usize,
    pub persistence: PersistencePolicy,
    pub flush_interval: Duration,
    pub tombstone_threshold: f64,
    pub max_import_bytes: u64,
}

impl IndexManagerOptions {
    pub fn new(config: &Config, dimension: usize) -> Self {
        Self {
            model_key: config.embedding.model_key(),
            dimension,
            persistence: config.index.persistence,
            flush_interval: config.index.flush_interval(),
            tombstone_threshold: config.index.tombstone_threshold,
            max_import_bytes: config.index.max_import_bytes,
        }
    }
}

/// Where the in-memory index came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoverySource {
    /// No artifacts and nothing to rebuild
    Fresh,
    Primary,
    Backup,
    /// Built from the relational store
    Rebuild,
    /// Installed from an imported bundle
    Import,
    /// Vector search is off until a rebuild succeeds
    Disabled,
}

impl std::fmt::Display for RecoverySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecoverySource::Fresh => "fresh",
            RecoverySource::Primary => "primary",
            RecoverySource::Backup => "backup",
            RecoverySource::Rebuild => "rebuild",
            RecoverySource::Import => "import",
            RecoverySource::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub source: RecoverySource,
    /// A loaded index disagreed with the store and was rebuilt
    pub reconciled: bool,
    pub vector_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub vector_count: usize,
    pub purged_metadata: u64,
    pub purged_documents: u64,
    pub elapsed_ms: u64,
    /// False when the rebuilt index is only in memory
    pub persisted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub model_key: String,
    pub index_count: usize,
    pub store_count: usize,
    pub index_signature: String,
    pub store_signature: String,
    pub consistent: bool,
}

/// Result of handing a worker's vector to the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The row changed or was deleted while it was being embedded
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub available: bool,
    pub disabled_reason: Option<String>,
    pub vector_count: usize,
    pub slot_count: usize,
    pub tombstone_count: usize,
    pub tombstone_ratio: f64,
    pub tombstone_threshold: f64,
    pub rebuild_needed: bool,
    pub dimension: usize,
    pub model_key: String,
    pub persistence: String,
    pub dirty: bool,
    pub generation: u64,
    pub recovery: RecoverySource,
    pub reconciled: bool,
    pub rebuilds: u64,
    /// Why the primary or backup artifacts could not be loaded at open
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub load_errors: Vec<String>,
}

impl IndexStatus {
    /// Status for a process that never opened the index
    pub fn unavailable(config: &Config, reason: String) -> Self {
        Self {
            available: false,
            disabled_reason: Some(reason),
            vector_count: 0,
            slot_count: 0,
            tombstone_count: 0,
            tombstone_ratio: 0.0,
            tombstone_threshold: config.index.tombstone_threshold,
            rebuild_needed: false,
            dimension: 0,
            model_key: config.embedding.model_key(),
            persistence: config.index.persistence.to_string(),
            dirty: false,
            generation: 0,
            recovery: RecoverySource::Disabled,
            reconciled: false,
            rebuilds: 0,
            load_errors: Vec::new(),
        }
    }
}

struct IndexState {
    index: Option<VectorIndex>,
    disabled_reason: Option<String>,
    dirty: bool,
    generation: u64,
    recovery: RecoveryReport,
    rebuilds: u64,
    load_errors: Vec<String>,
}

pub struct IndexManager {
    db: MetaDb,
    files: IndexFiles,
    options: IndexManagerOptions,
    state: Mutex<IndexState>,
}

/// BLAKE3 over sorted ids, one per line
fn id_signature(mut ids: Vec<String>) -> String {
    ids.sort();
    let mut hasher = blake3::Hasher::new();
    for id in &ids {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().to_hex().to_string()
}

impl IndexManager {
    /// Open the index, recovering it if needed.
    ///
    /// Order: primary, backup, rebuild from the store, disabled. A loaded
    /// index whose model key or dimension differs from `options` is an
    /// error rather than a recovery case.
    pub async fn open(db: MetaDb, files: IndexFiles, options: IndexManagerOptions) -> Result<Self> {
        if options.dimension == 0 {
            return Err(Error::Config("embedding dimension must be positive".to_string()));
        }

        let manager = Self {
            db,
            files,
            options,
            state: Mutex::new(IndexState {
                index: None,
                disabled_reason: Some("not loaded".to_string()),
                dirty: false,
                generation: 0,
                recovery: RecoveryReport {
                    source: RecoverySource::Disabled,
                    reconciled: false,
                    vector_count: 0,
                },
                rebuilds: 0,
                load_errors: Vec::new(),
            }),
        };

        {
            let mut state = manager.state.lock().await;
            let report = manager.recover_locked(&mut state).await?;
            info!(
                source = %report.source,
                reconciled = report.reconciled,
                vectors = report.vector_count,
                "Vector index ready"
            );
            state.recovery = report;
        }

        Ok(manager)
    }

    pub fn options(&self) -> &IndexManagerOptions {
        &self.options
    }

    pub fn files(&self) -> &IndexFiles {
        &self.files
    }

    fn check_sidecar(&self, sidecar: &Sidecar) -> Result<()> {
        if sidecar.model_key != self.options.model_key {
            return Err(Error::ConfigMismatch(format!(
                "index was built with model key '{}' but the embedder is '{}'; run 'memoria reindex'",
                sidecar.model_key, self.options.model_key
            )));
        }
        if sidecar.dimension != self.options.dimension {
            return Err(Error::ConfigMismatch(format!(
                "index dimension is {} but the embedder produces {}",
                sidecar.dimension, self.options.dimension
            )));
        }
        Ok(())
    }

    fn install_locked(&self, state: &mut IndexState, index: VectorIndex, generation: u64) {
        state.index = Some(index);
        state.disabled_reason = None;
        state.generation = state.generation.max(generation);
        state.dirty = false;
    }

    fn disable_locked(&self, state: &mut IndexState, reason: String) {
        error!(reason = %reason, "Vector search disabled");
        state.index = None;
        state.disabled_reason = Some(reason);
    }

    /// With no live embeddings under the configured key, an error if the
    /// index or the queue still claims vectors exist.
    async fn foreign_key_mismatch(&self, index_len: usize) -> Result<Option<Error>> {
        let embedded = self.db.embedded_document_count().await?;
        if index_len == 0 && embedded == 0 {
            return Ok(None);
        }
        let other_keys: Vec<String> = self
            .db
            .embedding_model_keys()
            .await?
            .into_iter()
            .filter(|(key, _)| key != &self.options.model_key)
            .map(|(key, count)| format!("{} ({} rows)", key, count))
            .collect();
        if other_keys.is_empty() && embedded == 0 {
            return Ok(None);
        }

        let found = if other_keys.is_empty() {
            "no embeddings under any key".to_string()
        } else {
            other_keys.join(", ")
        };
        Ok(Some(Error::ConfigMismatch(format!(
            "store has no embeddings under '{}' but the index holds {} vectors and {} documents are marked embedded; found {}; run 'memoria reindex'",
            self.options.model_key, index_len, embedded, found
        ))))
    }

    async fn recover_locked(&self, state: &mut IndexState) -> Result<RecoveryReport> {
        if !self.files.any_exist() {
            let store_ids = self.db.live_embedding_ids(&self.options.model_key).await?;
            if store_ids.is_empty() {
                if let Some(mismatch) = self.foreign_key_mismatch(0).await? {
                    return Err(mismatch);
                }
                self.install_locked(state, VectorIndex::new(self.options.dimension), 0);
                return Ok(RecoveryReport {
                    source: RecoverySource::Fresh,
                    reconciled: false,
                    vector_count: 0,
                });
            }
            warn!(
                stored = store_ids.len(),
                "No index files but the store has embeddings, rebuilding"
            );
            return Ok(self.rebuild_or_disable_locked(state, false).await);
        }

        let loaded = match self.files.load_primary() {
            Ok((index, sidecar)) => {
                self.check_sidecar(&sidecar)?;
                Some((index, sidecar, RecoverySource::Primary))
            }
            Err(primary_err) => {
                let primary_err = primary_err.into_load_error();
                warn!(error = %primary_err, "Primary index unusable, trying backup");
                state.load_errors.push(format!("primary: {}", primary_err));
                match self.files.restore_backup() {
                    Ok((index, sidecar)) => {
                        self.check_sidecar(&sidecar)?;
                        warn!(generation = sidecar.generation, "Restored index from backup");
                        Some((index, sidecar, RecoverySource::Backup))
                    }
                    Err(backup_err) => {
                        let backup_err = backup_err.into_load_error();
                        warn!(error = %backup_err, "Backup index unusable, rebuilding from store");
                        state.load_errors.push(format!("backup: {}", backup_err));
                        None
                    }
                }
            }
        };

        let Some((index, sidecar, source)) = loaded else {
            return Ok(self.rebuild_or_disable_locked(state, false).await);
        };

        self.install_locked(state, index, sidecar.generation);
        match self.matches_store_locked(state).await {
            Ok(true) => Ok(RecoveryReport {
                source,
                reconciled: false,
                vector_count: state.index.as_ref().map_or(0, |i| i.len()),
            }),
            Ok(false) => {
                warn!(source = %source, "Loaded index disagrees with the store, rebuilding");
                Ok(self.rebuild_or_disable_locked(state, true).await)
            }
            Err(e) => {
                warn!(error = %e, "Could not compare index with store, keeping loaded index");
                Ok(RecoveryReport {
                    source,
                    reconciled: false,
                    vector_count: state.index.as_ref().map_or(0, |i| i.len()),
                })
            }
        }
    }

    async fn rebuild_or_disable_locked(
        &self,
        state: &mut IndexState,
        reconciled: bool,
    ) -> RecoveryReport {
        match self.rebuild_locked(state).await {
            Ok(report) => RecoveryReport {
                source: RecoverySource::Rebuild,
                reconciled,
                vector_count: report.vector_count,
            },
            Err(e) => {
                self.disable_locked(state, format!("rebuild failed: {}", e));
                RecoveryReport {
                    source: RecoverySource::Disabled,
                    reconciled,
                    vector_count: 0,
                }
            }
        }
    }

    async fn matches_store_locked(&self, state: &IndexState) -> Result<bool> {
        let Some(index) = state.index.as_ref() else {
            return Ok(false);
        };
        let store_ids = self.db.live_embedding_ids(&self.options.model_key).await?;
        Ok(store_ids.len() == index.len() && id_signature(store_ids) == id_signature(index.live_ids()))
    }

    async fn rebuild_locked(&self, state: &mut IndexState) -> Result<RebuildReport> {
        let started = Instant::now();
        let rows = self.db.live_embeddings(&self.options.model_key).await?;

        if let Some((id, vector)) = rows.iter().find(|(_, v)| v.len() != self.options.dimension) {
            return Err(Error::ConfigMismatch(format!(
                "stored embedding for {} has dimension {} under key '{}', embedder produces {}",
                id,
                vector.len(),
                self.options.model_key,
                self.options.dimension
            )));
        }

        let (ids, vectors): (Vec<String>, Vec<Vec<f32>>) = rows.into_iter().unzip();
        let mut index = VectorIndex::new(self.options.dimension);
        index.add(&ids, &vectors)?;

        let mut tx = self.db.begin().await?;
        let purged = meta::purge_tombstones(&mut tx).await?;
        tx.commit().await?;

        let vector_count = index.len();
        let generation = state.generation + 1;
        self.install_locked(state, index, generation);
        state.rebuilds += 1;
        let persisted = match self.save_locked(state).await {
            Ok(()) => true,
            Err(e) => {
                state.dirty = true;
                warn!(error = %e, "Rebuilt index could not be saved, keeping it in memory");
                false
            }
        };

        let report = RebuildReport {
            vector_count,
            persisted,
            purged_metadata: purged.metadata_rows,
            purged_documents: purged.documents,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            vectors = report.vector_count,
            purged_metadata = report.purged_metadata,
            purged_documents = report.purged_documents,
            elapsed_ms = report.elapsed_ms,
            "Rebuilt vector index"
        );
        Ok(report)
    }

    /// Rebuild first if the tombstone ratio is over the threshold
    async fn compact_if_needed_locked(&self, state: &mut IndexState) {
        let ratio = match state.index.as_ref() {
            Some(index) => index.tombstone_ratio(),
            None => return,
        };
        if ratio <= self.options.tombstone_threshold {
            return;
        }

        info!(
            ratio,
            threshold = self.options.tombstone_threshold,
            "Tombstone ratio over threshold, rebuilding"
        );
        if let Err(e) = self.rebuild_locked(state).await {
            error!(error = %e, "Automatic rebuild failed");
        }
    }

    /// Encode under the lock, write the files on the blocking pool
    async fn save_locked(&self, state: &mut IndexState) -> Result<()> {
        let index = state.index.as_ref().ok_or_else(|| {
            Error::IndexUnavailable(
                state
                    .disabled_reason
                    .clone()
                    .unwrap_or_else(|| "disabled".to_string()),
            )
        })?;
        let generation = state.generation + 1;
        let (primary, sidecar) = index.encode(&self.options.model_key, generation)?;

        let files = self.files.clone();
        tokio::task::spawn_blocking(move || files.save_encoded(&primary, &sidecar, generation))
            .await
            .map_err(|e| Error::Other(format!("index save task failed: {}", e)))??;

        state.generation = generation;
        state.dirty = false;
        Ok(())
    }

    async fn mutated_locked(&self, state: &mut IndexState) {
        state.dirty = true;
        if self.options.persistence == PersistencePolicy::Immediate && state.index.is_some() {
            if let Err(e) = self.save_locked(state).await {
                error!(error = %e, "Failed to persist vector index");
            }
        }
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.options.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.options.dimension,
                actual: vector.len(),
            }
            .into());
        }
        Ok(())
    }

    /// Record the vector in the store and put it in the index (delete-then-add)
    async fn upsert_locked(&self, state: &mut IndexState, id: &str, vector: &[f32]) -> Result<()> {
        let now = meta::now_timestamp();
        let mut tx = self.db.begin().await?;
        meta::upsert_index_entry(&mut tx, id, false, &now).await?;
        meta::upsert_embedding(&mut tx, id, &self.options.model_key, vector, &now).await?;
        tx.commit().await?;

        self.replace_in_memory_locked(state, id, vector).await;
        Ok(())
    }

    async fn replace_in_memory_locked(&self, state: &mut IndexState, id: &str, vector: &[f32]) {
        if let Some(index) = state.index.as_mut() {
            let ids = [id.to_string()];
            index.remove(&ids);
            if let Err(e) = index.add(&ids, &[vector.to_vec()]) {
                error!(id = %id, error = %e, "Index rejected a validated vector");
            }
        }
        self.mutated_locked(state).await;
    }

    /// Add a vector for an id that is not yet in the index
    pub async fn add(&self, id: &str, vector: &[f32]) -> Result<()> {
        self.check_dimension(vector)?;
        let mut state = self.state.lock().await;
        self.compact_if_needed_locked(&mut state).await;

        if state.index.as_ref().is_some_and(|i| i.contains(id)) {
            return Err(IndexError::DuplicateId(id.to_string()).into());
        }
        self.upsert_locked(&mut state, id, vector).await
    }

    /// Replace the vector for an id (delete-then-add under one lock hold)
    pub async fn update(&self, id: &str, vector: &[f32]) -> Result<()> {
        self.check_dimension(vector)?;
        let mut state = self.state.lock().await;
        self.compact_if_needed_locked(&mut state).await;
        self.upsert_locked(&mut state, id, vector).await
    }

    /// Soft-delete a document and tombstone its vector.
    ///
    /// Returns false if there was nothing to delete.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        self.compact_if_needed_locked(&mut state).await;

        let now = meta::now_timestamp();
        let mut tx = self.db.begin().await?;
        let removed_doc = meta::soft_delete_document(&mut tx, id, &now).await?;
        let in_index = state.index.as_ref().is_some_and(|i| i.contains(id));
        if !removed_doc && !in_index {
            return Ok(false);
        }
        meta::upsert_index_entry(&mut tx, id, true, &now).await?;
        tx.commit().await?;

        if let Some(index) = state.index.as_mut() {
            index.remove(&[id.to_string()]);
        }
        self.mutated_locked(&mut state).await;
        debug!(id = %id, "Deleted document");
        Ok(true)
    }

    /// Worker path: mark the row embedded and index its vector, but only if
    /// the row is still the pending revision that was embedded.
    pub async fn commit_embedding(
        &self,
        id: &str,
        revision: i64,
        vector: &[f32],
    ) -> Result<CommitOutcome> {
        self.check_dimension(vector)?;
        let mut state = self.state.lock().await;
        self.compact_if_needed_locked(&mut state).await;

        let now = meta::now_timestamp();
        let mut tx = self.db.begin().await?;
        if !meta::mark_embedded(&mut tx, id, revision, &now).await? {
            debug!(id = %id, revision, "Row changed while embedding, skipping");
            return Ok(CommitOutcome::Skipped);
        }
        meta::upsert_embedding(&mut tx, id, &self.options.model_key, vector, &now).await?;
        meta::upsert_index_entry(&mut tx, id, false, &now).await?;
        tx.commit().await?;

        self.replace_in_memory_locked(&mut state, id, vector).await;
        Ok(CommitOutcome::Committed)
    }

    /// Nearest live ids by cosine similarity
    pub async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        let state = self.state.lock().await;
        let index = state.index.as_ref().ok_or_else(|| {
            Error::IndexUnavailable(
                state
                    .disabled_reason
                    .clone()
                    .unwrap_or_else(|| "disabled".to_string()),
            )
        })?;
        Ok(index.search(vector, k)?)
    }

    /// Stored vector for a live id
    pub async fn vector(&self, id: &str) -> Option<Vec<f32>> {
        let state = self.state.lock().await;
        state
            .index
            .as_ref()
            .and_then(|i| i.get(id))
            .map(|v| v.to_vec())
    }

    /// Persist now, whatever the policy
    pub async fn save(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.save_locked(&mut state).await
    }

    /// Rebuild from the store; re-enables a disabled index on success
    pub async fn rebuild(&self) -> Result<RebuildReport> {
        let mut state = self.state.lock().await;
        let report = self.rebuild_locked(&mut state).await?;
        state.load_errors.clear();
        state.recovery = RecoveryReport {
            source: RecoverySource::Rebuild,
            reconciled: false,
            vector_count: report.vector_count,
        };
        Ok(report)
    }

    /// Flush pending changes unless persistence is manual
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.dirty
            && state.index.is_some()
            && self.options.persistence != PersistencePolicy::Manual
        {
            self.save_locked(&mut state).await?;
        }
        Ok(())
    }

    pub async fn status(&self) -> IndexStatus {
        let state = self.state.lock().await;
        let (vector_count, slot_count, tombstone_count, tombstone_ratio) = match &state.index {
            Some(index) => (
                index.len(),
                index.slot_count(),
                index.tombstone_count(),
                index.tombstone_ratio(),
            ),
            None => (0, 0, 0, 0.0),
        };

        IndexStatus {
            available: state.index.is_some(),
            disabled_reason: state.disabled_reason.clone(),
            vector_count,
            slot_count,
            tombstone_count,
            tombstone_ratio,
            tombstone_threshold: self.options.tombstone_threshold,
            rebuild_needed: tombstone_ratio > self.options.tombstone_threshold,
            dimension: self.options.dimension,
            model_key: self.options.model_key.clone(),
            persistence: self.options.persistence.to_string(),
            dirty: state.dirty,
            generation: state.generation,
            recovery: state.recovery.source,
            reconciled: state.recovery.reconciled,
            rebuilds: state.rebuilds,
            load_errors: state.load_errors.clone(),
        }
    }

    /// Compare the index with the store under the configured model key
    pub async fn check_consistency(&self) -> Result<ConsistencyReport> {
        let state = self.state.lock().await;
        let index = state.index.as_ref().ok_or_else(|| {
            Error::IndexUnavailable(
                state
                    .disabled_reason
                    .clone()
                    .unwrap_or_else(|| "disabled".to_string()),
            )
        })?;

        let store_ids = self.db.live_embedding_ids(&self.options.model_key).await?;
        if store_ids.is_empty() {
            if let Some(mismatch) = self.foreign_key_mismatch(index.len()).await? {
                return Err(mismatch);
            }
        }

        let index_ids = index.live_ids();
        let report = ConsistencyReport {
            model_key: self.options.model_key.clone(),
            index_count: index_ids.len(),
            store_count: store_ids.len(),
            index_signature: id_signature(index_ids),
            store_signature: id_signature(store_ids),
            consistent: false,
        };
        let consistent = report.index_count == report.store_count
            && report.index_signature == report.store_signature;
        Ok(ConsistencyReport { consistent, ..report })
    }

    /// Save the current state and copy the artifacts into `dest`
    pub async fn export_bundle(&self, dest: &Path) -> Result<Vec<PathBuf>> {
        let mut state = self.state.lock().await;
        self.save_locked(&mut state).await?;
        let written = self.files.export_to(dest)?;
        info!(dest = %dest.display(), files = written.len(), "Exported index bundle");
        Ok(written)
    }

    /// Validate a bundle directory, install it and reconcile with the store
    pub async fn import_bundle(&self, src: &Path) -> Result<RecoveryReport> {
        let mut state = self.state.lock().await;

        let bundle = Bundle::read(src, self.options.max_import_bytes)?;
        let (index, sidecar) = bundle.decode()?;
        self.check_sidecar(&sidecar)?;

        let generation = state.generation.max(sidecar.generation);
        self.install_locked(&mut state, index, generation);
        self.save_locked(&mut state).await?;

        let report = if self.matches_store_locked(&state).await? {
            RecoveryReport {
                source: RecoverySource::Import,
                reconciled: false,
                vector_count: state.index.as_ref().map_or(0, |i| i.len()),
            }
        } else {
            warn!("Imported index disagrees with the store, rebuilding");
            let rebuilt = self.rebuild_locked(&mut state).await?;
            RecoveryReport {
                source: RecoverySource::Import,
                reconciled: true,
                vector_count: rebuilt.vector_count,
            }
        };

        info!(
            src = %src.display(),
            files = ?bundle.files,
            reconciled = report.reconciled,
            "Imported index bundle"
        );
        state.load_errors.clear();
        state.recovery = report.clone();
        Ok(report)
    }

    /// Start the periodic flusher when the policy asks for one.
    ///
    /// The task stops once the manager is dropped.
    pub fn spawn_flusher(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.options.persistence != PersistencePolicy::Periodic {
            return None;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.options.flush_interval;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let mut state = manager.state.lock().await;
                if state.dirty && state.index.is_some() {
                    match manager.save_locked(&mut state).await {
                        Ok(()) => debug!(generation = state.generation, "Periodic index flush"),
                        Err(e) => error!(error = %e, "Periodic index flush failed"),
                    }
                }
            }
        }))
    }
}
