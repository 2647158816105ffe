//! Wiring of the store, index, queue, workers and search into one handle.

use crate::config::Config;
use crate::embed::{Embedder, HttpEmbedder};
use crate::error::{Error, Result};
use crate::index::{
    ConsistencyReport, IndexFiles, IndexManager, IndexManagerOptions, IndexStatus, RebuildReport,
    RecoveryReport,
};
use crate::meta::{self, Document, DocumentUpdate, MetaDb, NewDocument, StoreStats};
use crate::queue::{DrainReport, EmbeddingQueue, QueueStats, WorkerPool, WorkerPoolOptions, WorkerStats};
use crate::rerank::create_reranker;
use crate::search::{SearchProvider, SearchService, TextProvider, VectorProvider};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Whether embedding workers run inside this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusInfo {
    pub config_path: String,
    pub db_path: String,
    pub index_dir: String,
    pub embedding_model: String,
    pub index: IndexStatus,
    pub queue: QueueStats,
    pub store: StoreStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<WorkerStats>,
}

pub struct App {
    config: Config,
    db: MetaDb,
    embedder: Option<Arc<dyn Embedder>>,
    manager: Option<Arc<IndexManager>>,
    /// Why the vector side was never opened
    offline_reason: Option<String>,
    queue: EmbeddingQueue,
    search: SearchService,
    workers: Option<WorkerPool>,
    flusher: Option<JoinHandle<()>>,
}

impl App {
    /// Connect to the embedding backend and open everything else.
    ///
    /// Without workers an unreachable backend is not fatal: the index is
    /// left closed and search runs on the text provider.
    pub async fn open(config: Config, mode: WorkerMode) -> Result<Self> {
        if !config.is_initialized() {
            return Err(Error::NotInitialized);
        }
        match HttpEmbedder::connect(&config.embedding).await {
            Ok(embedder) => Self::open_with(config, Arc::new(embedder), mode).await,
            Err(e) if mode == WorkerMode::Disabled => {
                warn!(
                    url = %config.embedding.url,
                    error = %e,
                    "Embedding backend unreachable, vector search disabled"
                );
                Self::open_offline(config, format!("embedding backend unreachable: {}", e)).await
            }
            Err(e) => Err(e),
        }
    }

    /// Open with a caller-supplied embedder
    pub async fn open_with(config: Config, embedder: Arc<dyn Embedder>, mode: WorkerMode) -> Result<Self> {
        config.validate()?;

        let db = MetaDb::connect(&config).await?;
        db.init_schema().await?;

        let options = IndexManagerOptions::new(&config, embedder.dimension());
        let files = IndexFiles::new(&config.paths.index_dir);
        let manager = Arc::new(IndexManager::open(db.clone(), files, options).await?);
        let flusher = manager.spawn_flusher();

        let queue = EmbeddingQueue::new(db.clone());

        let mut vector = VectorProvider::new(Arc::clone(&manager), db.clone(), Arc::clone(&embedder));
        if let Some(reranker) = create_reranker(&config.reranker)? {
            debug!(model = reranker.model_name(), "Reranking vector candidates");
            vector = vector.with_reranker(reranker, config.reranker.candidate_limit);
        }
        let vector: Arc<dyn SearchProvider> = Arc::new(vector);
        let text: Arc<dyn SearchProvider> = Arc::new(TextProvider::new(db.clone()));
        let search = SearchService::new(config.search.clone(), Some(vector), text);

        let workers = match mode {
            WorkerMode::Enabled => Some(
                WorkerPool::start(
                    queue.clone(),
                    Arc::clone(&manager),
                    Arc::clone(&embedder),
                    WorkerPoolOptions::from(&config.workers),
                )
                .await?,
            ),
            WorkerMode::Disabled => None,
        };

        Ok(Self {
            config,
            db,
            embedder: Some(embedder),
            manager: Some(manager),
            offline_reason: None,
            queue,
            search,
            workers,
            flusher,
        })
    }

    /// Store, queue and text search only; no index and no workers
    async fn open_offline(config: Config, reason: String) -> Result<Self> {
        config.validate()?;

        let db = MetaDb::connect(&config).await?;
        db.init_schema().await?;

        let text: Arc<dyn SearchProvider> = Arc::new(TextProvider::new(db.clone()));
        let search = SearchService::new(config.search.clone(), None, text);

        Ok(Self {
            queue: EmbeddingQueue::new(db.clone()),
            config,
            db,
            embedder: None,
            manager: None,
            offline_reason: Some(reason),
            search,
            workers: None,
            flusher: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db(&self) -> &MetaDb {
        &self.db
    }

    pub fn manager(&self) -> Result<&Arc<IndexManager>> {
        self.manager.as_ref().ok_or_else(|| {
            Error::IndexUnavailable(
                self.offline_reason
                    .clone()
                    .unwrap_or_else(|| "index not opened".to_string()),
            )
        })
    }

    pub fn queue(&self) -> &EmbeddingQueue {
        &self.queue
    }

    pub fn search(&self) -> &SearchService {
        &self.search
    }

    pub fn workers(&self) -> Option<&WorkerPool> {
        self.workers.as_ref()
    }

    fn require_workers(&self) -> Result<&WorkerPool> {
        self.workers
            .as_ref()
            .ok_or_else(|| Error::Other("embedding workers are not running".to_string()))
    }

    // ===== Documents =====

    pub async fn add_document(&self, new: NewDocument) -> Result<Document> {
        let doc = self.db.insert_document(&new).await?;
        info!(id = %doc.id, category = %doc.category, "Added document");
        Ok(doc)
    }

    pub async fn update_document(&self, id: &str, update: DocumentUpdate) -> Result<Document> {
        let doc = self.db.update_document(id, &update).await?;
        info!(id = %doc.id, revision = doc.revision, "Updated document");
        Ok(doc)
    }

    pub async fn delete_document(&self, id: &str) -> Result<()> {
        let removed = match &self.manager {
            Some(manager) => manager.delete(id).await?,
            None => self.tombstone_offline(id).await?,
        };
        if !removed {
            return Err(Error::DocumentNotFound(id.to_string()));
        }
        info!(id = %id, "Deleted document");
        Ok(())
    }

    /// Soft-delete and tombstone in the store; the next index open reconciles
    async fn tombstone_offline(&self, id: &str) -> Result<bool> {
        let now = meta::now_timestamp();
        let mut tx = self.db.begin().await?;
        let removed = meta::soft_delete_document(&mut tx, id, &now).await?;
        if removed {
            meta::upsert_index_entry(&mut tx, id, true, &now).await?;
        }
        tx.commit().await?;
        Ok(removed)
    }

    pub async fn get_document(&self, id: &str) -> Result<Document> {
        self.db
            .get_live_document(id)
            .await?
            .ok_or_else(|| Error::DocumentNotFound(id.to_string()))
    }

    /// Near-duplicates of a stored document
    pub async fn duplicates_of(&self, id: &str) -> Result<crate::search::DuplicateReport> {
        let doc = self.get_document(id).await?;
        self.search
            .find_duplicates(&doc.embedding_text(), Some(&doc.id))
            .await
    }

    // ===== Queue and index administration =====

    /// Wait for the workers to empty the queue
    pub async fn process(&self) -> Result<DrainReport> {
        self.require_workers()?
            .drain(self.config.workers.drain_timeout())
            .await
    }

    /// Rebuild the index; with workers running the queue is drained first
    pub async fn rebuild(&self) -> Result<RebuildReport> {
        let manager = self.manager()?;
        match &self.workers {
            Some(pool) => {
                pool.run_exclusive(self.config.workers.drain_timeout(), || manager.rebuild())
                    .await
            }
            None => manager.rebuild().await,
        }
    }

    pub async fn save(&self) -> Result<()> {
        self.manager()?.save().await
    }

    pub async fn check(&self) -> Result<ConsistencyReport> {
        self.manager()?.check_consistency().await
    }

    pub async fn retry_failed(&self, ids: Option<&[String]>) -> Result<u64> {
        self.queue.retry_failed(ids).await
    }

    pub async fn export_bundle(&self, dest: &Path) -> Result<Vec<PathBuf>> {
        self.manager()?.export_bundle(dest).await
    }

    pub async fn import_bundle(&self, src: &Path) -> Result<RecoveryReport> {
        let manager = self.manager()?;
        match &self.workers {
            Some(pool) => {
                pool.run_exclusive(self.config.workers.drain_timeout(), || {
                    manager.import_bundle(src)
                })
                .await
            }
            None => manager.import_bundle(src).await,
        }
    }

    pub async fn status(&self) -> Result<StatusInfo> {
        let model_key = self.config.embedding.model_key();
        let (embedding_model, index) = match (&self.embedder, &self.manager) {
            (Some(embedder), Some(manager)) => (
                format!("{} ({} dims)", model_key, embedder.dimension()),
                manager.status().await,
            ),
            _ => {
                let reason = self
                    .offline_reason
                    .clone()
                    .unwrap_or_else(|| "index not opened".to_string());
                (
                    format!("{} (backend unreachable)", model_key),
                    IndexStatus::unavailable(&self.config, reason),
                )
            }
        };

        Ok(StatusInfo {
            config_path: self.config.paths.config_file.display().to_string(),
            db_path: self.config.paths.db_file.display().to_string(),
            index_dir: self.config.paths.index_dir.display().to_string(),
            embedding_model,
            index,
            queue: self.queue.stats().await?,
            store: self.db.store_stats().await?,
            workers: self.workers.as_ref().map(WorkerPool::stats),
        })
    }

    /// Stop workers, flush the index and close the pool
    pub async fn shutdown(self) -> Result<()> {
        if let Some(pool) = &self.workers {
            pool.shutdown().await;
        }
        if let Some(flusher) = &self.flusher {
            flusher.abort();
        }
        let closed = match &self.manager {
            Some(manager) => manager.close().await,
            None => Ok(()),
        };
        if let Err(e) = &closed {
            warn!(error = %e, "Final index flush failed");
        }
        self.db.close().await;
        closed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReindexReport {
    pub previous_model_key: Option<String>,
    pub model_key: String,
    pub cleared_index: bool,
    pub requeued: u64,
}

/// Prepare for a model change: drop index files built with another model
/// and put every live document back in the queue.
///
/// Runs before the index is opened, since opening refuses a foreign index.
pub async fn prepare_reindex(config: &Config, dimension: usize, force: bool) -> Result<ReindexReport> {
    let db = MetaDb::connect(config).await?;
    db.init_schema().await?;

    let files = IndexFiles::new(&config.paths.index_dir);
    let model_key = config.embedding.model_key();
    let previous = match files.read_sidecar() {
        Ok(sidecar) => Some(sidecar),
        Err(e) if e.is_missing() => None,
        Err(e) => {
            warn!(error = %e, "Index sidecar unreadable, clearing index files");
            None
        }
    };

    let mismatch = previous
        .as_ref()
        .map_or(files.any_exist(), |s| s.model_key != model_key || s.dimension != dimension);
    let cleared_index = force || mismatch;
    if cleared_index {
        files.remove_all()?;
        info!(dir = %files.dir().display(), "Cleared index files");
    }

    let requeued = EmbeddingQueue::new(db.clone()).requeue_all().await?;
    info!(requeued, model_key = %model_key, "Requeued documents for embedding");
    db.close().await;

    Ok(ReindexReport {
        previous_model_key: previous.map(|s| s.model_key),
        model_key,
        cleared_index,
        requeued,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::RecoverySource;
    use crate::test_support::StubEmbedder;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DIM: usize = 8;

    fn test_config(tmp: &TempDir) -> Config {
        let mut config = Config::default();
        config.init_paths(Some(tmp.path().to_path_buf()));
        config.workers.poll_interval_ms = 20;
        config
    }

    async fn open(config: Config, mode: WorkerMode) -> App {
        App::open_with(config, Arc::new(StubEmbedder::new(DIM)), mode)
            .await
            .unwrap()
    }

    fn note(title: &str, body: &str) -> NewDocument {
        NewDocument {
            category: "notes".to_string(),
            section: None,
            title: title.to_string(),
            body: body.to_string(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_add_process_search_delete() {
        let tmp = TempDir::new().unwrap();
        let app = open(test_config(&tmp), WorkerMode::Enabled).await;

        let doc = app.add_document(note("Release steps", "tag, build, publish")).await.unwrap();
        app.add_document(note("Team lunch", "thursdays")).await.unwrap();
        assert!(app.process().await.unwrap().drained);

        let response = app.search().search(&doc.embedding_text(), Some(1)).await.unwrap();
        assert!(!response.degraded);
        assert_eq!(response.hits[0].id, doc.id);

        app.delete_document(&doc.id).await.unwrap();
        assert!(matches!(
            app.delete_document(&doc.id).await,
            Err(Error::DocumentNotFound(_))
        ));
        let status = app.status().await.unwrap();
        assert_eq!(status.index.vector_count, 1);
        assert_eq!(status.queue.pending, 0);
        app.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reprocessing_keeps_one_vector() {
        let tmp = TempDir::new().unwrap();
        let app = open(test_config(&tmp), WorkerMode::Enabled).await;
        let doc = app.add_document(note("Only once", "same text")).await.unwrap();
        assert!(app.process().await.unwrap().drained);
        let first = app.manager().unwrap().vector(&doc.id).await.unwrap();

        assert_eq!(app.queue().requeue_all().await.unwrap(), 1);
        assert!(app.process().await.unwrap().drained);

        let status = app.status().await.unwrap();
        assert_eq!(status.index.vector_count, 1);
        assert_eq!(app.manager().unwrap().vector(&doc.id).await.unwrap(), first);
        app.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rebuild_with_workers_running() {
        let tmp = TempDir::new().unwrap();
        let app = open(test_config(&tmp), WorkerMode::Enabled).await;
        let mut ids = Vec::new();
        for i in 0..6 {
            ids.push(app.add_document(note(&format!("n{}", i), "x")).await.unwrap().id);
        }
        assert!(app.process().await.unwrap().drained);
        app.delete_document(&ids[0]).await.unwrap();

        let report = app.rebuild().await.unwrap();
        assert_eq!(report.vector_count, 5);
        assert!(!app.workers().unwrap().is_paused());
        app.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_backend_degrades_to_text_search() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embed/text"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let mut config = test_config(&tmp);
        config.embedding.url = server.uri();
        config.embedding.retries = 0;
        config.save().unwrap();
        let db = MetaDb::connect(&config).await.unwrap();
        db.init_schema().await.unwrap();
        db.close().await;

        // Workers cannot run without an embedder
        assert!(App::open(config.clone(), WorkerMode::Enabled).await.is_err());

        let app = App::open(config, WorkerMode::Disabled).await.unwrap();
        let doc = app.add_document(note("Backup rotation", "weekly offsite")).await.unwrap();
        app.add_document(note("Coffee", "beans")).await.unwrap();

        let response = app.search().search("backup rotation", Some(3)).await.unwrap();
        assert!(response.degraded);
        assert!(response.hint.is_some());
        assert_eq!(response.hits[0].id, doc.id);

        let status = app.status().await.unwrap();
        assert!(!status.index.available);
        assert!(status
            .index
            .disabled_reason
            .as_deref()
            .is_some_and(|r| r.contains("unreachable")));
        assert_eq!(status.queue.pending, 2);
        assert!(matches!(app.save().await, Err(Error::IndexUnavailable(_))));

        app.delete_document(&doc.id).await.unwrap();
        assert!(matches!(
            app.delete_document(&doc.id).await,
            Err(Error::DocumentNotFound(_))
        ));
        let response = app.search().search("backup", None).await.unwrap();
        assert!(response.hits.iter().all(|h| h.id != doc.id));
        app.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_process_requires_workers() {
        let tmp = TempDir::new().unwrap();
        let app = open(test_config(&tmp), WorkerMode::Disabled).await;
        assert!(app.process().await.is_err());
        app.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reindex_after_model_change() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let app = open(config.clone(), WorkerMode::Enabled).await;
        app.add_document(note("a", "b")).await.unwrap();
        app.add_document(note("c", "d")).await.unwrap();
        assert!(app.process().await.unwrap().drained);
        app.shutdown().await.unwrap();

        let mut changed = config.clone();
        changed.embedding.model = "other-model".to_string();
        assert!(matches!(
            App::open_with(changed.clone(), Arc::new(StubEmbedder::new(DIM)), WorkerMode::Disabled).await,
            Err(Error::ConfigMismatch(_))
        ));

        let report = prepare_reindex(&changed, DIM, false).await.unwrap();
        assert!(report.cleared_index);
        assert_eq!(report.requeued, 2);
        assert_eq!(report.previous_model_key, Some(config.embedding.model_key()));

        let app = open(changed, WorkerMode::Enabled).await;
        assert_eq!(app.manager().unwrap().status().await.recovery, RecoverySource::Fresh);
        assert!(app.process().await.unwrap().drained);
        assert_eq!(app.status().await.unwrap().index.vector_count, 2);
        app.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reindex_same_model_keeps_index() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let app = open(config.clone(), WorkerMode::Disabled).await;
        app.save().await.unwrap();
        app.shutdown().await.unwrap();

        let report = prepare_reindex(&config, DIM, false).await.unwrap();
        assert!(!report.cleared_index);
        assert_eq!(report.requeued, 0);
    }
}
