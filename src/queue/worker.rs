//! Worker pool that turns pending rows into indexed vectors.
//!
//! Each worker is a tokio task polling the queue. Pause and shutdown are
//! broadcast over `watch` channels and checked between items, so a worker
//! always finishes the row it is on and hands back the rest of its batch.

use super::{EmbeddingJob, EmbeddingQueue};
use crate::config::WorkerConfig;
use crate::embed::{embed_one, Embedder};
use crate::error::{Error, Result};
use crate::index::{CommitOutcome, IndexManager};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DRAIN_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct WorkerPoolOptions {
    pub count: usize,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub stale_claim_age: Duration,
}

impl From<&WorkerConfig> for WorkerPoolOptions {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            count: config.count,
            batch_size: config.batch_size,
            poll_interval: config.poll_interval(),
            stale_claim_age: config.stale_claim_age(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DrainReport {
    pub drained: bool,
    pub remaining: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub workers: usize,
    pub paused: bool,
    pub committed: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    committed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

struct Shared {
    queue: EmbeddingQueue,
    manager: Arc<IndexManager>,
    embedder: Arc<dyn Embedder>,
    options: WorkerPoolOptions,
    paused: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    /// Workers currently between claiming and finishing a batch
    active: AtomicUsize,
    counters: Counters,
}

impl Shared {
    fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Resumes the pool when an exclusive section ends, however it ends
struct ResumeOnDrop<'a>(&'a WorkerPool);

impl Drop for ResumeOnDrop<'_> {
    fn drop(&mut self) {
        self.0.resume();
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Release leftover claims and spawn the workers
    pub async fn start(
        queue: EmbeddingQueue,
        manager: Arc<IndexManager>,
        embedder: Arc<dyn Embedder>,
        options: WorkerPoolOptions,
    ) -> Result<Self> {
        let released = queue.release_all_claims().await?;
        if released > 0 {
            info!(released, "Released claims left by a previous run");
        }

        let (paused, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            queue,
            manager,
            embedder,
            options,
            paused,
            shutdown,
            active: AtomicUsize::new(0),
            counters: Counters::default(),
        });

        let handles = (0..shared.options.count.max(1))
            .map(|worker_id| tokio::spawn(worker_loop(Arc::clone(&shared), worker_id)))
            .collect();

        info!(workers = shared.options.count.max(1), "Embedding workers started");
        Ok(Self {
            shared,
            handles: Mutex::new(handles),
        })
    }

    /// Stop claiming; each worker finishes its current row and releases the rest
    pub fn pause(&self) {
        if !self.shared.paused.send_replace(true) {
            info!("Embedding workers paused");
        }
    }

    pub fn resume(&self) {
        if self.shared.paused.send_replace(false) {
            info!("Embedding workers resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.shared.is_paused()
    }

    pub fn stats(&self) -> WorkerStats {
        let counters = &self.shared.counters;
        WorkerStats {
            workers: self.shared.options.count.max(1),
            paused: self.is_paused(),
            committed: counters.committed.load(Ordering::Relaxed),
            skipped: counters.skipped.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Wait until no row is pending or `timeout` passes.
    ///
    /// A paused pool cannot make progress, so a non-empty backlog returns
    /// `drained = false` straight away.
    pub async fn drain(&self, timeout: Duration) -> Result<DrainReport> {
        let started = Instant::now();
        loop {
            let remaining = self.shared.queue.count_pending().await?;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            if remaining == 0 {
                debug!(elapsed_ms, "Queue drained");
                return Ok(DrainReport {
                    drained: true,
                    remaining,
                    elapsed_ms,
                });
            }
            if self.is_paused() {
                warn!(remaining, "Drain requested while workers are paused");
                return Ok(DrainReport {
                    drained: false,
                    remaining,
                    elapsed_ms,
                });
            }
            if started.elapsed() >= timeout {
                warn!(remaining, elapsed_ms, "Queue did not drain before timeout");
                return Ok(DrainReport {
                    drained: false,
                    remaining,
                    elapsed_ms,
                });
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    async fn wait_idle(&self, deadline: Instant) -> bool {
        while self.shared.active.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    /// Run `f` with the queue drained and the workers paused.
    ///
    /// Sequence: drain, pause, wait for in-flight rows, run, resume. The
    /// pool is resumed on every exit path. If the drain does not finish in
    /// `timeout`, `f` is not run and `QueueDrainTimeout` is returned.
    pub async fn run_exclusive<F, Fut, T>(&self, timeout: Duration, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let deadline = Instant::now() + timeout;
        let report = self.drain(timeout).await?;
        if !report.drained {
            return Err(Error::QueueDrainTimeout {
                remaining: report.remaining,
            });
        }

        self.pause();
        let _resume = ResumeOnDrop(self);
        if !self.wait_idle(deadline).await {
            let remaining = self.shared.queue.count_pending().await?;
            return Err(Error::QueueDrainTimeout { remaining });
        }

        f().await
    }

    /// Stop every worker after its current row and wait for them
    pub async fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock().await);
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Embedding worker ended abnormally");
            }
        }
        info!("Embedding workers stopped");
    }
}

async fn worker_loop(shared: Arc<Shared>, worker_id: usize) {
    let mut paused_rx = shared.paused.subscribe();
    let mut shutdown_rx = shared.shutdown.subscribe();
    debug!(worker_id, "Worker started");

    loop {
        if *shutdown_rx.borrow_and_update() {
            break;
        }
        if *paused_rx.borrow_and_update() {
            tokio::select! {
                _ = paused_rx.changed() => {}
                _ = shutdown_rx.changed() => {}
            }
            continue;
        }

        match run_batch(&shared, worker_id).await {
            Ok(Some(processed)) if processed > 0 => continue,
            Ok(Some(_)) => {
                if let Err(e) = shared.queue.reclaim_stale(shared.options.stale_claim_age).await {
                    warn!(worker_id, error = %e, "Stale claim sweep failed");
                }
            }
            Ok(None) => continue,
            Err(e) => error!(worker_id, error = %e, "Worker iteration failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(shared.options.poll_interval) => {}
            _ = paused_rx.changed() => {}
            _ = shutdown_rx.changed() => {}
        }
    }

    debug!(worker_id, "Worker stopped");
}

/// Claim and process one batch. `None` means the pool was paused or
/// stopping before anything was claimed.
async fn run_batch(shared: &Shared, worker_id: usize) -> Result<Option<usize>> {
    let _active = ActiveGuard::enter(&shared.active);
    if shared.is_paused() || shared.is_stopping() {
        return Ok(None);
    }

    let jobs = shared.queue.claim_batch(shared.options.batch_size).await?;
    let mut processed = 0;
    for (i, job) in jobs.iter().enumerate() {
        if shared.is_paused() || shared.is_stopping() {
            let rest: Vec<String> = jobs[i..].iter().map(|j| j.id.clone()).collect();
            let released = shared.queue.release(&rest).await?;
            debug!(worker_id, released, "Released unprocessed claims");
            break;
        }
        process_job(shared, worker_id, job).await;
        processed += 1;
    }
    Ok(Some(processed))
}

async fn process_job(shared: &Shared, worker_id: usize, job: &EmbeddingJob) {
    let outcome = match embed_one(shared.embedder.as_ref(), &job.text).await {
        Ok(vector) => {
            shared
                .manager
                .commit_embedding(&job.id, job.revision, &vector)
                .await
        }
        Err(e) => Err(e),
    };

    match outcome {
        Ok(CommitOutcome::Committed) => {
            shared.counters.committed.fetch_add(1, Ordering::Relaxed);
            debug!(worker_id, id = %job.id, revision = job.revision, "Embedded document");
        }
        Ok(CommitOutcome::Skipped) => {
            shared.counters.skipped.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(worker_id, id = %job.id, error = %e, "Embedding failed");
            if let Err(mark_err) = shared
                .queue
                .mark_failed(&job.id, job.revision, &e.to_string())
                .await
            {
                error!(worker_id, id = %job.id, error = %mark_err, "Could not record embedding failure");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexFiles;
    use crate::meta::{MetaDb, NewDocument};
    use crate::test_support::{test_db, test_options, StubEmbedder};

    const DIM: usize = 8;

    fn fast_options(count: usize) -> WorkerPoolOptions {
        WorkerPoolOptions {
            count,
            batch_size: 4,
            poll_interval: Duration::from_millis(20),
            stale_claim_age: Duration::from_secs(600),
        }
    }

    async fn insert(db: &MetaDb, title: &str) -> String {
        db.insert_document(&NewDocument {
            category: "notes".to_string(),
            section: None,
            title: title.to_string(),
            body: format!("{} body", title),
        })
        .await
        .unwrap()
        .id
    }

    async fn setup(embedder: StubEmbedder, workers: usize) -> (MetaDb, Arc<IndexManager>, WorkerPool, tempfile::TempDir) {
        let (db, tmp) = test_db().await;
        let manager = Arc::new(
            IndexManager::open(db.clone(), IndexFiles::new(tmp.path().join("index")), test_options(DIM))
                .await
                .unwrap(),
        );
        let pool = WorkerPool::start(
            EmbeddingQueue::new(db.clone()),
            Arc::clone(&manager),
            Arc::new(embedder),
            fast_options(workers),
        )
        .await
        .unwrap();
        (db, manager, pool, tmp)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_drain_with_active_workers() {
        let (db, manager, pool, _tmp) = setup(StubEmbedder::new(DIM), 2).await;
        for i in 0..10 {
            insert(&db, &format!("note {}", i)).await;
        }

        let report = pool.drain(Duration::from_secs(10)).await.unwrap();
        assert!(report.drained);
        assert_eq!(report.remaining, 0);
        assert!(report.elapsed_ms < 5_000);
        assert_eq!(manager.status().await.vector_count, 10);
        assert_eq!(pool.stats().committed, 10);

        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_drain_while_paused_returns_promptly() {
        let (db, _manager, pool, _tmp) = setup(StubEmbedder::new(DIM), 2).await;
        pool.pause();
        for i in 0..5 {
            insert(&db, &format!("note {}", i)).await;
        }

        let started = Instant::now();
        let report = pool.drain(Duration::from_secs(10)).await.unwrap();
        assert!(!report.drained);
        assert_eq!(report.remaining, 5);
        assert!(started.elapsed() < Duration::from_secs(1));

        pool.resume();
        assert!(pool.drain(Duration::from_secs(10)).await.unwrap().drained);
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_bad_row_does_not_stall_batch() {
        let (db, manager, pool, _tmp) = setup(StubEmbedder::new(DIM), 1).await;
        let bad = insert(&db, "FAIL_EMBED please").await;
        for i in 0..3 {
            insert(&db, &format!("good {}", i)).await;
        }

        assert!(pool.drain(Duration::from_secs(10)).await.unwrap().drained);
        assert_eq!(manager.status().await.vector_count, 3);

        let doc = db.get_document(&bad).await.unwrap().unwrap();
        assert_eq!(doc.embedding_status, "failed");
        assert!(doc.last_error.is_some());
        assert_eq!(pool.stats().failed, 1);
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_exclusive_pauses_and_resumes() {
        let (db, manager, pool, _tmp) = setup(StubEmbedder::new(DIM), 2).await;
        for i in 0..6 {
            insert(&db, &format!("note {}", i)).await;
        }

        let seen = pool
            .run_exclusive(Duration::from_secs(10), || async {
                assert!(pool.is_paused());
                Ok(manager.status().await.vector_count)
            })
            .await
            .unwrap();
        assert_eq!(seen, 6);
        assert!(!pool.is_paused());

        // Resumed on the error path too
        let err = pool
            .run_exclusive(Duration::from_secs(10), || async {
                Err::<(), _>(Error::Other("boom".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Other(_)));
        assert!(!pool.is_paused());
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_exclusive_times_out_without_running() {
        let slow = StubEmbedder::new(DIM).with_delay(Duration::from_millis(300));
        let (db, _manager, pool, _tmp) = setup(slow, 1).await;
        for i in 0..10 {
            insert(&db, &format!("note {}", i)).await;
        }

        let mut ran = false;
        let err = pool
            .run_exclusive(Duration::from_millis(200), || {
                ran = true;
                async { Ok(()) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueueDrainTimeout { remaining } if remaining > 0));
        assert!(!ran);
        assert!(!pool.is_paused());
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pause_releases_rest_of_batch() {
        let slow = StubEmbedder::new(DIM).with_delay(Duration::from_millis(100));
        let (db, _manager, pool, _tmp) = setup(slow, 1).await;
        for i in 0..4 {
            insert(&db, &format!("note {}", i)).await;
        }

        // Let the worker claim a batch and start on it
        tokio::time::sleep(Duration::from_millis(150)).await;
        pool.pause();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let stats = EmbeddingQueue::new(db.clone()).stats().await.unwrap();
        assert_eq!(stats.claimed, 0);
        assert!(stats.pending > 0);
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_start_releases_leftover_claims() {
        let (db, tmp) = test_db().await;
        insert(&db, "orphan").await;
        let queue = EmbeddingQueue::new(db.clone());
        assert_eq!(queue.claim_batch(1).await.unwrap().len(), 1);

        let manager = Arc::new(
            IndexManager::open(db.clone(), IndexFiles::new(tmp.path().join("index")), test_options(DIM))
                .await
                .unwrap(),
        );
        let pool = WorkerPool::start(queue, Arc::clone(&manager), Arc::new(StubEmbedder::new(DIM)), fast_options(1))
            .await
            .unwrap();
        assert!(pool.drain(Duration::from_secs(10)).await.unwrap().drained);
        assert_eq!(manager.status().await.vector_count, 1);
        pool.shutdown().await;
    }
}
