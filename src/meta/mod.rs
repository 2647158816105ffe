//! Metadata storage using SQLite
//!
//! This module handles all relational storage:
//! - Documents (client records plus their embedding queue state)
//! - Embeddings (vectors keyed by document and model key)
//! - Index metadata (the tombstone ledger the vector index is rebuilt from)
//!
//! Helpers that take a `&mut SqliteConnection` run on the caller's
//! transaction so a status transition commits together with its dependent
//! rows.

mod schema;

pub use schema::*;

use crate::config::Config;
use crate::error::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

const UPDATE_ATTEMPTS: usize = 5;

pub(crate) const DOCUMENT_COLUMNS: &str = "id, category, section, title, body, embedding_status, revision, \
     claimed_at, last_error, created_at, updated_at, deleted_at";

/// Format a timestamp with fixed precision so string order is time order
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time in the storage format
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Embedding state of a document; the queue substrate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingStatus {
    Pending,
    Embedded,
    Failed,
}

impl EmbeddingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingStatus::Pending => "pending",
            EmbeddingStatus::Embedded => "embedded",
            EmbeddingStatus::Failed => "failed",
        }
    }

    /// Legal transitions of the embedding state machine.
    ///
    /// `embedded -> pending` and `failed -> pending` happen on a content
    /// change; `failed -> pending` is also the manual retry.
    pub fn can_transition_to(&self, next: EmbeddingStatus) -> bool {
        use EmbeddingStatus::*;
        matches!(
            (self, next),
            (Pending, Embedded) | (Pending, Failed) | (Failed, Pending) | (Embedded, Pending)
        )
    }

    /// Error unless `self -> next` is legal
    pub fn check_transition(&self, next: EmbeddingStatus) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl std::fmt::Display for EmbeddingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmbeddingStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(EmbeddingStatus::Pending),
            "embedded" => Ok(EmbeddingStatus::Embedded),
            "failed" => Ok(EmbeddingStatus::Failed),
            _ => Err(Error::Other(format!("Unknown embedding status: {}", s))),
        }
    }
}

/// A stored document
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub category: String,
    pub section: Option<String>,
    pub title: String,
    pub body: String,
    pub embedding_status: String,
    pub revision: i64,
    pub claimed_at: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

impl Document {
    pub fn status(&self) -> Result<EmbeddingStatus> {
        self.embedding_status.parse()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// The text handed to the embedder
    pub fn embedding_text(&self) -> String {
        let mut text = self.title.clone();
        if let Some(section) = self.section.as_deref().filter(|s| !s.is_empty()) {
            text.push('\n');
            text.push_str(section);
        }
        text.push_str("\n\n");
        text.push_str(&self.body);
        text
    }
}

/// Fields for a new document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewDocument {
    pub category: String,
    pub section: Option<String>,
    pub title: String,
    pub body: String,
}

/// Partial content change; `None` leaves a field untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentUpdate {
    pub category: Option<String>,
    pub section: Option<String>,
    pub title: Option<String>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
struct EmbeddingRow {
    entity_id: String,
    vector_bytes: Vec<u8>,
    dimension: i64,
}

/// Row counts removed by a tombstone purge
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PurgeStats {
    pub metadata_rows: u64,
    pub documents: u64,
}

/// Store-wide counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub documents: usize,
    pub soft_deleted: usize,
    pub pending: usize,
    pub claimed: usize,
    pub embedded: usize,
    pub failed: usize,
    pub embeddings: usize,
    pub tombstones: usize,
}

/// Metadata database handle
#[derive(Clone)]
pub struct MetaDb {
    pool: SqlitePool,
}

impl MetaDb {
    /// Connect to the metadata database
    pub async fn connect(config: &Config) -> Result<Self> {
        Self::open(&config.paths.db_file).await
    }

    /// Connect to a database file, creating it if missing
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(10));

        debug!("Connecting to SQLite database at {:?}", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Initialize the database schema
    pub async fn init_schema(&self) -> Result<()> {
        info!("Initializing database schema");
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Check if database is initialized
    pub async fn is_initialized(&self) -> Result<bool> {
        let result: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM sqlite_master WHERE type='table' AND name='documents'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(result.is_some())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a transaction
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ===== Document Operations =====

    /// Insert a new document in the `pending` state
    pub async fn insert_document(&self, new: &NewDocument) -> Result<Document> {
        if new.title.trim().is_empty() && new.body.trim().is_empty() {
            return Err(Error::Other(
                "Document needs a title or a body".to_string(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let now = now_timestamp();

        sqlx::query(
            r#"
            INSERT INTO documents (id, category, section, title, body, embedding_status,
                                   revision, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'pending', 1, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.category)
        .bind(&new.section)
        .bind(&new.title)
        .bind(&new.body)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        debug!(id = %id, category = %new.category, "Inserted document");

        self.get_document(&id)
            .await?
            .ok_or(Error::DocumentNotFound(id))
    }

    /// Apply a content change.
    ///
    /// A real change bumps `revision`, drops any claim and puts the row back
    /// to `pending`. The index keeps serving the previous vector until the
    /// worker replaces it. An update that changes nothing is a no-op.
    pub async fn update_document(&self, id: &str, update: &DocumentUpdate) -> Result<Document> {
        for _ in 0..UPDATE_ATTEMPTS {
            let current = self
                .get_live_document(id)
                .await?
                .ok_or_else(|| Error::DocumentNotFound(id.to_string()))?;

            let category = update.category.clone().unwrap_or_else(|| current.category.clone());
            let section = update.section.clone().or_else(|| current.section.clone());
            let title = update.title.clone().unwrap_or_else(|| current.title.clone());
            let body = update.body.clone().unwrap_or_else(|| current.body.clone());

            let changed = category != current.category
                || section != current.section
                || title != current.title
                || body != current.body;
            if !changed {
                return Ok(current);
            }

            let status = current.status()?;
            if status != EmbeddingStatus::Pending {
                status.check_transition(EmbeddingStatus::Pending)?;
            }

            // Guarded on the revision we read so a concurrent edit is not lost
            let result = sqlx::query(
                r#"
                UPDATE documents
                SET category = ?, section = ?, title = ?, body = ?,
                    embedding_status = 'pending', revision = revision + 1,
                    claimed_at = NULL, last_error = NULL, updated_at = ?
                WHERE id = ? AND revision = ? AND deleted_at IS NULL
                "#,
            )
            .bind(&category)
            .bind(&section)
            .bind(&title)
            .bind(&body)
            .bind(now_timestamp())
            .bind(id)
            .bind(current.revision)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                debug!(id = %id, revision = current.revision + 1, "Updated document");
                return self
                    .get_document(id)
                    .await?
                    .ok_or_else(|| Error::DocumentNotFound(id.to_string()));
            }
        }

        Err(Error::Other(format!(
            "Document {} kept changing underneath the update",
            id
        )))
    }

    /// Get a document by ID, soft-deleted rows included
    pub async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let doc = sqlx::query_as::<_, Document>(&format!(
            "SELECT {} FROM documents WHERE id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(doc)
    }

    /// Get a live (not soft-deleted) document
    pub async fn get_live_document(&self, id: &str) -> Result<Option<Document>> {
        let mut conn = self.pool.acquire().await?;
        fetch_live_document(&mut conn, id).await
    }

    /// Fetch the live documents among `ids`, in no particular order
    pub async fn get_live_documents(&self, ids: &[String]) -> Result<Vec<Document>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM documents WHERE deleted_at IS NULL AND id IN (",
            DOCUMENT_COLUMNS
        ));
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(")");

        let docs = qb
            .build_query_as::<Document>()
            .fetch_all(&self.pool)
            .await?;
        Ok(docs)
    }

    /// List live documents, newest first
    pub async fn list_documents(
        &self,
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Document>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM documents WHERE deleted_at IS NULL",
            DOCUMENT_COLUMNS
        ));
        if let Some(category) = category {
            qb.push(" AND category = ").push_bind(category.to_string());
        }
        qb.push(" ORDER BY created_at DESC, id LIMIT ")
            .push_bind(limit as i64);

        let docs = qb
            .build_query_as::<Document>()
            .fetch_all(&self.pool)
            .await?;
        Ok(docs)
    }

    /// Live documents containing at least one of `terms` as a literal
    /// substring of title, section or body (ASCII case-insensitive).
    ///
    /// Documents matching more distinct terms come first, then the most
    /// recently updated, so `limit` never drops a better match.
    pub async fn find_documents_matching(
        &self,
        terms: &[String],
        limit: usize,
    ) -> Result<Vec<Document>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        fn push_term_match(qb: &mut QueryBuilder<'_, Sqlite>, term: &str) {
            let pattern = like_pattern(term);
            qb.push("(title LIKE ")
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\' OR IFNULL(section, '') LIKE ")
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\' OR body LIKE ")
                .push_bind(pattern)
                .push(" ESCAPE '\\')");
        }

        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM documents WHERE deleted_at IS NULL AND (",
            DOCUMENT_COLUMNS
        ));
        for (i, term) in terms.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            push_term_match(&mut qb, term);
        }
        qb.push(") ORDER BY (");
        for (i, term) in terms.iter().enumerate() {
            if i > 0 {
                qb.push(" + ");
            }
            qb.push("CASE WHEN ");
            push_term_match(&mut qb, term);
            qb.push(" THEN 1 ELSE 0 END");
        }
        qb.push(") DESC, updated_at DESC, id LIMIT ")
            .push_bind(limit as i64);

        let docs = qb
            .build_query_as::<Document>()
            .fetch_all(&self.pool)
            .await?;
        Ok(docs)
    }

    // ===== Embedding Operations =====

    /// Embeddings that belong in the index: metadata not tombstoned and
    /// stored under `model_key`. Ordered by id so rebuilds are deterministic.
    pub async fn live_embeddings(&self, model_key: &str) -> Result<Vec<(String, Vec<f32>)>> {
        let rows = sqlx::query_as::<_, EmbeddingRow>(
            r#"
            SELECT e.entity_id, e.vector_bytes, e.dimension
            FROM embeddings e
            JOIN index_metadata m ON m.entity_id = e.entity_id
            WHERE m.deleted = 0 AND e.model_key = ?
            ORDER BY e.entity_id
            "#,
        )
        .bind(model_key)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let vector = decode_vector(&row.vector_bytes)?;
            if vector.len() as i64 != row.dimension {
                warn!(
                    entity_id = %row.entity_id,
                    stored = row.dimension,
                    actual = vector.len(),
                    "Embedding row dimension disagrees with its payload"
                );
            }
            out.push((row.entity_id, vector));
        }
        Ok(out)
    }

    /// Sorted ids of the embeddings that belong in the index
    pub async fn live_embedding_ids(&self, model_key: &str) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT e.entity_id
            FROM embeddings e
            JOIN index_metadata m ON m.entity_id = e.entity_id
            WHERE m.deleted = 0 AND e.model_key = ?
            ORDER BY e.entity_id
            "#,
        )
        .bind(model_key)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Model keys present in the embeddings table with their row counts
    pub async fn embedding_model_keys(&self) -> Result<Vec<(String, i64)>> {
        let keys: Vec<(String, i64)> = sqlx::query_as(
            "SELECT model_key, COUNT(*) FROM embeddings GROUP BY model_key ORDER BY model_key",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }

    /// Live documents the queue considers embedded
    pub async fn embedded_document_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM documents WHERE embedding_status = 'embedded' AND deleted_at IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Stored vector for one document
    pub async fn get_embedding(&self, entity_id: &str, model_key: &str) -> Result<Option<Vec<f32>>> {
        let bytes: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT vector_bytes FROM embeddings WHERE entity_id = ? AND model_key = ?",
        )
        .bind(entity_id)
        .bind(model_key)
        .fetch_optional(&self.pool)
        .await?;
        bytes.map(|b| decode_vector(&b)).transpose()
    }

    // ===== Statistics =====

    pub async fn store_stats(&self) -> Result<StoreStats> {
        let row: (i64, i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN deleted_at IS NULL THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN deleted_at IS NOT NULL THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN deleted_at IS NULL AND embedding_status = 'pending' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN deleted_at IS NULL AND embedding_status = 'pending' AND claimed_at IS NOT NULL THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN deleted_at IS NULL AND embedding_status = 'embedded' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN deleted_at IS NULL AND embedding_status = 'failed' THEN 1 ELSE 0 END), 0)
            FROM documents
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let embeddings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings")
            .fetch_one(&self.pool)
            .await?;
        let tombstones: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM index_metadata WHERE deleted = 1")
                .fetch_one(&self.pool)
                .await?;

        Ok(StoreStats {
            documents: row.0 as usize,
            soft_deleted: row.1 as usize,
            pending: row.2 as usize,
            claimed: row.3 as usize,
            embedded: row.4 as usize,
            failed: row.5 as usize,
            embeddings: embeddings as usize,
            tombstones: tombstones as usize,
        })
    }
}

// ===== Transaction-scoped helpers =====

async fn fetch_live_document(conn: &mut SqliteConnection, id: &str) -> Result<Option<Document>> {
    let doc = sqlx::query_as::<_, Document>(&format!(
        "SELECT {} FROM documents WHERE id = ? AND deleted_at IS NULL",
        DOCUMENT_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(doc)
}

/// `pending -> embedded` for exactly the revision that was embedded.
///
/// Returns false when the row moved on (content changed, deleted, or no
/// longer pending); the caller must then discard its vector.
pub async fn mark_embedded(
    conn: &mut SqliteConnection,
    id: &str,
    revision: i64,
    now: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE documents
        SET embedding_status = 'embedded', claimed_at = NULL, last_error = NULL, updated_at = ?
        WHERE id = ? AND revision = ? AND deleted_at IS NULL AND embedding_status = 'pending'
        "#,
    )
    .bind(now)
    .bind(id)
    .bind(revision)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Insert or replace the vector for `(entity_id, model_key)`
pub async fn upsert_embedding(
    conn: &mut SqliteConnection,
    entity_id: &str,
    model_key: &str,
    vector: &[f32],
    now: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO embeddings (entity_id, model_key, vector_bytes, dimension, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(entity_id, model_key) DO UPDATE SET
            vector_bytes = excluded.vector_bytes,
            dimension = excluded.dimension,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(entity_id)
    .bind(model_key)
    .bind(encode_vector(vector))
    .bind(vector.len() as i64)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Insert or replace the tombstone ledger entry for a document
pub async fn upsert_index_entry(
    conn: &mut SqliteConnection,
    entity_id: &str,
    deleted: bool,
    now: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO index_metadata (entity_id, entity_type, deleted, updated_at)
        VALUES (?, 'document', ?, ?)
        ON CONFLICT(entity_id) DO UPDATE SET
            deleted = excluded.deleted,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(entity_id)
    .bind(deleted as i64)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Soft-delete a live document. Returns false if it was missing or already deleted.
pub async fn soft_delete_document(conn: &mut SqliteConnection, id: &str, now: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE documents
        SET deleted_at = ?, claimed_at = NULL, updated_at = ?
        WHERE id = ? AND deleted_at IS NULL
        "#,
    )
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Drop tombstoned ledger rows and soft-deleted documents.
///
/// Embedding rows stay so a document's vector history is not lost.
pub async fn purge_tombstones(conn: &mut SqliteConnection) -> Result<PurgeStats> {
    let metadata = sqlx::query("DELETE FROM index_metadata WHERE deleted = 1")
        .execute(&mut *conn)
        .await?;
    let documents = sqlx::query("DELETE FROM documents WHERE deleted_at IS NOT NULL")
        .execute(&mut *conn)
        .await?;
    Ok(PurgeStats {
        metadata_rows: metadata.rows_affected(),
        documents: documents.rows_affected(),
    })
}

// ===== Vector codec =====

/// Little-endian f32 bytes
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::Other(format!(
            "Stored vector has {} bytes, not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// `%term%` with LIKE wildcards in `term` escaped by backslash
fn like_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for ch in term.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup_test_db() -> (MetaDb, TempDir) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.paths.db_file = tmp.path().join("test.db");

        let db = MetaDb::connect(&config).await.unwrap();
        db.init_schema().await.unwrap();
        (db, tmp)
    }

    fn note(title: &str, body: &str) -> NewDocument {
        NewDocument {
            category: "notes".to_string(),
            section: None,
            title: title.to_string(),
            body: body.to_string(),
        }
    }

    #[test]
    fn test_status_transitions() {
        use EmbeddingStatus::*;
        assert!(Pending.can_transition_to(Embedded));
        assert!(Pending.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));
        assert!(Embedded.can_transition_to(Pending));
        assert!(!Embedded.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Embedded));
        assert!(!Pending.can_transition_to(Pending));
        assert!(matches!(
            Embedded.check_transition(Failed),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_timestamps_sort_chronologically() {
        let early = Utc::now();
        let late = early + chrono::Duration::milliseconds(1500);
        assert!(format_timestamp(early) < format_timestamp(late));
        assert_eq!(format_timestamp(early).len(), format_timestamp(late).len());
    }

    #[test]
    fn test_vector_codec() {
        let v = vec![0.5f32, -1.25, 3.0];
        let bytes = encode_vector(&v);
        assert_eq!(bytes.len(), 12);
        assert_eq!(decode_vector(&bytes).unwrap(), v);
        assert!(decode_vector(&bytes[..5]).is_err());
    }

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
    }

    #[tokio::test]
    async fn test_document_insert_and_update() {
        let (db, _tmp) = setup_test_db().await;

        let doc = db.insert_document(&note("Tea", "Brew at 80C")).await.unwrap();
        assert_eq!(doc.status().unwrap(), EmbeddingStatus::Pending);
        assert_eq!(doc.revision, 1);

        // No-op update keeps the revision
        let same = db
            .update_document(&doc.id, &DocumentUpdate::default())
            .await
            .unwrap();
        assert_eq!(same.revision, 1);

        let mut tx = db.begin().await.unwrap();
        assert!(mark_embedded(&mut tx, &doc.id, 1, &now_timestamp()).await.unwrap());
        tx.commit().await.unwrap();

        let updated = db
            .update_document(
                &doc.id,
                &DocumentUpdate {
                    body: Some("Brew at 75C".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.revision, 2);
        assert_eq!(updated.status().unwrap(), EmbeddingStatus::Pending);
        assert_eq!(updated.body, "Brew at 75C");
    }

    #[tokio::test]
    async fn test_mark_embedded_guards_revision() {
        let (db, _tmp) = setup_test_db().await;
        let doc = db.insert_document(&note("a", "b")).await.unwrap();
        db.update_document(
            &doc.id,
            &DocumentUpdate {
                title: Some("a2".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let mut tx = db.begin().await.unwrap();
        assert!(!mark_embedded(&mut tx, &doc.id, 1, &now_timestamp()).await.unwrap());
        assert!(mark_embedded(&mut tx, &doc.id, 2, &now_timestamp()).await.unwrap());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_live_embeddings_respect_tombstones_and_model_key() {
        let (db, _tmp) = setup_test_db().await;
        let now = now_timestamp();

        let mut tx = db.begin().await.unwrap();
        upsert_embedding(&mut tx, "a", "m:f32", &[1.0, 0.0], &now).await.unwrap();
        upsert_embedding(&mut tx, "b", "m:f32", &[0.0, 1.0], &now).await.unwrap();
        upsert_embedding(&mut tx, "c", "other:q8", &[1.0, 1.0], &now).await.unwrap();
        upsert_index_entry(&mut tx, "a", false, &now).await.unwrap();
        upsert_index_entry(&mut tx, "b", true, &now).await.unwrap();
        upsert_index_entry(&mut tx, "c", false, &now).await.unwrap();
        tx.commit().await.unwrap();

        let live = db.live_embeddings("m:f32").await.unwrap();
        assert_eq!(live, vec![("a".to_string(), vec![1.0, 0.0])]);

        let keys = db.embedding_model_keys().await.unwrap();
        assert_eq!(
            keys,
            vec![("m:f32".to_string(), 2), ("other:q8".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn test_soft_delete_and_purge() {
        let (db, _tmp) = setup_test_db().await;
        let doc = db.insert_document(&note("gone", "soon")).await.unwrap();
        let now = now_timestamp();

        let mut tx = db.begin().await.unwrap();
        upsert_embedding(&mut tx, &doc.id, "m:f32", &[1.0], &now).await.unwrap();
        upsert_index_entry(&mut tx, &doc.id, false, &now).await.unwrap();
        assert!(soft_delete_document(&mut tx, &doc.id, &now).await.unwrap());
        assert!(!soft_delete_document(&mut tx, &doc.id, &now).await.unwrap());
        upsert_index_entry(&mut tx, &doc.id, true, &now).await.unwrap();
        tx.commit().await.unwrap();

        assert!(db.get_live_document(&doc.id).await.unwrap().is_none());
        assert!(db.get_document(&doc.id).await.unwrap().unwrap().is_deleted());
        assert!(db
            .update_document(&doc.id, &DocumentUpdate::default())
            .await
            .is_err());

        let mut tx = db.begin().await.unwrap();
        let purged = purge_tombstones(&mut tx).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(purged.metadata_rows, 1);
        assert_eq!(purged.documents, 1);

        assert!(db.get_document(&doc.id).await.unwrap().is_none());
        // Embedding history survives the purge
        assert!(db.get_embedding(&doc.id, "m:f32").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_find_documents_matching_is_literal() {
        let (db, _tmp) = setup_test_db().await;
        db.insert_document(&note("Discount", "50% off everything"))
            .await
            .unwrap();
        db.insert_document(&note("Other", "500 items")).await.unwrap();

        let hits = db
            .find_documents_matching(&["50%".to_string()], 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Discount");

        let hits = db
            .find_documents_matching(&["ITEMS".to_string()], 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_store_stats() {
        let (db, _tmp) = setup_test_db().await;
        db.insert_document(&note("one", "1")).await.unwrap();
        db.insert_document(&note("two", "2")).await.unwrap();

        let stats = db.store_stats().await.unwrap();
        assert_eq!(stats.documents, 2);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.claimed, 0);
        assert_eq!(stats.failed, 0);
    }
}
