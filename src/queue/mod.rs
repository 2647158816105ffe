//! Embedding job queue.
//!
//! The queue is the `documents` table itself: a row is a job while its
//! `embedding_status` is `pending`, and `claimed_at` marks it as taken by a
//! worker. A claim selects and marks its rows in one statement, so two
//! workers never get the same row.

mod worker;

pub use worker::*;

pub use crate::meta::EmbeddingStatus;

use crate::error::Result;
use crate::meta::{format_timestamp, now_timestamp, Document, MetaDb, DOCUMENT_COLUMNS};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite};
use std::time::Duration;
use tracing::{debug, info};

/// A claimed unit of work
#[derive(Debug, Clone)]
pub struct EmbeddingJob {
    pub id: String,
    /// Revision the text was read at; the commit is discarded if it moved on
    pub revision: i64,
    pub text: String,
}

impl From<&Document> for EmbeddingJob {
    fn from(doc: &Document) -> Self {
        Self {
            id: doc.id.clone(),
            revision: doc.revision,
            text: doc.embedding_text(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Pending rows, claimed or not
    pub pending: usize,
    pub claimed: usize,
    pub embedded: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct EmbeddingQueue {
    db: MetaDb,
}

impl EmbeddingQueue {
    pub fn new(db: MetaDb) -> Self {
        Self { db }
    }

    /// Claim up to `limit` of the oldest unclaimed pending rows.
    ///
    /// One `UPDATE ... RETURNING` picks and marks the rows, so concurrent
    /// claimers each get a full batch while unclaimed rows remain.
    pub async fn claim_batch(&self, limit: usize) -> Result<Vec<EmbeddingJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            UPDATE documents SET claimed_at = ?
            WHERE id IN (
                SELECT id FROM documents
                WHERE embedding_status = 'pending' AND claimed_at IS NULL AND deleted_at IS NULL
                ORDER BY created_at, id
                LIMIT ?
            )
            AND claimed_at IS NULL
            RETURNING {}
            "#,
            DOCUMENT_COLUMNS
        );
        let mut claimed: Vec<Document> = sqlx::query_as(&sql)
            .bind(now_timestamp())
            .bind(limit as i64)
            .fetch_all(self.db.pool())
            .await?;

        // RETURNING order is unspecified
        claimed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        if !claimed.is_empty() {
            debug!(claimed = claimed.len(), "Claimed embedding jobs");
        }
        Ok(claimed.iter().map(EmbeddingJob::from).collect())
    }

    /// Hand claimed rows back to the queue
    pub async fn release(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            "UPDATE documents SET claimed_at = NULL WHERE embedding_status = 'pending' AND id IN (",
        );
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(")");

        let result = qb.build().execute(self.db.pool()).await?;
        Ok(result.rows_affected())
    }

    /// Drop every claim; used at startup, when no worker can be running
    pub async fn release_all_claims(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE documents SET claimed_at = NULL WHERE claimed_at IS NOT NULL")
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected())
    }

    /// Drop claims older than `max_age`
    pub async fn reclaim_stale(&self, max_age: Duration) -> Result<u64> {
        let age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now()
            .checked_sub_signed(age)
            .map(format_timestamp)
            .unwrap_or_default();

        let result = sqlx::query(
            r#"
            UPDATE documents SET claimed_at = NULL
            WHERE claimed_at IS NOT NULL AND claimed_at < ? AND embedding_status = 'pending'
            "#,
        )
        .bind(cutoff)
        .execute(self.db.pool())
        .await?;

        let reclaimed = result.rows_affected();
        if reclaimed > 0 {
            info!(reclaimed, "Reclaimed stale embedding claims");
        }
        Ok(reclaimed)
    }

    /// `pending -> failed` for the revision that failed
    pub async fn mark_failed(&self, id: &str, revision: i64, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE documents
            SET embedding_status = 'failed', claimed_at = NULL, last_error = ?, updated_at = ?
            WHERE id = ? AND revision = ? AND embedding_status = 'pending' AND deleted_at IS NULL
            "#,
        )
        .bind(error)
        .bind(now_timestamp())
        .bind(id)
        .bind(revision)
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// `failed -> pending` for the given ids, or for every failed row
    pub async fn retry_failed(&self, ids: Option<&[String]>) -> Result<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "UPDATE documents SET embedding_status = 'pending', last_error = NULL, claimed_at = NULL, updated_at = ",
        );
        qb.push_bind(now_timestamp());
        qb.push(" WHERE embedding_status = 'failed' AND deleted_at IS NULL");

        if let Some(ids) = ids {
            if ids.is_empty() {
                return Ok(0);
            }
            qb.push(" AND id IN (");
            let mut separated = qb.separated(", ");
            for id in ids {
                separated.push_bind(id.clone());
            }
            separated.push_unseparated(")");
        }

        let result = qb.build().execute(self.db.pool()).await?;
        let retried = result.rows_affected();
        info!(retried, "Requeued failed embedding jobs");
        Ok(retried)
    }

    /// Put every live document back in the queue at a new revision
    pub async fn requeue_all(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE documents
            SET embedding_status = 'pending', revision = revision + 1,
                claimed_at = NULL, last_error = NULL, updated_at = ?
            WHERE deleted_at IS NULL
            "#,
        )
        .bind(now_timestamp())
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Live pending rows, claimed or not; failed rows are not counted
    pub async fn count_pending(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM documents WHERE embedding_status = 'pending' AND deleted_at IS NULL",
        )
        .fetch_one(self.db.pool())
        .await?;
        Ok(count as usize)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let stats = self.db.store_stats().await?;
        Ok(QueueStats {
            pending: stats.pending,
            claimed: stats.claimed,
            embedded: stats.embedded,
            failed: stats.failed,
        })
    }

    /// Failed rows with their last error, newest first
    pub async fn list_failed(&self, limit: usize) -> Result<Vec<Document>> {
        let docs = sqlx::query_as(
            r#"
            SELECT id, category, section, title, body, embedding_status, revision,
                   claimed_at, last_error, created_at, updated_at, deleted_at
            FROM documents
            WHERE embedding_status = 'failed' AND deleted_at IS NULL
            ORDER BY updated_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(self.db.pool())
        .await?;
        Ok(docs)
    }
}
