use super::{HitSource, SearchHit, SearchProvider};
use crate::embed::{embed_one, Embedder};
use crate::error::Result;
use crate::index::IndexManager;
use crate::meta::{Document, MetaDb};
use crate::rerank::Reranker;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Text candidates fetched per requested hit before scoring
const TEXT_CANDIDATE_FACTOR: usize = 4;

/// Nearest-neighbour search over the vector index
pub struct VectorProvider {
    manager: Arc<IndexManager>,
    db: MetaDb,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
    candidate_limit: usize,
}

impl VectorProvider {
    pub fn new(manager: Arc<IndexManager>, db: MetaDb, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            manager,
            db,
            embedder,
            reranker: None,
            candidate_limit: 0,
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>, candidate_limit: usize) -> Self {
        self.reranker = Some(reranker);
        self.candidate_limit = candidate_limit;
        self
    }

    /// Look up documents for scored ids, preserving order and dropping any
    /// that were deleted since the index answered.
    async fn hydrate(&self, scored: Vec<(String, f32)>) -> Result<Vec<SearchHit>> {
        let ids: Vec<String> = scored.iter().map(|(id, _)| id.clone()).collect();
        let mut docs: HashMap<String, Document> = self
            .db
            .get_live_documents(&ids)
            .await?
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();

        Ok(scored
            .into_iter()
            .filter_map(|(id, score)| {
                docs.remove(&id)
                    .map(|doc| SearchHit::from_document(doc, score, HitSource::Vector))
            })
            .collect())
    }
}

async fn apply_reranker(
    reranker: &dyn Reranker,
    query: &str,
    hits: Vec<SearchHit>,
) -> Result<Vec<SearchHit>> {
    if hits.is_empty() {
        return Ok(hits);
    }

    let texts: Vec<String> = hits.iter().map(SearchHit::text).collect();
    let mut reranked = reranker.rerank(query, texts).await?;
    if reranked.is_empty() {
        return Ok(hits);
    }

    reranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut ordered = Vec::with_capacity(reranked.len());
    for r in reranked {
        if let Some(hit) = hits.get(r.index) {
            let mut updated = hit.clone();
            updated.score = r.score;
            ordered.push(updated);
        }
    }
    Ok(ordered)
}

#[async_trait]
impl SearchProvider for VectorProvider {
    fn source(&self) -> HitSource {
        HitSource::Vector
    }

    async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        let vector = embed_one(self.embedder.as_ref(), query).await?;
        let fetch = match self.reranker {
            Some(_) => self.candidate_limit.max(k),
            None => k,
        };

        let scored = self.manager.search(&vector, fetch).await?;
        debug!(candidates = scored.len(), "Vector candidates");
        let mut hits = self.hydrate(scored).await?;

        if let Some(reranker) = &self.reranker {
            hits = apply_reranker(reranker.as_ref(), query, hits).await?;
        }
        hits.truncate(k);
        Ok(hits)
    }
}

/// Literal keyword search over live documents
pub struct TextProvider {
    db: MetaDb,
}

impl TextProvider {
    pub fn new(db: MetaDb) -> Self {
        Self { db }
    }
}

/// ASCII-lowercased, de-duplicated whitespace terms.
///
/// Case folding stays ASCII-only to agree with SQLite `LIKE`, which picks
/// the candidates.
pub(crate) fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for term in query.split_whitespace().map(str::to_ascii_lowercase) {
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

/// Fraction of `terms` found in the document's title, section or body
pub(crate) fn term_score(doc: &Document, terms: &[String]) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let haystack = doc.embedding_text().to_ascii_lowercase();
    let matched = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
    matched as f32 / terms.len() as f32
}

#[async_trait]
impl SearchProvider for TextProvider {
    fn source(&self) -> HitSource {
        HitSource::Text
    }

    async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        let terms = query_terms(query);
        let docs = self
            .db
            .find_documents_matching(&terms, k.saturating_mul(TEXT_CANDIDATE_FACTOR))
            .await?;

        let mut hits: Vec<SearchHit> = docs
            .into_iter()
            .map(|doc| {
                let score = term_score(&doc, &terms);
                SearchHit::from_document(doc, score, HitSource::Text)
            })
            .filter(|hit| hit.score > 0.0)
            .collect();

        // Stable: equal scores keep the store's most-recent-first order
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);
        Ok(hits)
    }
}
