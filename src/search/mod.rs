//! Search over stored documents.
//!
//! `SearchService` runs a provider chain: vector search first, then literal
//! keyword search when the vector path is unavailable, empty or failing.
//! Responses served by the fallback are flagged `degraded` and carry a hint
//! for the caller.

mod providers;

pub use providers::*;

use crate::config::{SearchConfig, SearchMode};
use crate::error::{Error, Result};
use crate::meta::Document;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Which provider produced a hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HitSource {
    Vector,
    Text,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub title: String,
    pub body: String,
    pub score: f32,
    pub source: HitSource,
}

impl SearchHit {
    pub fn from_document(doc: Document, score: f32, source: HitSource) -> Self {
        Self {
            id: doc.id,
            category: doc.category,
            section: doc.section,
            title: doc.title,
            body: doc.body,
            score,
            source,
        }
    }

    /// Text handed to the reranker
    pub fn text(&self) -> String {
        match &self.section {
            Some(section) => format!("{}\n{}\n\n{}", self.title, section, self.body),
            None => format!("{}\n\n{}", self.title, self.body),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub hits: Vec<SearchHit>,
    pub source: HitSource,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateReport {
    pub candidates: Vec<SearchHit>,
    pub source: HitSource,
    pub degraded: bool,
    pub min_score: f32,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn source(&self) -> HitSource;

    async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>>;
}

struct ChainOutcome {
    hits: Vec<SearchHit>,
    source: HitSource,
    degraded: bool,
}

pub struct SearchService {
    config: SearchConfig,
    vector: Option<Arc<dyn SearchProvider>>,
    text: Arc<dyn SearchProvider>,
}

impl SearchService {
    pub fn new(
        config: SearchConfig,
        vector: Option<Arc<dyn SearchProvider>>,
        text: Arc<dyn SearchProvider>,
    ) -> Self {
        Self {
            config,
            vector,
            text,
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    async fn run_chain(&self, query: &str, k: usize) -> Result<ChainOutcome> {
        if self.config.mode == SearchMode::TextOnly {
            let hits = self.text.search(query, k).await?;
            return Ok(ChainOutcome {
                hits,
                source: self.text.source(),
                degraded: false,
            });
        }

        match &self.vector {
            Some(vector) => match vector.search(query, k).await {
                Ok(hits) => {
                    return Ok(ChainOutcome {
                        hits,
                        source: vector.source(),
                        degraded: false,
                    })
                }
                Err(e) => warn!(error = %e, "Vector search failed, using text fallback"),
            },
            None => debug!("No vector provider, using text fallback"),
        }

        let hits = self.text.search(query, k).await?;
        Ok(ChainOutcome {
            hits,
            source: self.text.source(),
            degraded: true,
        })
    }

    fn clamp_k(&self, k: Option<usize>) -> usize {
        k.unwrap_or(self.config.default_k)
            .clamp(1, self.config.max_k.max(1))
    }

    /// Search with the configured policy; `k` defaults to `search.default_k`
    /// and is capped at `search.max_k`.
    pub async fn search(&self, query: &str, k: Option<usize>) -> Result<SearchResponse> {
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::InvalidQuery("query is empty".to_string()));
        }

        let k = self.clamp_k(k);
        let outcome = self.run_chain(query, k).await?;
        debug!(
            hits = outcome.hits.len(),
            degraded = outcome.degraded,
            "Search complete"
        );

        Ok(SearchResponse {
            query: query.to_string(),
            hint: outcome
                .degraded
                .then(|| self.config.fallback_hint.clone()),
            hits: outcome.hits,
            source: outcome.source,
            degraded: outcome.degraded,
        })
    }

    /// Near-duplicate candidates for `text`, excluding `exclude_id`.
    ///
    /// Only reports candidates; deciding what to merge is the caller's job.
    pub async fn find_duplicates(
        &self,
        text: &str,
        exclude_id: Option<&str>,
    ) -> Result<DuplicateReport> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::InvalidQuery("text is empty".to_string()));
        }

        let k = self.config.duplicate_k.max(1);
        let fetch = if exclude_id.is_some() { k + 1 } else { k };
        let outcome = self.run_chain(text, fetch).await?;
        let min_score = self.config.duplicate_min_score;

        let mut candidates: Vec<SearchHit> = outcome
            .hits
            .into_iter()
            .filter(|hit| Some(hit.id.as_str()) != exclude_id)
            .filter(|hit| hit.score >= min_score)
            .collect();
        candidates.truncate(k);

        Ok(DuplicateReport {
            candidates,
            source: outcome.source,
            degraded: outcome.degraded,
            min_score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RerankerConfig;
    use crate::embed::Embedder;
    use crate::index::{IndexFiles, IndexManager};
    use crate::meta::{MetaDb, NewDocument};
    use crate::rerank::HttpReranker;
    use crate::test_support::{stub_vector, test_db, test_options, StubEmbedder};
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DIM: usize = 8;

    struct Fixture {
        db: MetaDb,
        manager: Arc<IndexManager>,
        embedder: Arc<dyn Embedder>,
        _tmp: TempDir,
    }

    impl Fixture {
        async fn new() -> Self {
            let (db, tmp) = test_db().await;
            let manager = Arc::new(
                IndexManager::open(db.clone(), IndexFiles::new(tmp.path().join("index")), test_options(DIM))
                    .await
                    .unwrap(),
            );
            Self {
                db,
                manager,
                embedder: Arc::new(StubEmbedder::new(DIM)),
                _tmp: tmp,
            }
        }

        /// Insert and embed synchronously, the way a worker would
        async fn add(&self, title: &str, body: &str) -> Document {
            let doc = self
                .db
                .insert_document(&NewDocument {
                    category: "notes".to_string(),
                    section: None,
                    title: title.to_string(),
                    body: body.to_string(),
                })
                .await
                .unwrap();
            let vector = stub_vector(&doc.embedding_text(), DIM);
            self.manager
                .commit_embedding(&doc.id, doc.revision, &vector)
                .await
                .unwrap();
            doc
        }

        fn vector_provider(&self) -> VectorProvider {
            VectorProvider::new(Arc::clone(&self.manager), self.db.clone(), Arc::clone(&self.embedder))
        }

        fn service(&self, config: SearchConfig) -> SearchService {
            SearchService::new(
                config,
                Some(Arc::new(self.vector_provider())),
                Arc::new(TextProvider::new(self.db.clone())),
            )
        }
    }

    #[tokio::test]
    async fn test_vector_search_ranks_exact_text_first() {
        let fx = Fixture::new().await;
        let target = fx.add("Deploy checklist", "run migrations before restart").await;
        fx.add("Lunch", "sandwiches on friday").await;
        fx.add("Standup", "daily at nine").await;

        let service = fx.service(SearchConfig::default());
        let response = service
            .search(&target.embedding_text(), Some(2))
            .await
            .unwrap();
        assert!(!response.degraded);
        assert!(response.hint.is_none());
        assert_eq!(response.source, HitSource::Vector);
        assert_eq!(response.hits.len(), 2);
        assert_eq!(response.hits[0].id, target.id);
        assert!((response.hits[0].score - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_empty_index_falls_back_to_text() {
        let fx = Fixture::new().await;
        let doc = fx
            .db
            .insert_document(&NewDocument {
                category: "notes".to_string(),
                section: Some("ops".to_string()),
                title: "Rotate keys".to_string(),
                body: "Rotate the signing keys every quarter".to_string(),
            })
            .await
            .unwrap();

        let config = SearchConfig::default();
        let hint = config.fallback_hint.clone();
        let response = fx.service(config).search("signing keys", None).await.unwrap();
        assert!(response.degraded);
        assert_eq!(response.hint.as_deref(), Some(hint.as_str()));
        assert_eq!(response.source, HitSource::Text);
        assert_eq!(response.hits.len(), 1);
        assert_eq!(response.hits[0].id, doc.id);
        assert_eq!(response.hits[0].score, 1.0);
    }

    #[tokio::test]
    async fn test_embedding_failure_falls_back_to_text() {
        let fx = Fixture::new().await;
        fx.add("FAIL_EMBED notes", "anything").await;
        let response = fx
            .service(SearchConfig::default())
            .search("FAIL_EMBED", None)
            .await
            .unwrap();
        assert!(response.degraded);
        assert_eq!(response.hits.len(), 1);
    }

    #[tokio::test]
    async fn test_text_only_mode_is_not_degraded() {
        let fx = Fixture::new().await;
        fx.add("Alpha", "first letter").await;
        let config = SearchConfig {
            mode: SearchMode::TextOnly,
            ..SearchConfig::default()
        };
        let response = fx.service(config).search("alpha", None).await.unwrap();
        assert!(!response.degraded);
        assert_eq!(response.source, HitSource::Text);
        assert_eq!(response.hits.len(), 1);
    }

    #[tokio::test]
    async fn test_text_candidates_prefer_more_matched_terms() {
        let fx = Fixture::new().await;
        let best = fx.add("alpha beta", "").await;
        for i in 0..4 {
            fx.add(&format!("alpha {}", i), "").await;
        }

        // k = 1 fetches four candidates; the four newer rows match one term
        let provider = TextProvider::new(fx.db.clone());
        let hits = provider.search("alpha beta", 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, best.id);
        assert_eq!(hits[0].score, 1.0);
    }

    #[tokio::test]
    async fn test_text_case_folding_is_ascii_only() {
        let fx = Fixture::new().await;
        let doc = fx.add("ÉCOLE Notes", "").await;

        let provider = TextProvider::new(fx.db.clone());
        // "école" is not an ASCII case variant of "ÉCOLE", for LIKE or for scoring
        let hits = provider.search("école NOTES", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, doc.id);
        assert_eq!(hits[0].score, 0.5);

        let hits = provider.search("ÉCOLE", 5).await.unwrap();
        assert_eq!(hits[0].score, 1.0);
        assert!(provider.search("école", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_text_score_is_fraction_of_terms() {
        let fx = Fixture::new().await;
        let both = fx.add("alpha beta", "").await;
        let one = fx.add("alpha only", "").await;

        let provider = TextProvider::new(fx.db.clone());
        let hits = provider.search("Alpha BETA", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, both.id);
        assert_eq!(hits[0].score, 1.0);
        assert_eq!(hits[1].id, one.id);
        assert_eq!(hits[1].score, 0.5);
    }

    #[tokio::test]
    async fn test_deleted_documents_never_returned() {
        let fx = Fixture::new().await;
        let gone = fx.add("retired runbook", "old pager rotation").await;
        let kept = fx.add("current runbook", "new pager rotation").await;
        assert!(fx.manager.delete(&gone.id).await.unwrap());

        let service = fx.service(SearchConfig::default());
        let vector = service.search(&gone.embedding_text(), Some(5)).await.unwrap();
        assert!(vector.hits.iter().all(|h| h.id != gone.id));

        let text = TextProvider::new(fx.db.clone())
            .search("runbook", 5)
            .await
            .unwrap();
        assert_eq!(text.len(), 1);
        assert_eq!(text[0].id, kept.id);
    }

    #[tokio::test]
    async fn test_query_validation_and_k_clamp() {
        let fx = Fixture::new().await;
        for i in 0..5 {
            fx.add(&format!("note {}", i), "shared words").await;
        }
        let config = SearchConfig {
            max_k: 2,
            ..SearchConfig::default()
        };
        let service = fx.service(config);

        assert!(matches!(
            service.search("   ", None).await,
            Err(Error::InvalidQuery(_))
        ));
        let response = service.search("shared words", Some(50)).await.unwrap();
        assert_eq!(response.hits.len(), 2);
    }

    #[tokio::test]
    async fn test_find_duplicates_excludes_self_and_filters_score() {
        let fx = Fixture::new().await;
        let original = fx.add("Backup policy", "nightly snapshots kept 30 days").await;
        let copy = fx.add("Backup policy", "nightly snapshots kept 30 days").await;
        fx.add("Holiday calendar", "office closed in august").await;

        let config = SearchConfig {
            duplicate_min_score: 0.99,
            ..SearchConfig::default()
        };
        let report = fx
            .service(config)
            .find_duplicates(&original.embedding_text(), Some(&original.id))
            .await
            .unwrap();
        assert!(!report.degraded);
        assert_eq!(report.candidates.len(), 1);
        assert_eq!(report.candidates[0].id, copy.id);
    }

    #[tokio::test]
    async fn test_reranker_reorders_candidates() {
        let fx = Fixture::new().await;
        let first = fx.add("apples", "red fruit").await;
        fx.add("pears", "green fruit").await;

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/rerank"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"index": 0, "score": 0.1}, {"index": 1, "score": 0.9}]
            })))
            .mount(&server)
            .await;
        let reranker = HttpReranker::new(&RerankerConfig {
            enabled: true,
            url: server.uri(),
            ..RerankerConfig::default()
        })
        .unwrap();

        let provider = fx.vector_provider().with_reranker(Arc::new(reranker), 10);
        let hits = provider.search(&first.embedding_text(), 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_ne!(hits[0].id, first.id);
        assert_eq!(hits[0].score, 0.9);
    }
}
