//! Reranking support for search results

mod http_backend;

pub use http_backend::*;

use crate::config::RerankerConfig;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct RerankResult {
    pub index: usize,
    pub score: f32,
}

#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, documents: Vec<String>) -> Result<Vec<RerankResult>>;
    fn model_name(&self) -> &str;
}

/// Build the configured reranker, or `None` when reranking is disabled
pub fn create_reranker(config: &RerankerConfig) -> Result<Option<Arc<dyn Reranker>>> {
    if !config.enabled {
        return Ok(None);
    }
    let reranker = HttpReranker::new(config)?;
    Ok(Some(Arc::new(reranker)))
}
