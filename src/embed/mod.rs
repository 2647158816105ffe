//! Embedding generation
//!
//! This module provides an abstraction over embedding models with:
//! - A trait for different embedding backends
//! - An HTTP embedding backend

mod http_backend;

pub use http_backend::*;

use crate::error::Result;
use async_trait::async_trait;

/// Scale a vector to unit length; the zero vector is returned unchanged
pub fn normalize_embedding(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return vector.to_vec();
    }
    vector.iter().map(|v| v / norm).collect()
}

/// Trait for embedding providers
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;

    /// Get the embedding dimension
    fn dimension(&self) -> usize;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// Embed a single text
pub async fn embed_one(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    let mut vectors = embedder.embed(vec![text.to_string()]).await?;
    vectors.pop().ok_or_else(|| {
        crate::error::Error::EmbeddingGenerationFailed(format!(
            "Model '{}' returned no vector",
            embedder.model_name()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StubEmbedder;

    #[test]
    fn test_normalize_embedding() {
        let v = normalize_embedding(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(normalize_embedding(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_embed_one_matches_batch_embedding() {
        let embedder = StubEmbedder::new(8);
        let texts: Vec<String> = (0..4).map(|i| format!("text {}", i)).collect();

        let batch = embedder.embed(texts.clone()).await.unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(batch[2], embed_one(&embedder, &texts[2]).await.unwrap());
        assert!(embed_one(&embedder, "FAIL_EMBED").await.is_err());
    }
}
