use super::Embedder;
use crate::config::EmbeddingConfig;
use crate::embedding_backend::EmbeddingBackendClient;
use crate::error::{Error, Result};
use async_trait::async_trait;
use tracing::info;

const DIMENSION_PROBE: &str = "memoria dimension probe";

/// Embedder backed by an HTTP embedding sidecar.
///
/// The vector dimension is never configured; `connect` asks the live model.
pub struct HttpEmbedder {
    client: EmbeddingBackendClient,
    model_id: String,
    dimension: usize,
}

impl HttpEmbedder {
    /// Build the client and probe the model's dimension
    pub async fn connect(config: &EmbeddingConfig) -> Result<Self> {
        let client = EmbeddingBackendClient::new(config)?;
        let probe = client
            .embed_text(&config.model, vec![DIMENSION_PROBE.to_string()])
            .await?;
        let dimension = match probe.first() {
            Some(vector) if !vector.is_empty() => vector.len(),
            _ => {
                return Err(Error::EmbeddingGenerationFailed(format!(
                    "Model '{}' returned no vector for the dimension probe",
                    config.model
                )))
            }
        };

        info!(model = %config.model, dimension, "Embedding backend ready");
        Ok(Self {
            client,
            model_id: config.model.clone(),
            dimension,
        })
    }

    fn validate_dimensions(&self, embeddings: &[Vec<f32>]) -> Result<()> {
        if let Some(mismatch) = embeddings.iter().find(|vec| vec.len() != self.dimension) {
            return Err(Error::EmbeddingGenerationFailed(format!(
                "Embedding dimension mismatch for model '{}': expected {}, got {}",
                self.model_id,
                self.dimension,
                mismatch.len()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let expected = texts.len();
        let embeddings = self.client.embed_text(&self.model_id, texts).await?;
        if embeddings.len() != expected {
            return Err(Error::EmbeddingGenerationFailed(format!(
                "Model '{}' returned {} vectors for {} inputs",
                self.model_id,
                embeddings.len(),
                expected
            )));
        }
        self.validate_dimensions(&embeddings)?;
        Ok(embeddings)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> EmbeddingConfig {
        EmbeddingConfig {
            url: server.uri(),
            retries: 0,
            ..EmbeddingConfig::default()
        }
    }

    #[tokio::test]
    async fn test_connect_probes_dimension() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embed/text"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"vectors": [[0.0, 1.0, 0.0, 0.5]]})),
            )
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::connect(&config_for(&server)).await.unwrap();
        assert_eq!(embedder.dimension(), 4);
        assert_eq!(embedder.model_name(), EmbeddingConfig::default().model);
    }

    #[tokio::test]
    async fn test_connect_rejects_empty_probe() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embed/text"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"embeddings": []})))
            .mount(&server)
            .await;

        let err = HttpEmbedder::connect(&config_for(&server)).await.err().unwrap();
        assert!(matches!(err, Error::EmbeddingGenerationFailed(_)));
    }

    #[tokio::test]
    async fn test_embed_rejects_wrong_dimension() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embed/text"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"embeddings": [[1.0, 2.0]]})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/embed/text"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"embeddings": [[1.0, 2.0, 3.0]]})))
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::connect(&config_for(&server)).await.unwrap();
        let err = embedder.embed(vec!["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, Error::EmbeddingGenerationFailed(_)));
    }
}
