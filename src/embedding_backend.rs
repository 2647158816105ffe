use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, Serialize)]
struct EmbedTextRequest {
    model: String,
    inputs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum EmbeddingResponse {
    Embeddings { embeddings: Vec<Vec<f32>> },
    Vectors { vectors: Vec<Vec<f32>> },
    Data { data: Vec<EmbeddingData> },
}

#[derive(Debug, Clone, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl EmbeddingResponse {
    fn into_embeddings(self) -> Vec<Vec<f32>> {
        match self {
            EmbeddingResponse::Embeddings { embeddings } => embeddings,
            EmbeddingResponse::Vectors { vectors } => vectors,
            EmbeddingResponse::Data { data } => data.into_iter().map(|d| d.embedding).collect(),
        }
    }
}

/// HTTP client for an embedding sidecar
pub struct EmbeddingBackendClient {
    client: Client,
    base_url: Url,
    retries: usize,
}

impl EmbeddingBackendClient {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let base_url = Url::parse(&config.url)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url,
            retries: config.retries,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Config(format!("Invalid embedding backend URL: {}", e)))
    }

    async fn send_with_retry<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let mut last_err: Option<Error> = None;
        for attempt in 0..=self.retries {
            let req = request.try_clone().ok_or_else(|| {
                Error::EmbeddingGenerationFailed("Failed to clone backend request".to_string())
            })?;
            match req.send().await {
                Ok(response) => match response.error_for_status() {
                    Ok(ok) => match ok.json::<T>().await {
                        Ok(parsed) => return Ok(parsed),
                        Err(e) => last_err = Some(Error::EmbeddingGenerationFailed(e.to_string())),
                    },
                    Err(e) => last_err = Some(Error::EmbeddingGenerationFailed(e.to_string())),
                },
                Err(e) => last_err = Some(Error::EmbeddingGenerationFailed(e.to_string())),
            }

            if attempt < self.retries {
                debug!(attempt, "Embedding backend request failed, retrying");
                tokio::time::sleep(Duration::from_millis(200 * (attempt + 1) as u64)).await;
            }
        }

        Err(last_err.unwrap_or_else(|| {
            Error::EmbeddingGenerationFailed("Embedding backend request failed".to_string())
        }))
    }

    pub async fn embed_text(&self, model: &str, inputs: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let url = self.endpoint("/v1/embed/text")?;
        let request = EmbedTextRequest {
            model: model.to_string(),
            inputs,
        };
        let parsed: EmbeddingResponse = self
            .send_with_retry(self.client.post(url).json(&request))
            .await?;
        Ok(parsed.into_embeddings())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer, retries: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            url: server.uri(),
            retries,
            ..EmbeddingConfig::default()
        }
    }

    #[test]
    fn test_response_shapes() {
        let a: EmbeddingResponse = serde_json::from_value(json!({"embeddings": [[1.0, 2.0]]})).unwrap();
        let b: EmbeddingResponse = serde_json::from_value(json!({"vectors": [[1.0, 2.0]]})).unwrap();
        let c: EmbeddingResponse =
            serde_json::from_value(json!({"data": [{"embedding": [1.0, 2.0]}]})).unwrap();
        for parsed in [a, b, c] {
            assert_eq!(parsed.into_embeddings(), vec![vec![1.0, 2.0]]);
        }
    }

    #[tokio::test]
    async fn test_embed_text_posts_model_and_inputs() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embed/text"))
            .and(body_partial_json(json!({"model": "m", "inputs": ["hello"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"embeddings": [[0.1, 0.2, 0.3]]})))
            .expect(1)
            .mount(&server)
            .await;

        let client = EmbeddingBackendClient::new(&config_for(&server, 0)).unwrap();
        let out = client.embed_text("m", vec!["hello".to_string()]).await.unwrap();
        assert_eq!(out, vec![vec![0.1, 0.2, 0.3]]);
    }

    #[tokio::test]
    async fn test_retries_then_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embed/text"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let client = EmbeddingBackendClient::new(&config_for(&server, 1)).unwrap();
        let err = client
            .embed_text("m", vec!["x".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmbeddingGenerationFailed(_)));
    }
}
