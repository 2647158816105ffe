//! Fixtures shared by the unit tests

use crate::config::PersistencePolicy;
use crate::embed::{normalize_embedding, Embedder};
use crate::error::{Error, Result};
use crate::index::IndexManagerOptions;
use crate::meta::MetaDb;
use async_trait::async_trait;
use std::time::Duration;
use tempfile::TempDir;

pub(crate) const FAIL_MARKER: &str = "FAIL_EMBED";

/// Deterministic unit vector derived from the text's hash
pub(crate) fn stub_vector(text: &str, dim: usize) -> Vec<f32> {
    let mut raw = Vec::with_capacity(dim);
    let mut reader = blake3::Hasher::new().update(text.as_bytes()).finalize_xof();
    let mut buf = [0u8; 4];
    for _ in 0..dim {
        reader.fill(&mut buf);
        let unit = u32::from_le_bytes(buf) as f32 / u32::MAX as f32;
        raw.push(unit * 2.0 - 1.0);
    }
    normalize_embedding(&raw)
}

/// Embedder that needs no network. Texts containing `FAIL_EMBED` fail.
pub(crate) struct StubEmbedder {
    dim: usize,
    delay: Option<Duration>,
}

impl StubEmbedder {
    pub(crate) fn new(dim: usize) -> Self {
        Self { dim, delay: None }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        texts
            .iter()
            .map(|t| {
                if t.contains(FAIL_MARKER) {
                    Err(Error::EmbeddingGenerationFailed(format!(
                        "stub refused '{}'",
                        t
                    )))
                } else {
                    Ok(stub_vector(t, self.dim))
                }
            })
            .collect()
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn model_name(&self) -> &str {
        "stub"
    }
}

/// Fresh database with the schema applied, living in a temp dir
pub(crate) async fn test_db() -> (MetaDb, TempDir) {
    let tmp = TempDir::new().unwrap();
    let db = MetaDb::open(&tmp.path().join("metadata.db")).await.unwrap();
    db.init_schema().await.unwrap();
    (db, tmp)
}

pub(crate) fn test_options(dim: usize) -> IndexManagerOptions {
    IndexManagerOptions {
        model_key: "test-model:f32".to_string(),
        dimension: dim,
        persistence: PersistencePolicy::Immediate,
        flush_interval: Duration::from_secs(30),
        tombstone_threshold: 0.20,
        max_import_bytes: 64 * 1024 * 1024,
    }
}
