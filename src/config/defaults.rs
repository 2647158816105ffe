//! Default values for configuration

use super::{PersistencePolicy, SearchMode};

/// Default embedding backend URL
pub fn default_embedding_url() -> String {
    std::env::var("MEMORIA_EMBEDDING_URL").unwrap_or_else(|_| "http://127.0.0.1:7997".to_string())
}

/// Default embedding model (BAAI/bge-small-en-v1.5)
pub fn default_embedding_model() -> String {
    "BAAI/bge-small-en-v1.5".to_string()
}

/// Default quantization label, second half of the model key
pub fn default_embedding_quantization() -> String {
    "f32".to_string()
}

/// Default embedding request timeout in seconds
pub fn default_embedding_timeout() -> u64 {
    30
}

/// Default number of retries for embedding requests
pub fn default_embedding_retries() -> usize {
    2
}

/// Default persistence policy
pub fn default_persistence() -> PersistencePolicy {
    PersistencePolicy::Immediate
}

/// Default flush interval for periodic persistence (seconds)
pub fn default_flush_interval() -> u64 {
    30
}

/// Default tombstone ratio that triggers a rebuild
pub fn default_tombstone_threshold() -> f64 {
    0.20
}

/// Default per-file size cap for imported bundles (512 MB)
pub fn default_max_import_bytes() -> u64 {
    512 * 1024 * 1024
}

/// Default number of worker loops
pub fn default_worker_count() -> usize {
    2
}

/// Default number of rows claimed per worker iteration
pub fn default_worker_batch_size() -> usize {
    16
}

/// Default idle poll interval (milliseconds)
pub fn default_poll_interval() -> u64 {
    500
}

/// Default age after which an in-progress claim is considered abandoned
pub fn default_stale_claim() -> u64 {
    600
}

/// Default drain timeout (seconds)
pub fn default_drain_timeout() -> u64 {
    60
}

/// Default search mode
pub fn default_search_mode() -> SearchMode {
    SearchMode::Auto
}

/// Default number of search results
pub fn default_search_k() -> usize {
    10
}

/// Default maximum number of search results
pub fn default_search_max_k() -> usize {
    100
}

/// Default number of duplicate candidates
pub fn default_duplicate_k() -> usize {
    5
}

/// Default minimum score for a duplicate candidate
pub fn default_duplicate_min_score() -> f32 {
    0.85
}

/// Default hint attached to degraded search responses
pub fn default_fallback_hint() -> String {
    "use literal keywords".to_string()
}

/// Default: reranker disabled
pub fn default_reranker_enabled() -> bool {
    false
}

/// Default reranker model (cross-encoder)
pub fn default_reranker_model() -> String {
    "BAAI/bge-reranker-base".to_string()
}

/// Default reranker backend URL
pub fn default_reranker_url() -> String {
    std::env::var("MEMORIA_RERANKER_URL").unwrap_or_else(|_| "http://127.0.0.1:7997".to_string())
}

/// Default number of vector candidates handed to the reranker
pub fn default_rerank_candidates() -> usize {
    50
}
