//! Configuration management for memoria
//!
//! Handles loading, saving, and validating configuration from TOML files.

mod defaults;

pub use defaults::*;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Embedding backend configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Vector index configuration
    #[serde(default)]
    pub index: IndexConfig,

    /// Embedding worker configuration
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Search configuration
    #[serde(default)]
    pub search: SearchConfig,

    /// Reranker configuration
    #[serde(default)]
    pub reranker: RerankerConfig,

    /// Paths configuration (internal, not user-editable)
    #[serde(skip)]
    pub paths: PathsConfig,
}

/// Embedding backend configuration
///
/// The vector dimension is deliberately absent: it is probed from the live
/// backend at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Backend base URL
    #[serde(default = "default_embedding_url")]
    pub url: String,

    /// Model name/identifier
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Quantization label served by the backend (e.g. "f32", "q8")
    #[serde(default = "default_embedding_quantization")]
    pub quantization: String,

    /// Request timeout in seconds
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,

    /// Retries per request
    #[serde(default = "default_embedding_retries")]
    pub retries: usize,
}

impl EmbeddingConfig {
    /// Composite key identifying which vectors belong together.
    ///
    /// This is the only place the key is formatted. The relational filter,
    /// the index sidecar and the consistency check all go through it.
    pub fn model_key(&self) -> String {
        format!("{}:{}", self.model, self.quantization)
    }
}

/// When the in-memory index is written to disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistencePolicy {
    /// Save after every mutating call
    Immediate,
    /// A background task saves when dirty
    Periodic,
    /// Only on explicit request
    Manual,
}

impl fmt::Display for PersistencePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistencePolicy::Immediate => write!(f, "immediate"),
            PersistencePolicy::Periodic => write!(f, "periodic"),
            PersistencePolicy::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for PersistencePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "immediate" => Ok(PersistencePolicy::Immediate),
            "periodic" => Ok(PersistencePolicy::Periodic),
            "manual" => Ok(PersistencePolicy::Manual),
            _ => Err(Error::Config(format!("Unknown persistence policy: {}", s))),
        }
    }
}

/// Vector index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Persistence policy
    #[serde(default = "default_persistence")]
    pub persistence: PersistencePolicy,

    /// Flush interval for the periodic policy
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Tombstone ratio above which the next mutation rebuilds the index
    #[serde(default = "default_tombstone_threshold")]
    pub tombstone_threshold: f64,

    /// Per-file size cap when importing a bundle
    #[serde(default = "default_max_import_bytes")]
    pub max_import_bytes: u64,
}

impl IndexConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

/// Embedding worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of polling loops
    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// Rows claimed per iteration
    #[serde(default = "default_worker_batch_size")]
    pub batch_size: usize,

    /// Sleep between polls of an empty queue
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Claims older than this are handed back to the queue
    #[serde(default = "default_stale_claim")]
    pub stale_claim_secs: u64,

    /// Default drain timeout
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_claim_age(&self) -> Duration {
        Duration::from_secs(self.stale_claim_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Provider selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Prefer vector search, fall back to text
    Auto,
    /// Always use text search
    TextOnly,
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchMode::Auto => write!(f, "auto"),
            SearchMode::TextOnly => write!(f, "text_only"),
        }
    }
}

impl FromStr for SearchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "auto" => Ok(SearchMode::Auto),
            "text_only" | "text" => Ok(SearchMode::TextOnly),
            _ => Err(Error::Config(format!("Unknown search mode: {}", s))),
        }
    }
}

/// Search configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Provider selection policy
    #[serde(default = "default_search_mode")]
    pub mode: SearchMode,

    /// Default number of results
    #[serde(default = "default_search_k")]
    pub default_k: usize,

    /// Maximum results allowed
    #[serde(default = "default_search_max_k")]
    pub max_k: usize,

    /// Number of near-duplicate candidates to consider
    #[serde(default = "default_duplicate_k")]
    pub duplicate_k: usize,

    /// Minimum score for a near-duplicate
    #[serde(default = "default_duplicate_min_score")]
    pub duplicate_min_score: f32,

    /// Hint attached to responses served by the text fallback
    #[serde(default = "default_fallback_hint")]
    pub fallback_hint: String,
}

/// Reranker configuration (cross-encoder model for result reranking)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankerConfig {
    /// Enable reranking of vector candidates
    #[serde(default = "default_reranker_enabled")]
    pub enabled: bool,

    /// Model name/identifier for cross-encoder reranker
    #[serde(default = "default_reranker_model")]
    pub model: String,

    /// Backend base URL
    #[serde(default = "default_reranker_url")]
    pub url: String,

    /// Vector candidates handed to the reranker
    #[serde(default = "default_rerank_candidates")]
    pub candidate_limit: usize,
}

/// Internal paths configuration
#[derive(Debug, Clone, Default)]
pub struct PathsConfig {
    /// Base directory for memoria data
    pub base_dir: PathBuf,

    /// Path to config file
    pub config_file: PathBuf,

    /// Path to SQLite database
    pub db_file: PathBuf,

    /// Directory holding the vector index artifacts
    pub index_dir: PathBuf,
}

impl PathsConfig {
    fn rooted_at(base: PathBuf, config_file: PathBuf) -> Self {
        Self {
            config_file,
            db_file: base.join("metadata.db"),
            index_dir: base.join("index"),
            base_dir: base,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            url: default_embedding_url(),
            model: default_embedding_model(),
            quantization: default_embedding_quantization(),
            timeout_secs: default_embedding_timeout(),
            retries: default_embedding_retries(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            persistence: default_persistence(),
            flush_interval_secs: default_flush_interval(),
            tombstone_threshold: default_tombstone_threshold(),
            max_import_bytes: default_max_import_bytes(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            batch_size: default_worker_batch_size(),
            poll_interval_ms: default_poll_interval(),
            stale_claim_secs: default_stale_claim(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            mode: default_search_mode(),
            default_k: default_search_k(),
            max_k: default_search_max_k(),
            duplicate_k: default_duplicate_k(),
            duplicate_min_score: default_duplicate_min_score(),
            fallback_hint: default_fallback_hint(),
        }
    }
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            enabled: default_reranker_enabled(),
            model: default_reranker_model(),
            url: default_reranker_url(),
            candidate_limit: default_rerank_candidates(),
        }
    }
}

impl Config {
    /// Get the default base directory for memoria (~/.memoria)
    pub fn default_base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".memoria")
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        Self::default_base_dir().join("config.toml")
    }

    /// Initialize paths configuration
    pub fn init_paths(&mut self, base_dir: Option<PathBuf>) {
        let base = base_dir.unwrap_or_else(Self::default_base_dir);
        let config_file = base.join("config.toml");
        self.paths = PathsConfig::rooted_at(base, config_file);
    }

    /// Load configuration from a specific file path
    pub fn load(config_path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", config_path);

        if !config_path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let mut config: Config = toml::from_str(&content)?;

        let base = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        config.paths = PathsConfig::rooted_at(base, config_path.to_path_buf());

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific base directory, falling back to defaults
    pub fn load_from(base_dir: Option<PathBuf>) -> Result<Self> {
        let mut config = Config::default();
        config.init_paths(base_dir);

        if config.paths.config_file.exists() {
            debug!("Loading config from {:?}", config.paths.config_file);
            let content = std::fs::read_to_string(&config.paths.config_file)?;
            let mut loaded: Config = toml::from_str(&content)?;
            loaded.paths = config.paths;
            config = loaded;
        } else {
            debug!("No config file found, using defaults");
        }

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.paths.config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.paths.config_file, content)?;
        info!("Saved config to {:?}", self.paths.config_file);
        Ok(())
    }

    /// Check if memoria is initialized (config and DB exist)
    pub fn is_initialized(&self) -> bool {
        self.paths.config_file.exists() && self.paths.db_file.exists()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.embedding.model.trim().is_empty() {
            return Err(Error::Config("embedding.model must not be empty".to_string()));
        }

        if self.embedding.quantization.trim().is_empty() {
            return Err(Error::Config(
                "embedding.quantization must not be empty".to_string(),
            ));
        }

        if !(self.index.tombstone_threshold > 0.0 && self.index.tombstone_threshold <= 1.0) {
            return Err(Error::Config(
                "index.tombstone_threshold must be in (0.0, 1.0]".to_string(),
            ));
        }

        if self.index.persistence == PersistencePolicy::Periodic
            && self.index.flush_interval_secs == 0
        {
            return Err(Error::Config(
                "index.flush_interval_secs must be positive for periodic persistence".to_string(),
            ));
        }

        if self.workers.count == 0 {
            return Err(Error::Config("workers.count must be at least 1".to_string()));
        }

        if self.workers.batch_size == 0 {
            return Err(Error::Config(
                "workers.batch_size must be at least 1".to_string(),
            ));
        }

        if self.search.default_k == 0 || self.search.default_k > self.search.max_k {
            return Err(Error::Config(
                "search.default_k must be between 1 and search.max_k".to_string(),
            ));
        }

        if self.search.duplicate_k == 0 {
            return Err(Error::Config(
                "search.duplicate_k must be at least 1".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.search.duplicate_min_score) {
            return Err(Error::Config(
                "search.duplicate_min_score must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.reranker.enabled && self.reranker.candidate_limit == 0 {
            return Err(Error::Config(
                "reranker.candidate_limit must be at least 1 when reranking".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.index.persistence, PersistencePolicy::Immediate);
        assert_eq!(config.search.mode, SearchMode::Auto);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_model_key_is_composite() {
        let mut config = Config::default();
        config.embedding.model = "nomic-embed-text".to_string();
        config.embedding.quantization = "q8".to_string();
        assert_eq!(config.embedding.model_key(), "nomic-embed-text:q8");
    }

    #[test]
    fn test_config_save_load() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.init_paths(Some(tmp.path().to_path_buf()));
        config.index.persistence = PersistencePolicy::Periodic;
        config.index.tombstone_threshold = 0.1;

        config.save().unwrap();
        assert!(config.paths.config_file.exists());

        let loaded = Config::load_from(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(loaded.index.persistence, PersistencePolicy::Periodic);
        assert_eq!(loaded.index.tombstone_threshold, 0.1);
        assert_eq!(loaded.paths.index_dir, tmp.path().join("index"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [search]
            mode = "text_only"
            "#,
        )
        .unwrap();
        assert_eq!(config.search.mode, SearchMode::TextOnly);
        assert_eq!(config.search.default_k, default_search_k());
        assert_eq!(config.workers.count, default_worker_count());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.index.tombstone_threshold = 0.0;
        assert!(config.validate().is_err());
        config.index.tombstone_threshold = 1.5;
        assert!(config.validate().is_err());
        config.index.tombstone_threshold = 0.1;
        assert!(config.validate().is_ok());

        config.workers.count = 0;
        assert!(config.validate().is_err());
        config.workers.count = 1;

        config.search.default_k = config.search.max_k + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(
            "Periodic".parse::<PersistencePolicy>().unwrap(),
            PersistencePolicy::Periodic
        );
        assert_eq!("text-only".parse::<SearchMode>().unwrap(), SearchMode::TextOnly);
        assert!("sometimes".parse::<PersistencePolicy>().is_err());
    }
}
