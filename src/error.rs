//! Custom error types for memoria

use crate::index::IndexError;
use thiserror::Error;

/// Main error type for memoria operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Model key or dimension disagreement between the live embedder, the
    /// relational store and the persisted index.
    #[error("Configuration mismatch: {0}")]
    ConfigMismatch(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Vector index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Vector index corrupt: {0}")]
    IndexCorrupt(String),

    #[error("Vector index error: {0}")]
    Index(#[from] IndexError),

    #[error("Embedding generation failed: {0}")]
    EmbeddingGenerationFailed(String),

    #[error("Queue did not drain before timeout ({remaining} rows remaining)")]
    QueueDrainTimeout { remaining: usize },

    #[error("Illegal embedding status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Bundle rejected: {0}")]
    BundleRejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Not initialized: run 'memoria init' first")]
    NotInitialized,

    #[error("{0}")]
    Other(String),
}

/// Result type alias for memoria
pub type Result<T> = std::result::Result<T, Error>;
