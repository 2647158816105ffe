//! memoria - a local-first knowledge store with semantic search
//!
//! This crate provides:
//! - A SQLite document store with an embedding job queue
//! - A crash-safe vector index with backup, rebuild and bundle import/export
//! - Background embedding workers that can be paused and drained
//! - Search that falls back to literal keyword matching when vectors are unavailable

pub mod app;
pub mod commands;
pub mod config;
pub mod embed;
pub mod embedding_backend;
pub mod error;
pub mod index;
pub mod meta;
pub mod progress;
pub mod queue;
pub mod rerank;
pub mod search;

#[cfg(test)]
pub(crate) mod test_support;

pub use app::App;
pub use config::Config;
pub use error::{Error, Result};
