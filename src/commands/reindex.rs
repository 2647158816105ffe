//! Reindex command: re-embed everything after a model change

use crate::app::{prepare_reindex, ReindexReport};
use crate::config::Config;
use crate::embed::{Embedder, HttpEmbedder};
use crate::error::Result;
use tracing::info;

/// Clear an index built by another model and requeue every document.
///
/// The embedding backend is probed for the dimension it now produces.
pub async fn cmd_reindex(config: &Config, force: bool) -> Result<ReindexReport> {
    let embedder = HttpEmbedder::connect(&config.embedding).await?;
    info!(
        model = embedder.model_name(),
        dimension = embedder.dimension(),
        "Reindexing with current embedding model"
    );
    prepare_reindex(config, embedder.dimension(), force).await
}

pub fn print_reindex_report(report: &ReindexReport) {
    println!("\n✓ Reindex prepared");
    if let Some(previous) = &report.previous_model_key {
        if previous != &report.model_key {
            println!("  Model: {} -> {}", previous, report.model_key);
        } else {
            println!("  Model: {}", report.model_key);
        }
    } else {
        println!("  Model: {}", report.model_key);
    }
    if report.cleared_index {
        println!("  Old index files removed");
    }
    println!("  Documents queued: {}", report.requeued);
}
