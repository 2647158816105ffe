//! Status command implementation

use crate::app::{App, StatusInfo};
use crate::error::Result;
use tracing::info;

/// Get system status
pub async fn cmd_status(app: &App) -> Result<StatusInfo> {
    info!("Getting status");
    app.status().await
}

/// Print status to console
pub fn print_status(status: &StatusInfo) {
    println!("\n📊 memoria Status\n");
    println!("Configuration: {}", status.config_path);
    println!("Database: {}", status.db_path);
    println!("Embedding Model: {}", status.embedding_model);

    let index = &status.index;
    println!("\nVector Index:");
    println!("  Directory: {}", status.index_dir);
    let availability = if index.available {
        "✓ Available".to_string()
    } else {
        format!(
            "✗ Disabled ({})",
            index.disabled_reason.as_deref().unwrap_or("unknown reason")
        )
    };
    println!("  Status: {}", availability);
    println!("  Vectors: {}", index.vector_count);
    println!(
        "  Tombstones: {} ({:.1}% of slots, threshold {:.0}%)",
        index.tombstone_count,
        index.tombstone_ratio * 100.0,
        index.tombstone_threshold * 100.0
    );
    if index.rebuild_needed {
        println!("  ⚠ Rebuild needed: run 'memoria index rebuild'");
    }
    println!(
        "  Persistence: {}{}",
        index.persistence,
        if index.dirty { " (unsaved changes)" } else { "" }
    );
    println!("  Generation: {}", index.generation);
    println!(
        "  Loaded from: {}{}",
        index.recovery,
        if index.reconciled { " (reconciled with store)" } else { "" }
    );
    for load_error in &index.load_errors {
        println!("  ⚠ {}", load_error);
    }

    println!("\nEmbedding Queue:");
    println!("  Pending: {}", status.queue.pending);
    println!("  Claimed: {}", status.queue.claimed);
    println!("  Embedded: {}", status.queue.embedded);
    println!("  Failed: {}", status.queue.failed);
    if status.queue.failed > 0 {
        println!("  ⚠ Retry with 'memoria queue retry'");
    }

    if let Some(workers) = &status.workers {
        println!("\nWorkers:");
        println!(
            "  {} running{}",
            workers.workers,
            if workers.paused { ", paused" } else { "" }
        );
        println!(
            "  Committed: {}, Skipped: {}, Failed: {}",
            workers.committed, workers.skipped, workers.failed
        );
    }

    println!("\nDatabase Stats:");
    println!("  Documents: {}", status.store.documents);
    println!("  Soft-deleted: {}", status.store.soft_deleted);
    println!("  Embeddings: {}", status.store.embeddings);
    println!("  Tombstones: {}", status.store.tombstones);
}
