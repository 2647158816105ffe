//! Vector index administration: rebuild, save, check, export, import

use crate::app::App;
use crate::error::Result;
use crate::index::{ConsistencyReport, RebuildReport, RecoveryReport};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct SaveReport {
    pub generation: u64,
    pub vector_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub dest: String,
    pub files: Vec<String>,
}

pub async fn cmd_rebuild(app: &App) -> Result<RebuildReport> {
    info!("Rebuilding vector index from the store");
    app.rebuild().await
}

pub async fn cmd_save(app: &App) -> Result<SaveReport> {
    app.save().await?;
    let status = app.manager()?.status().await;
    Ok(SaveReport {
        generation: status.generation,
        vector_count: status.vector_count,
    })
}

pub async fn cmd_check(app: &App) -> Result<ConsistencyReport> {
    app.check().await
}

pub async fn cmd_export(app: &App, dest: &Path) -> Result<ExportReport> {
    let written: Vec<PathBuf> = app.export_bundle(dest).await?;
    Ok(ExportReport {
        dest: dest.display().to_string(),
        files: written.iter().map(|p| p.display().to_string()).collect(),
    })
}

pub async fn cmd_import(app: &App, src: &Path) -> Result<RecoveryReport> {
    info!("Importing index bundle from {:?}", src);
    app.import_bundle(src).await
}

pub fn print_rebuild_report(report: &RebuildReport) {
    println!("\n✓ Vector index rebuilt");
    println!("  Vectors: {}", report.vector_count);
    println!("  Tombstones purged: {}", report.purged_metadata);
    println!("  Deleted documents purged: {}", report.purged_documents);
    println!("  Took: {} ms", report.elapsed_ms);
    if !report.persisted {
        println!("  ⚠ Not saved to disk; run 'memoria index save'");
    }
}

pub fn print_save_report(report: &SaveReport) {
    println!(
        "✓ Saved {} vectors (generation {})",
        report.vector_count, report.generation
    );
}

pub fn print_consistency_report(report: &ConsistencyReport) {
    let verdict = if report.consistent {
        "✓ Index matches the store"
    } else {
        "✗ Index and store disagree: run 'memoria index rebuild'"
    };
    println!("{}", verdict);
    println!("  Model key: {}", report.model_key);
    println!("  Index vectors: {}", report.index_count);
    println!("  Store embeddings: {}", report.store_count);
    if !report.consistent {
        println!("  Index signature: {}", report.index_signature);
        println!("  Store signature: {}", report.store_signature);
    }
}

pub fn print_export_report(report: &ExportReport) {
    println!("✓ Exported {} files to {}", report.files.len(), report.dest);
    for file in &report.files {
        println!("  {}", file);
    }
}

pub fn print_import_report(report: &RecoveryReport) {
    println!("✓ Imported index bundle");
    println!("  Vectors: {}", report.vector_count);
    if report.reconciled {
        println!("  Bundle disagreed with the store and was rebuilt from it");
    }
}
