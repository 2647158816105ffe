//! Embedding queue commands: process, retry, failed

use crate::app::App;
use crate::error::Result;
use crate::meta::Document;
use crate::progress::start_progress_bar;
use crate::queue::DrainReport;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

const PROGRESS_REFRESH: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Serialize)]
pub struct RetryReport {
    pub requeued: u64,
}

/// Drain the queue with the in-process workers, showing progress
pub async fn cmd_process(app: &App, show_progress: bool) -> Result<DrainReport> {
    let initial = app.queue().count_pending().await?;
    info!(pending = initial, "Processing embedding queue");
    if initial == 0 || !show_progress {
        return app.process().await;
    }

    let pb = start_progress_bar(initial as u64, "embedding");

    let drain = app.process();
    tokio::pin!(drain);
    let mut ticker = tokio::time::interval(PROGRESS_REFRESH);
    let report = loop {
        tokio::select! {
            report = &mut drain => break report,
            _ = ticker.tick() => {
                match app.queue().count_pending().await {
                    Ok(pending) => pb.set_position(initial.saturating_sub(pending) as u64),
                    Err(e) => debug!(error = %e, "Progress poll failed"),
                }
            }
        }
    };

    match &report {
        Ok(r) if r.drained => pb.finish_with_message("Documents embedded"),
        _ => pb.abandon_with_message("Queue not drained"),
    }
    report
}

pub async fn cmd_retry(app: &App, ids: Option<Vec<String>>) -> Result<RetryReport> {
    let requeued = app.retry_failed(ids.as_deref()).await?;
    Ok(RetryReport { requeued })
}

pub async fn cmd_list_failed(app: &App, limit: usize) -> Result<Vec<Document>> {
    app.queue().list_failed(limit).await
}

pub fn print_drain_report(report: &DrainReport) {
    if report.drained {
        println!("✓ Queue drained in {} ms", report.elapsed_ms);
    } else {
        println!(
            "⚠ Queue not drained: {} rows remaining after {} ms",
            report.remaining, report.elapsed_ms
        );
    }
}

pub fn print_retry_report(report: &RetryReport) {
    println!("✓ Requeued {} failed documents", report.requeued);
}

pub fn print_failed(docs: &[Document]) {
    if docs.is_empty() {
        println!("No failed documents.");
        return;
    }
    println!("\n❌ Failed embeddings\n");
    for doc in docs {
        println!("• {} ({})", doc.title, doc.id);
        println!(
            "  Error: {}",
            doc.last_error.as_deref().unwrap_or("unknown")
        );
    }
}
