//! Search and duplicate-detection commands

use crate::app::App;
use crate::error::Result;
use crate::search::{DuplicateReport, SearchResponse};
use tracing::info;

pub async fn cmd_search(app: &App, query: &str, k: Option<usize>) -> Result<SearchResponse> {
    info!("Searching: {}", query);
    let response = app.search().search(query, k).await?;
    info!(hits = response.hits.len(), "Returning results");
    Ok(response)
}

/// Duplicates of a stored document, or of free text
pub async fn cmd_duplicates(app: &App, id: Option<&str>, text: Option<&str>) -> Result<DuplicateReport> {
    match (id, text) {
        (Some(id), _) => app.duplicates_of(id).await,
        (None, Some(text)) => app.search().find_duplicates(text, None).await,
        (None, None) => Err(crate::error::Error::InvalidQuery(
            "give a document id or --text".to_string(),
        )),
    }
}

/// Single-line preview cut on a char boundary
fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.trim().replace('\n', " ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}

/// Print search results to console
pub fn print_search_response(response: &SearchResponse) {
    println!("\n🔍 Query: {}\n", response.query);
    if response.degraded {
        println!("⚠️  Vector search unavailable, showing keyword matches");
        if let Some(hint) = &response.hint {
            println!("   Hint: {}", hint);
        }
        println!();
    }
    println!("Found {} results:\n", response.hits.len());

    for (i, hit) in response.hits.iter().enumerate() {
        println!("{}. [score: {:.3}] {} ({})", i + 1, hit.score, hit.title, hit.id);
        match &hit.section {
            Some(section) => println!("   {} > {}", hit.category, section),
            None => println!("   {}", hit.category),
        }
        println!("   {}\n", preview(&hit.body, 200));
    }
}

pub fn print_duplicate_report(report: &DuplicateReport) {
    if report.candidates.is_empty() {
        println!("No duplicates above {:.2}", report.min_score);
        return;
    }
    println!(
        "Possible duplicates (score >= {:.2}{}):",
        report.min_score,
        if report.degraded { ", keyword fallback" } else { "" }
    );
    for hit in &report.candidates {
        println!("  [{:.3}] {} ({})", hit.score, hit.title, hit.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_cuts_on_char_boundary() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("héllo wörld", 5), "héllo...");
        assert_eq!(preview("a\nb", 10), "a b");
    }
}
