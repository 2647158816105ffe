//! Document commands: add, update, delete, show, list

use crate::app::App;
use crate::error::Result;
use crate::meta::{Document, DocumentUpdate, NewDocument};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct DeleteReport {
    pub id: String,
    pub deleted: bool,
}

pub async fn cmd_add_document(app: &App, new: NewDocument) -> Result<Document> {
    app.add_document(new).await
}

pub async fn cmd_update_document(app: &App, id: &str, update: DocumentUpdate) -> Result<Document> {
    app.update_document(id, update).await
}

pub async fn cmd_delete_document(app: &App, id: &str) -> Result<DeleteReport> {
    app.delete_document(id).await?;
    Ok(DeleteReport {
        id: id.to_string(),
        deleted: true,
    })
}

pub async fn cmd_show_document(app: &App, id: &str) -> Result<Document> {
    app.get_document(id).await
}

pub async fn cmd_list_documents(
    app: &App,
    category: Option<&str>,
    limit: usize,
) -> Result<Vec<Document>> {
    info!("Listing documents");
    app.db().list_documents(category, limit).await
}

/// Print one document to console
pub fn print_document(doc: &Document) {
    println!("\n📄 {}\n", doc.title);
    println!("ID: {}", doc.id);
    match &doc.section {
        Some(section) => println!("Category: {} > {}", doc.category, section),
        None => println!("Category: {}", doc.category),
    }
    println!("Embedding: {} (revision {})", doc.embedding_status, doc.revision);
    if let Some(err) = &doc.last_error {
        println!("Last error: {}", err);
    }
    println!("Created: {}", doc.created_at);
    println!("Updated: {}", doc.updated_at);
    if !doc.body.is_empty() {
        println!("\n{}", doc.body);
    }
}

/// Print a document list to console
pub fn print_documents(docs: &[Document]) {
    println!("\n📚 Documents\n");

    if docs.is_empty() {
        println!("No documents. Use 'memoria doc add' to create one.");
        return;
    }

    for doc in docs {
        println!("• {} [{}]", doc.title, doc.category);
        println!("  ID: {}", doc.id);
        println!("  Embedding: {}", doc.embedding_status);
        println!();
    }
}
