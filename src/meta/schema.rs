//! SQLite schema definition

/// SQL schema for the metadata database
pub const SCHEMA_SQL: &str = r#"
-- Documents: short text records written by clients
CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    category TEXT NOT NULL,
    section TEXT,
    title TEXT NOT NULL,
    body TEXT NOT NULL,
    embedding_status TEXT NOT NULL DEFAULT 'pending',
    revision INTEGER NOT NULL DEFAULT 1,
    claimed_at TEXT,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT
);

-- Embeddings: one vector per document and model key, kept after delete
CREATE TABLE IF NOT EXISTS embeddings (
    entity_id TEXT NOT NULL,
    model_key TEXT NOT NULL,
    vector_bytes BLOB NOT NULL,
    dimension INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (entity_id, model_key)
);

-- Index metadata: tombstone ledger for the vector index
CREATE TABLE IF NOT EXISTS index_metadata (
    entity_id TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL DEFAULT 'document',
    deleted INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

-- Indexes for performance
CREATE INDEX IF NOT EXISTS idx_documents_queue ON documents(embedding_status, claimed_at, created_at);
CREATE INDEX IF NOT EXISTS idx_documents_category ON documents(category);
CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(model_key);
CREATE INDEX IF NOT EXISTS idx_index_metadata_deleted ON index_metadata(deleted);
"#;
