//! Database schema migrations.
//!
//! Creates all required tables and ensures idempotent execution.
//! Designed to be run via `orag init` (and automatically by the server).
//!
//! # Schema
//!
//! ```text
//! ┌────────────────┐      ┌───────────────────┐      ┌──────────┐
//! │   documents    │──┐   │  document_chunks  │      │   tags   │
//! │                │  │   │                   │      │          │
//! │ id (PK)        │  │   │ id (PK)           │      │ id (PK)  │
//! │ title          │  └───│ document_id  (FK, │      │ name     │
//! │ author         │      │   ON DELETE       │      └──────────┘
//! │ tag_id         │      │   CASCADE)        │
//! │ content        │      │ chunk_index       │
//! │ page_count     │      │ chunk_text        │
//! │ word_count     │      │ token_count       │
//! │ metadata JSON  │      │ embedding JSON    │
//! │ uploaded_at    │      │ metadata JSON     │
//! └────────────────┘      │ created_at        │
//!                         └───────────────────┘
//! ```
//!
//! The `document_overview` view joins documents to their chunk counts and tag
//! name for the admin listing.
//!
//! # Idempotency
//!
//! All statements use `CREATE ... IF NOT EXISTS`. Running `orag init`
//! multiple times is safe.

use anyhow::Result;
use sqlx::SqlitePool;

/// Run all database migrations. Safe to call multiple times.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            author TEXT,
            tag_id TEXT,
            content TEXT NOT NULL,
            page_count INTEGER NOT NULL DEFAULT 0,
            word_count INTEGER NOT NULL DEFAULT 0,
            metadata TEXT NOT NULL DEFAULT '{}',
            uploaded_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_text TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            token_count INTEGER NOT NULL,
            embedding TEXT,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            UNIQUE(document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Tags are created and managed by the admin collaborator; the core only
    // reads them. The table exists here so the overview view resolves.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tags (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE VIEW IF NOT EXISTS document_overview AS
        SELECT
            d.id,
            d.title,
            d.author,
            t.name AS tag_name,
            d.page_count,
            d.word_count,
            COUNT(c.id) AS chunk_count,
            COUNT(c.embedding) AS embedded_chunk_count,
            d.uploaded_at
        FROM documents d
        LEFT JOIN document_chunks c ON c.document_id = d.id
        LEFT JOIN tags t ON t.id = d.tag_id
        GROUP BY d.id
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON document_chunks(document_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_uploaded_at ON documents(uploaded_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
