//! SQLite-backed persistence for documents and chunks.
//!
//! The store exclusively owns persisted rows. Bulk chunk operations are
//! transactional: either every chunk is visible or none. Deleting a
//! document removes its chunks in the same statement via `ON DELETE CASCADE`.
//! The retrieval scan returns denormalized chunk metadata so a
//! [`crate::models::RetrievalSource`] can be built without a second
//! round-trip.

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::{Row, SqlitePool};
use std::time::Duration;

use crate::error::{RagError, Result, Retryable};
use crate::models::{Chunk, ChunkMetadata, Document, DocumentOverview};

/// Attempts for transient store failures (lock contention, deadlock).
const STORE_RETRIES: u32 = 3;

pub struct Store {
    pool: SqlitePool,
}

/// One embedded chunk as returned by the retrieval scan.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub chunk_text: String,
    pub embedding: Vec<f32>,
    pub metadata: ChunkMetadata,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn insert_document(&self, doc: &Document) -> Result<()> {
        let metadata_json = serde_json::to_string(&doc.metadata)?;
        with_store_retry(|| async {
            sqlx::query(
                r#"
                INSERT INTO documents (id, title, author, tag_id, content,
                                       page_count, word_count, metadata, uploaded_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&doc.id)
            .bind(&doc.title)
            .bind(&doc.author)
            .bind(&doc.tag_id)
            .bind(&doc.content)
            .bind(doc.page_count)
            .bind(doc.word_count)
            .bind(&metadata_json)
            .bind(doc.uploaded_at.timestamp())
            .execute(&self.pool)
            .await
            .map_err(RagError::from)?;
            Ok(())
        })
        .await
    }

    /// Insert a document's chunks in a single transaction.
    pub async fn bulk_insert_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let now = Utc::now().timestamp();
        with_store_retry(|| async {
            let mut tx = self.pool.begin().await.map_err(RagError::from)?;
            for chunk in chunks {
                insert_chunk_tx(&mut tx, document_id, chunk, now).await?;
            }
            tx.commit().await.map_err(RagError::from)?;
            Ok(())
        })
        .await
    }

    /// Delete all existing chunks for a document and insert the new set, in
    /// one transaction. Used by reprocess: from the caller's perspective
    /// either the old set remains or the new set exists.
    pub async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let now = Utc::now().timestamp();
        with_store_retry(|| async {
            let mut tx = self.pool.begin().await.map_err(RagError::from)?;

            sqlx::query("DELETE FROM document_chunks WHERE document_id = ?")
                .bind(document_id)
                .execute(&mut *tx)
                .await
                .map_err(RagError::from)?;

            for chunk in chunks {
                insert_chunk_tx(&mut tx, document_id, chunk, now).await?;
            }

            tx.commit().await.map_err(RagError::from)?;
            Ok(())
        })
        .await
    }

    /// Delete a document; its chunks go with it via `ON DELETE CASCADE`.
    pub async fn delete_document(&self, id: &str) -> Result<()> {
        let result = with_store_retry(|| async {
            sqlx::query("DELETE FROM documents WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(RagError::from)
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(RagError::NotFound(format!("document {id}")));
        }
        Ok(())
    }

    pub async fn get_document(&self, id: &str) -> Result<Document> {
        let row = sqlx::query(
            r#"
            SELECT id, title, author, tag_id, content, page_count, word_count,
                   metadata, uploaded_at
            FROM documents WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RagError::NotFound(format!("document {id}")))?;

        let metadata_json: String = row.get("metadata");
        let uploaded_at: i64 = row.get("uploaded_at");

        Ok(Document {
            id: row.get("id"),
            title: row.get("title"),
            author: row.get("author"),
            tag_id: row.get("tag_id"),
            content: row.get("content"),
            page_count: row.get("page_count"),
            word_count: row.get("word_count"),
            metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
            uploaded_at: ts_to_datetime(uploaded_at),
        })
    }

    /// Ids of all documents, oldest upload first. Used by reprocess-all.
    pub async fn list_document_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT id FROM documents ORDER BY uploaded_at ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    /// Admin listing through the `document_overview` view.
    pub async fn list_documents_with_stats(&self) -> Result<Vec<DocumentOverview>> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, author, tag_name, page_count, word_count,
                   chunk_count, embedded_chunk_count, uploaded_at
            FROM document_overview
            ORDER BY uploaded_at DESC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| DocumentOverview {
                id: row.get("id"),
                title: row.get("title"),
                author: row.get("author"),
                tag_name: row.get("tag_name"),
                page_count: row.get("page_count"),
                word_count: row.get("word_count"),
                chunk_count: row.get("chunk_count"),
                embedded_chunk_count: row.get("embedded_chunk_count"),
                uploaded_at: ts_to_datetime(row.get("uploaded_at")),
            })
            .collect())
    }

    /// Number of chunks that carry an embedding vector.
    pub async fn embedded_chunk_count(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks WHERE embedding IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// All embedded chunks, materialized. Suitable for small corpora; the
    /// retriever switches to [`Store::stream_embedded_chunks`] past the
    /// configured threshold.
    pub async fn embedded_chunks(&self) -> Result<Vec<EmbeddedChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT id, document_id, chunk_index, chunk_text, embedding, metadata
            FROM document_chunks
            WHERE embedding IS NOT NULL
            ORDER BY document_id ASC, chunk_index ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_embedded_chunk).collect()
    }

    /// Stream embedded chunks one row at a time, calling `visit` for each.
    /// Keeps memory flat when the corpus is large.
    pub async fn stream_embedded_chunks<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(EmbeddedChunk),
    {
        let mut rows = sqlx::query(
            r#"
            SELECT id, document_id, chunk_index, chunk_text, embedding, metadata
            FROM document_chunks
            WHERE embedding IS NOT NULL
            ORDER BY document_id ASC, chunk_index ASC
            "#,
        )
        .fetch(&self.pool);

        while let Some(row) = rows.try_next().await.map_err(RagError::from)? {
            visit(row_to_embedded_chunk(&row)?);
        }
        Ok(())
    }

    pub async fn tag_name(&self, tag_id: &str) -> Result<Option<String>> {
        let name: Option<String> = sqlx::query_scalar("SELECT name FROM tags WHERE id = ?")
            .bind(tag_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(name)
    }
}

async fn insert_chunk_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    document_id: &str,
    chunk: &Chunk,
    now: i64,
) -> Result<()> {
    let embedding_json = chunk
        .embedding
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let metadata_json = serde_json::to_string(&chunk.metadata)?;

    sqlx::query(
        r#"
        INSERT INTO document_chunks (id, document_id, chunk_text, chunk_index,
                                     token_count, embedding, metadata, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&chunk.id)
    .bind(document_id)
    .bind(&chunk.chunk_text)
    .bind(chunk.chunk_index)
    .bind(chunk.token_count)
    .bind(&embedding_json)
    .bind(&metadata_json)
    .bind(now)
    .execute(&mut **tx)
    .await
    .map_err(RagError::from)?;
    Ok(())
}

fn row_to_embedded_chunk(row: &sqlx::sqlite::SqliteRow) -> Result<EmbeddedChunk> {
    let embedding_json: String = row.get("embedding");
    let metadata_json: String = row.get("metadata");

    let embedding: Vec<f32> = serde_json::from_str(&embedding_json)
        .map_err(|e| RagError::Store(format!("corrupt embedding column: {e}")))?;

    Ok(EmbeddedChunk {
        chunk_id: row.get("id"),
        document_id: row.get("document_id"),
        chunk_index: row.get("chunk_index"),
        chunk_text: row.get("chunk_text"),
        embedding,
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
    })
}

fn ts_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_else(Utc::now)
}

/// Retry a store operation when the failure is transient (SQLite lock
/// contention). Non-transient errors surface immediately.
async fn with_store_retry<T, F, Fut>(mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < STORE_RETRIES => {
                attempt += 1;
                tracing::debug!(attempt, error = %err, "retrying transient store failure");
                tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use crate::models::DocumentMetadata;
    use tempfile::TempDir;

    async fn test_store() -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        let pool = crate::db::connect(&tmp.path().join("test.sqlite"))
            .await
            .unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        (tmp, Store::new(pool))
    }

    fn sample_document(id: &str) -> Document {
        Document {
            id: id.to_string(),
            title: "Employee Handbook".to_string(),
            author: Some("HR".to_string()),
            tag_id: None,
            content: "Welcome to the company.".to_string(),
            page_count: 2,
            word_count: 4,
            metadata: DocumentMetadata {
                document_type: "handbook".to_string(),
                language: "en".to_string(),
                ..Default::default()
            },
            uploaded_at: Utc::now(),
        }
    }

    fn sample_chunk(document_id: &str, index: i64, embedded: bool) -> Chunk {
        Chunk {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            chunk_index: index,
            chunk_text: format!("chunk number {index}"),
            token_count: 4,
            embedding: embedded.then(|| vec![0.1, 0.2, 0.3]),
            metadata: ChunkMetadata {
                document_title: "Employee Handbook".to_string(),
                document_type: "handbook".to_string(),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn delete_document_cascades_to_chunks() {
        let (_tmp, store) = test_store().await;
        let doc = sample_document("doc-1");
        store.insert_document(&doc).await.unwrap();
        store
            .bulk_insert_chunks("doc-1", &[sample_chunk("doc-1", 0, true)])
            .await
            .unwrap();

        assert_eq!(store.embedded_chunk_count().await.unwrap(), 1);
        store.delete_document("doc-1").await.unwrap();
        assert_eq!(store.embedded_chunk_count().await.unwrap(), 0);

        let orphans: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[tokio::test]
    async fn delete_unknown_document_is_not_found() {
        let (_tmp, store) = test_store().await;
        let err = store.delete_document("missing").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn replace_chunks_swaps_the_whole_set() {
        let (_tmp, store) = test_store().await;
        store.insert_document(&sample_document("doc-1")).await.unwrap();
        store
            .bulk_insert_chunks(
                "doc-1",
                &[
                    sample_chunk("doc-1", 0, true),
                    sample_chunk("doc-1", 1, true),
                    sample_chunk("doc-1", 2, true),
                ],
            )
            .await
            .unwrap();

        store
            .replace_chunks("doc-1", &[sample_chunk("doc-1", 0, true)])
            .await
            .unwrap();

        let chunks = store.embedded_chunks().await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
    }

    #[tokio::test]
    async fn scan_skips_unembedded_chunks_and_orders_deterministically() {
        let (_tmp, store) = test_store().await;
        store.insert_document(&sample_document("doc-a")).await.unwrap();
        store.insert_document(&sample_document("doc-b")).await.unwrap();
        store
            .bulk_insert_chunks(
                "doc-b",
                &[sample_chunk("doc-b", 0, true), sample_chunk("doc-b", 1, false)],
            )
            .await
            .unwrap();
        store
            .bulk_insert_chunks("doc-a", &[sample_chunk("doc-a", 0, true)])
            .await
            .unwrap();

        let chunks = store.embedded_chunks().await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].document_id, "doc-a");
        assert_eq!(chunks[1].document_id, "doc-b");

        let mut streamed = Vec::new();
        store
            .stream_embedded_chunks(|c| streamed.push(c.chunk_id))
            .await
            .unwrap();
        assert_eq!(streamed.len(), 2);
    }

    #[tokio::test]
    async fn overview_counts_chunks_and_embeddings() {
        let (_tmp, store) = test_store().await;
        store.insert_document(&sample_document("doc-1")).await.unwrap();
        store
            .bulk_insert_chunks(
                "doc-1",
                &[sample_chunk("doc-1", 0, true), sample_chunk("doc-1", 1, false)],
            )
            .await
            .unwrap();

        let listing = store.list_documents_with_stats().await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].chunk_count, 2);
        assert_eq!(listing[0].embedded_chunk_count, 1);
    }
}
