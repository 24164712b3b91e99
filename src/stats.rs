//! Knowledge-base statistics and readiness.
//!
//! Aggregates over the store: document and chunk totals, embedding coverage,
//! the document type distribution, and the five most recent uploads. The
//! corpus is ready for queries once at least one document has an embedded
//! chunk.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeBaseStats {
    pub total_documents: i64,
    pub total_chunks: i64,
    pub total_words: i64,
    /// Documents with at least one embedded chunk.
    pub documents_with_embeddings: i64,
    pub average_chunks_per_document: f64,
    /// Distribution of detected document types.
    pub document_types: BTreeMap<String, i64>,
    /// Five most recent uploads, newest first.
    pub recent_uploads: Vec<RecentUpload>,
    /// `true` once at least one document is retrievable.
    pub is_ready: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentUpload {
    pub id: String,
    pub title: String,
    pub uploaded_at: DateTime<Utc>,
}

pub async fn knowledge_base_stats(store: &Store) -> Result<KnowledgeBaseStats> {
    let pool = store.pool();

    let total_documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(pool)
        .await?;

    let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks")
        .fetch_one(pool)
        .await?;

    let total_words: i64 =
        sqlx::query_scalar("SELECT COALESCE(SUM(word_count), 0) FROM documents")
            .fetch_one(pool)
            .await?;

    let documents_with_embeddings: i64 = sqlx::query_scalar(
        "SELECT COUNT(DISTINCT document_id) FROM document_chunks WHERE embedding IS NOT NULL",
    )
    .fetch_one(pool)
    .await?;

    let average_chunks_per_document = if total_documents > 0 {
        total_chunks as f64 / total_documents as f64
    } else {
        0.0
    };

    let type_rows = sqlx::query(
        r#"
        SELECT COALESCE(json_extract(metadata, '$.document_type'), 'general') AS doc_type,
               COUNT(*) AS doc_count
        FROM documents
        GROUP BY doc_type
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut document_types = BTreeMap::new();
    for row in &type_rows {
        let doc_type: String = row.get("doc_type");
        let count: i64 = row.get("doc_count");
        document_types.insert(doc_type, count);
    }

    let recent_rows = sqlx::query(
        "SELECT id, title, uploaded_at FROM documents ORDER BY uploaded_at DESC, id ASC LIMIT 5",
    )
    .fetch_all(pool)
    .await?;

    let recent_uploads = recent_rows
        .iter()
        .map(|row| RecentUpload {
            id: row.get("id"),
            title: row.get("title"),
            uploaded_at: DateTime::from_timestamp(row.get("uploaded_at"), 0)
                .unwrap_or_else(Utc::now),
        })
        .collect();

    Ok(KnowledgeBaseStats {
        total_documents,
        total_chunks,
        total_words,
        documents_with_embeddings,
        average_chunks_per_document,
        document_types,
        recent_uploads,
        is_ready: documents_with_embeddings > 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use crate::models::{Chunk, ChunkMetadata, Document, DocumentMetadata};
    use tempfile::TempDir;

    async fn seeded_store() -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        let pool = crate::db::connect(&tmp.path().join("stats.sqlite"))
            .await
            .unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        (tmp, Store::new(pool))
    }

    fn doc(id: &str, doc_type: &str, words: i64) -> Document {
        Document {
            id: id.to_string(),
            title: format!("Doc {id}"),
            author: None,
            tag_id: None,
            content: "text".to_string(),
            page_count: 1,
            word_count: words,
            metadata: DocumentMetadata {
                document_type: doc_type.to_string(),
                ..Default::default()
            },
            uploaded_at: Utc::now(),
        }
    }

    fn chunk(doc_id: &str, index: i64, embedded: bool) -> Chunk {
        Chunk {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: doc_id.to_string(),
            chunk_index: index,
            chunk_text: "chunk".to_string(),
            token_count: 2,
            embedding: embedded.then(|| vec![1.0, 0.0]),
            metadata: ChunkMetadata::default(),
        }
    }

    #[tokio::test]
    async fn empty_corpus_is_not_ready() {
        let (_tmp, store) = seeded_store().await;
        let stats = knowledge_base_stats(&store).await.unwrap();
        assert_eq!(stats.total_documents, 0);
        assert_eq!(stats.average_chunks_per_document, 0.0);
        assert!(!stats.is_ready);
    }

    #[tokio::test]
    async fn aggregates_cover_types_words_and_readiness() {
        let (_tmp, store) = seeded_store().await;
        store.insert_document(&doc("a", "handbook", 100)).await.unwrap();
        store.insert_document(&doc("b", "handbook", 50)).await.unwrap();
        store.insert_document(&doc("c", "policy", 25)).await.unwrap();

        store
            .bulk_insert_chunks("a", &[chunk("a", 0, true), chunk("a", 1, false)])
            .await
            .unwrap();
        store
            .bulk_insert_chunks("b", &[chunk("b", 0, false)])
            .await
            .unwrap();

        let stats = knowledge_base_stats(&store).await.unwrap();
        assert_eq!(stats.total_documents, 3);
        assert_eq!(stats.total_chunks, 3);
        assert_eq!(stats.total_words, 175);
        assert_eq!(stats.documents_with_embeddings, 1);
        assert!(stats.is_ready);
        assert_eq!(stats.document_types.get("handbook"), Some(&2));
        assert_eq!(stats.document_types.get("policy"), Some(&1));
        assert!((stats.average_chunks_per_document - 1.0).abs() < 1e-9);
        assert_eq!(stats.recent_uploads.len(), 3);
    }
}
