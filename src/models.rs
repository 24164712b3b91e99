//! Core data types flowing through the ingestion and query pipelines.
//!
//! The data lifecycle is:
//!
//! ```text
//! PDF bytes → extract() → ExtractedDocument → chunk() → ChunkDraft
//!                                                 ↓
//!                                           embed() → Vec<f32>
//!                                                 ↓
//!                                   Store (documents / document_chunks)
//!                                                 ↓
//!                            retrieve() → RetrievalSource → answer() → Answer
//! ```
//!
//! Persisted rows ([`Document`], [`Chunk`]) are owned by the store. Query-path
//! values ([`RetrievalSource`], [`Answer`]) are transient and owned by the
//! caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Normalized document stored in the `documents` table.
///
/// Created by the ingestor after successful extraction. Mutated only by
/// reprocess (which replaces its chunks); deleted explicitly, cascading to
/// chunks.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    /// UUID v4 primary key.
    pub id: String,
    /// Merged title: caller-supplied, then PDF metadata, then filename-derived.
    pub title: String,
    /// Author from PDF metadata, if any.
    pub author: Option<String>,
    /// Optional admin-managed tag id.
    pub tag_id: Option<String>,
    /// Full normalized extracted text.
    pub content: String,
    /// Page count reported by the PDF parser.
    pub page_count: i64,
    /// Count of maximal non-whitespace runs in the normalized text.
    pub word_count: i64,
    /// Heuristic metadata blob, serialized as JSON at the store boundary.
    pub metadata: DocumentMetadata,
    /// Upload timestamp.
    pub uploaded_at: DateTime<Utc>,
}

/// Heuristic document metadata produced by the extractor.
///
/// A tagged product: fixed fields plus an extension map for anything a future
/// extractor version wants to carry without a schema change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Detected document type: `onboarding`, `policy`, `training`, `handbook`,
    /// `guide`, `procedure`, or `general`.
    #[serde(default)]
    pub document_type: String,
    /// Advisory language label: `en` or `unknown`.
    #[serde(default)]
    pub language: String,
    /// Tags split out of the PDF Keywords/Subject fields.
    #[serde(default)]
    pub extracted_tags: Vec<String>,
    /// Number of sections found by the heading scan.
    #[serde(default)]
    pub section_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mod_date: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A chunk of a document's text, stored in the `document_chunks` table.
///
/// Created in bulk by the ingestor; never mutated; deleted only with (or
/// ahead of) its document. Indices within a document are contiguous from 0.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// UUID v4 primary key.
    pub id: String,
    /// Foreign key to the parent [`Document`].
    pub document_id: String,
    /// Zero-based index within the document's chunk sequence.
    pub chunk_index: i64,
    /// Chunk text content.
    pub chunk_text: String,
    /// Approximate token count: `ceil(len / 4)`.
    pub token_count: i64,
    /// Embedding vector; `None` until embedded. All stored vectors share one
    /// dimensionality per corpus.
    pub embedding: Option<Vec<f32>>,
    /// Denormalization cache for retrieval without joins.
    pub metadata: ChunkMetadata,
}

/// Chunk metadata: char offsets plus denormalized document fields.
///
/// This is a cache, not an open extension point.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(default)]
    pub start_char: usize,
    #[serde(default)]
    pub end_char: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_title: Option<String>,
    /// Owning document's title, denormalized for retrieval.
    #[serde(default)]
    pub document_title: String,
    /// Owning document's detected type, denormalized for retrieval.
    #[serde(default)]
    pub document_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

/// Admin-managed tag. Read-only to the core.
#[derive(Debug, Clone, Serialize)]
pub struct Tag {
    pub id: String,
    pub name: String,
}

/// One chunk surfaced for a query, with its relevance score. Transient.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalSource {
    pub chunk_id: String,
    pub document_id: String,
    pub document_title: String,
    pub chunk_index: i64,
    pub chunk_text: String,
    /// Cosine similarity clamped to `[0, 1]`.
    pub relevance_score: f32,
    pub metadata: ChunkMetadata,
}

/// A grounded answer with its ordered sources and derived confidence. Transient.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<RetrievalSource>,
    /// `clamp(0.5·avg + 0.5·top, boosted ×1.1 when citations are present)`.
    pub confidence: f32,
    pub response_time_seconds: f64,
}

/// Summary row for the admin document listing.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentOverview {
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    pub tag_name: Option<String>,
    pub page_count: i64,
    pub word_count: i64,
    pub chunk_count: i64,
    pub embedded_chunk_count: i64,
    pub uploaded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_metadata_round_trips_with_extra_fields() {
        let json = r#"{
            "document_type": "policy",
            "language": "en",
            "extracted_tags": ["hr", "leave"],
            "section_count": 3,
            "custom_field": "kept"
        }"#;
        let meta: DocumentMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.document_type, "policy");
        assert_eq!(meta.extracted_tags, vec!["hr", "leave"]);
        assert_eq!(meta.extra.get("custom_field").unwrap(), "kept");

        let back = serde_json::to_value(&meta).unwrap();
        assert_eq!(back["custom_field"], "kept");
    }

    #[test]
    fn chunk_metadata_defaults_are_empty() {
        let meta: ChunkMetadata = serde_json::from_str("{}").unwrap();
        assert_eq!(meta.start_char, 0);
        assert!(meta.section_title.is_none());
    }
}
