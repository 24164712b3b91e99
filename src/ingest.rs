//! Ingestion pipeline orchestration.
//!
//! Coordinates extract → chunk → embed → store for a single document, and
//! the reprocess paths that rebuild a document's chunks from its stored text.
//!
//! Failure semantics: an extraction failure writes no rows at all. A failure
//! after the document row exists leaves the document without (or with fewer)
//! chunks — the stats component reports such documents as not ready, and
//! reprocess is the remediation. When only some chunks embed, the ones that
//! succeeded are persisted with contiguous indices and the response carries a
//! warning.

use chrono::Utc;
use uuid::Uuid;

use crate::chunk::{self, ChunkDraft};
use crate::config::Config;
use crate::embed;
use crate::error::{RagError, Result};
use crate::extract::{self, Section};
use crate::model_client::ModelClient;
use crate::models::{Chunk, ChunkMetadata, Document, DocumentMetadata};
use crate::store::Store;

/// Upload size ceiling (50 MiB).
pub const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

const UNTITLED: &str = "Untitled Document";

/// Outcome of one document ingestion, returned to the interface layer.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestReport {
    pub document_id: String,
    pub title: String,
    pub page_count: i64,
    pub word_count: i64,
    pub chunk_count: usize,
    pub embedded_chunk_count: usize,
    pub processing_seconds: f64,
    pub metadata: DocumentMetadata,
    /// Non-fatal problems, e.g. a partial embedding failure.
    pub warnings: Vec<String>,
}

/// Outcome of a reprocess-all batch.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReprocessAllReport {
    pub processed: usize,
    pub errors: usize,
}

/// Ingest one PDF: extract, persist the document row, chunk, embed, and
/// store the chunks whose embedding succeeded.
pub async fn process_document(
    store: &Store,
    client: &ModelClient,
    config: &Config,
    bytes: &[u8],
    title: Option<String>,
    tag_id: Option<String>,
    filename: Option<&str>,
) -> Result<IngestReport> {
    if bytes.len() > MAX_UPLOAD_BYTES {
        return Err(RagError::Validation(format!(
            "upload of {} bytes exceeds the {} byte limit",
            bytes.len(),
            MAX_UPLOAD_BYTES
        )));
    }

    let started = std::time::Instant::now();

    let extracted = extract::extract(bytes, filename)?;

    let caller_title = title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
    let final_title = caller_title
        .or_else(|| extracted.metadata.title.clone())
        .unwrap_or_else(|| UNTITLED.to_string());
    let author = extracted.metadata.author.clone();

    let metadata = DocumentMetadata {
        document_type: extracted.metadata.document_type.clone(),
        language: extracted.metadata.language.clone(),
        extracted_tags: extracted.metadata.extracted_tags.clone(),
        section_count: extracted.sections.len(),
        subject: extracted.metadata.subject.clone(),
        creator: extracted.metadata.creator.clone(),
        producer: extracted.metadata.producer.clone(),
        creation_date: extracted.metadata.creation_date.clone(),
        mod_date: extracted.metadata.mod_date.clone(),
        extra: Default::default(),
    };

    let document = Document {
        id: Uuid::new_v4().to_string(),
        title: final_title.clone(),
        author: author.clone(),
        tag_id,
        content: extracted.text.clone(),
        page_count: extracted.page_count,
        word_count: extracted.word_count,
        metadata: metadata.clone(),
        uploaded_at: Utc::now(),
    };
    store.insert_document(&document).await?;

    tracing::info!(
        document_id = %document.id,
        title = %final_title,
        pages = extracted.page_count,
        words = extracted.word_count,
        "document extracted and stored"
    );

    let outcome = build_embedded_chunks(
        store,
        client,
        config,
        &document.id,
        &extracted.text,
        &extracted.sections,
        &final_title,
        &metadata.document_type,
        author.as_deref(),
        false,
    )
    .await?;

    Ok(IngestReport {
        document_id: document.id,
        title: final_title,
        page_count: extracted.page_count,
        word_count: extracted.word_count,
        chunk_count: outcome.planned,
        embedded_chunk_count: outcome.stored,
        processing_seconds: started.elapsed().as_secs_f64(),
        metadata,
        warnings: outcome.warnings,
    })
}

/// Rebuild a document's chunks from its stored text. Safe to invoke
/// repeatedly: each invocation yields a consistent chunk set, and the swap is
/// atomic from the caller's perspective.
pub async fn reprocess_document(
    store: &Store,
    client: &ModelClient,
    config: &Config,
    document_id: &str,
) -> Result<IngestReport> {
    let started = std::time::Instant::now();
    let document = store.get_document(document_id).await?;
    let sections = extract::extract_sections(&document.content);

    let outcome = build_embedded_chunks(
        store,
        client,
        config,
        &document.id,
        &document.content,
        &sections,
        &document.title,
        &document.metadata.document_type,
        document.author.as_deref(),
        true,
    )
    .await?;

    tracing::info!(
        document_id = %document.id,
        chunks = outcome.stored,
        "document reprocessed"
    );

    Ok(IngestReport {
        document_id: document.id,
        title: document.title,
        page_count: document.page_count,
        word_count: document.word_count,
        chunk_count: outcome.planned,
        embedded_chunk_count: outcome.stored,
        processing_seconds: started.elapsed().as_secs_f64(),
        metadata: document.metadata,
        warnings: outcome.warnings,
    })
}

/// Reprocess every document. A single failure does not abort the batch.
pub async fn reprocess_all_documents(
    store: &Store,
    client: &ModelClient,
    config: &Config,
) -> Result<ReprocessAllReport> {
    let ids = store.list_document_ids().await?;
    let mut processed = 0usize;
    let mut errors = 0usize;

    for id in ids {
        match reprocess_document(store, client, config, &id).await {
            Ok(_) => processed += 1,
            Err(e) => {
                errors += 1;
                tracing::warn!(document_id = %id, error = %e, "reprocess failed");
            }
        }
    }

    Ok(ReprocessAllReport { processed, errors })
}

struct ChunkBuildOutcome {
    planned: usize,
    stored: usize,
    warnings: Vec<String>,
}

/// Chunk, embed, and persist. Chunks whose embedding failed are dropped; the
/// survivors are renumbered so stored indices stay contiguous from 0.
#[allow(clippy::too_many_arguments)]
async fn build_embedded_chunks(
    store: &Store,
    client: &ModelClient,
    config: &Config,
    document_id: &str,
    text: &str,
    sections: &[Section],
    document_title: &str,
    document_type: &str,
    author: Option<&str>,
    replace: bool,
) -> Result<ChunkBuildOutcome> {
    let drafts = chunk::chunk_text(
        text,
        config.chunking.chunk_tokens,
        config.chunking.overlap_tokens,
    );

    let texts: Vec<String> = drafts.iter().map(|d| d.text.clone()).collect();
    let outcomes = embed::embed_texts(client, &config.embedding, &texts).await;

    let mut warnings = Vec::new();
    let failed = outcomes.iter().filter(|o| o.is_err()).count();
    if failed > 0 {
        warnings.push(format!(
            "{failed} of {} chunks failed to embed and were not stored; run reprocess to complete them",
            drafts.len()
        ));
    }

    let mut chunks: Vec<Chunk> = Vec::with_capacity(drafts.len().saturating_sub(failed));
    for (draft, outcome) in drafts.iter().zip(outcomes) {
        let embedding = match outcome {
            Ok(vector) => vector,
            Err(_) => continue,
        };
        chunks.push(make_chunk(
            document_id,
            chunks.len() as i64,
            draft,
            embedding,
            sections,
            document_title,
            document_type,
            author,
        ));
    }

    if replace {
        store.replace_chunks(document_id, &chunks).await?;
    } else {
        store.bulk_insert_chunks(document_id, &chunks).await?;
    }

    Ok(ChunkBuildOutcome {
        planned: drafts.len(),
        stored: chunks.len(),
        warnings,
    })
}

#[allow(clippy::too_many_arguments)]
fn make_chunk(
    document_id: &str,
    index: i64,
    draft: &ChunkDraft,
    embedding: Vec<f32>,
    sections: &[Section],
    document_title: &str,
    document_type: &str,
    author: Option<&str>,
) -> Chunk {
    let section_title = sections
        .iter()
        .rev()
        .find(|s| s.start_char <= draft.start_char)
        .map(|s| s.title.clone());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        chunk_text: draft.text.clone(),
        token_count: draft.token_count,
        embedding: Some(embedding),
        metadata: ChunkMetadata {
            start_char: draft.start_char,
            end_char: draft.end_char,
            section_title,
            document_title: document_title.to_string(),
            document_type: document_type.to_string(),
            author: author.map(str::to_string),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_section_assignment_uses_last_preceding_heading() {
        let sections = vec![
            Section {
                title: "OVERVIEW".to_string(),
                level: 1,
                start_char: 0,
                content_lines: 4,
            },
            Section {
                title: "1. Benefits".to_string(),
                level: 1,
                start_char: 500,
                content_lines: 2,
            },
        ];
        let draft = ChunkDraft {
            text: "body".to_string(),
            index: 0,
            token_count: 1,
            start_char: 600,
            end_char: 604,
        };
        let chunk = make_chunk("doc", 0, &draft, vec![0.0], &sections, "T", "general", None);
        assert_eq!(chunk.metadata.section_title.as_deref(), Some("1. Benefits"));
    }
}
