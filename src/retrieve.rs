//! Vector retrieval: cosine similarity scan with thresholding and ranking.
//!
//! The store scan is exhaustive and exact. An ANN index could replace it
//! behind the same interface; the [`RetrievalSource`] contract is stable
//! under that swap.

use crate::config::Config;
use crate::embed;
use crate::error::Result;
use crate::model_client::ModelClient;
use crate::models::RetrievalSource;
use crate::store::{EmbeddedChunk, Store};

/// Retrieve the top-K chunks most relevant to `query`, all scoring at or
/// above the relevance floor. An empty corpus yields an empty list, not an
/// error.
pub async fn retrieve(
    store: &Store,
    client: &ModelClient,
    config: &Config,
    query: &str,
) -> Result<Vec<RetrievalSource>> {
    retrieve_with(
        store,
        client,
        query,
        config.retrieval.top_k,
        config.retrieval.min_relevance_score,
        config.retrieval.scan_stream_threshold,
    )
    .await
}

/// [`retrieve`] with explicit parameters.
pub async fn retrieve_with(
    store: &Store,
    client: &ModelClient,
    query: &str,
    top_k: usize,
    min_score: f32,
    stream_threshold: i64,
) -> Result<Vec<RetrievalSource>> {
    let embedded_count = store.embedded_chunk_count().await?;
    if embedded_count == 0 {
        return Ok(Vec::new());
    }

    let query_vector = embed::embed_query(client, query).await?;

    let mut candidates: Vec<(f32, EmbeddedChunk)> = Vec::new();
    let mut collect = |chunk: EmbeddedChunk| {
        let similarity = cosine_similarity(&query_vector, &chunk.embedding);
        if similarity >= min_score {
            candidates.push((similarity, chunk));
        }
    };

    if embedded_count > stream_threshold {
        store.stream_embedded_chunks(&mut collect).await?;
    } else {
        for chunk in store.embedded_chunks().await? {
            collect(chunk);
        }
    }

    // Score descending; ties broken by (document id, chunk index) so the
    // ordering is deterministic.
    candidates.sort_by(|a, b| {
        b.0.total_cmp(&a.0)
            .then_with(|| a.1.document_id.cmp(&b.1.document_id))
            .then_with(|| a.1.chunk_index.cmp(&b.1.chunk_index))
    });
    candidates.truncate(top_k);

    Ok(candidates
        .into_iter()
        .map(|(similarity, chunk)| RetrievalSource {
            chunk_id: chunk.chunk_id,
            document_id: chunk.document_id,
            document_title: chunk.metadata.document_title.clone(),
            chunk_index: chunk.chunk_index,
            chunk_text: chunk.chunk_text,
            relevance_score: similarity.clamp(0.0, 1.0),
            metadata: chunk.metadata,
        })
        .collect())
}

/// Cosine similarity `dot(a, b) / (‖a‖ · ‖b‖)`. Degenerate inputs (length
/// mismatch, zero vectors) score 0; two vectors of different dimensions are
/// never meaningfully compared.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_identical_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_degenerate_inputs_score_zero() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn cosine_opposite_is_negative_one() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }
}
