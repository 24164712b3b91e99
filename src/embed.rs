//! Batch embedding with per-item failure tolerance.
//!
//! Texts go through the model client in batches (default 5) with a fixed
//! sleep between batches, so a single document ingestion cannot exhaust the
//! client's queue. Within a batch the requests are issued concurrently and
//! serialize through the client's FIFO queue. A failed item becomes an error
//! sentinel at its index; the remaining items keep going.

use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{RagError, Result};
use crate::model_client::ModelClient;

/// Embed `texts`, returning one outcome per input, aligned by index.
///
/// The ingestor decides what to do with partial results.
pub async fn embed_texts(
    client: &ModelClient,
    config: &EmbeddingConfig,
    texts: &[String],
) -> Vec<Result<Vec<f32>>> {
    let mut results: Vec<Result<Vec<f32>>> = Vec::with_capacity(texts.len());

    for (batch_no, batch) in texts.chunks(config.batch_size).enumerate() {
        if batch_no > 0 {
            tokio::time::sleep(Duration::from_millis(config.batch_delay_ms)).await;
        }

        let outcomes = client.embed_batch(batch.to_vec()).await;
        for (offset, outcome) in outcomes.into_iter().enumerate() {
            // Vectors of the wrong dimensionality must never reach the store;
            // they would poison every similarity comparison.
            let outcome = outcome.and_then(|vector| {
                if vector.len() == client.dims() {
                    Ok(vector)
                } else {
                    Err(RagError::Internal(format!(
                        "provider returned a {}-dimensional vector, expected {}",
                        vector.len(),
                        client.dims()
                    )))
                }
            });
            if let Err(ref e) = outcome {
                tracing::warn!(
                    index = batch_no * config.batch_size + offset,
                    error = %e,
                    "embedding failed for one chunk"
                );
            }
            results.push(outcome);
        }
    }

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    if succeeded < texts.len() {
        tracing::warn!(
            requested = texts.len(),
            succeeded,
            "partial embedding failure; missing chunks can be completed by reprocess"
        );
    }

    results
}

/// Embed one query text through the single-item path.
pub async fn embed_query(client: &ModelClient, text: &str) -> Result<Vec<f32>> {
    if text.trim().is_empty() {
        return Err(RagError::Validation("cannot embed empty text".to_string()));
    }
    client.embed_one(text.to_string()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::model_client::MockProvider;
    use std::sync::Arc;

    fn fast_client(provider: Arc<MockProvider>) -> ModelClient {
        let config = ModelConfig {
            provider: "mock".to_string(),
            min_interval_ms: 10,
            max_retries: 0,
            ..Default::default()
        };
        ModelClient::new(provider, &config)
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn outcomes_align_with_inputs_on_partial_failure() {
        let provider = Arc::new(MockProvider::new());
        provider.fail_embeds_containing("POISON");
        let client = fast_client(provider);

        let texts = vec![
            "first chunk".to_string(),
            "second chunk".to_string(),
            "POISON third chunk".to_string(),
            "fourth chunk".to_string(),
        ];
        let config = EmbeddingConfig::default();
        let results = embed_texts(&client, &config, &texts).await;

        assert_eq!(results.len(), 4);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(results[2].is_err());
        assert!(results[3].is_ok());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn batches_are_separated_by_the_configured_delay() {
        let provider = Arc::new(MockProvider::new());
        let client = fast_client(provider.clone());

        let texts: Vec<String> = (0..7).map(|i| format!("chunk {i}")).collect();
        let config = EmbeddingConfig {
            batch_size: 5,
            batch_delay_ms: 500,
        };
        let results = embed_texts(&client, &config, &texts).await;
        assert!(results.iter().all(|r| r.is_ok()));

        // 7 inputs at batch size 5 → two batches → at least one 500 ms gap
        // between the last call of batch one and the first of batch two.
        let times = provider.call_times();
        assert_eq!(times.len(), 7);
        let gap = times[5].duration_since(times[4]);
        assert!(gap >= Duration::from_millis(500), "inter-batch gap {gap:?}");
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn empty_query_is_a_validation_error() {
        let provider = Arc::new(MockProvider::new());
        let client = fast_client(provider);
        let err = embed_query(&client, "   ").await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }
}
