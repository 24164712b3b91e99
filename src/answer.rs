//! Answer synthesis: grounding prompt, citation validation, confidence.
//!
//! Retrieved chunks become numbered source blocks, the generator is invoked
//! under instructions that forbid outside knowledge and require `[SOURCE i]`
//! citations, and the result is validated post-hoc. Retrieval coming back
//! empty and the generator refusing are both successful responses with fixed
//! text, not errors.

use serde::Serialize;

use crate::config::Config;
use crate::error::{RagError, Result};
use crate::model_client::{GenerationParams, ModelClient};
use crate::models::{Answer, RetrievalSource};
use crate::retrieve;
use crate::store::Store;

/// Returned when retrieval finds nothing above the relevance floor.
pub const EMPTY_CORPUS_FALLBACK: &str = "I couldn't find any relevant information in the uploaded onboarding documents to answer your question. Please ensure the relevant materials have been uploaded in the Admin section, or try rephrasing your question.";

/// The refusal the generator is instructed to emit when the context does not
/// contain the answer.
pub const GROUNDING_REFUSAL: &str = "This information is not available in the current onboarding materials. Please contact HR or your manager for clarification.";

/// Appended when the generator cited nothing despite being given sources.
pub const MISSING_CITATION_NOTE: &str =
    "(Note: This answer is based on the uploaded onboarding documents.)";

/// Length of the per-source excerpt in the query response.
const EXCERPT_CHARS: usize = 200;

/// Answer a question from the ingested corpus.
pub async fn answer_question(
    store: &Store,
    client: &ModelClient,
    config: &Config,
    question: &str,
    user_id: Option<&str>,
) -> Result<Answer> {
    if question.trim().is_empty() {
        return Err(RagError::Validation("question must not be empty".to_string()));
    }

    let started = std::time::Instant::now();
    tracing::debug!(user_id = user_id.unwrap_or("-"), "answering question");

    let sources = retrieve::retrieve(store, client, config, question).await?;

    if sources.is_empty() {
        return Ok(Answer {
            answer: EMPTY_CORPUS_FALLBACK.to_string(),
            sources,
            confidence: 0.0,
            response_time_seconds: started.elapsed().as_secs_f64(),
        });
    }

    let context = build_context(&sources);
    let user_prompt = format!(
        "Context from the onboarding documents:\n\n{context}\n\nQuestion: {question}"
    );

    let generated = client
        .generate(
            &system_instructions(),
            &user_prompt,
            GenerationParams {
                temperature: config.generation.temperature,
                max_output_tokens: config.generation.max_output_tokens,
            },
        )
        .await?;

    let cited = contains_citation(&generated);
    let answer_text = if cited {
        generated
    } else {
        format!("{generated}\n\n{MISSING_CITATION_NOTE}")
    };

    let confidence = confidence_score(&sources, cited);

    Ok(Answer {
        answer: answer_text,
        sources,
        confidence,
        response_time_seconds: started.elapsed().as_secs_f64(),
    })
}

/// One block per source, each opened by a header of the exact form
/// `[SOURCE i: "<title>" by <author> [<type>] - Section <n> (Relevance: <p>%)]`,
/// separated by `\n\n---\n\n`.
fn build_context(sources: &[RetrievalSource]) -> String {
    sources
        .iter()
        .enumerate()
        .map(|(i, source)| {
            let author_suffix = source
                .metadata
                .author
                .as_deref()
                .map(|a| format!(" by {a}"))
                .unwrap_or_default();
            let type_suffix = if source.metadata.document_type.is_empty() {
                String::new()
            } else {
                format!(" [{}]", source.metadata.document_type)
            };
            format!(
                "[SOURCE {}: \"{}\"{}{} - Section {} (Relevance: {:.1}%)]\n{}",
                i + 1,
                source.document_title,
                author_suffix,
                type_suffix,
                source.chunk_index + 1,
                source.relevance_score * 100.0,
                source.chunk_text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

fn system_instructions() -> String {
    format!(
        "You are an onboarding assistant. Answer questions using ONLY the \
         provided context from the uploaded onboarding documents. Never use \
         outside knowledge, and never invent information that is not in the \
         context. Cite every fact with the [SOURCE n] notation matching the \
         source it came from. If the context does not contain the information \
         needed to answer, reply exactly: \"{GROUNDING_REFUSAL}\""
    )
}

/// True when the text contains a `[SOURCE <digits>]` citation.
fn contains_citation(text: &str) -> bool {
    let mut rest = text;
    while let Some(pos) = rest.find("[SOURCE ") {
        let after = &rest[pos + "[SOURCE ".len()..];
        let digits = after.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits > 0 && after[digits..].starts_with(']') {
            return true;
        }
        rest = &rest[pos + 1..];
    }
    false
}

/// `0.5·avg + 0.5·top`, boosted by 1.1 when the answer carries citations,
/// clamped to `[0, 1]`. Zero exactly when there are no sources.
fn confidence_score(sources: &[RetrievalSource], cited: bool) -> f32 {
    if sources.is_empty() {
        return 0.0;
    }
    let sum: f32 = sources.iter().map(|s| s.relevance_score).sum();
    let avg = sum / sources.len() as f32;
    let top = sources
        .iter()
        .map(|s| s.relevance_score)
        .fold(0.0f32, f32::max);

    let mut confidence = 0.5 * avg + 0.5 * top;
    if cited {
        confidence *= 1.1;
    }
    confidence.clamp(0.0, 1.0)
}

// ============ Query interface response ============

/// The collaborator-facing query response.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub confidence: f32,
    pub response_time_seconds: f64,
    pub sources: Vec<SourceSummary>,
    pub metadata: QueryMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    pub chunk_id: String,
    pub document_id: String,
    pub document_title: String,
    pub chunk_index: i64,
    pub relevance_score: f32,
    /// First 200 chars of the chunk, ellipsis-terminated.
    pub excerpt: String,
    pub metadata: SourceSummaryMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceSummaryMetadata {
    pub author: Option<String>,
    pub document_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryMetadata {
    pub source_count: usize,
    pub avg_relevance_score: f32,
    pub top_relevance_score: f32,
}

impl QueryResponse {
    pub fn from_answer(answer: Answer) -> Self {
        let source_count = answer.sources.len();
        let avg = if source_count == 0 {
            0.0
        } else {
            answer.sources.iter().map(|s| s.relevance_score).sum::<f32>() / source_count as f32
        };
        let top = answer
            .sources
            .iter()
            .map(|s| s.relevance_score)
            .fold(0.0f32, f32::max);

        let sources = answer
            .sources
            .into_iter()
            .map(|source| SourceSummary {
                excerpt: excerpt(&source.chunk_text),
                chunk_id: source.chunk_id,
                document_id: source.document_id,
                document_title: source.document_title,
                chunk_index: source.chunk_index,
                relevance_score: source.relevance_score,
                metadata: SourceSummaryMetadata {
                    author: source.metadata.author,
                    document_type: source.metadata.document_type,
                },
            })
            .collect();

        Self {
            answer: answer.answer,
            confidence: answer.confidence,
            response_time_seconds: answer.response_time_seconds,
            sources,
            metadata: QueryMetadata {
                source_count,
                avg_relevance_score: avg,
                top_relevance_score: top,
            },
        }
    }
}

fn excerpt(text: &str) -> String {
    let truncated: String = text.chars().take(EXCERPT_CHARS).collect();
    format!("{truncated}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;

    fn source(score: f32, index: i64) -> RetrievalSource {
        RetrievalSource {
            chunk_id: format!("chunk-{index}"),
            document_id: "doc-1".to_string(),
            document_title: "Employee Handbook".to_string(),
            chunk_index: index,
            chunk_text: "Vacation accrues monthly.".to_string(),
            relevance_score: score,
            metadata: ChunkMetadata {
                document_title: "Employee Handbook".to_string(),
                document_type: "handbook".to_string(),
                author: Some("HR Team".to_string()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn context_header_has_exact_shape() {
        let context = build_context(&[source(0.8765, 2)]);
        let expected_header =
            "[SOURCE 1: \"Employee Handbook\" by HR Team [handbook] - Section 3 (Relevance: 87.7%)]";
        assert!(
            context.starts_with(expected_header),
            "context was: {context}"
        );
        assert!(context.contains("Vacation accrues monthly."));
    }

    #[test]
    fn context_blocks_are_separated() {
        let context = build_context(&[source(0.9, 0), source(0.5, 1)]);
        assert!(context.contains("\n\n---\n\n"));
        assert!(context.contains("[SOURCE 2:"));
    }

    #[test]
    fn citation_detection() {
        assert!(contains_citation("Holidays are paid [SOURCE 1]."));
        assert!(contains_citation("see [SOURCE 12] for details"));
        assert!(!contains_citation("no citations here"));
        assert!(!contains_citation("[SOURCE ] empty"));
        assert!(!contains_citation("[SOURCE one]"));
    }

    #[test]
    fn confidence_combines_avg_and_top() {
        let sources = vec![source(0.8, 0), source(0.4, 1)];
        // avg = 0.6, top = 0.8 → base 0.7; no citation boost.
        let c = confidence_score(&sources, false);
        assert!((c - 0.7).abs() < 1e-6);

        // With citations: 0.7 × 1.1 = 0.77.
        let c = confidence_score(&sources, true);
        assert!((c - 0.77).abs() < 1e-6);
    }

    #[test]
    fn confidence_clamps_and_zeroes() {
        assert_eq!(confidence_score(&[], true), 0.0);
        let c = confidence_score(&[source(1.0, 0)], true);
        assert_eq!(c, 1.0);
    }

    #[test]
    fn excerpt_is_truncated_and_ellipsis_terminated() {
        let long = "x".repeat(500);
        let e = excerpt(&long);
        assert_eq!(e.chars().count(), 201);
        assert!(e.ends_with('…'));

        assert_eq!(excerpt("short"), "short…");
    }

    #[test]
    fn system_instructions_pin_the_refusal_string() {
        let instructions = system_instructions();
        assert!(instructions.contains(GROUNDING_REFUSAL));
        assert!(instructions.contains("[SOURCE n]"));
    }
}
