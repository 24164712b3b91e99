//! Paragraph-boundary text chunker with sentence-aware overlap.
//!
//! Splits normalized document text into chunks that respect a token budget
//! (approximated as 4 chars per token; no real tokenizer is ever called).
//! Paragraphs are packed greedily; when a chunk fills up, the next chunk is
//! seeded with an overlap prefix drawn from the tail of the one just emitted,
//! preferring a sentence boundary inside the overlap window.
//!
//! Invariants: chunk indices are `0, 1, 2, …`; chunk text is non-empty after
//! trimming; consecutive chunks share the overlap prefix by construction.

/// Approximate chars-per-token ratio used across the pipeline.
const CHARS_PER_TOKEN: usize = 4;

/// One produced chunk, before ids and denormalized metadata are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDraft {
    pub text: String,
    /// Monotone index assigned in production order.
    pub index: i64,
    /// `ceil(len / 4)`.
    pub token_count: i64,
    /// Byte offset into the source text where this chunk begins. For an
    /// overlap-seeded chunk this is `previous end_char - overlap length`.
    pub start_char: usize,
    /// Byte offset into the source text where this chunk's last paragraph ends.
    pub end_char: usize,
}

struct Paragraph {
    text: String,
    start: usize,
}

/// Split text into overlapping, token-budgeted chunks.
///
/// A single paragraph larger than the budget is emitted whole as its own
/// chunk; the algorithm never splits mid-paragraph.
pub fn chunk_text(text: &str, chunk_tokens: usize, overlap_tokens: usize) -> Vec<ChunkDraft> {
    let max_chars = chunk_tokens * CHARS_PER_TOKEN;
    let overlap_chars = overlap_tokens * CHARS_PER_TOKEN;

    let paragraphs = split_paragraphs(text);
    if paragraphs.is_empty() {
        return Vec::new();
    }

    let mut chunks: Vec<ChunkDraft> = Vec::new();
    let mut current = String::new();
    let mut current_start = 0usize;
    let mut current_end = 0usize;

    for para in &paragraphs {
        let would_be = if current.is_empty() {
            para.text.len()
        } else {
            current.len() + 2 + para.text.len()
        };

        // The paragraph that triggers a flush is appended right after the
        // overlap seed below, so `current` never reaches this check holding
        // a seed alone.
        if would_be > max_chars && !current.is_empty() {
            let emitted_end = current_end;
            push_chunk(&mut chunks, &current, current_start, emitted_end);

            let overlap = overlap_suffix(&current, overlap_chars);
            current.clear();
            if !overlap.is_empty() {
                current_start = emitted_end - overlap.len();
                current.push_str(&overlap);
            }
        }

        if current.is_empty() {
            current_start = para.start;
            current.push_str(&para.text);
        } else {
            current.push_str("\n\n");
            current.push_str(&para.text);
        }
        current_end = para.start + para.text.len();
    }

    if !current.trim().is_empty() {
        push_chunk(&mut chunks, &current, current_start, current_end);
    }

    chunks
}

/// Approximate token count for a text: `ceil(len / 4)`.
pub fn estimate_tokens(text: &str) -> i64 {
    ((text.len() + CHARS_PER_TOKEN - 1) / CHARS_PER_TOKEN) as i64
}

fn push_chunk(chunks: &mut Vec<ChunkDraft>, text: &str, start_char: usize, end_char: usize) {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return;
    }
    chunks.push(ChunkDraft {
        text: trimmed.to_string(),
        index: chunks.len() as i64,
        token_count: estimate_tokens(trimmed),
        start_char,
        end_char,
    });
}

/// Paragraphs are maximal runs of non-blank lines. Each paragraph records the
/// byte offset of its first non-whitespace character so chunk offsets map
/// back into the source text.
fn split_paragraphs(text: &str) -> Vec<Paragraph> {
    let mut paragraphs = Vec::new();
    let mut para_start: Option<usize> = None;
    let mut para_end = 0usize;
    let mut offset = 0usize;

    for line in text.split('\n') {
        if line.trim().is_empty() {
            if let Some(start) = para_start.take() {
                close_paragraph(text, start, para_end, &mut paragraphs);
            }
        } else {
            if para_start.is_none() {
                para_start = Some(offset);
            }
            para_end = offset + line.len();
        }
        offset += line.len() + 1;
    }
    if let Some(start) = para_start {
        close_paragraph(text, start, para_end, &mut paragraphs);
    }

    paragraphs
}

fn close_paragraph(text: &str, start: usize, end: usize, out: &mut Vec<Paragraph>) {
    let raw = &text[start..end];
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return;
    }
    let leading = raw.len() - raw.trim_start().len();
    out.push(Paragraph {
        text: trimmed.to_string(),
        start: start + leading,
    });
}

/// Overlap prefix for the next chunk: from the last `overlap_chars` of the
/// emitted chunk, start after the last sentence break if one exists, else use
/// the whole tail verbatim.
fn overlap_suffix(text: &str, overlap_chars: usize) -> String {
    if overlap_chars == 0 || text.is_empty() {
        return String::new();
    }
    let start = floor_char_boundary(text, text.len().saturating_sub(overlap_chars));
    let tail = &text[start..];

    match last_sentence_break(tail) {
        Some(pos) => tail[pos..].trim_start().to_string(),
        None => tail.to_string(),
    }
}

/// Byte offset just after the last `.`/`!`/`?` that is followed by whitespace
/// and a capital letter.
fn last_sentence_break(tail: &str) -> Option<usize> {
    let chars: Vec<(usize, char)> = tail.char_indices().collect();
    let mut best = None;

    for (k, &(i, c)) in chars.iter().enumerate() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let mut j = k + 1;
        let mut saw_whitespace = false;
        while j < chars.len() && chars[j].1.is_whitespace() {
            saw_whitespace = true;
            j += 1;
        }
        if saw_whitespace && j < chars.len() && chars[j].1.is_ascii_uppercase() {
            best = Some(i + c.len_utf8());
        }
    }

    best
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
