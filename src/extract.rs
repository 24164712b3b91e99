//! PDF text extraction and heuristic metadata.
//!
//! Turns a PDF byte stream into normalized text, page and word counts, a
//! section outline, and heuristic metadata (title, author, detected document
//! type, language, tags). Image-only PDFs that yield no text fail with
//! `ExtractFailed`; OCR is out of scope.

use lopdf::{Document as PdfDocument, Object};

use crate::error::{RagError, Result};

/// Everything the extractor learns about one PDF.
#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    /// Normalized full text.
    pub text: String,
    pub page_count: i64,
    pub word_count: i64,
    /// Heading outline in document order.
    pub sections: Vec<Section>,
    pub metadata: ExtractedMetadata,
}

/// One heading found by the section scan.
#[derive(Debug, Clone)]
pub struct Section {
    pub title: String,
    /// 1 for numbered `1.` or all-caps headings, 2 for `1.2`, 3 for `1.2.3`.
    pub level: u8,
    /// Byte offset of the heading line in the normalized text.
    pub start_char: usize,
    /// Non-blank, non-heading lines under this heading. A section with zero
    /// body lines absorbs any heading that immediately follows it.
    pub content_lines: usize,
}

/// Fields pulled from the PDF Info dictionary plus derived heuristics.
#[derive(Debug, Clone, Default)]
pub struct ExtractedMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
    pub keywords: Option<String>,
    pub creator: Option<String>,
    pub producer: Option<String>,
    pub creation_date: Option<String>,
    pub mod_date: Option<String>,
    /// Keywords split on `,`/`;`/`|` plus the Subject field.
    pub extracted_tags: Vec<String>,
    /// `en` or `unknown`. Advisory only.
    pub language: String,
    /// One of: onboarding, policy, training, handbook, guide, procedure, general.
    pub document_type: String,
}

const STOPWORDS: [&str; 8] = ["the", "and", "is", "in", "to", "of", "a", "for"];

/// Parse a PDF and derive the full extraction result.
///
/// `filename` is used only to derive a title when the PDF metadata has none.
pub fn extract(bytes: &[u8], filename: Option<&str>) -> Result<ExtractedDocument> {
    let doc = PdfDocument::load_mem(bytes)
        .map_err(|e| RagError::ExtractFailed(format!("unable to parse PDF: {e}")))?;

    let pages = doc.get_pages();
    let page_count = pages.len() as i64;

    let mut raw = String::new();
    for (&page_no, _) in pages.iter() {
        match doc.extract_text(&[page_no]) {
            Ok(text) => {
                if !raw.is_empty() {
                    raw.push('\n');
                }
                raw.push_str(&text);
            }
            Err(e) => {
                tracing::debug!(page = page_no, error = %e, "page text extraction failed");
            }
        }
    }

    let text = normalize_text(&raw);
    if text.is_empty() {
        return Err(RagError::ExtractFailed(
            "PDF yielded no extractable text".to_string(),
        ));
    }

    let word_count = text.split_whitespace().count() as i64;
    let sections = extract_sections(&text);

    let mut metadata = read_info_metadata(&doc);
    if metadata.title.is_none() {
        metadata.title = filename.map(title_from_filename).filter(|t| !t.is_empty());
    }
    metadata.extracted_tags =
        extract_tags(metadata.keywords.as_deref(), metadata.subject.as_deref());
    metadata.language = detect_language(&text).to_string();
    metadata.document_type =
        detect_document_type(&text, metadata.title.as_deref().unwrap_or("")).to_string();

    Ok(ExtractedDocument {
        text,
        page_count,
        word_count,
        sections,
        metadata,
    })
}

/// Normalize extracted text: CRLF → LF, runs of 3+ newlines collapsed to two,
/// runs of spaces/tabs collapsed to one space, NUL bytes stripped, trimmed.
///
/// Idempotent: `normalize_text(normalize_text(t)) == normalize_text(t)`.
pub fn normalize_text(input: &str) -> String {
    let text = input.replace('\0', "").replace("\r\n", "\n");

    let mut out = String::with_capacity(text.len());
    let mut newline_run = 0usize;
    let mut in_space = false;

    for c in text.chars() {
        match c {
            '\n' => {
                in_space = false;
                newline_run += 1;
                if newline_run <= 2 {
                    out.push('\n');
                }
            }
            ' ' | '\t' => {
                newline_run = 0;
                if !in_space {
                    out.push(' ');
                    in_space = true;
                }
            }
            _ => {
                newline_run = 0;
                in_space = false;
                out.push(c);
            }
        }
    }

    out.trim().to_string()
}

/// Split the Keywords field on `,`/`;`/`|`, append Subject, trim, drop empties.
fn extract_tags(keywords: Option<&str>, subject: Option<&str>) -> Vec<String> {
    let mut tags = Vec::new();
    if let Some(keywords) = keywords {
        for part in keywords.split([',', ';', '|']) {
            let tag = part.trim();
            if !tag.is_empty() {
                tags.push(tag.to_string());
            }
        }
    }
    if let Some(subject) = subject {
        let tag = subject.trim();
        if !tag.is_empty() {
            tags.push(tag.to_string());
        }
    }
    tags
}

/// Stopword scan over the first 1000 chars. `en` when at least 4 of the 8
/// stopwords appear as whole words, `unknown` otherwise.
fn detect_language(text: &str) -> &'static str {
    let sample: String = text.chars().take(1000).collect();
    let sample = sample.to_lowercase();
    let padded = format!(
        " {} ",
        sample.split_whitespace().collect::<Vec<_>>().join(" ")
    );

    let hits = STOPWORDS
        .iter()
        .filter(|word| padded.contains(&format!(" {word} ")))
        .count();

    if hits >= 4 {
        "en"
    } else {
        "unknown"
    }
}

/// Substring search over the first 2000 chars and the title, in priority
/// order, returning on first match.
fn detect_document_type(text: &str, title: &str) -> &'static str {
    let sample: String = text.chars().take(2000).collect();
    let sample = sample.to_lowercase();
    let title = title.to_lowercase();

    let matches = |needles: &[&str]| {
        needles
            .iter()
            .any(|needle| sample.contains(needle) || title.contains(needle))
    };

    if matches(&["onboarding"]) {
        "onboarding"
    } else if matches(&["policy", "policies"]) {
        "policy"
    } else if matches(&["training", "tutorial"]) {
        "training"
    } else if matches(&["handbook", "manual"]) {
        "handbook"
    } else if matches(&["guide"]) {
        "guide"
    } else if matches(&["procedure", "process"]) {
        "procedure"
    } else {
        "general"
    }
}

/// Walk trimmed lines and collect headings into a section outline.
///
/// A heading closes the running section only once that section has body
/// content. A heading directly after another heading (a subtitle line, say)
/// folds into the open section rather than opening one of its own.
pub fn extract_sections(text: &str) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();
    let mut open: Option<Section> = None;
    let mut offset = 0usize;

    for line in text.split('\n') {
        let trimmed = line.trim();
        if is_heading(trimmed) {
            match &open {
                Some(section) if section.content_lines == 0 => {}
                _ => {
                    if let Some(done) = open.take() {
                        sections.push(done);
                    }
                    open = Some(Section {
                        title: trimmed.to_string(),
                        level: heading_level(trimmed),
                        start_char: offset,
                        content_lines: 0,
                    });
                }
            }
        } else if !trimmed.is_empty() {
            if let Some(section) = open.as_mut() {
                section.content_lines += 1;
            }
        }
        offset += line.len() + 1;
    }
    if let Some(done) = open {
        sections.push(done);
    }

    sections
}

/// A line is a heading when it is short all-caps, a numbered heading like
/// `3. Benefits`, or a short capitalized line without sentence punctuation.
fn is_heading(line: &str) -> bool {
    if line.is_empty() {
        return false;
    }
    let token_count = line.split_whitespace().count();
    if line.len() < 100 && token_count <= 10 && line == line.to_uppercase() {
        return true;
    }
    if is_numbered_heading(line) {
        return true;
    }
    if line.len() < 80 && starts_capitalized_without_sentence_punct(line) {
        return true;
    }
    false
}

/// `^\d+(\.|\))\s+[A-Z]`
fn is_numbered_heading(line: &str) -> bool {
    let rest = line.trim_start_matches(|c: char| c.is_ascii_digit());
    if rest.len() == line.len() {
        return false;
    }
    let mut chars = rest.chars();
    if !matches!(chars.next(), Some('.') | Some(')')) {
        return false;
    }
    let after = chars.as_str();
    let body = after.trim_start();
    if body.len() == after.len() {
        return false;
    }
    body.chars().next().is_some_and(|c| c.is_ascii_uppercase())
}

/// `^[A-Z][^.!?]*$`
fn starts_capitalized_without_sentence_punct(line: &str) -> bool {
    if !line.chars().next().is_some_and(|c| c.is_ascii_uppercase()) {
        return false;
    }
    !line.contains(['.', '!', '?'])
}

/// `1.` → 1, `1.2` → 2, `1.2.3` → 3, all-caps → 1, anything else → 2.
fn heading_level(line: &str) -> u8 {
    if let Some(depth) = numbered_depth(line) {
        return depth;
    }
    if line == line.to_uppercase() {
        1
    } else {
        2
    }
}

fn numbered_depth(line: &str) -> Option<u8> {
    let mut groups = 0u8;
    let mut rest = line;
    loop {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return None;
        }
        groups += 1;
        rest = &rest[digits..];
        if let Some(stripped) = rest.strip_prefix('.') {
            if stripped.starts_with(' ') {
                return Some(groups.min(3));
            }
            rest = stripped;
            continue;
        }
        if rest.starts_with(' ') {
            return Some(groups.min(3));
        }
        return None;
    }
}

/// Derive a title from a filename: drop the extension, turn `-`/`_` into
/// spaces, title-case each word.
fn title_from_filename(filename: &str) -> String {
    let stem = std::path::Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);

    stem.replace(['-', '_'], " ")
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn read_info_metadata(doc: &PdfDocument) -> ExtractedMetadata {
    let mut metadata = ExtractedMetadata::default();

    let dict = match info_dictionary(doc) {
        Some(dict) => dict,
        None => return metadata,
    };

    metadata.title = info_string(dict, b"Title");
    metadata.author = info_string(dict, b"Author");
    metadata.subject = info_string(dict, b"Subject");
    metadata.keywords = info_string(dict, b"Keywords");
    metadata.creator = info_string(dict, b"Creator");
    metadata.producer = info_string(dict, b"Producer");
    metadata.creation_date = info_string(dict, b"CreationDate");
    metadata.mod_date = info_string(dict, b"ModDate");
    metadata
}

fn info_dictionary(doc: &PdfDocument) -> Option<&lopdf::Dictionary> {
    match doc.trailer.get(b"Info").ok()? {
        Object::Reference(id) => doc.get_object(*id).ok()?.as_dict().ok(),
        Object::Dictionary(dict) => Some(dict),
        _ => None,
    }
}

fn info_string(dict: &lopdf::Dictionary, key: &[u8]) -> Option<String> {
    decode_pdf_string(dict.get(key).ok()?)
}

/// PDF text strings are either UTF-16BE with a BOM or a byte string.
fn decode_pdf_string(obj: &Object) -> Option<String> {
    let bytes = match obj {
        Object::String(bytes, _) => bytes,
        _ => return None,
    };

    let text = if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    };

    let trimmed = text.trim().to_string();
    (!trimmed.is_empty()).then_some(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace() {
        let input = "Line one.\r\n\r\n\r\n\r\nLine   two.\t\tTabbed.\0";
        let normalized = normalize_text(input);
        assert_eq!(normalized, "Line one.\n\nLine two. Tabbed.");
    }

    #[test]
    fn normalize_is_idempotent() {
        let inputs = [
            "a  b\r\n\r\n\r\nc",
            "  leading and trailing  ",
            "one\n\n\n\n\ntwo\tthree",
            "",
        ];
        for input in inputs {
            let once = normalize_text(input);
            assert_eq!(normalize_text(&once), once, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn word_count_counts_nonwhitespace_runs() {
        let text = normalize_text(
            "Company holidays include New Year's Day, Memorial Day, and Independence Day.\n\nAll full-time employees are entitled to these paid holidays.",
        );
        assert_eq!(text.split_whitespace().count(), 20);
    }

    #[test]
    fn tags_split_on_all_separators_and_include_subject() {
        let tags = extract_tags(Some("hr, benefits; leave | travel"), Some("Policies"));
        assert_eq!(tags, vec!["hr", "benefits", "leave", "travel", "Policies"]);
        assert!(extract_tags(Some(" , ;"), None).is_empty());
    }

    #[test]
    fn language_detection_needs_four_stopwords() {
        let english = "The office is in the city and it is open to all of the staff for a day.";
        assert_eq!(detect_language(english), "en");

        let sparse = "Company holidays include Memorial Day and Independence Day.";
        assert_eq!(detect_language(sparse), "unknown");
    }

    #[test]
    fn document_type_priority_order() {
        assert_eq!(
            detect_document_type("your onboarding policy handbook", ""),
            "onboarding"
        );
        assert_eq!(detect_document_type("security policies handbook", ""), "policy");
        assert_eq!(detect_document_type("a tutorial for new hires", ""), "training");
        assert_eq!(detect_document_type("", "Employee Handbook"), "handbook");
        assert_eq!(detect_document_type("style guide", ""), "guide");
        assert_eq!(detect_document_type("expense process", ""), "procedure");
        assert_eq!(detect_document_type("quarterly report", ""), "general");
    }

    #[test]
    fn heading_detection_variants() {
        assert!(is_heading("INTRODUCTION"));
        assert!(is_heading("1. Getting Started"));
        assert!(is_heading("2) Benefits"));
        assert!(is_heading("Welcome aboard"));
        assert!(!is_heading("This is a full sentence."));
        assert!(!is_heading(""));
        assert!(!is_heading("lowercase start"));
    }

    #[test]
    fn heading_levels() {
        assert_eq!(heading_level("1. Overview"), 1);
        assert_eq!(heading_level("1.2 Details"), 2);
        assert_eq!(heading_level("1.2.3 Fine Print"), 3);
        assert_eq!(heading_level("COMPANY POLICY"), 1);
        assert_eq!(heading_level("Welcome aboard"), 2);
    }

    #[test]
    fn sections_record_offsets_in_order() {
        let text = "OVERVIEW\nThis covers the basics of it all.\n\n1. Pay\nPaid monthly. No exceptions here at all.";
        let sections = extract_sections(text);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].title, "OVERVIEW");
        assert_eq!(sections[0].start_char, 0);
        assert_eq!(sections[0].content_lines, 1);
        assert_eq!(sections[1].title, "1. Pay");
        assert!(sections[1].start_char > sections[0].start_char);
    }

    #[test]
    fn adjacent_headings_fold_into_one_section() {
        // A title line followed immediately by a subtitle: the open section
        // has no content yet, so the second heading does not open its own.
        let text = "EMPLOYEE HANDBOOK\nWelcome Aboard\nThis part explains the basics of it all.\n\n1. Pay\nPaid monthly. No exceptions here at all.";
        let sections = extract_sections(text);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].title, "EMPLOYEE HANDBOOK");
        assert_eq!(sections[0].start_char, 0);
        assert_eq!(sections[1].title, "1. Pay");
    }

    #[test]
    fn trailing_heading_without_content_still_closes_the_outline() {
        let text = "INTRODUCTION\nSome body text explains things here at length.\n\nAPPENDIX";
        let sections = extract_sections(text);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[1].title, "APPENDIX");
        assert_eq!(sections[1].content_lines, 0);
    }

    #[test]
    fn filename_titles_are_cleaned() {
        assert_eq!(
            title_from_filename("employee-handbook_2024.pdf"),
            "Employee Handbook 2024"
        );
        assert_eq!(title_from_filename("guide.pdf"), "Guide");
    }

    #[test]
    fn garbage_bytes_fail_extraction() {
        let err = extract(b"not a pdf at all", None).unwrap_err();
        assert_eq!(err.kind(), "extract_failed");
    }

    #[test]
    fn utf16_info_strings_decode() {
        let obj = Object::String(
            vec![0xFE, 0xFF, 0x00, b'H', 0x00, b'R'],
            lopdf::StringFormat::Literal,
        );
        assert_eq!(decode_pdf_string(&obj).as_deref(), Some("HR"));
    }
}
