//! Inline citation extraction.
//!
//! Answer text may embed citation blocks of the form
//! `[Source: <type>, Pages <range>, URL: <url>; ...]`. Extraction replaces
//! each block with numbered `[i]` markers and returns the deduplicated
//! reference list in first-seen order. Pure and deterministic.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

// =============================================================================
// Compiled patterns (compiled once, reused across calls)
// =============================================================================

static SOURCE_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[Source:\s*([^\]]+)\]").expect("Invalid source block regex"));

/// Page range after the `Pages` token: digits, hyphens, en-dashes, commas.
static PAGE_RANGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Pages\s+([0-9][0-9,\-\u{2013}]*)").expect("Invalid pages regex"));

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"URL:\s*(\S+)").expect("Invalid url regex"));

/// One parsed citation entry. Missing sub-fields are empty strings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtractedSource {
    pub source_type: String,
    pub pages: String,
    pub url: String,
}

impl ExtractedSource {
    /// Dedup key across the entire input text.
    fn key(&self) -> String {
        format!("{}|{}|{}", self.url, self.pages, self.source_type)
    }
}

/// Result of extracting citations from one answer text.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Extraction {
    /// The input with each source block replaced by `[i]` markers.
    pub text: String,
    /// Distinct sources in first-seen order; `sources[i]` is marker `[i+1]`.
    pub sources: Vec<ExtractedSource>,
}

/// Parse and number every citation block in `text`.
///
/// Identical entries (same url, pages, and type) collapse to one reference
/// and reuse their first-assigned index, across the whole input rather than
/// per block. Within one block's replacement no index repeats.
pub fn extract_sources(text: &str) -> Extraction {
    let mut sources: Vec<ExtractedSource> = Vec::new();
    let mut index_by_key: HashMap<String, usize> = HashMap::new();

    let cleaned = SOURCE_BLOCK_RE.replace_all(text, |caps: &regex::Captures| {
        let mut markers = String::new();
        let mut seen_in_block: Vec<usize> = Vec::new();

        for entry in caps[1].split(';') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let source = parse_entry(entry);
            let index = *index_by_key.entry(source.key()).or_insert_with(|| {
                sources.push(source);
                sources.len()
            });
            if !seen_in_block.contains(&index) {
                seen_in_block.push(index);
                markers.push_str(&format!("[{}]", index));
            }
        }
        markers
    });

    Extraction {
        text: cleaned.into_owned(),
        sources,
    }
}

/// Parse one `;`-separated entry into its sub-fields.
fn parse_entry(entry: &str) -> ExtractedSource {
    let source_type = entry
        .split(',')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();

    let pages = PAGE_RANGE_RE
        .captures(entry)
        .map(|c| c[1].to_string())
        .unwrap_or_default();

    let url = URL_RE
        .captures(entry)
        .map(|c| c[1].to_string())
        .unwrap_or_default();

    ExtractedSource {
        source_type,
        pages,
        url,
    }
}
