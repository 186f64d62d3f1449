//! ============================================================================
//! Text Chunker - Bounded, overlap-aware splitting for indexing
//! ============================================================================
//! Splits raw text into lines and then paragraphs measured in units, where a
//! unit is one whitespace-delimited word. Words are never split. Every
//! paragraph after the first repeats the trailing `overlap` words of the
//! previous one so a fact spanning a boundary is still retrievable.
//! ============================================================================

use serde::{Deserialize, Serialize};

/// Default maximum units per line
pub const DEFAULT_UNITS_PER_LINE: usize = 128;

/// Default maximum units per paragraph
pub const DEFAULT_UNITS_PER_PARAGRAPH: usize = 200;

/// Chunking parameters for one memorize call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSettings {
    pub max_units_per_line: usize,
    pub max_units_per_paragraph: usize,
    pub overlap_units: usize,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            max_units_per_line: DEFAULT_UNITS_PER_LINE,
            max_units_per_paragraph: DEFAULT_UNITS_PER_PARAGRAPH,
            overlap_units: 0,
        }
    }
}

/// Split text into lines of at most `max_units_per_line` words.
/// Source line breaks are kept as boundaries; blank lines are dropped.
pub fn chunk_lines(text: &str, max_units_per_line: usize) -> Vec<String> {
    let max = max_units_per_line.max(1);
    let mut lines = Vec::new();

    for source_line in text.lines() {
        let words: Vec<&str> = source_line.split_whitespace().collect();
        for piece in words.chunks(max) {
            lines.push(piece.join(" "));
        }
    }

    lines
}

/// Pack lines into paragraphs of at most `max_units_per_paragraph` words,
/// each starting with the trailing `overlap_units` words of its predecessor.
pub fn chunk_paragraphs(
    lines: &[String],
    overlap_units: usize,
    max_units_per_paragraph: usize,
) -> Vec<String> {
    pack_paragraphs(lines, overlap_units, max_units_per_paragraph)
        .into_iter()
        .map(|paragraph| paragraph.text)
        .collect()
}

/// Lines then paragraphs, with one set of settings
pub fn chunk_text(text: &str, settings: &ChunkSettings) -> Vec<String> {
    let lines = chunk_lines(text, settings.max_units_per_line);
    chunk_paragraphs(
        &lines,
        settings.overlap_units,
        settings.max_units_per_paragraph,
    )
}

#[derive(Debug, Clone, PartialEq)]
struct PackedParagraph {
    /// Number of leading words repeated from the previous paragraph
    overlap: usize,
    text: String,
}

fn pack_paragraphs(lines: &[String], overlap_units: usize, max_units: usize) -> Vec<PackedParagraph> {
    let max = max_units.max(1);
    let overlap = overlap_units.min(max - 1);
    // Room left for new content once the overlap prefix is in place
    let budget = max - overlap;

    let mut paragraphs = Vec::new();
    let mut current: Vec<Vec<&str>> = Vec::new();
    let mut current_len = 0usize;
    let mut tail: Vec<&str> = Vec::new();

    for line in lines {
        let words: Vec<&str> = line.split_whitespace().collect();
        for piece in words.chunks(budget) {
            if current_len > 0 && current_len + piece.len() > budget {
                emit(&mut paragraphs, &mut current, &mut current_len, &mut tail, overlap);
            }
            current_len += piece.len();
            current.push(piece.to_vec());
        }
    }

    if current_len > 0 {
        emit(&mut paragraphs, &mut current, &mut current_len, &mut tail, overlap);
    }

    paragraphs
}

fn emit<'a>(
    paragraphs: &mut Vec<PackedParagraph>,
    current: &mut Vec<Vec<&'a str>>,
    current_len: &mut usize,
    tail: &mut Vec<&'a str>,
    overlap: usize,
) {
    let body = current
        .iter()
        .map(|line| line.join(" "))
        .collect::<Vec<_>>()
        .join("\n");

    let text = if tail.is_empty() {
        body
    } else {
        format!("{}\n{}", tail.join(" "), body)
    };

    paragraphs.push(PackedParagraph {
        overlap: tail.len(),
        text,
    });

    // The next overlap may reach back into this paragraph's own prefix
    let mut whole: Vec<&str> = tail.clone();
    whole.extend(current.iter().flatten().copied());
    *tail = whole[whole.len().saturating_sub(overlap)..].to_vec();
    current.clear();
    *current_len = 0;
}
