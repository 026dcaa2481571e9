
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::embeddings::Document;

/// Represents a token window of a document, the unit of embedding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Deterministic id, `{document_id}_chunk_{index}`
    pub id: String,
    pub document_id: String,
    /// Exact source text from the first to the last token of the window
    pub text: String,
    /// The index of this chunk within the document
    pub chunk_index: usize,
    /// Offset of the first token (inclusive)
    pub start_token: usize,
    /// Offset one past the last token (exclusive)
    pub end_token: usize,
    pub token_count: usize,
}

/// Configuration for token-window chunking
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Maximum window size in tokens
    pub max_chunk_size: usize,
    /// Tokens shared between adjacent windows
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            max_chunk_size: 512,
            overlap: 50,
        }
    }
}

impl ChunkingConfig {
    /// Distance between the starts of two consecutive windows
    #[inline]
    pub fn stride(&self) -> usize {
        self.max_chunk_size.saturating_sub(self.overlap).max(1)
    }
}

/// Build the id for the chunk at `index` of a document
#[inline]
pub fn chunk_id(document_id: &str, index: usize) -> String {
    format!("{}_chunk_{}", document_id, index)
}

/// Split a document into overlapping token windows
///
/// A token is a maximal run of non-whitespace characters. Windows start every
/// `max_chunk_size - overlap` tokens and chunking stops at the first window that
/// reaches the final token, so the last chunk may be shorter than the rest.
#[inline]
pub fn chunk_document(document: &Document, config: &ChunkingConfig) -> Vec<Chunk> {
    let spans = token_spans(&document.content);
    if spans.is_empty() {
        return Vec::new();
    }

    let window = config.max_chunk_size.max(1);
    let stride = config.stride();
    let mut chunks = Vec::with_capacity(spans.len() / stride + 1);
    let mut start = 0;

    loop {
        let end = (start + window).min(spans.len());
        let text = window_text(&document.content, &spans[start..end]);
        let chunk_index = chunks.len();

        chunks.push(Chunk {
            id: chunk_id(&document.id, chunk_index),
            document_id: document.id.clone(),
            text,
            chunk_index,
            start_token: start,
            end_token: end,
            token_count: end - start,
        });

        if end == spans.len() {
            break;
        }
        start += stride;
    }

    debug!(
        "Chunked document '{}' into {} chunks ({} tokens)",
        document.id,
        chunks.len(),
        spans.len()
    );

    chunks
}

/// Byte spans of every whitespace-delimited token in `text`
#[inline]
pub fn token_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut token_start = None;

    for (offset, ch) in text.char_indices() {
        match (ch.is_whitespace(), token_start) {
            (true, Some(start)) => {
                spans.push((start, offset));
                token_start = None;
            }
            (false, None) => token_start = Some(offset),
            _ => {}
        }
    }

    if let Some(start) = token_start {
        spans.push((start, text.len()));
    }

    spans
}

/// Count tokens the same way the chunker does
#[inline]
pub fn estimate_token_count(text: &str) -> usize {
    text.split_whitespace().count()
}

fn window_text(content: &str, spans: &[(usize, usize)]) -> String {
    match (spans.first(), spans.last()) {
        (Some(&(start, _)), Some(&(_, end))) => {
            content.get(start..end).unwrap_or_default().to_string()
        }
        _ => String::new(),
    }
}
