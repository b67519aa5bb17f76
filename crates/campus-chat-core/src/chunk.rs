//! Paragraph-boundary text chunker for course documents.
//!
//! Splits a document into [`TextChunk`]s no longer than `max_tokens`
//! (approximated at 4 characters per token). Paragraphs (`\n\n`) are
//! packed together until the next one would overflow; a paragraph that
//! is too long on its own is hard-split at the last newline or space
//! before the limit.
//!
//! ```rust
//! use campus_chat_core::chunk::split_text;
//!
//! let chunks = split_text("Cells.\n\nMitochondria.", 700);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].index, 0);
//! ```

use sha2::{Digest, Sha256};

const CHARS_PER_TOKEN: usize = 4;

/// A chunk of document text awaiting embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub index: i64,
    pub text: String,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
}

/// Split `text` into chunks with contiguous indices starting at 0.
///
/// Blank input yields no chunks.
pub fn split_text(text: &str, max_tokens: usize) -> Vec<TextChunk> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let mut chunks = Vec::new();
    let mut buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if buf.is_empty() {
            trimmed.len()
        } else {
            buf.len() + 2 + trimmed.len()
        };
        if would_be > max_chars && !buf.is_empty() {
            push_chunk(&mut chunks, &buf);
            buf.clear();
        }

        if trimmed.len() > max_chars {
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let split_at = floor_char_boundary(remaining, max_chars);
                let actual = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind('\n')
                        .or_else(|| remaining[..split_at].rfind(' '))
                        .map(|pos| pos + 1)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };
                let piece = remaining[..actual].trim();
                if !piece.is_empty() {
                    push_chunk(&mut chunks, piece);
                }
                remaining = &remaining[actual..];
            }
        } else {
            if !buf.is_empty() {
                buf.push_str("\n\n");
            }
            buf.push_str(trimmed);
        }
    }

    if !buf.is_empty() {
        push_chunk(&mut chunks, &buf);
    }

    chunks
}

fn push_chunk(chunks: &mut Vec<TextChunk>, text: &str) {
    let index = chunks.len() as i64;
    chunks.push(TextChunk {
        index,
        text: text.to_string(),
        hash: content_hash(text),
    });
}

/// Hex SHA-256 of `text`.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

// Largest index <= `max` that falls on a char boundary (never 0 for non-empty input).
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut i = max;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    if i == 0 {
        s.chars().next().map(|c| c.len_utf8()).unwrap_or(s.len())
    } else {
        i
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_text_has_no_chunks() {
        assert!(split_text("", 700).is_empty());
        assert!(split_text("\n\n  \n\n", 700).is_empty());
    }

    #[test]
    fn test_paragraphs_packed_under_limit() {
        let chunks = split_text("First.\n\nSecond.\n\nThird.", 700);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "First.\n\nSecond.\n\nThird.");
    }

    #[test]
    fn test_indices_contiguous() {
        let text = (0..50)
            .map(|i| format!("Paragraph number {}.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = split_text(&text, 10);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i as i64);
            assert!(c.text.len() <= 40, "chunk too long: {}", c.text.len());
        }
    }

    #[test]
    fn test_oversized_paragraph_hard_split() {
        let text = "word ".repeat(100);
        let chunks = split_text(&text, 5);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.text.len() <= 20));
    }

    #[test]
    fn test_multibyte_split_is_safe() {
        let text = "é".repeat(50);
        let chunks = split_text(&text, 2);
        let rejoined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(rejoined, text);
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = split_text("Alpha\n\nBeta", 2);
        let b = split_text("Alpha\n\nBeta", 2);
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].hash, content_hash("Alpha"));
    }
}
