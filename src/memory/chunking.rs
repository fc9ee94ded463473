//! Content chunking
//!
//! Content above the configured token threshold is stored as a level-0
//! parent plus ordered children: level-1 paragraph chunks split on
//! blank-line boundaries. A paragraph that is itself long becomes level-2
//! sentence chunks instead of a single paragraph chunk, so every slice of
//! the parent lands in exactly one child. Children share one ascending
//! chunk_index sequence in document order.

use once_cell::sync::Lazy;
use tiktoken_rs::CoreBPE;

/// Token count above which a paragraph also gets sentence-level chunks
pub const ATOMIC_THRESHOLD_TOKENS: usize = 100;

static BPE: Lazy<CoreBPE> =
    Lazy::new(|| tiktoken_rs::cl100k_base().expect("cl100k_base vocabulary"));

/// Count tokens in a text
pub fn count_tokens(text: &str) -> usize {
    BPE.encode_with_special_tokens(text).len()
}

/// One planned chunk
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPiece {
    pub content: String,
    /// 1 = paragraph, 2 = atomic
    pub level: i32,
    pub index: i32,
}

/// Plan the chunks for a piece of content. Returns `None` when the content
/// is below the threshold and should be stored as a single memory.
pub fn plan_chunks(content: &str, threshold_tokens: usize) -> Option<Vec<ChunkPiece>> {
    if count_tokens(content) <= threshold_tokens {
        return None;
    }

    let mut pieces = Vec::new();
    let mut index: i32 = 0;

    for paragraph in split_paragraphs(content) {
        if count_tokens(&paragraph) > ATOMIC_THRESHOLD_TOKENS {
            for sentence in split_sentences(&paragraph) {
                pieces.push(ChunkPiece {
                    content: sentence,
                    level: 2,
                    index,
                });
                index += 1;
            }
        } else {
            pieces.push(ChunkPiece {
                content: paragraph,
                level: 1,
                index,
            });
            index += 1;
        }
    }

    if pieces.is_empty() {
        None
    } else {
        Some(pieces)
    }
}

/// Split content on blank-line boundaries
pub fn split_paragraphs(content: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current = String::new();

    for line in content.lines() {
        if line.trim().is_empty() {
            if !current.trim().is_empty() {
                paragraphs.push(current.trim().to_string());
            }
            current.clear();
        } else {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
        }
    }
    if !current.trim().is_empty() {
        paragraphs.push(current.trim().to_string());
    }

    paragraphs
}

/// Split a paragraph into sentences on terminal punctuation
pub fn split_sentences(paragraph: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = paragraph.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            let boundary = chars.peek().map_or(true, |next| next.is_whitespace());
            if boundary {
                let trimmed = current.trim();
                if !trimmed.is_empty() {
                    sentences.push(trimmed.to_string());
                }
                current.clear();
            }
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }

    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_content_not_chunked() {
        assert!(plan_chunks("a short note", 400).is_none());
    }

    #[test]
    fn test_paragraph_split() {
        let paragraphs = split_paragraphs("first line\nsame paragraph\n\nsecond\n\n\nthird");
        assert_eq!(
            paragraphs,
            vec!["first line\nsame paragraph", "second", "third"]
        );
    }

    #[test]
    fn test_sentence_split() {
        let sentences = split_sentences("One sentence. Another one! A third? Done");
        assert_eq!(
            sentences,
            vec!["One sentence.", "Another one!", "A third?", "Done"]
        );
    }

    #[test]
    fn test_sentence_split_keeps_decimal_points() {
        let sentences = split_sentences("Version 1.5 shipped. It works.");
        assert_eq!(sentences, vec!["Version 1.5 shipped.", "It works."]);
    }

    #[test]
    fn test_chunk_indexes_ascending() {
        // Force chunking with a tiny threshold
        let content = "Alpha paragraph one. It has sentences.\n\nBeta paragraph two.";
        let pieces = plan_chunks(content, 3).unwrap();

        let indexes: Vec<i32> = pieces.iter().map(|p| p.index).collect();
        let expected: Vec<i32> = (0..pieces.len() as i32).collect();
        assert_eq!(indexes, expected);
        assert!(pieces.iter().all(|p| p.level == 1 || p.level == 2));
        assert!(pieces.iter().any(|p| p.level == 1));
    }

    #[test]
    fn test_long_paragraph_gets_atomic_chunks() {
        let long_paragraph = (0..40)
            .map(|i| format!("Sentence number {} contains several words here.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let pieces = plan_chunks(&long_paragraph, 50).unwrap();

        // The long paragraph is replaced by its sentences, not duplicated
        assert_eq!(pieces.iter().filter(|p| p.level == 1).count(), 0);
        assert!(pieces.iter().filter(|p| p.level == 2).count() > 1);

        // Every slice of the parent appears in exactly one piece, so the
        // total across all levels never exceeds the parent length
        let child_total: usize = pieces.iter().map(|p| p.content.len()).sum();
        assert!(child_total <= long_paragraph.len());
    }

    #[test]
    fn test_mixed_paragraphs_total_bounded() {
        let long_paragraph = (0..30)
            .map(|i| format!("Sentence {} of the oversized paragraph keeps going on.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let content = format!("A short opener.\n\n{}\n\nA short closer.", long_paragraph);
        let pieces = plan_chunks(&content, 10).unwrap();

        assert!(pieces.iter().any(|p| p.level == 1));
        assert!(pieces.iter().any(|p| p.level == 2));
        let child_total: usize = pieces.iter().map(|p| p.content.len()).sum();
        assert!(child_total <= content.len());
    }

    #[test]
    fn test_token_counting_nonzero() {
        assert!(count_tokens("hello world") >= 2);
        assert_eq!(count_tokens(""), 0);
    }
}
