//! Sentence-boundary text chunker.
//!
//! Splits extracted document text into overlapping windows of at most
//! `size` characters. Each window tries to end at a sentence boundary
//! (`.`, `!`, `?`) found within the last `min(100, size / 4)` characters,
//! so chunks rarely cut a sentence in half. Consecutive chunks overlap by
//! `overlap` characters to preserve context across boundaries for
//! retrieval.
//!
//! This is a pure function with no side effects; counts are in characters
//! (not bytes), so multi-byte input is handled safely.

/// Split text into overlapping, sentence-boundary-aware chunks.
///
/// Texts no longer than `size` are returned unchanged as a single chunk.
/// Empty results after trimming are skipped. `overlap` must be smaller
/// than `size`; config validation enforces this before the pipeline runs.
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= size {
        return vec![text.to_string()];
    }

    let lookback = 100.min(size / 4);
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        // Naive window end; may point past the end of the text.
        let mut end = start + size;

        // Snap back to the nearest sentence boundary inside the lookback
        // window. Only applies when the window ends mid-text.
        if end < chars.len() {
            for i in 0..lookback {
                if end - i > start && is_sentence_end(chars[end - i - 1]) {
                    end -= i;
                    break;
                }
            }
        }

        let slice_end = end.min(chars.len());
        let chunk: String = chars[start..slice_end].iter().collect();
        let trimmed = chunk.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }

        // Advance by the (possibly snapped) window end minus the overlap,
        // guaranteeing forward progress even with degenerate parameters.
        start = end.saturating_sub(overlap).max(start + 1);
    }

    chunks
}

fn is_sentence_end(c: char) -> bool {
    matches!(c, '.' | '!' | '?')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_single_chunk() {
        let chunks = chunk_text("Hello, world!", 1000, 200);
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn text_exactly_at_size_is_unchanged() {
        let text = "a".repeat(50);
        let chunks = chunk_text(&text, 50, 10);
        assert_eq!(chunks, vec![text]);
    }

    #[test]
    fn empty_text_single_chunk() {
        let chunks = chunk_text("", 1000, 200);
        assert_eq!(chunks, vec![String::new()]);
    }

    #[test]
    fn long_text_produces_multiple_chunks() {
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(50);
        let chunks = chunk_text(&text, 200, 40);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(!chunk.is_empty());
            assert!(chunk.chars().count() <= 200);
        }
    }

    #[test]
    fn chunks_end_at_sentence_boundaries() {
        let text = "First sentence here. Second sentence follows. ".repeat(20);
        let chunks = chunk_text(&text, 100, 20);
        // All but the last chunk should end with a sentence terminator,
        // since the text has a boundary within every lookback window.
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(
                chunk.ends_with('.'),
                "chunk does not end at a sentence boundary: {:?}",
                chunk
            );
        }
    }

    #[test]
    fn consecutive_chunks_overlap() {
        // Uniform text without sentence boundaries: windows advance by
        // exactly size - overlap, so adjacent chunks share a suffix/prefix.
        let text: String = ('a'..='z').cycle().take(1000).collect();
        let chunks = chunk_text(&text, 300, 100);
        assert!(chunks.len() >= 2);
        let first = &chunks[0];
        let second = &chunks[1];
        let tail: String = first.chars().skip(first.chars().count() - 100).collect();
        assert!(second.starts_with(&tail));
    }

    #[test]
    fn coverage_of_original_text() {
        // Every character of the input must appear in some chunk: walking
        // the chunks with overlap removed reconstructs the original.
        let text = "Sentence one is short. Sentence two is a bit longer than one. ".repeat(30);
        let trimmed = text.trim();
        let chunks = chunk_text(&text, 150, 30);
        let mut covered = String::new();
        for chunk in &chunks {
            // Longest suffix of `covered` that prefixes this chunk marks
            // where the chunk continues past what we already have.
            let mut appended = false;
            for keep in 0..=covered.chars().count() {
                let prefix: String = covered.chars().skip(keep).collect();
                if chunk.starts_with(&prefix) {
                    covered.push_str(&chunk[prefix.len()..]);
                    appended = true;
                    break;
                }
            }
            assert!(appended, "chunk does not continue coverage: {:?}", chunk);
        }
        // Whitespace at window edges is trimmed, so compare ignoring spaces.
        let squash = |s: &str| s.chars().filter(|c| !c.is_whitespace()).collect::<String>();
        assert_eq!(squash(&covered), squash(trimmed));
    }

    #[test]
    fn multibyte_input_is_safe() {
        let text = "Terima kasih kerana bertanya! Ini ayat kedua. ".repeat(30);
        let chunks = chunk_text(&text, 120, 30);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 120);
        }
    }

    #[test]
    fn deterministic() {
        let text = "Alpha beta gamma delta. ".repeat(40);
        let a = chunk_text(&text, 100, 25);
        let b = chunk_text(&text, 100, 25);
        assert_eq!(a, b);
    }
}
