//! Q&A matching, checked before any knowledge-base retrieval.
//!
//! Two passes: exact (case-insensitive, whitespace-trimmed equality)
//! then fuzzy keyword overlap. The fuzzy pass requires both a Jaccard
//! similarity of at least 0.7 *and* at least two shared meaningful
//! words — the absolute floor stops one-word messages from spuriously
//! clearing the ratio threshold against short questions.

use std::collections::HashSet;

use crate::models::QnaEntry;

/// Minimum Jaccard similarity for a fuzzy match.
const FUZZY_THRESHOLD: f64 = 0.7;
/// Minimum shared meaningful words for a fuzzy match.
const MIN_INTERSECTION: usize = 2;

/// Words carrying no matching signal, excluded from the fuzzy token sets.
const STOP_WORDS: &[&str] = &[
    "what", "how", "when", "where", "why", "who", "the", "and", "or", "but", "you", "your", "are",
    "is", "do", "does", "can", "will", "would", "should", "about", "with", "for", "from", "to",
    "in", "on", "at", "by",
];

/// Match a message against the assistant's Q&A list.
///
/// Returns the stored answer on a hit, preferring exact matches (first
/// exact hit wins) and otherwise the highest-similarity qualifying fuzzy
/// candidate.
pub fn match_qna<'a>(message: &str, entries: &'a [QnaEntry]) -> Option<&'a str> {
    let message_lower = message.to_lowercase();
    let message_trimmed = message_lower.trim();

    // Exact pass.
    for entry in entries {
        if entry.question.to_lowercase().trim() == message_trimmed {
            return Some(&entry.answer);
        }
    }

    // Fuzzy pass: keyword-overlap scoring.
    let message_words = meaningful_words(&message_lower);
    if message_words.is_empty() {
        return None;
    }

    let mut best: Option<&QnaEntry> = None;
    let mut best_score = 0.0f64;

    for entry in entries {
        let question_lower = entry.question.to_lowercase();
        let question_words = meaningful_words(&question_lower);
        if question_words.is_empty() {
            continue;
        }

        let intersection = message_words.intersection(&question_words).count();
        let union = message_words.union(&question_words).count();
        let similarity = if union > 0 {
            intersection as f64 / union as f64
        } else {
            0.0
        };

        if similarity >= FUZZY_THRESHOLD
            && intersection >= MIN_INTERSECTION
            && similarity > best_score
        {
            best_score = similarity;
            best = Some(entry);
        }
    }

    best.map(|e| e.answer.as_str())
}

fn meaningful_words(text: &str) -> HashSet<&str> {
    text.split_whitespace()
        .filter(|w| w.len() > 3 && !STOP_WORDS.contains(w))
        .collect()
}
