//! Bilingual (English / Bahasa Malaysia) message-language detection.
//!
//! A lightweight word-list heuristic shared by the chat composer and the
//! realtime voice orchestrator. It selects which system-instruction
//! template is used and which synthesized voice a realtime session speaks
//! with. Not a general language identifier — it only has to separate the
//! two languages the assistants serve.

use crate::models::LanguagePref;

/// Detected message language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lang {
    En,
    Ms,
}

/// Strong English indicator words.
const ENGLISH_INDICATORS: &[&str] = &[
    "what", "how", "when", "where", "why", "who", "which", "whose", "the", "and", "or", "but",
    "with", "for", "from", "to", "at", "by", "are", "is", "was", "were", "be", "been", "being",
    "have", "has", "had", "do", "does", "did", "will", "would", "should", "could", "can", "may",
    "might", "your", "you", "i", "we", "they", "he", "she", "it", "my", "our", "their", "business",
    "service", "services", "hours", "contact", "many", "much", "some", "about", "company",
    "property", "properties", "agent", "agents", "luxury",
];

/// Common Malay words, chosen to be exclusive to Malay where possible.
const MALAY_WORDS: &[&str] = &[
    "apa", "yang", "ini", "itu", "saya", "awak", "kamu", "dengan", "untuk", "dari", "dalam",
    "boleh", "tidak", "tak", "ada", "tiada", "macam", "mana", "bagaimana", "kenapa", "bila",
    "kami", "mereka", "dia", "terima", "kasih", "maaf", "tolong", "pun", "lagi", "juga", "sudah",
    "belum", "akan", "sedang", "buat", "kerja", "rumah", "sekolah", "universiti", "malaysia",
    "melayu", "ringgit", "sen", "berapa", "banyak", "sikit", "ramai", "ejen", "hartanah", "mewah",
    "perkhidmatan", "waktu", "operasi", "perniagaan", "masa", "hari", "minggu", "bulan", "tahun",
    "pagi", "tengah", "petang", "malam",
];

/// Phrases that identify Malay with high confidence regardless of word
/// counts.
const MALAY_PHRASES: &[&str] = &[
    "terima kasih",
    "boleh tak",
    "macam mana",
    "tak ada",
    "ada tak",
    "apa khabar",
    "berapa ramai",
    "boleh tolong",
    "saya nak",
    "awak ada",
    "berapa harga",
    "bagaimana nak",
    "apa waktu",
    "waktu operasi",
];

/// Detect the language of a message.
///
/// Punctuation is normalized away, then English and Malay indicator
/// counts are compared as ratios of the token count. A small set of
/// unmistakable Malay phrases short-circuits the ratio logic. Short
/// messages (two tokens or fewer) without any Malay indicator default to
/// English.
pub fn detect_language(message: &str) -> Lang {
    if message.is_empty() {
        return Lang::En;
    }

    let message_lower = message.to_lowercase();
    let cleaned: String = message_lower
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    let words: Vec<&str> = cleaned.split_whitespace().collect();

    if words.is_empty() {
        return Lang::En;
    }

    for phrase in MALAY_PHRASES {
        if message_lower.contains(phrase) {
            return Lang::Ms;
        }
    }

    let malay_count = words.iter().filter(|w| MALAY_WORDS.contains(w)).count();
    let english_count = words
        .iter()
        .filter(|w| ENGLISH_INDICATORS.contains(w))
        .count();

    if english_count > 0 && malay_count == 0 {
        return Lang::En;
    }

    if words.len() > 2 {
        let malay_ratio = malay_count as f64 / words.len() as f64;
        let english_ratio = english_count as f64 / words.len() as f64;

        if english_ratio > malay_ratio && english_ratio >= 0.3 {
            return Lang::En;
        } else if malay_ratio >= 0.2 {
            return Lang::Ms;
        }
    }

    // Short or ambiguous messages: conservative default unless clearly Malay.
    if words.len() <= 2 && malay_count == 0 {
        Lang::En
    } else if malay_count > 0 {
        Lang::Ms
    } else {
        Lang::En
    }
}

/// Resolve an assistant's configured preference against a concrete
/// message, falling back to detection only for `Auto`.
pub fn resolve_language(pref: LanguagePref, message: &str) -> Lang {
    match pref {
        LanguagePref::En => Lang::En,
        LanguagePref::Ms => Lang::Ms,
        LanguagePref::Auto => detect_language(message),
    }
}

/// Speech-synthesis voice for a language preference. Shimmer handles
/// Malay pronunciation noticeably better; alloy is the English and
/// auto-detect default.
pub fn voice_for_language(pref: LanguagePref) -> &'static str {
    match pref {
        LanguagePref::Ms => "shimmer",
        LanguagePref::En | LanguagePref::Auto => "alloy",
    }
}
