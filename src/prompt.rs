//! Prompt assembly for the chat composer and the realtime voice
//! orchestrator.
//!
//! The system turn is a language-specific instruction block that embeds
//! the assistant's full Q&A list and (truncated) knowledge-base contents
//! as static context; retrieval augments that with a dynamic context
//! block in the user turn rather than replacing it. Voice sessions get a
//! variant of the same templates phrased for spoken conversation.

use crate::language::Lang;
use crate::models::{
    Assistant, ChatMessage, KnowledgeItem, LanguagePref, MessageRole, QnaEntry, RetrievedChunk,
};

/// Fixed user-facing reply when the completion call fails. The
/// underlying error is logged, never shown.
pub const APOLOGY: &str = "I apologize, but I'm having trouble processing your request right now. \
     Please try again later or contact our support team.";

/// Per-item cap on knowledge-base text injected as static context.
const KNOWLEDGE_CONTEXT_CHARS: usize = 2000;
/// How many trailing messages of history accompany each prompt.
pub const HISTORY_WINDOW: usize = 6;

/// Q&A list rendered for a system-instruction block. Empty string when
/// there are no entries.
fn qna_block(qnas: &[QnaEntry]) -> String {
    if qnas.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n\nHere are the specific Q&As for this business:\n\n");
    for qna in qnas {
        out.push_str(&format!("Q: {}\nA: {}\n\n", qna.question, qna.answer));
    }
    out.push_str("Always prioritize these Q&As when answering similar questions.");
    out
}

/// Knowledge-base contents rendered for a system-instruction block, with
/// each item's text truncated to a fixed cap.
fn knowledge_block(items: &[(&KnowledgeItem, String)]) -> String {
    if items.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n\nKnowledge Base Information:\n\n");
    for (item, text) in items {
        let truncated: String = text.chars().take(KNOWLEDGE_CONTEXT_CHARS).collect();
        out.push_str(&format!("=== {} ===\n{}\n\n", item.title, truncated));
    }
    out.push_str(
        "Use this knowledge base information when customers ask about business-specific \
         details, services, policies, etc.",
    );
    out
}

/// System instructions for the chat composer, selected by detected or
/// configured language.
pub fn chat_instructions(
    assistant: &Assistant,
    qnas: &[QnaEntry],
    knowledge: &[(&KnowledgeItem, String)],
    lang: Lang,
) -> String {
    let qna_text = qna_block(qnas);
    let knowledge_context = knowledge_block(knowledge);

    match lang {
        Lang::Ms => format!(
            "Anda adalah pembantu perkhidmatan pelanggan {} secara bertulis.\n\n\
             PANDUAN BAHASA:\n\
             - SENTIASA balas dalam BAHASA MALAYSIA sahaja\n\
             - Gunakan ungkapan Malaysia yang sesuai seperti \"Terima kasih\", \"Maaf\", \"Baiklah\", \"Bagaimana\"\n\
             - Bercakap seperti orang Malaysia yang membantu pelanggan\n\n\
             STRATEGI JAWAPAN:\n\
             1. PERTAMA: Periksa sama ada soalan sepadan dengan Q&A di bawah - ini adalah keutamaan tinggi\n\
             2. KEDUA: Cari melalui maklumat Knowledge Base untuk butiran yang berkaitan\n\
             3. KETIGA: Gunakan pengetahuan umum tetapi sebut mereka harus sahkan dengan perniagaan\n\
             4. Sentiasa membantu dan berusaha untuk memajukan perbualan\n\n\
             PANDUAN PERBUALAN:\n\
             - Beri jawapan yang lengkap dan terperinci\n\
             - Rujuk perbualan terdahulu secara semula jadi\n\
             - Tanya soalan pengklarifikasian apabila diperlukan\n\
             - Gunakan nada yang mesra dan membantu{qna}{kb}\n\n\
             Ingat: Balas dalam BAHASA MALAYSIA sahaja, tidak kira bahasa soalan pelanggan.",
            assistant.business_type,
            qna = qna_text,
            kb = knowledge_context,
        ),
        Lang::En => format!(
            "You are a {} customer service assistant with multi-language capabilities.\n\n\
             LANGUAGE GUIDELINES:\n\
             - AUTO-DETECT the language the customer is using\n\
             - If customer writes in English → Respond in ENGLISH\n\
             - If customer writes in Bahasa Malaysia/Malay → Respond in BAHASA MALAYSIA\n\
             - If mixed languages are used, use the primary language of the conversation\n\n\
             RESPONSE STRATEGY:\n\
             1. FIRST: Detect the customer's language from their message\n\
             2. SECOND: Check if the question matches any of the Q&As below - these are high priority\n\
             3. THIRD: Search through the Knowledge Base information for relevant details\n\
             4. FOURTH: Use general knowledge but mention they should verify with the business\n\
             5. Always respond in the SAME language as the customer\n\n\
             CONVERSATION GUIDELINES:\n\
             - Keep responses complete and detailed\n\
             - Reference previous conversation naturally\n\
             - Ask clarifying questions when needed in the customer's language\n\
             - Use a warm, helpful tone with appropriate cultural context{qna}{kb}\n\n\
             Remember: Always respond in the SAME language as the customer's message.",
            assistant.business_type,
            qna = qna_text,
            kb = knowledge_context,
        ),
    }
}

/// System instructions for a realtime voice session. Voice sessions use
/// the configured preference directly (including the trilingual `Auto`
/// variant) since there is no message text to detect from at connect
/// time.
pub fn realtime_instructions(
    assistant: &Assistant,
    qnas: &[QnaEntry],
    knowledge: &[(&KnowledgeItem, String)],
) -> String {
    let qna_text = qna_block(qnas);
    let knowledge_context = knowledge_block(knowledge);

    match assistant.preferred_language {
        LanguagePref::Ms => format!(
            "Anda adalah pembantu perkhidmatan pelanggan {} yang bercakap dengan suara yang \
             semulajadi dan berkomunikasi.\n\n\
             PERSONALITI & SUARA:\n\
             - Bercakap secara semula jadi dan berkomunikasi dalam BAHASA MALAYSIA sahaja\n\
             - Gunakan ungkapan Malaysia yang semula jadi, intonasi, dan frasa\n\
             - Akui emosi pelanggan dan balas dengan empati\n\n\
             STRATEGI JAWAPAN:\n\
             1. PERTAMA: Periksa sama ada soalan sepadan dengan Q&A di bawah - ini adalah keutamaan tinggi\n\
             2. KEDUA: Cari melalui maklumat Knowledge Base untuk butiran yang berkaitan\n\
             3. KETIGA: Gunakan pengetahuan umum tetapi sebut mereka harus sahkan dengan perniagaan\n\n\
             PANDUAN PERBUALAN:\n\
             - Beri jawapan yang ringkas tetapi lengkap (perbualan suara)\n\
             - Rujuk perbualan terdahulu secara semula jadi\n\
             - Tanya soalan pengklarifikasian apabila diperlukan{qna}{kb}\n\n\
             Ingat: Anda sedang bercakap secara semula jadi, jadi bercakap seperti anda bercakap \
             dengan seseorang yang berdiri di sebelah anda, dalam BAHASA MALAYSIA sahaja.",
            assistant.business_type,
            qna = qna_text,
            kb = knowledge_context,
        ),
        LanguagePref::Auto => format!(
            "You are a {} customer service assistant with multi-language capabilities.\n\n\
             PERSONALITY & VOICE:\n\
             - Speak naturally and conversationally\n\
             - Detect the customer's language and respond in the SAME language they use\n\
             - Use a warm, helpful tone with appropriate cultural context\n\
             - Acknowledge customer emotions and respond empathetically\n\n\
             LANGUAGE GUIDELINES:\n\
             - AUTO-DETECT the language the customer is speaking\n\
             - If customer speaks English → Respond in ENGLISH\n\
             - If customer speaks Bahasa Malaysia/Malay → Respond in BAHASA MALAYSIA\n\
             - If mixed languages are used, use the primary language of the conversation\n\n\
             RESPONSE STRATEGY:\n\
             1. FIRST: Detect the customer's language from their speech\n\
             2. SECOND: Check if the question matches any of the Q&As below - these are high priority\n\
             3. THIRD: Search through the Knowledge Base information for relevant details\n\
             4. FOURTH: Use general knowledge but mention they should verify with the business\n\n\
             CONVERSATION GUIDELINES:\n\
             - Keep responses concise but complete (voice conversation)\n\
             - Reference previous conversation naturally\n\
             - Ask clarifying questions when needed in the customer's language{qna}{kb}\n\n\
             Remember: You're having a natural voice conversation, so speak as you would to a \
             person standing next to you, matching their language preference.",
            assistant.business_type,
            qna = qna_text,
            kb = knowledge_context,
        ),
        LanguagePref::En => format!(
            "You are a {} customer service assistant speaking in a conversational, natural voice.\n\n\
             PERSONALITY & VOICE:\n\
             - Speak naturally and conversationally in ENGLISH ONLY\n\
             - Use a warm, helpful tone with appropriate cultural context\n\
             - Acknowledge customer emotions and respond empathetically\n\n\
             RESPONSE STRATEGY:\n\
             1. FIRST: Check if the question matches any of the Q&As below - these are high priority\n\
             2. SECOND: Search through the Knowledge Base information for relevant details\n\
             3. THIRD: Use general knowledge but mention they should verify with the business\n\n\
             CONVERSATION GUIDELINES:\n\
             - Keep responses concise but complete (voice conversation)\n\
             - Reference previous conversation naturally\n\
             - Ask clarifying questions when needed{qna}{kb}\n\n\
             Remember: You're having a natural voice conversation in ENGLISH ONLY, so speak as \
             you would to a person standing next to you.",
            assistant.business_type,
            qna = qna_text,
            kb = knowledge_context,
        ),
    }
}

/// Dynamic retrieval context: chunks sorted best-first, each wrapped with
/// a relevance marker and its source citation.
pub fn context_block(hits: &[RetrievedChunk]) -> String {
    let mut sorted: Vec<&RetrievedChunk> = hits.iter().collect();
    sorted.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let parts: Vec<String> = sorted
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let priority = if i == 0 {
                "MOST RELEVANT".to_string()
            } else {
                format!("Relevance: {:.1}%", chunk.similarity * 100.0)
            };
            format!(
                "[{} - Source: {}]\n{}",
                priority, chunk.source_label, chunk.content
            )
        })
        .collect();

    format!(
        "\n\nRelevant information from knowledge base (sorted by relevance):\n{}",
        parts.join("\n\n---\n\n")
    )
}

/// Recent conversation rendered for prompt context, oldest first.
pub fn history_block(messages: &[ChatMessage]) -> String {
    if messages.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n\nRecent conversation history:\n");
    for msg in messages {
        let role = match msg.role {
            MessageRole::User => "Customer",
            MessageRole::Assistant => "Assistant",
        };
        out.push_str(&format!("{}: {}\n", role, msg.content));
    }
    out
}

/// User-turn prompt when retrieval produced context.
pub fn knowledge_prompt(message: &str, context: &str, history: &str) -> String {
    format!(
        "Answer the customer's question using the provided knowledge base information and \
         conversation history for context.\n\n\
         Customer Question: {message}\n\
         {context}\n\
         {history}\n\n\
         CRITICAL INSTRUCTIONS:\n\
         1. Consider the conversation history to understand the context and maintain continuity\n\
         2. The customer is asking: \"{message}\"\n\
         3. Look for the EXACT information that answers this specific question\n\
         4. If they ask \"how many\" or \"how much\", look for NUMBERS and QUANTITIES\n\
         5. IGNORE unrelated information that does not answer their question\n\
         6. Use ONLY the information that directly answers their question\n\
         7. Be specific and cite the exact numbers/details found\n\
         8. Reference previous conversation if relevant to the current question\n\n\
         What does the knowledge base say about their specific question?"
    )
}

/// User-turn prompt when no relevant knowledge was found: answer from
/// general knowledge and hedge.
pub fn general_prompt(message: &str, history: &str) -> String {
    format!(
        "Please answer the following customer question based on your general knowledge. Since \
         no specific business information was found, provide a helpful general response and \
         suggest the customer contact the business directly for specific details.\n\n\
         Customer Question: {message}\n\
         {history}\n\n\
         Instructions:\n\
         1. Consider the conversation history to maintain context and continuity\n\
         2. Provide a helpful, general response\n\
         3. Acknowledge that specific business details should be verified\n\
         4. Maintain a professional customer service tone\n\
         5. Suggest appropriate next steps for the customer"
    )
}

/// Compact formatting of the top retrieval results for a realtime
/// function-call response. At most three chunks.
pub fn format_knowledge_for_realtime(hits: &[RetrievedChunk]) -> String {
    if hits.is_empty() {
        return "No relevant information found.".to_string();
    }

    let parts: Vec<String> = hits
        .iter()
        .take(3)
        .enumerate()
        .map(|(i, chunk)| {
            let priority = if i == 0 {
                "MOST RELEVANT".to_string()
            } else {
                format!("Relevance: {:.1}%", chunk.similarity * 100.0)
            };
            format!("[{} - {}]\n{}", priority, chunk.source_label, chunk.content)
        })
        .collect();

    parts.join("\n\n---\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Assistant, KnowledgeItem, LanguagePref};

    fn assistant(pref: LanguagePref) -> Assistant {
        Assistant {
            id: "a1".to_string(),
            owner_id: "u1".to_string(),
            business_type: "Real Estate".to_string(),
            preferred_language: pref,
        }
    }

    fn hit(label: &str, similarity: f32) -> RetrievedChunk {
        RetrievedChunk {
            item_id: "k1".to_string(),
            item_title: "Doc".to_string(),
            chunk_index: 0,
            content: format!("content for {}", label),
            similarity,
            source_label: label.to_string(),
        }
    }

    #[test]
    fn instructions_embed_qna_and_knowledge() {
        let a = assistant(LanguagePref::Auto);
        let qnas = vec![QnaEntry {
            question: "What are your hours?".to_string(),
            answer: "9-5".to_string(),
        }];
        let item = KnowledgeItem::new_inline(&a, "Listings", "We list condos.");
        let knowledge = vec![(&item, "We list condos.".to_string())];

        let text = chat_instructions(&a, &qnas, &knowledge, Lang::En);
        assert!(text.contains("Real Estate"));
        assert!(text.contains("Q: What are your hours?"));
        assert!(text.contains("=== Listings ==="));
    }

    #[test]
    fn malay_instructions_selected() {
        let a = assistant(LanguagePref::Auto);
        let text = chat_instructions(&a, &[], &[], Lang::Ms);
        assert!(text.contains("BAHASA MALAYSIA"));
        assert!(text.starts_with("Anda adalah"));
    }

    #[test]
    fn knowledge_context_is_truncated() {
        let a = assistant(LanguagePref::Auto);
        let long = "¤".repeat(5000);
        let item = KnowledgeItem::new_inline(&a, "Big", &long);
        let knowledge = vec![(&item, long.clone())];
        let text = chat_instructions(&a, &[], &knowledge, Lang::En);
        assert_eq!(text.matches('¤').count(), KNOWLEDGE_CONTEXT_CHARS);
    }

    #[test]
    fn context_block_sorts_best_first() {
        let hits = vec![hit("low (chunk 1)", 0.5), hit("high (chunk 1)", 0.9)];
        let block = context_block(&hits);
        let high_pos = block.find("high").unwrap();
        let low_pos = block.find("low").unwrap();
        assert!(high_pos < low_pos);
        assert!(block.contains("[MOST RELEVANT - Source: high (chunk 1)]"));
        assert!(block.contains("Relevance: 50.0%"));
    }

    #[test]
    fn realtime_formatting_caps_at_three() {
        let hits = vec![
            hit("a", 0.9),
            hit("b", 0.8),
            hit("c", 0.7),
            hit("d", 0.6),
        ];
        let block = format_knowledge_for_realtime(&hits);
        assert!(block.contains("content for a"));
        assert!(block.contains("content for c"));
        assert!(!block.contains("content for d"));
    }

    #[test]
    fn realtime_instructions_follow_preference() {
        assert!(realtime_instructions(&assistant(LanguagePref::Ms), &[], &[])
            .contains("BAHASA MALAYSIA sahaja"));
        assert!(realtime_instructions(&assistant(LanguagePref::En), &[], &[])
            .contains("ENGLISH ONLY"));
        assert!(realtime_instructions(&assistant(LanguagePref::Auto), &[], &[])
            .contains("AUTO-DETECT"));
    }

    #[test]
    fn history_block_labels_roles() {
        let msgs = vec![
            ChatMessage::new("s1", MessageRole::User, "hi", false),
            ChatMessage::new("s1", MessageRole::Assistant, "hello", false),
        ];
        let block = history_block(&msgs);
        assert!(block.contains("Customer: hi"));
        assert!(block.contains("Assistant: hello"));
    }
}
