//! Response composition for text chat.
//!
//! Per message the composer runs a fixed decision ladder: exact/fuzzy
//! Q&A match first (no model call at all on a hit), then embedding
//! retrieval, then a completion call — with retrieved context when there
//! is any, as a plain general-knowledge prompt otherwise.
//!
//! The inbound message is persisted *before* composition starts, as a
//! deliberate two-step protocol: if composing crashes, the customer's
//! question is still on record. Completion failures never surface raw —
//! the customer sees a fixed apology and the error goes to the log.

use std::sync::Arc;

use anyhow::Result;

use crate::embeddings::EmbeddingStore;
use crate::extract;
use crate::language::resolve_language;
use crate::models::{
    Assistant, ChatMessage, ChatSession, ItemStatus, MessageRole, RetrievedChunk, SessionSource,
};
use crate::prompt;
use crate::provider::{AiProvider, ChatTurn};
use crate::qna::match_qna;
use crate::retrieve::Retriever;
use crate::store::Storage;
use crate::usage::Quota;

/// Which path produced a reply. Carried on the reply for diagnostics and
/// session UIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplySource {
    Qna,
    KnowledgeBase,
    General,
}

#[derive(Debug, Clone)]
pub struct ChatReply {
    pub session_id: String,
    pub text: String,
    pub source: ReplySource,
}

/// Typed rejection surfaced to the transport layer. Quota variants carry
/// the current usage and the limit so the UI can explain the block;
/// `Storage` wraps infrastructure failures.
#[derive(Debug)]
pub enum ChatError {
    ApiLimitExceeded { used: u64, limit: u64 },
    TokenLimitExceeded { used: u64, limit: u64 },
    Storage(anyhow::Error),
}

impl std::fmt::Display for ChatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatError::ApiLimitExceeded { used, limit } => {
                write!(f, "api_limit_exceeded: {} of {} requests used", used, limit)
            }
            ChatError::TokenLimitExceeded { used, limit } => {
                write!(f, "token_limit_exceeded: {} of {} tokens used", used, limit)
            }
            ChatError::Storage(e) => write!(f, "storage error: {}", e),
        }
    }
}

impl std::error::Error for ChatError {}

/// Retrieval parameters applied per message.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalParams {
    pub similarity_threshold: f32,
    pub top_k: usize,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            similarity_threshold: crate::retrieve::DEFAULT_SIMILARITY_THRESHOLD,
            top_k: crate::retrieve::DEFAULT_TOP_K,
        }
    }
}

/// Composes replies for one assistant.
pub struct ChatService {
    assistant: Assistant,
    storage: Arc<dyn Storage>,
    provider: Arc<dyn AiProvider>,
    quota: Arc<dyn Quota>,
    retriever: Retriever,
    params: RetrievalParams,
}

impl ChatService {
    pub fn new(
        assistant: Assistant,
        storage: Arc<dyn Storage>,
        provider: Arc<dyn AiProvider>,
        quota: Arc<dyn Quota>,
        embeddings: Arc<EmbeddingStore>,
        params: RetrievalParams,
    ) -> Self {
        let retriever = Retriever::new(storage.clone(), provider.clone(), embeddings);
        Self {
            assistant,
            storage,
            provider,
            quota,
            retriever,
            params,
        }
    }

    pub fn assistant(&self) -> &Assistant {
        &self.assistant
    }

    /// Reuse an existing session by id if it belongs to this assistant,
    /// otherwise create one. Non-voice sessions get an external
    /// conversation thread when the provider can allocate one; a failed
    /// allocation is tolerated and the session simply has no thread.
    pub async fn get_or_create_session(
        &self,
        session_id: Option<&str>,
        source: SessionSource,
    ) -> Result<ChatSession> {
        if let Some(id) = session_id {
            if let Some(existing) = self.storage.session(id, &self.assistant.id).await? {
                return Ok(existing);
            }
        }

        let thread_id = if source.is_voice() {
            None
        } else {
            match self.provider.create_thread().await {
                Ok(id) => Some(id),
                Err(e) => {
                    tracing::warn!("thread allocation failed: {}", e);
                    None
                }
            }
        };

        let session = ChatSession::new(&self.assistant.id, thread_id, source);
        self.storage.insert_session(&session).await?;
        Ok(session)
    }

    /// Process one inbound message and produce a reply.
    pub async fn process_message(
        &self,
        message: &str,
        session_id: Option<&str>,
        is_voice: bool,
        source: SessionSource,
    ) -> Result<ChatReply, ChatError> {
        self.check_quota()?;

        let session = self
            .get_or_create_session(session_id, source)
            .await
            .map_err(ChatError::Storage)?;

        // User message first: a composer crash must still leave the
        // question on record.
        self.storage
            .insert_message(&ChatMessage::new(
                &session.id,
                MessageRole::User,
                message,
                is_voice,
            ))
            .await
            .map_err(ChatError::Storage)?;

        let qnas = self
            .storage
            .qna_entries(&self.assistant.id)
            .await
            .map_err(ChatError::Storage)?;

        let (text, reply_source) = if let Some(answer) = match_qna(message, &qnas) {
            (answer.to_string(), ReplySource::Qna)
        } else {
            let hits = self
                .retriever
                .find_relevant(
                    &self.assistant.id,
                    message,
                    self.params.similarity_threshold,
                    self.params.top_k,
                )
                .await;

            let reply_source = if hits.is_empty() {
                ReplySource::General
            } else {
                ReplySource::KnowledgeBase
            };
            let text = self.generate_response(message, &hits, &session).await;
            (text, reply_source)
        };

        self.storage
            .insert_message(&ChatMessage::new(
                &session.id,
                MessageRole::Assistant,
                &text,
                false,
            ))
            .await
            .map_err(ChatError::Storage)?;

        Ok(ChatReply {
            session_id: session.id,
            text,
            source: reply_source,
        })
    }

    fn check_quota(&self) -> Result<(), ChatError> {
        let counters = self.quota.counters();
        let limits = self.quota.limits();
        if !self.quota.can_make_request() {
            return Err(ChatError::ApiLimitExceeded {
                used: counters.requests,
                limit: limits.monthly_requests,
            });
        }
        if self.quota.token_limit_exceeded() {
            return Err(ChatError::TokenLimitExceeded {
                used: counters.tokens,
                limit: limits.monthly_tokens,
            });
        }
        Ok(())
    }

    /// Build the prompt pair and call the completion API. Retrieval hits
    /// select the knowledge-grounded prompt; none selects the hedged
    /// general prompt. Any upstream failure becomes the fixed apology.
    async fn generate_response(
        &self,
        message: &str,
        hits: &[RetrievedChunk],
        session: &ChatSession,
    ) -> String {
        let history = match self
            .storage
            .recent_messages(&session.id, prompt::HISTORY_WINDOW)
            .await
        {
            Ok(msgs) => prompt::history_block(&msgs),
            Err(e) => {
                tracing::warn!("failed to load history: {}", e);
                String::new()
            }
        };

        let user_prompt = if hits.is_empty() {
            prompt::general_prompt(message, &history)
        } else {
            let context = prompt::context_block(hits);
            prompt::knowledge_prompt(message, &context, &history)
        };

        let system = self.build_instructions(message).await;

        match self
            .provider
            .complete(&system, &[ChatTurn::user(user_prompt)])
            .await
        {
            Ok(completion) => {
                if completion.total_tokens > 0 {
                    self.quota.record_usage("/api/chat/", completion.total_tokens);
                }
                completion.text
            }
            Err(e) => {
                tracing::error!("error generating response: {}", e);
                prompt::APOLOGY.to_string()
            }
        }
    }

    /// Language-adaptive system instructions with the Q&A list and the
    /// completed knowledge base injected as static context. Retrieval
    /// augments this, it does not replace it.
    async fn build_instructions(&self, message: &str) -> String {
        let lang = resolve_language(self.assistant.preferred_language, message);

        let qnas = self
            .storage
            .qna_entries(&self.assistant.id)
            .await
            .unwrap_or_default();

        let items = self
            .storage
            .knowledge_items(&self.assistant.id)
            .await
            .unwrap_or_default();
        let completed: Vec<_> = items
            .iter()
            .filter(|i| i.status == ItemStatus::Completed)
            .collect();
        let knowledge: Vec<_> = completed
            .iter()
            .map(|item| (*item, extract::extract_item(item)))
            .collect();

        prompt::chat_instructions(&self.assistant, &qnas, &knowledge, lang)
    }
}
