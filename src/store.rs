//! Storage abstraction for the assistant engine.
//!
//! The [`Storage`] trait is the engine's narrow view of the host
//! application's relational store: knowledge items, Q&A entries, chat
//! sessions, and messages. The one non-obvious primitive is
//! [`apply_embedding_state`](Storage::apply_embedding_state) — an atomic
//! update of the three embedding-related fields that must not run any
//! content-change hooks, because the embedding pipeline calls it from
//! inside regeneration and a hook would re-trigger the pipeline.
//!
//! [`MemoryStore`] is the bundled implementation, used by the CLI and the
//! test suite. Implementations must be `Send + Sync` to work with async
//! runtimes.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ChatMessage, ChatSession, ItemStatus, KnowledgeItem, QnaEntry};

/// The three embedding-related fields written together when generation
/// finishes or resets, bypassing any change-detection hooks.
#[derive(Debug, Clone)]
pub struct EmbeddingState {
    pub status: ItemStatus,
    pub embedding_file_path: String,
    pub chunks_count: usize,
}

impl EmbeddingState {
    /// The cleared state an item returns to when its content changes.
    pub fn reset() -> Self {
        Self {
            status: ItemStatus::Processing,
            embedding_file_path: String::new(),
            chunks_count: 0,
        }
    }
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert_knowledge_item`](Storage::insert_knowledge_item) | Add a knowledge item |
/// | [`knowledge_item`](Storage::knowledge_item) | Fetch one item by id |
/// | [`knowledge_items`](Storage::knowledge_items) | List an assistant's items |
/// | [`set_item_status`](Storage::set_item_status) | Direct status write, hook-free |
/// | [`apply_embedding_state`](Storage::apply_embedding_state) | Atomic 3-field embedding update, hook-free |
/// | [`set_item_embedding_model`](Storage::set_item_embedding_model) | Record the model used |
/// | [`delete_knowledge_item`](Storage::delete_knowledge_item) | Remove the row (file cleanup is the pipeline's job) |
/// | [`qna_entries`](Storage::qna_entries) | Fetch the assistant's Q&A list |
/// | [`replace_qna_entries`](Storage::replace_qna_entries) | Replace the Q&A list wholesale |
/// | [`session`](Storage::session) | Fetch a session owned by an assistant |
/// | [`assistant_sessions`](Storage::assistant_sessions) | List an assistant's sessions |
/// | [`insert_session`](Storage::insert_session) | Create a session |
/// | [`delete_session`](Storage::delete_session) | Delete a session and its messages |
/// | [`insert_message`](Storage::insert_message) | Append a message |
/// | [`session_messages`](Storage::session_messages) | All messages, oldest first |
/// | [`recent_messages`](Storage::recent_messages) | Last `n` messages, oldest first |
#[async_trait]
pub trait Storage: Send + Sync {
    async fn insert_knowledge_item(&self, item: &KnowledgeItem) -> Result<()>;
    async fn knowledge_item(&self, id: &str) -> Result<Option<KnowledgeItem>>;
    async fn knowledge_items(&self, assistant_id: &str) -> Result<Vec<KnowledgeItem>>;
    async fn set_item_status(&self, item_id: &str, status: ItemStatus) -> Result<()>;
    async fn apply_embedding_state(&self, item_id: &str, state: EmbeddingState) -> Result<()>;
    async fn set_item_embedding_model(&self, item_id: &str, model: &str) -> Result<()>;
    async fn delete_knowledge_item(&self, id: &str) -> Result<()>;

    async fn qna_entries(&self, assistant_id: &str) -> Result<Vec<QnaEntry>>;
    async fn replace_qna_entries(&self, assistant_id: &str, entries: Vec<QnaEntry>) -> Result<()>;

    async fn session(&self, session_id: &str, assistant_id: &str)
        -> Result<Option<ChatSession>>;
    async fn assistant_sessions(&self, assistant_id: &str) -> Result<Vec<ChatSession>>;
    async fn insert_session(&self, session: &ChatSession) -> Result<()>;
    async fn delete_session(&self, session_id: &str) -> Result<()>;

    async fn insert_message(&self, message: &ChatMessage) -> Result<()>;
    async fn session_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>>;
    async fn recent_messages(&self, session_id: &str, limit: usize) -> Result<Vec<ChatMessage>>;
}

// ============ In-memory implementation ============

/// In-memory store backed by `HashMap`/`Vec` behind `RwLock`s.
pub struct MemoryStore {
    items: RwLock<HashMap<String, KnowledgeItem>>,
    qnas: RwLock<HashMap<String, Vec<QnaEntry>>>,
    sessions: RwLock<HashMap<String, ChatSession>>,
    messages: RwLock<Vec<ChatMessage>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            qnas: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            messages: RwLock::new(Vec::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn insert_knowledge_item(&self, item: &KnowledgeItem) -> Result<()> {
        self.items
            .write()
            .unwrap()
            .insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn knowledge_item(&self, id: &str) -> Result<Option<KnowledgeItem>> {
        Ok(self.items.read().unwrap().get(id).cloned())
    }

    async fn knowledge_items(&self, assistant_id: &str) -> Result<Vec<KnowledgeItem>> {
        let items = self.items.read().unwrap();
        let mut out: Vec<KnowledgeItem> = items
            .values()
            .filter(|i| i.assistant_id == assistant_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn set_item_status(&self, item_id: &str, status: ItemStatus) -> Result<()> {
        if let Some(item) = self.items.write().unwrap().get_mut(item_id) {
            item.status = status;
        }
        Ok(())
    }

    async fn apply_embedding_state(&self, item_id: &str, state: EmbeddingState) -> Result<()> {
        if let Some(item) = self.items.write().unwrap().get_mut(item_id) {
            item.status = state.status;
            item.embedding_file_path = state.embedding_file_path;
            item.chunks_count = state.chunks_count;
        }
        Ok(())
    }

    async fn set_item_embedding_model(&self, item_id: &str, model: &str) -> Result<()> {
        if let Some(item) = self.items.write().unwrap().get_mut(item_id) {
            item.embedding_model = model.to_string();
        }
        Ok(())
    }

    async fn delete_knowledge_item(&self, id: &str) -> Result<()> {
        self.items.write().unwrap().remove(id);
        Ok(())
    }

    async fn qna_entries(&self, assistant_id: &str) -> Result<Vec<QnaEntry>> {
        Ok(self
            .qnas
            .read()
            .unwrap()
            .get(assistant_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn replace_qna_entries(&self, assistant_id: &str, entries: Vec<QnaEntry>) -> Result<()> {
        self.qnas
            .write()
            .unwrap()
            .insert(assistant_id.to_string(), entries);
        Ok(())
    }

    async fn session(
        &self,
        session_id: &str,
        assistant_id: &str,
    ) -> Result<Option<ChatSession>> {
        Ok(self
            .sessions
            .read()
            .unwrap()
            .get(session_id)
            .filter(|s| s.assistant_id == assistant_id)
            .cloned())
    }

    async fn assistant_sessions(&self, assistant_id: &str) -> Result<Vec<ChatSession>> {
        let sessions = self.sessions.read().unwrap();
        let mut out: Vec<ChatSession> = sessions
            .values()
            .filter(|s| s.assistant_id == assistant_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn insert_session(&self, session: &ChatSession) -> Result<()> {
        self.sessions
            .write()
            .unwrap()
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.sessions.write().unwrap().remove(session_id);
        // Cascade: messages go with their session.
        self.messages
            .write()
            .unwrap()
            .retain(|m| m.session_id != session_id);
        Ok(())
    }

    async fn insert_message(&self, message: &ChatMessage) -> Result<()> {
        self.messages.write().unwrap().push(message.clone());
        Ok(())
    }

    async fn session_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        Ok(self
            .messages
            .read()
            .unwrap()
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn recent_messages(&self, session_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let mut all = self.session_messages(session_id).await?;
        if all.len() > limit {
            all = all.split_off(all.len() - limit);
        }
        Ok(all)
    }
}
