//! Core data models used throughout deskbot.
//!
//! These types represent the assistants, knowledge items, Q&A entries,
//! chat sessions, and embedding artifacts that flow through the ingestion
//! and response-composition pipelines.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a knowledge item's embedding pipeline.
///
/// Transitions are monotonic (`Uploading → Processing → Embedding →
/// Completed | Error`) except when the item's content changes, which
/// resets the item to `Processing` for regeneration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Uploading,
    Processing,
    Embedding,
    Completed,
    Error,
}

/// Where a knowledge item's raw text comes from: inline manual content
/// or an uploaded document on disk.
#[derive(Debug, Clone)]
pub enum ItemContent {
    Inline(String),
    Upload(PathBuf),
}

/// A knowledge-base item owned by exactly one assistant.
///
/// `embedding_file_path` stays empty until generation succeeds. The
/// optional `legacy_embeddings` field carries the older inline vector
/// representation some items still use; retrieval falls back to it when
/// no embedding file exists.
#[derive(Debug, Clone)]
pub struct KnowledgeItem {
    pub id: String,
    pub assistant_id: String,
    pub owner_id: String,
    pub title: String,
    pub content: ItemContent,
    pub embedding_file_path: String,
    pub chunks_count: usize,
    pub embedding_model: String,
    pub status: ItemStatus,
    pub legacy_embeddings: Option<Vec<LegacyChunk>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeItem {
    /// New manually-entered item in the initial `Uploading` state.
    pub fn new_inline(assistant: &Assistant, title: &str, content: &str) -> Self {
        Self::new(assistant, title, ItemContent::Inline(content.to_string()))
    }

    /// New file-backed item in the initial `Uploading` state.
    pub fn new_upload(assistant: &Assistant, title: &str, path: PathBuf) -> Self {
        Self::new(assistant, title, ItemContent::Upload(path))
    }

    fn new(assistant: &Assistant, title: &str, content: ItemContent) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            assistant_id: assistant.id.clone(),
            owner_id: assistant.owner_id.clone(),
            title: title.to_string(),
            content,
            embedding_file_path: String::new(),
            chunks_count: 0,
            embedding_model: String::new(),
            status: ItemStatus::Uploading,
            legacy_embeddings: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A chunk from the legacy inline embedding representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyChunk {
    pub chunk_id: usize,
    pub text: String,
    pub vector: Vec<f32>,
}

/// On-disk embedding artifact, one JSON document per knowledge item.
///
/// `metadata.content_hash` is a SHA-256 digest of the extracted text at
/// generation time; a mismatch against freshly-extracted text means the
/// stored vectors are stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingFile {
    pub metadata: EmbeddingMetadata,
    pub chunks: Vec<EmbeddedChunk>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingMetadata {
    pub file_name: String,
    pub file_type: String,
    pub total_chunks: usize,
    pub embedding_model: String,
    pub processed_at: String,
    pub user_id: String,
    pub knowledge_item_id: String,
    pub content_hash: String,
}

/// One embedded chunk inside an [`EmbeddingFile`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedChunk {
    pub chunk_index: usize,
    pub text: String,
    pub char_count: usize,
    pub embedding: Vec<f32>,
    pub sentence_count: usize,
}

/// Either embedding representation an item may carry, resolved once at
/// load time so retrieval branches in a single place.
#[derive(Debug, Clone)]
pub enum StoredEmbeddings {
    FileBacked(EmbeddingFile),
    Inline(Vec<LegacyChunk>),
}

/// A curated question/answer pair, checked before any retrieval happens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QnaEntry {
    pub question: String,
    pub answer: String,
}

/// Origin of a chat session, which controls whether an external
/// conversation thread is allocated (voice sources never get one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSource {
    TestChat,
    TestVoice,
    WidgetChat,
    WidgetVoice,
}

impl SessionSource {
    pub fn is_voice(&self) -> bool {
        matches!(self, SessionSource::TestVoice | SessionSource::WidgetVoice)
    }
}

/// A conversation grouping an ordered sequence of messages, scoped to
/// one assistant. Created lazily on first message or voice connect.
#[derive(Debug, Clone)]
pub struct ChatSession {
    pub id: String,
    pub assistant_id: String,
    pub thread_id: Option<String>,
    pub source: SessionSource,
    pub created_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn new(assistant_id: &str, thread_id: Option<String>, source: SessionSource) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            assistant_id: assistant_id.to_string(),
            thread_id,
            source,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// A single message in a session. Messages are append-only and deleted
/// together with their session.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub is_voice: bool,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(session_id: &str, role: MessageRole, content: &str, is_voice: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            is_voice,
            created_at: Utc::now(),
        }
    }
}

/// Language preference configured on an assistant. `Auto` defers to
/// per-message detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LanguagePref {
    Auto,
    En,
    Ms,
}

/// The owning assistant, as seen by the engine. The full entity (API
/// credentials, approval state, subscription) lives with the host
/// application; the engine only needs these fields.
#[derive(Debug, Clone)]
pub struct Assistant {
    pub id: String,
    pub owner_id: String,
    pub business_type: String,
    pub preferred_language: LanguagePref,
}

/// A chunk returned from retrieval, ready for prompt assembly.
///
/// `source_label` is the human-readable citation shown to the model,
/// e.g. `"Return Policy (chunk 2)"`.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub item_id: String,
    pub item_title: String,
    pub chunk_index: usize,
    pub content: String,
    pub similarity: f32,
    pub source_label: String,
}
