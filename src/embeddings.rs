//! Embedding generation, on-disk persistence, freshness validation, and
//! cleanup for knowledge items.
//!
//! Each completed item owns one JSON artifact at
//! `{base_dir}/users/{owner_id}/knowledge_bases/{item_id}_embeddings.json`
//! holding its chunk texts, vectors, and a SHA-256 hash of the extracted
//! content. The hash is the freshness contract: when it no longer matches
//! freshly-extracted text, the vectors are stale and must be regenerated
//! before retrieval can trust them.
//!
//! Status writes go through the storage collaborator's hook-free
//! primitives, so regeneration never re-triggers itself. No operation in
//! this module lets an error escape to the caller: failures degrade the
//! item to `Error` status or are logged and swallowed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::chunk::chunk_text;
use crate::extract;
use crate::models::{
    EmbeddedChunk, EmbeddingFile, EmbeddingMetadata, ItemContent, ItemStatus, KnowledgeItem,
    StoredEmbeddings,
};
use crate::provider::AiProvider;
use crate::store::{EmbeddingState, Storage};

/// Orchestrates the per-item embedding lifecycle.
pub struct EmbeddingStore {
    storage: Arc<dyn Storage>,
    provider: Arc<dyn AiProvider>,
    base_dir: PathBuf,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl EmbeddingStore {
    pub fn new(
        storage: Arc<dyn Storage>,
        provider: Arc<dyn AiProvider>,
        base_dir: impl Into<PathBuf>,
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> Self {
        Self {
            storage,
            provider,
            base_dir: base_dir.into(),
            chunk_size,
            chunk_overlap,
        }
    }

    /// Path of an item's embedding artifact. Parent directories are
    /// created on demand by [`save`](Self::save).
    pub fn file_path_for(&self, item: &KnowledgeItem) -> PathBuf {
        self.base_dir
            .join("users")
            .join(&item.owner_id)
            .join("knowledge_bases")
            .join(format!("{}_embeddings.json", item.id))
    }

    /// SHA-256 hex digest of the item's currently-extracted text.
    pub fn content_hash(&self, item: &KnowledgeItem) -> String {
        let text = extract::extract_item(item);
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Generate embeddings for one item, end to end.
    ///
    /// Walks the item through `Processing → Embedding → Completed`,
    /// degrading to `Error` on empty content or when every chunk fails to
    /// embed. A single failed chunk is logged and dropped; the rest of
    /// the document still embeds (per-chunk retry is deliberately absent
    /// here — the provider handles transient faults internally).
    pub async fn generate(&self, item: &KnowledgeItem) {
        if let Err(e) = self
            .storage
            .set_item_status(&item.id, ItemStatus::Processing)
            .await
        {
            tracing::error!("failed to mark {} processing: {}", item.id, e);
            return;
        }

        let text = extract::extract_item(item);
        if text.trim().is_empty() {
            tracing::warn!("no content found for {}", item.title);
            let _ = self
                .storage
                .set_item_status(&item.id, ItemStatus::Error)
                .await;
            return;
        }

        let _ = self
            .storage
            .set_item_status(&item.id, ItemStatus::Embedding)
            .await;

        let chunks = chunk_text(&text, self.chunk_size, self.chunk_overlap);
        tracing::info!("processing {} chunks for {}", chunks.len(), item.title);

        let mut embedded = Vec::new();
        for (index, chunk) in chunks.iter().enumerate() {
            match self.provider.embed(chunk).await {
                Ok(vector) => embedded.push(EmbeddedChunk {
                    chunk_index: index,
                    text: chunk.clone(),
                    char_count: chunk.chars().count(),
                    embedding: vector,
                    sentence_count: chunk.split('.').count(),
                }),
                Err(e) => {
                    tracing::warn!(
                        "failed to embed chunk {} of {}: {}",
                        index,
                        item.title,
                        e
                    );
                }
            }
        }

        if embedded.is_empty() {
            tracing::warn!("no embeddings generated for {}", item.title);
            let _ = self
                .storage
                .set_item_status(&item.id, ItemStatus::Error)
                .await;
            return;
        }

        self.save(item, embedded).await;
    }

    /// Persist embedded chunks to the item's JSON artifact and apply the
    /// completed state directly to the storage row.
    pub async fn save(&self, item: &KnowledgeItem, chunks: Vec<EmbeddedChunk>) {
        let path = self.file_path_for(item);

        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::error!("failed to create {}: {}", parent.display(), e);
                let _ = self
                    .storage
                    .set_item_status(&item.id, ItemStatus::Error)
                    .await;
                return;
            }
        }

        let file_type = match &item.content {
            ItemContent::Inline(_) => "manual".to_string(),
            ItemContent::Upload(p) => p
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("unknown")
                .to_lowercase(),
        };

        let chunk_count = chunks.len();
        let artifact = EmbeddingFile {
            metadata: EmbeddingMetadata {
                file_name: item.title.clone(),
                file_type,
                total_chunks: chunk_count,
                embedding_model: self.provider.embedding_model().to_string(),
                processed_at: Utc::now().to_rfc3339(),
                user_id: item.owner_id.clone(),
                knowledge_item_id: item.id.clone(),
                content_hash: self.content_hash(item),
            },
            chunks,
        };

        let json = match serde_json::to_string_pretty(&artifact) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("failed to serialize embeddings for {}: {}", item.title, e);
                let _ = self
                    .storage
                    .set_item_status(&item.id, ItemStatus::Error)
                    .await;
                return;
            }
        };

        if let Err(e) = std::fs::write(&path, json) {
            tracing::error!("failed to write {}: {}", path.display(), e);
            let _ = self
                .storage
                .set_item_status(&item.id, ItemStatus::Error)
                .await;
            return;
        }

        let _ = self
            .storage
            .set_item_embedding_model(&item.id, self.provider.embedding_model())
            .await;
        let _ = self
            .storage
            .apply_embedding_state(
                &item.id,
                EmbeddingState {
                    status: ItemStatus::Completed,
                    embedding_file_path: path.to_string_lossy().into_owned(),
                    chunks_count: chunk_count,
                },
            )
            .await;

        tracing::info!("saved {} embeddings to {}", chunk_count, path.display());
    }

    /// Load an item's embedding artifact.
    ///
    /// Returns `None` when no path is recorded, the file is missing, or
    /// parsing fails — never an error. A content-hash mismatch is logged
    /// but the stale data is still returned; acting on staleness is the
    /// caller's decision (see [`validate_all`](Self::validate_all)).
    pub async fn load(&self, item: &KnowledgeItem) -> Option<EmbeddingFile> {
        if item.embedding_file_path.is_empty() {
            return None;
        }
        let artifact = read_artifact(Path::new(&item.embedding_file_path))?;

        if artifact.metadata.content_hash != self.content_hash(item) {
            tracing::warn!(
                "content hash mismatch for {}, embeddings may be outdated",
                item.title
            );
        }

        Some(artifact)
    }

    /// Resolve whichever embedding representation the item carries,
    /// branching on format exactly once: the file artifact wins, with the
    /// legacy inline vectors as the backward-compatible fallback.
    pub async fn load_stored(&self, item: &KnowledgeItem) -> Option<StoredEmbeddings> {
        if let Some(artifact) = self.load(item).await {
            return Some(StoredEmbeddings::FileBacked(artifact));
        }
        item.legacy_embeddings
            .as_ref()
            .map(|chunks| StoredEmbeddings::Inline(chunks.clone()))
    }

    /// Scan all `Completed` items of an assistant and return the subset
    /// whose stored content hash no longer matches — the outdated ones.
    pub async fn validate_all(&self, assistant_id: &str) -> Vec<KnowledgeItem> {
        let items = match self.storage.knowledge_items(assistant_id).await {
            Ok(items) => items,
            Err(e) => {
                tracing::error!("failed to list knowledge items: {}", e);
                return Vec::new();
            }
        };

        let mut outdated = Vec::new();
        for item in items {
            if item.status != ItemStatus::Completed || item.embedding_file_path.is_empty() {
                continue;
            }
            if let Some(artifact) = self.load(&item).await {
                if artifact.metadata.content_hash != self.content_hash(&item) {
                    tracing::info!("found outdated embeddings for: {}", item.title);
                    outdated.push(item);
                }
            }
        }
        outdated
    }

    /// Regenerate an item's embeddings after a content change: delete the
    /// old artifact, reset the embedding fields, and run
    /// [`generate`](Self::generate) again.
    pub async fn refresh(&self, item: &KnowledgeItem) {
        tracing::info!("refreshing embeddings for {}", item.title);

        if !item.embedding_file_path.is_empty() {
            let path = Path::new(&item.embedding_file_path);
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    tracing::warn!("error deleting old embedding file: {}", e);
                }
            }
        }

        let _ = self
            .storage
            .apply_embedding_state(&item.id, EmbeddingState::reset())
            .await;

        let mut fresh = item.clone();
        fresh.embedding_file_path = String::new();
        fresh.chunks_count = 0;
        fresh.status = ItemStatus::Processing;
        self.generate(&fresh).await;
    }

    /// Refresh every outdated item of an assistant; returns how many were
    /// refreshed. Retrieval calls this opportunistically when it comes
    /// back empty-handed.
    pub async fn refresh_outdated(&self, assistant_id: &str) -> usize {
        let outdated = self.validate_all(assistant_id).await;
        let count = outdated.len();
        for item in outdated {
            self.refresh(&item).await;
        }
        count
    }

    /// Remove the item's on-disk artifacts: the embedding file and any
    /// uploaded source document. Idempotent — missing files are not
    /// errors. Runs as a required cleanup step on item deletion.
    pub async fn delete(&self, item: &KnowledgeItem) {
        tracing::info!("deleting embeddings for {}", item.title);

        if !item.embedding_file_path.is_empty() {
            let path = Path::new(&item.embedding_file_path);
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    tracing::warn!("error deleting embedding file: {}", e);
                }
            }
        }

        if let ItemContent::Upload(source) = &item.content {
            if source.exists() {
                if let Err(e) = std::fs::remove_file(source) {
                    tracing::warn!("error deleting uploaded file: {}", e);
                }
            }
        }

        let _ = self
            .storage
            .apply_embedding_state(
                &item.id,
                EmbeddingState {
                    status: ItemStatus::Uploading,
                    embedding_file_path: String::new(),
                    chunks_count: 0,
                },
            )
            .await;
    }

    /// Generate embeddings for every item of an assistant that has none
    /// yet. An existing artifact whose content hash still matches is
    /// adopted as-is, so restarts never re-embed unchanged documents.
    pub async fn process_knowledge_base(&self, assistant_id: &str) {
        let items = match self.storage.knowledge_items(assistant_id).await {
            Ok(items) => items,
            Err(e) => {
                tracing::error!("failed to list knowledge items: {}", e);
                return;
            }
        };

        for item in items {
            if item.status == ItemStatus::Completed {
                continue;
            }
            if self.adopt_existing(&item).await {
                continue;
            }
            self.generate(&item).await;
        }
    }

    /// Try to adopt a pre-existing, still-fresh artifact for an item that
    /// has not been marked completed yet (e.g. after a restart with an
    /// empty row store). Returns true when adopted.
    async fn adopt_existing(&self, item: &KnowledgeItem) -> bool {
        let path = self.file_path_for(item);
        let Some(artifact) = read_artifact(&path) else {
            return false;
        };
        if artifact.metadata.content_hash != self.content_hash(item) {
            return false;
        }

        self.link_artifact(item, &path, &artifact).await;
        tracing::info!("adopted existing embeddings for {}", item.title);
        true
    }

    /// Link every on-disk artifact to its item row, fresh or not. Used
    /// when the row store was rebuilt and freshness is about to be judged
    /// separately (validate/refresh tooling).
    pub async fn attach_existing(&self, assistant_id: &str) {
        let items = match self.storage.knowledge_items(assistant_id).await {
            Ok(items) => items,
            Err(e) => {
                tracing::error!("failed to list knowledge items: {}", e);
                return;
            }
        };

        for item in items {
            if item.status == ItemStatus::Completed {
                continue;
            }
            let path = self.file_path_for(&item);
            if let Some(artifact) = read_artifact(&path) {
                self.link_artifact(&item, &path, &artifact).await;
            }
        }
    }

    async fn link_artifact(&self, item: &KnowledgeItem, path: &Path, artifact: &EmbeddingFile) {
        let _ = self
            .storage
            .set_item_embedding_model(&item.id, &artifact.metadata.embedding_model)
            .await;
        let _ = self
            .storage
            .apply_embedding_state(
                &item.id,
                EmbeddingState {
                    status: ItemStatus::Completed,
                    embedding_file_path: path.to_string_lossy().into_owned(),
                    chunks_count: artifact.chunks.len(),
                },
            )
            .await;
    }
}

/// Read and parse an artifact file, logging and returning `None` on any
/// failure.
fn read_artifact(path: &Path) -> Option<EmbeddingFile> {
    if !path.exists() {
        return None;
    }

    let data = match std::fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!("error reading embeddings from {}: {}", path.display(), e);
            return None;
        }
    };

    match serde_json::from_str(&data) {
        Ok(a) => Some(a),
        Err(e) => {
            tracing::warn!("error parsing embeddings from {}: {}", path.display(), e);
            None
        }
    }
}
