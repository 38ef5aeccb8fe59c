//! Cosine-similarity retrieval over an assistant's embedded knowledge.
//!
//! The query is embedded in the same vector space as the stored chunks,
//! every chunk of every `Completed` item is scored, and chunks at or
//! above the similarity threshold come back sorted best-first, capped at
//! `top_k`. Items still carrying the legacy inline representation are
//! scored through the same math via [`StoredEmbeddings`].

use std::sync::Arc;

use crate::embeddings::EmbeddingStore;
use crate::models::{ItemStatus, KnowledgeItem, RetrievedChunk, StoredEmbeddings};
use crate::provider::{cosine_similarity, AiProvider};
use crate::store::Storage;

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.4;
pub const DEFAULT_TOP_K: usize = 5;

pub struct Retriever {
    storage: Arc<dyn Storage>,
    provider: Arc<dyn AiProvider>,
    embeddings: Arc<EmbeddingStore>,
}

impl Retriever {
    pub fn new(
        storage: Arc<dyn Storage>,
        provider: Arc<dyn AiProvider>,
        embeddings: Arc<EmbeddingStore>,
    ) -> Self {
        Self {
            storage,
            provider,
            embeddings,
        }
    }

    /// Find the knowledge chunks most relevant to a query.
    ///
    /// Never fails: a query-embedding error or storage error yields an
    /// empty result. An empty result additionally triggers an
    /// opportunistic freshness sweep over the assistant's items as a
    /// self-healing measure — the current call still returns empty and
    /// the caller may retry.
    pub async fn find_relevant(
        &self,
        assistant_id: &str,
        query: &str,
        threshold: f32,
        top_k: usize,
    ) -> Vec<RetrievedChunk> {
        let query_vec = match self.provider.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("query embedding failed: {}", e);
                return Vec::new();
            }
        };

        let items = match self.storage.knowledge_items(assistant_id).await {
            Ok(items) => items,
            Err(e) => {
                tracing::error!("failed to list knowledge items: {}", e);
                return Vec::new();
            }
        };

        let mut relevant: Vec<RetrievedChunk> = Vec::new();

        for item in items.iter().filter(|i| i.status == ItemStatus::Completed) {
            let Some(stored) = self.embeddings.load_stored(item).await else {
                continue;
            };
            score_stored(&mut relevant, item, &stored, &query_vec, threshold);
        }

        if relevant.is_empty() {
            let refreshed = self.embeddings.refresh_outdated(assistant_id).await;
            if refreshed > 0 {
                tracing::info!(
                    "refreshed {} outdated embeddings, a retry may find results",
                    refreshed
                );
            }
            return Vec::new();
        }

        relevant.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        relevant.truncate(top_k);
        relevant
    }
}

/// Score every chunk of one item against the query vector, keeping those
/// at or above the threshold. Both representations flow through the same
/// similarity math.
fn score_stored(
    out: &mut Vec<RetrievedChunk>,
    item: &KnowledgeItem,
    stored: &StoredEmbeddings,
    query_vec: &[f32],
    threshold: f32,
) {
    match stored {
        StoredEmbeddings::FileBacked(artifact) => {
            for chunk in &artifact.chunks {
                let similarity = cosine_similarity(query_vec, &chunk.embedding);
                if similarity >= threshold {
                    out.push(make_result(item, chunk.chunk_index, &chunk.text, similarity));
                }
            }
        }
        StoredEmbeddings::Inline(chunks) => {
            for chunk in chunks {
                let similarity = cosine_similarity(query_vec, &chunk.vector);
                if similarity >= threshold {
                    out.push(make_result(item, chunk.chunk_id, &chunk.text, similarity));
                }
            }
        }
    }
}

fn make_result(
    item: &KnowledgeItem,
    chunk_index: usize,
    text: &str,
    similarity: f32,
) -> RetrievedChunk {
    RetrievedChunk {
        item_id: item.id.clone(),
        item_title: item.title.clone(),
        chunk_index,
        content: text.to_string(),
        similarity,
        source_label: format!("{} (chunk {})", item.title, chunk_index + 1),
    }
}
