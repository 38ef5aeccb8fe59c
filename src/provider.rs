//! External AI provider abstraction and the OpenAI implementation.
//!
//! The engine consumes three capability calls: `embed` (vector per text),
//! `complete` (chat completion with token usage), and `create_thread`
//! (external conversation handle for non-voice sessions). The
//! [`AiProvider`] trait keeps the seam narrow so tests can substitute a
//! scripted provider.
//!
//! # Retry Strategy
//!
//! Embedding calls use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Completion calls are not retried; the composer translates a failure
//! into a fixed user-facing message, so retrying would only delay it.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::config::OpenAiConfig;
use crate::models::MessageRole;

/// One turn of a completion prompt.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: MessageRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

/// A completion result with the token usage reported by the upstream.
/// `total_tokens` is zero when the response carried no usage block.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub total_tokens: u64,
}

/// The engine's view of the external AI service.
#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Embed a single text into a vector. Chunk and query embeddings must
    /// come from the same implementation so the spaces match.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate a chat completion from a system instruction block and a
    /// sequence of turns.
    async fn complete(&self, system: &str, messages: &[ChatTurn]) -> Result<Completion>;

    /// Allocate an external conversation thread and return its id.
    async fn create_thread(&self) -> Result<String>;

    /// Model identifier used for embeddings, recorded in embedding-file
    /// metadata.
    fn embedding_model(&self) -> &str;
}

// ============ OpenAI provider ============

/// Provider backed by the OpenAI HTTP API.
pub struct OpenAiProvider {
    api_key: String,
    base_url: String,
    chat_model: String,
    embedding_model: String,
    temperature: f32,
    max_tokens: u32,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiProvider {
    /// Create a provider from configuration. The API key is read from the
    /// `OPENAI_API_KEY` environment variable.
    pub fn new(config: &OpenAiConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            chat_model: config.chat_model.clone(),
            embedding_model: config.embedding_model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
            client,
        })
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
    }
}

#[async_trait]
impl AiProvider for OpenAiProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.embedding_model,
            "input": text,
        });
        let url = format!("{}/v1/embeddings", self.base_url);

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self.auth(self.client.post(&url)).json(&body).send().await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_embedding_response(&json);
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow!("OpenAI API error {}: {}", status, body_text));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("OpenAI API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("Embedding failed after retries")))
    }

    async fn complete(&self, system: &str, messages: &[ChatTurn]) -> Result<Completion> {
        let mut wire_messages = vec![serde_json::json!({
            "role": "system",
            "content": system,
        })];
        for turn in messages {
            let role = match turn.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
            };
            wire_messages.push(serde_json::json!({
                "role": role,
                "content": turn.content,
            }));
        }

        let body = serde_json::json!({
            "model": self.chat_model,
            "messages": wire_messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });

        let url = format!("{}/v1/chat/completions", self.base_url);
        let resp = self.auth(self.client.post(&url)).json(&body).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            bail!("OpenAI API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = resp.json().await?;
        let text = json["choices"]
            .get(0)
            .and_then(|c| c["message"]["content"].as_str())
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing message content"))?
            .to_string();

        // Absent usage is tolerated and reported as zero tokens.
        let total_tokens = json["usage"]["total_tokens"].as_u64().unwrap_or(0);

        Ok(Completion { text, total_tokens })
    }

    async fn create_thread(&self) -> Result<String> {
        let url = format!("{}/v1/threads", self.base_url);
        let resp = self
            .auth(self.client.post(&url))
            .header("OpenAI-Beta", "assistants=v2")
            .json(&serde_json::json!({}))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            bail!("OpenAI API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = resp.json().await?;
        json["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing thread id"))
    }

    fn embedding_model(&self) -> &str {
        &self.embedding_model
    }
}

/// Parse the embeddings API response, taking the first data entry.
fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<f32>> {
    let embedding = json["data"]
        .get(0)
        .and_then(|d| d["embedding"].as_array())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))?;

    Ok(embedding
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`; `0.0` for empty vectors, vectors of
/// different lengths, or a zero-magnitude operand.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
