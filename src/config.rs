use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::{Assistant, LanguagePref, QnaEntry};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssistantConfig {
    pub id: String,
    pub owner_id: String,
    pub business_type: String,
    #[serde(default = "default_language")]
    pub preferred_language: String,
    /// Directory of knowledge documents ingested on startup.
    pub knowledge_dir: Option<PathBuf>,
    #[serde(default)]
    pub qna: Vec<QnaConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QnaConfig {
    pub question: String,
    pub answer: String,
}

fn default_language() -> String {
    "auto".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OpenAiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_realtime_url")]
    pub realtime_url: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_realtime_model")]
    pub realtime_model: String,
    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            realtime_url: default_realtime_url(),
            chat_model: default_chat_model(),
            embedding_model: default_embedding_model(),
            realtime_model: default_realtime_model(),
            transcription_model: default_transcription_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_realtime_url() -> String {
    "wss://api.openai.com/v1/realtime".to_string()
}
fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_realtime_model() -> String {
    "gpt-4o-realtime-preview-2024-12-17".to_string()
}
fn default_transcription_model() -> String {
    "gpt-4o-transcribe".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    500
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            top_k: default_top_k(),
        }
    }
}

fn default_similarity_threshold() -> f32 {
    0.4
}
fn default_top_k() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_embeddings_dir")]
    pub embeddings_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            embeddings_dir: default_embeddings_dir(),
        }
    }
}

fn default_embeddings_dir() -> PathBuf {
    PathBuf::from("media/embeddings")
}

#[derive(Debug, Deserialize, Clone)]
pub struct VoiceConfig {
    #[serde(default = "default_vad_threshold")]
    pub vad_threshold: f32,
    #[serde(default = "default_prefix_padding_ms")]
    pub prefix_padding_ms: u32,
    #[serde(default = "default_silence_duration_ms")]
    pub silence_duration_ms: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            vad_threshold: default_vad_threshold(),
            prefix_padding_ms: default_prefix_padding_ms(),
            silence_duration_ms: default_silence_duration_ms(),
            temperature: default_temperature(),
        }
    }
}

fn default_vad_threshold() -> f32 {
    0.5
}
fn default_prefix_padding_ms() -> u32 {
    300
}
fn default_silence_duration_ms() -> u32 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    #[serde(default = "default_monthly_requests")]
    pub monthly_requests: u64,
    #[serde(default = "default_monthly_tokens")]
    pub monthly_tokens: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            monthly_requests: default_monthly_requests(),
            monthly_tokens: default_monthly_tokens(),
        }
    }
}

fn default_monthly_requests() -> u64 {
    1000
}
fn default_monthly_tokens() -> u64 {
    100_000
}

impl AssistantConfig {
    /// Materialize the engine-facing assistant entity.
    pub fn to_assistant(&self) -> Assistant {
        let preferred_language = match self.preferred_language.as_str() {
            "en" => LanguagePref::En,
            "ms" => LanguagePref::Ms,
            _ => LanguagePref::Auto,
        };
        Assistant {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            business_type: self.business_type.clone(),
            preferred_language,
        }
    }

    pub fn qna_entries(&self) -> Vec<QnaEntry> {
        self.qna
            .iter()
            .map(|q| QnaEntry {
                question: q.question.clone(),
                answer: q.answer.clone(),
            })
            .collect()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate chunking
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be smaller than chunking.chunk_size");
    }

    // Validate retrieval
    if !(0.0..=1.0).contains(&config.retrieval.similarity_threshold) {
        anyhow::bail!("retrieval.similarity_threshold must be in [0.0, 1.0]");
    }
    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }

    // Validate language
    match config.assistant.preferred_language.as_str() {
        "auto" | "en" | "ms" => {}
        other => anyhow::bail!(
            "Unknown preferred_language: '{}'. Must be auto, en, or ms.",
            other
        ),
    }

    // Validate voice
    if !(0.0..=1.0).contains(&config.voice.vad_threshold) {
        anyhow::bail!("voice.vad_threshold must be in [0.0, 1.0]");
    }

    Ok(config)
}
