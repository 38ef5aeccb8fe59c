//! # deskbot CLI
//!
//! Operator tooling for one assistant: ingest its knowledge directory,
//! check embedding freshness, and talk to it from a terminal.
//!
//! ## Usage
//!
//! ```bash
//! deskbot --config ./deskbot.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `deskbot ingest` | Extract, chunk, and embed the knowledge directory |
//! | `deskbot validate` | List items whose embeddings are stale |
//! | `deskbot refresh` | Regenerate every stale item |
//! | `deskbot chat` | Interactive chat session on stdin |
//!
//! Embedding artifacts persist under the configured embeddings directory,
//! so re-running `ingest` only embeds documents whose content changed.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use deskbot::chat::{ChatError, ChatService, RetrievalParams};
use deskbot::config::{load_config, Config};
use deskbot::embeddings::EmbeddingStore;
use deskbot::extract::SourceKind;
use deskbot::models::{Assistant, ItemStatus, KnowledgeItem, SessionSource};
use deskbot::provider::OpenAiProvider;
use deskbot::store::{MemoryStore, Storage};
use deskbot::usage::{TenantProfile, UsageLimits};

#[derive(Parser)]
#[command(name = "deskbot", about = "Retrieval-augmented assistant engine")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "deskbot.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract, chunk, and embed the assistant's knowledge directory.
    Ingest,
    /// List knowledge items whose embeddings no longer match their content.
    Validate,
    /// Regenerate embeddings for every stale knowledge item.
    Refresh,
    /// Chat with the assistant interactively.
    Chat,
}

struct Engine {
    assistant: Assistant,
    storage: Arc<MemoryStore>,
    embeddings: Arc<EmbeddingStore>,
    chat: ChatService,
}

/// Assemble the engine from config: storage rows for the assistant's
/// Q&A list and knowledge directory, the OpenAI provider, and the
/// embedding store.
async fn build_engine(config: &Config) -> Result<Engine> {
    let assistant = config.assistant.to_assistant();
    let storage: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let provider = Arc::new(OpenAiProvider::new(&config.openai)?);
    let profile = Arc::new(TenantProfile::new(UsageLimits {
        monthly_requests: config.limits.monthly_requests,
        monthly_tokens: config.limits.monthly_tokens,
    }));

    storage
        .replace_qna_entries(&assistant.id, config.assistant.qna_entries())
        .await?;

    if let Some(dir) = &config.assistant.knowledge_dir {
        let mut entries: Vec<_> = std::fs::read_dir(dir)
            .map(|rd| rd.filter_map(|e| e.ok()).collect())
            .unwrap_or_default();
        entries.sort_by_key(|e| e.path());

        for entry in entries {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if matches!(SourceKind::from_path(&path), SourceKind::Unsupported(_)) {
                continue;
            }
            let title = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("document")
                .to_string();
            let item = KnowledgeItem::new_upload(&assistant, &title, path);
            storage.insert_knowledge_item(&item).await?;
        }
    }

    let embeddings = Arc::new(EmbeddingStore::new(
        storage.clone(),
        provider.clone(),
        config.storage.embeddings_dir.clone(),
        config.chunking.chunk_size,
        config.chunking.chunk_overlap,
    ));

    let chat = ChatService::new(
        assistant.clone(),
        storage.clone(),
        provider,
        profile,
        embeddings.clone(),
        RetrievalParams {
            similarity_threshold: config.retrieval.similarity_threshold,
            top_k: config.retrieval.top_k,
        },
    );

    Ok(Engine {
        assistant,
        storage,
        embeddings,
        chat,
    })
}

async fn run_ingest(engine: &Engine) -> Result<()> {
    engine
        .embeddings
        .process_knowledge_base(&engine.assistant.id)
        .await;

    let items = engine.storage.knowledge_items(&engine.assistant.id).await?;
    let completed = items
        .iter()
        .filter(|i| i.status == ItemStatus::Completed)
        .count();
    let errored = items
        .iter()
        .filter(|i| i.status == ItemStatus::Error)
        .count();

    println!("ingest");
    println!("  items found: {}", items.len());
    println!("  completed: {}", completed);
    if errored > 0 {
        println!("  errors: {}", errored);
    }
    for item in &items {
        println!(
            "  {} — {:?} ({} chunks)",
            item.title, item.status, item.chunks_count
        );
    }
    println!("ok");
    Ok(())
}

async fn run_validate(engine: &Engine) -> Result<()> {
    engine.embeddings.attach_existing(&engine.assistant.id).await;
    let outdated = engine.embeddings.validate_all(&engine.assistant.id).await;
    if outdated.is_empty() {
        println!("all embeddings up to date");
    } else {
        println!("outdated embeddings: {}", outdated.len());
        for item in &outdated {
            println!("  {}", item.title);
        }
    }
    Ok(())
}

async fn run_refresh(engine: &Engine) -> Result<()> {
    engine.embeddings.attach_existing(&engine.assistant.id).await;
    let refreshed = engine
        .embeddings
        .refresh_outdated(&engine.assistant.id)
        .await;
    println!("refreshed {} items", refreshed);
    Ok(())
}

async fn run_chat(engine: &Engine) -> Result<()> {
    // Make sure the knowledge base is embedded before answering.
    engine
        .embeddings
        .process_knowledge_base(&engine.assistant.id)
        .await;

    println!(
        "chatting with {} assistant (ctrl-d to exit)",
        engine.assistant.business_type
    );

    let stdin = std::io::stdin();
    let mut session_id: Option<String> = None;

    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let message = line.trim();
        if message.is_empty() {
            continue;
        }

        match engine
            .chat
            .process_message(message, session_id.as_deref(), false, SessionSource::TestChat)
            .await
        {
            Ok(reply) => {
                session_id = Some(reply.session_id.clone());
                println!("{}", reply.text);
                println!("  [{:?}]", reply.source);
            }
            Err(e @ ChatError::ApiLimitExceeded { .. })
            | Err(e @ ChatError::TokenLimitExceeded { .. }) => {
                println!("blocked: {}", e);
            }
            Err(ChatError::Storage(e)) => {
                eprintln!("error: {}", e);
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let engine = build_engine(&config).await?;

    match cli.command {
        Commands::Ingest => run_ingest(&engine).await,
        Commands::Validate => run_validate(&engine).await,
        Commands::Refresh => run_refresh(&engine).await,
        Commands::Chat => run_chat(&engine).await,
    }
}
