//! # deskbot
//!
//! A tenant-scoped, retrieval-augmented customer-service assistant
//! engine. Each assistant owns a knowledge base of documents and a
//! curated Q&A list; incoming messages are answered from an exact Q&A
//! match, from retrieved knowledge chunks, or from general model
//! knowledge — in that order — over both text chat and realtime voice.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌───────────────┐
//! │ Documents  │──▶│ Extract +    │──▶│ Embedding     │
//! │ txt/pdf/docx│  │ Chunk        │   │ files (JSON)  │
//! └────────────┘   └──────────────┘   └──────┬────────┘
//!                                           │
//!              ┌────────────┐   ┌───────────▼───────────┐
//! message ───▶ │ QnA match  │──▶│ Retriever (cosine)    │──▶ completion
//!              └────────────┘   └───────────────────────┘
//!                     ▲                    ▲
//!              ┌──────┴────────────────────┴──────┐
//!              │ Realtime voice (function-calling) │
//!              └───────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`extract`] | Document text extraction |
//! | [`chunk`] | Sentence-boundary text chunking |
//! | [`provider`] | External AI provider abstraction |
//! | [`store`] | Storage collaborator trait + in-memory store |
//! | [`embeddings`] | Embedding generation, persistence, freshness |
//! | [`retrieve`] | Cosine-similarity retrieval |
//! | [`qna`] | Exact/fuzzy Q&A matching |
//! | [`language`] | English/Malay detection and voice selection |
//! | [`prompt`] | Instruction templates and prompt assembly |
//! | [`chat`] | Response composition for text chat |
//! | [`usage`] | Per-tenant quota and usage accounting |
//! | [`realtime`] | Realtime voice session orchestration |

pub mod chat;
pub mod chunk;
pub mod config;
pub mod embeddings;
pub mod extract;
pub mod language;
pub mod models;
pub mod prompt;
pub mod provider;
pub mod qna;
pub mod realtime;
pub mod retrieve;
pub mod store;
pub mod usage;
