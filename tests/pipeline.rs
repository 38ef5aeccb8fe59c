//! End-to-end composition tests over the in-memory store and a scripted
//! provider: Q&A short-circuit, retrieval-grounded replies, the general
//! fallback, upstream-failure handling, quota rejection, and the realtime
//! voice orchestrator.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;

use deskbot::chat::{ChatError, ChatService, ReplySource, RetrievalParams};
use deskbot::config::VoiceConfig;
use deskbot::embeddings::EmbeddingStore;
use deskbot::models::{
    Assistant, ItemStatus, KnowledgeItem, LanguagePref, MessageRole, QnaEntry, SessionSource,
};
use deskbot::provider::{AiProvider, ChatTurn, Completion};
use deskbot::realtime::events::{ClientCommand, OutboundEvent, ServerEvent, TurnUsage};
use deskbot::realtime::{ClientSink, RealtimeSink, RealtimeStream, VoiceOrchestrator};
use deskbot::retrieve::Retriever;
use deskbot::store::{MemoryStore, Storage};
use deskbot::usage::{Quota, TenantProfile, UsageLimits};

// ============ Scripted provider ============

/// Deterministic provider: embeddings come from a substring→vector
/// table, completions from a fixed script, and every call is counted.
struct MockProvider {
    embeddings: Vec<(String, Vec<f32>)>,
    completion_text: String,
    completion_tokens: u64,
    fail_completion: bool,
    fail_embedding: bool,
    complete_calls: AtomicUsize,
    last_system: Mutex<Option<String>>,
    last_prompt: Mutex<Option<String>>,
}

impl MockProvider {
    fn new() -> Self {
        Self {
            embeddings: Vec::new(),
            completion_text: "mock completion".to_string(),
            completion_tokens: 42,
            fail_completion: false,
            fail_embedding: false,
            complete_calls: AtomicUsize::new(0),
            last_system: Mutex::new(None),
            last_prompt: Mutex::new(None),
        }
    }

    fn with_embedding(mut self, needle: &str, vector: Vec<f32>) -> Self {
        self.embeddings.push((needle.to_string(), vector));
        self
    }

    fn with_completion(mut self, text: &str, tokens: u64) -> Self {
        self.completion_text = text.to_string();
        self.completion_tokens = tokens;
        self
    }

    fn failing_completion(mut self) -> Self {
        self.fail_completion = true;
        self
    }

    fn completions_made(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    fn last_prompt(&self) -> String {
        self.last_prompt.lock().unwrap().clone().unwrap_or_default()
    }

    fn last_system(&self) -> String {
        self.last_system.lock().unwrap().clone().unwrap_or_default()
    }
}

#[async_trait]
impl AiProvider for MockProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.fail_embedding {
            bail!("embedding unavailable");
        }
        for (needle, vector) in &self.embeddings {
            if text.contains(needle.as_str()) {
                return Ok(vector.clone());
            }
        }
        Ok(vec![0.0, 0.0, 1.0])
    }

    async fn complete(&self, system: &str, messages: &[ChatTurn]) -> Result<Completion> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_system.lock().unwrap() = Some(system.to_string());
        *self.last_prompt.lock().unwrap() =
            messages.last().map(|turn| turn.content.clone());
        if self.fail_completion {
            bail!("upstream completion failed");
        }
        Ok(Completion {
            text: self.completion_text.clone(),
            total_tokens: self.completion_tokens,
        })
    }

    async fn create_thread(&self) -> Result<String> {
        Ok("thread-test".to_string())
    }

    fn embedding_model(&self) -> &str {
        "mock-embed"
    }
}

// ============ Fixture ============

struct Fixture {
    assistant: Assistant,
    storage: Arc<MemoryStore>,
    provider: Arc<MockProvider>,
    profile: Arc<TenantProfile>,
    embeddings: Arc<EmbeddingStore>,
    _dir: tempfile::TempDir,
}

impl Fixture {
    async fn new(provider: MockProvider) -> Self {
        Self::with_limits(
            provider,
            UsageLimits {
                monthly_requests: 1000,
                monthly_tokens: 1_000_000,
            },
        )
        .await
    }

    async fn with_limits(provider: MockProvider, limits: UsageLimits) -> Self {
        let assistant = Assistant {
            id: "a1".to_string(),
            owner_id: "u1".to_string(),
            business_type: "Retail".to_string(),
            preferred_language: LanguagePref::Auto,
        };
        let storage: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let provider = Arc::new(provider);
        let profile = Arc::new(TenantProfile::new(limits));
        let dir = tempfile::tempdir().unwrap();
        let embeddings = Arc::new(EmbeddingStore::new(
            storage.clone(),
            provider.clone(),
            dir.path().to_path_buf(),
            1000,
            200,
        ));
        Self {
            assistant,
            storage,
            provider,
            profile,
            embeddings,
            _dir: dir,
        }
    }

    fn chat(&self) -> ChatService {
        ChatService::new(
            self.assistant.clone(),
            self.storage.clone(),
            self.provider.clone(),
            self.profile.clone(),
            self.embeddings.clone(),
            RetrievalParams::default(),
        )
    }

    async fn add_qna(&self, question: &str, answer: &str) {
        self.storage
            .replace_qna_entries(
                &self.assistant.id,
                vec![QnaEntry {
                    question: question.to_string(),
                    answer: answer.to_string(),
                }],
            )
            .await
            .unwrap();
    }

    async fn add_embedded_item(&self, title: &str, content: &str) -> KnowledgeItem {
        let item = KnowledgeItem::new_inline(&self.assistant, title, content);
        self.storage.insert_knowledge_item(&item).await.unwrap();
        self.embeddings.generate(&item).await;
        let stored = self
            .storage
            .knowledge_item(&item.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, ItemStatus::Completed);
        stored
    }
}

// ============ Scenario A: exact Q&A hit ============

#[tokio::test]
async fn qna_hit_answers_without_completion_call() {
    let fixture = Fixture::new(MockProvider::new()).await;
    fixture.add_qna("What are your hours?", "9-5 Mon-Fri").await;

    let reply = fixture
        .chat()
        .process_message("What are your hours?", None, false, SessionSource::TestChat)
        .await
        .unwrap();

    assert_eq!(reply.text, "9-5 Mon-Fri");
    assert_eq!(reply.source, ReplySource::Qna);
    assert_eq!(fixture.provider.completions_made(), 0);

    // Both sides of the exchange are on record.
    let messages = fixture
        .storage
        .session_messages(&reply.session_id)
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[1].content, "9-5 Mon-Fri");
}

// ============ Scenario B: retrieval-grounded reply ============

#[tokio::test]
async fn retrieval_hit_uses_knowledge_context() {
    let provider = MockProvider::new()
        .with_embedding("return", vec![1.0, 0.1, 0.0])
        .with_completion("You have 30 days to return items.", 60);
    let fixture = Fixture::new(provider).await;
    fixture
        .add_embedded_item("Return Policy", "Our return window is 30 days.")
        .await;

    let reply = fixture
        .chat()
        .process_message(
            "how long do I have to return something",
            None,
            false,
            SessionSource::TestChat,
        )
        .await
        .unwrap();

    assert_eq!(reply.source, ReplySource::KnowledgeBase);
    assert_eq!(reply.text, "You have 30 days to return items.");
    assert_eq!(fixture.provider.completions_made(), 1);

    // The composed prompt carries the retrieved chunk with its citation.
    let prompt = fixture.provider.last_prompt();
    assert!(prompt.contains("Relevant information from knowledge base"));
    assert!(prompt.contains("Return Policy (chunk 1)"));
    assert!(prompt.contains("Our return window is 30 days."));

    // The system turn still carries the static knowledge-base context;
    // retrieval augments it rather than replacing it.
    let system = fixture.provider.last_system();
    assert!(system.contains("Retail"));
    assert!(system.contains("=== Return Policy ==="));

    // Token usage from the completion is recorded.
    assert_eq!(fixture.profile.counters().tokens, 60);
    assert_eq!(fixture.profile.usage_log()[0].endpoint, "/api/chat/");
}

// ============ Scenario C: empty knowledge base falls back ============

#[tokio::test]
async fn empty_knowledge_base_uses_general_fallback() {
    let provider = MockProvider::new().with_completion("Happy to help in general terms.", 20);
    let fixture = Fixture::new(provider).await;

    let reply = fixture
        .chat()
        .process_message("do you ship overseas?", None, false, SessionSource::TestChat)
        .await
        .unwrap();

    assert_eq!(reply.source, ReplySource::General);
    assert_eq!(reply.text, "Happy to help in general terms.");
    assert!(!reply.text.contains("apologize"));

    let prompt = fixture.provider.last_prompt();
    assert!(prompt.contains("general knowledge"));
    assert!(!prompt.contains("Relevant information from knowledge base"));
}

// ============ Scenario D: upstream failure becomes the apology ============

#[tokio::test]
async fn completion_failure_returns_apology() {
    let provider = MockProvider::new().failing_completion();
    let fixture = Fixture::new(provider).await;

    let reply = fixture
        .chat()
        .process_message("anything at all", None, false, SessionSource::TestChat)
        .await
        .unwrap();

    assert!(reply.text.contains("I apologize"));
    // The question still made it to storage before the failure.
    let messages = fixture
        .storage
        .session_messages(&reply.session_id)
        .await
        .unwrap();
    assert_eq!(messages[0].content, "anything at all");
    // No usage recorded for a failed call.
    assert_eq!(fixture.profile.counters().tokens, 0);
}

// ============ Sessions ============

#[tokio::test]
async fn session_is_reused_across_messages() {
    let fixture = Fixture::new(MockProvider::new()).await;
    let chat = fixture.chat();

    let first = chat
        .process_message("hello", None, false, SessionSource::TestChat)
        .await
        .unwrap();
    let second = chat
        .process_message(
            "another question",
            Some(&first.session_id),
            false,
            SessionSource::TestChat,
        )
        .await
        .unwrap();

    assert_eq!(first.session_id, second.session_id);
    let messages = fixture
        .storage
        .session_messages(&first.session_id)
        .await
        .unwrap();
    assert_eq!(messages.len(), 4);
}

#[tokio::test]
async fn voice_sessions_skip_thread_allocation() {
    let fixture = Fixture::new(MockProvider::new()).await;
    let chat = fixture.chat();

    let text_session = chat
        .get_or_create_session(None, SessionSource::TestChat)
        .await
        .unwrap();
    assert_eq!(text_session.thread_id.as_deref(), Some("thread-test"));

    let voice_session = chat
        .get_or_create_session(None, SessionSource::WidgetVoice)
        .await
        .unwrap();
    assert!(voice_session.thread_id.is_none());
}

// ============ Quota rejection ============

#[tokio::test]
async fn exhausted_request_quota_is_a_typed_rejection() {
    let fixture = Fixture::with_limits(
        MockProvider::new(),
        UsageLimits {
            monthly_requests: 1,
            monthly_tokens: 1_000,
        },
    )
    .await;
    fixture.profile.record_api_usage("/api/chat/", 10);

    let err = fixture
        .chat()
        .process_message("hello", None, false, SessionSource::TestChat)
        .await
        .unwrap_err();

    match err {
        ChatError::ApiLimitExceeded { used, limit } => {
            assert_eq!(used, 1);
            assert_eq!(limit, 1);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(fixture.provider.completions_made(), 0);
}

#[tokio::test]
async fn exhausted_token_quota_is_a_typed_rejection() {
    let fixture = Fixture::with_limits(
        MockProvider::new(),
        UsageLimits {
            monthly_requests: 100,
            monthly_tokens: 50,
        },
    )
    .await;
    fixture.profile.record_api_usage("/api/chat/", 50);

    let err = fixture
        .chat()
        .process_message("hello", None, false, SessionSource::TestChat)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::TokenLimitExceeded { used: 50, limit: 50 }));
}

// ============ Retriever properties ============

#[tokio::test]
async fn retriever_respects_threshold_order_and_top_k() {
    let provider = MockProvider::new().with_embedding("query-probe", vec![1.0, 0.0, 0.0]);
    let fixture = Fixture::new(provider).await;

    // One item with legacy inline vectors at controlled similarities.
    let mut item = KnowledgeItem::new_inline(&fixture.assistant, "Legacy Doc", "legacy");
    item.status = ItemStatus::Completed;
    item.legacy_embeddings = Some(vec![
        deskbot::models::LegacyChunk {
            chunk_id: 0,
            text: "strong".to_string(),
            vector: vec![1.0, 0.0, 0.0], // sim 1.0
        },
        deskbot::models::LegacyChunk {
            chunk_id: 1,
            text: "medium".to_string(),
            vector: vec![1.0, 1.0, 0.0], // sim ~0.707
        },
        deskbot::models::LegacyChunk {
            chunk_id: 2,
            text: "weak".to_string(),
            vector: vec![1.0, 4.0, 0.0], // sim ~0.24, below threshold
        },
        deskbot::models::LegacyChunk {
            chunk_id: 3,
            text: "also-strong".to_string(),
            vector: vec![0.9, 0.1, 0.0],
        },
    ]);
    fixture.storage.insert_knowledge_item(&item).await.unwrap();

    let retriever = Retriever::new(
        fixture.storage.clone(),
        fixture.provider.clone(),
        fixture.embeddings.clone(),
    );

    let results = retriever
        .find_relevant(&fixture.assistant.id, "query-probe", 0.4, 2)
        .await;

    assert_eq!(results.len(), 2, "top_k caps the result count");
    for result in &results {
        assert!(result.similarity >= 0.4, "threshold filter violated");
    }
    assert!(results[0].similarity >= results[1].similarity, "sorted descending");
    assert_eq!(results[0].content, "strong");
    assert_eq!(results[0].source_label, "Legacy Doc (chunk 1)");
}

#[tokio::test]
async fn retriever_embedding_failure_yields_empty() {
    let mut provider = MockProvider::new();
    provider.fail_embedding = true;
    let fixture = Fixture::new(provider).await;

    let retriever = Retriever::new(
        fixture.storage.clone(),
        fixture.provider.clone(),
        fixture.embeddings.clone(),
    );
    let results = retriever
        .find_relevant(&fixture.assistant.id, "anything", 0.4, 5)
        .await;
    assert!(results.is_empty());
}

// ============ Realtime voice ============

struct ScriptedStream {
    events: VecDeque<ServerEvent>,
}

#[async_trait]
impl RealtimeStream for ScriptedStream {
    async fn next_event(&mut self) -> Option<ServerEvent> {
        self.events.pop_front()
    }
}

struct RecordingSink {
    sent: Arc<Mutex<Vec<ClientCommand>>>,
}

#[async_trait]
impl RealtimeSink for RecordingSink {
    async fn send(&mut self, command: ClientCommand) -> Result<()> {
        self.sent.lock().unwrap().push(command);
        Ok(())
    }
}

struct RecordingClient {
    live: AtomicBool,
    events: Mutex<Vec<OutboundEvent>>,
}

impl RecordingClient {
    fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            events: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ClientSink for RecordingClient {
    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    async fn deliver(&self, event: OutboundEvent) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

fn orchestrator(fixture: &Fixture) -> VoiceOrchestrator {
    VoiceOrchestrator::new(
        fixture.assistant.clone(),
        fixture.storage.clone(),
        fixture.provider.clone(),
        fixture.profile.clone(),
        fixture.embeddings.clone(),
        VoiceConfig::default(),
        "gpt-4o-transcribe".to_string(),
        0.4,
        5,
    )
}

#[tokio::test]
async fn voice_turn_persists_exchange_and_usage() {
    let fixture = Fixture::new(MockProvider::new()).await;
    fixture.add_qna("What are your hours?", "9-5 Mon-Fri").await;

    let stream = ScriptedStream {
        events: VecDeque::from(vec![
            ServerEvent::SessionUpdated,
            ServerEvent::SpeechStarted,
            ServerEvent::InputTranscriptDone {
                transcript: "what are your hours".to_string(),
                item_id: "i1".to_string(),
            },
            ServerEvent::SpeechStopped,
            ServerEvent::FunctionCall {
                name: "search_knowledge".to_string(),
                arguments: r#"{"query":"What are your hours?"}"#.to_string(),
                call_id: "c1".to_string(),
            },
            ServerEvent::ResponseTranscriptDone {
                transcript: "We are open 9 to 5.".to_string(),
            },
            ServerEvent::TurnDone {
                usage: Some(TurnUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                    total_tokens: 15,
                }),
            },
        ]),
    };
    let sent = Arc::new(Mutex::new(Vec::new()));
    let sink = RecordingSink { sent: sent.clone() };
    let client = Arc::new(RecordingClient::new());
    let (_audio_tx, audio_rx) = tokio::sync::mpsc::channel(8);

    orchestrator(&fixture)
        .run(sink, stream, client.clone(), SessionSource::TestVoice, audio_rx)
        .await
        .unwrap();

    // Upstream commands: configuration first, then the explicit response
    // request after speech stop, then the tool output + re-request.
    let commands = sent.lock().unwrap();
    assert!(matches!(commands[0], ClientCommand::SessionUpdate(_)));
    let mut saw_create_response = false;
    let mut tool_output = None;
    for command in commands.iter() {
        match command {
            ClientCommand::CreateResponse => saw_create_response = true,
            ClientCommand::FunctionCallOutput { call_id, output } => {
                assert_eq!(call_id, "c1");
                tool_output = Some(output.clone());
            }
            _ => {}
        }
    }
    assert!(saw_create_response);
    let tool_output = tool_output.expect("function call was answered");
    assert_eq!(tool_output["success"], true);
    assert_eq!(tool_output["source"], "qna");
    assert_eq!(tool_output["result"], "9-5 Mon-Fri");

    // The tool output is followed by another response request.
    let output_pos = commands
        .iter()
        .position(|c| matches!(c, ClientCommand::FunctionCallOutput { .. }))
        .unwrap();
    assert!(commands[output_pos + 1..]
        .iter()
        .any(|c| matches!(c, ClientCommand::CreateResponse)));
    drop(commands);

    // Client saw the turn-taking and transcript events.
    let events = client.events.lock().unwrap();
    assert!(events.contains(&OutboundEvent::VoiceStarted));
    assert!(events.contains(&OutboundEvent::VoiceStopped));
    assert!(events.iter().any(|e| matches!(
        e,
        OutboundEvent::UserTranscript { transcript, .. } if transcript == "what are your hours"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        OutboundEvent::AiResponseText { text } if text == "We are open 9 to 5."
    )));
    drop(events);

    // The completed turn was persisted as one voice exchange: user
    // transcript first, assistant transcript second, both voice-flagged.
    let sessions = fixture
        .storage
        .assistant_sessions(&fixture.assistant.id)
        .await
        .unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].source, SessionSource::TestVoice);
    assert!(sessions[0].thread_id.is_none());

    let messages = fixture
        .storage
        .session_messages(&sessions[0].id)
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[0].content, "what are your hours");
    assert!(messages[0].is_voice);
    assert_eq!(messages[1].role, MessageRole::Assistant);
    assert_eq!(messages[1].content, "We are open 9 to 5.");
    assert!(messages[1].is_voice);

    assert_eq!(fixture.profile.counters().requests, 1);
    assert_eq!(fixture.profile.counters().tokens, 15);
}

#[tokio::test]
async fn voice_turn_without_usage_still_counts_one_request() {
    let fixture = Fixture::new(MockProvider::new()).await;

    let stream = ScriptedStream {
        events: VecDeque::from(vec![
            ServerEvent::InputTranscriptDone {
                transcript: "hello".to_string(),
                item_id: "i1".to_string(),
            },
            ServerEvent::ResponseTranscriptDone {
                transcript: "hi there".to_string(),
            },
            ServerEvent::TurnDone { usage: None },
        ]),
    };
    let sink = RecordingSink {
        sent: Arc::new(Mutex::new(Vec::new())),
    };
    let client = Arc::new(RecordingClient::new());
    let (_audio_tx, audio_rx) = tokio::sync::mpsc::channel(8);

    orchestrator(&fixture)
        .run(sink, stream, client, SessionSource::WidgetVoice, audio_rx)
        .await
        .unwrap();

    let counters = fixture.profile.counters();
    assert_eq!(counters.requests, 1);
    assert_eq!(counters.tokens, 0);
}

#[tokio::test]
async fn upstream_error_is_forwarded_and_loop_survives() {
    let fixture = Fixture::new(MockProvider::new()).await;

    let stream = ScriptedStream {
        events: VecDeque::from(vec![
            ServerEvent::Error {
                message: "rate limited".to_string(),
            },
            // The loop keeps running after the error event.
            ServerEvent::ResponseTranscriptDone {
                transcript: "still here".to_string(),
            },
            ServerEvent::TurnDone { usage: None },
        ]),
    };
    let sink = RecordingSink {
        sent: Arc::new(Mutex::new(Vec::new())),
    };
    let client = Arc::new(RecordingClient::new());
    let (_audio_tx, audio_rx) = tokio::sync::mpsc::channel(8);

    orchestrator(&fixture)
        .run(sink, stream, client.clone(), SessionSource::TestVoice, audio_rx)
        .await
        .unwrap();

    let events = client.events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        OutboundEvent::OpenaiError { error } if error == "rate limited"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        OutboundEvent::AiResponseText { text } if text == "still here"
    )));
}

#[tokio::test]
async fn dead_client_sink_is_skipped_without_error() {
    let fixture = Fixture::new(MockProvider::new()).await;

    let stream = ScriptedStream {
        events: VecDeque::from(vec![
            ServerEvent::SpeechStarted,
            ServerEvent::TurnDone { usage: None },
        ]),
    };
    let sink = RecordingSink {
        sent: Arc::new(Mutex::new(Vec::new())),
    };
    let client = Arc::new(RecordingClient::new());
    client.live.store(false, Ordering::SeqCst);
    let (_audio_tx, audio_rx) = tokio::sync::mpsc::channel(8);

    orchestrator(&fixture)
        .run(sink, stream, client.clone(), SessionSource::TestVoice, audio_rx)
        .await
        .unwrap();

    assert!(client.events.lock().unwrap().is_empty());
}
