//! Realtime voice session orchestration.
//!
//! One supervised task set per active connection:
//! - the **event loop** owns the upstream receive half and drives the
//!   turn-taking state machine;
//! - a **writer task** owns the upstream send half, fed by a bounded
//!   command channel;
//! - an **outbound forwarder** drains a bounded channel of client events
//!   into the transport sink, checking liveness before every send —
//!   failures are logged and swallowed so they can never kill the event
//!   loop;
//! - an **audio forwarder** moves microphone audio from the transport
//!   into upstream `input_audio_buffer.append` commands.
//!
//! The upstream does not auto-respond: on speech stop the orchestrator
//! explicitly requests a response. When the model calls the
//! `search_knowledge` tool, the same Q&A-then-retrieval pipeline used by
//! text chat answers it, so voice and text behave identically over a
//! given knowledge base.

pub mod events;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::config::{OpenAiConfig, VoiceConfig};
use crate::embeddings::EmbeddingStore;
use crate::extract;
use crate::language::voice_for_language;
use crate::models::{
    Assistant, ChatMessage, ChatSession, ItemStatus, LanguagePref, MessageRole, SessionSource,
};
use crate::prompt;
use crate::provider::AiProvider;
use crate::qna::match_qna;
use crate::retrieve::Retriever;
use crate::store::Storage;
use crate::usage::Quota;

use events::{ClientCommand, OutboundEvent, ServerEvent, SessionParams, VadParams};

/// Bounded depth for the per-connection channels.
const CHANNEL_DEPTH: usize = 64;

/// Receive half of the upstream duplex stream.
#[async_trait]
pub trait RealtimeStream: Send {
    /// Next typed event, or `None` once the stream is closed.
    async fn next_event(&mut self) -> Option<ServerEvent>;
}

/// Send half of the upstream duplex stream.
#[async_trait]
pub trait RealtimeSink: Send {
    async fn send(&mut self, command: ClientCommand) -> Result<()>;
}

/// The connected widget/browser client. `is_live` is checked before every
/// delivery; a torn-down connection makes sends no-ops.
#[async_trait]
pub trait ClientSink: Send + Sync {
    fn is_live(&self) -> bool;
    async fn deliver(&self, event: OutboundEvent) -> Result<()>;
}

// ============ OpenAI transport ============

/// Receive half over a tokio-tungstenite websocket.
pub struct OpenAiRealtimeStream {
    inner: futures::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    >,
}

/// Send half over a tokio-tungstenite websocket.
pub struct OpenAiRealtimeSink {
    inner: futures::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        WsMessage,
    >,
}

/// Open the upstream websocket and split it into trait-object halves.
pub async fn connect_openai(
    config: &OpenAiConfig,
) -> Result<(OpenAiRealtimeSink, OpenAiRealtimeStream)> {
    let api_key = std::env::var("OPENAI_API_KEY")
        .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;

    let url = format!(
        "{}?model={}",
        config.realtime_url.trim_end_matches('/'),
        config.realtime_model
    );
    let mut request = url.into_client_request()?;
    request
        .headers_mut()
        .insert("Authorization", format!("Bearer {}", api_key).parse()?);
    request
        .headers_mut()
        .insert("OpenAI-Beta", "realtime=v1".parse()?);

    let (ws, _response) = tokio_tungstenite::connect_async(request).await?;
    tracing::info!("connected to realtime API");

    let (sink, stream) = ws.split();
    Ok((
        OpenAiRealtimeSink { inner: sink },
        OpenAiRealtimeStream { inner: stream },
    ))
}

#[async_trait]
impl RealtimeStream for OpenAiRealtimeStream {
    async fn next_event(&mut self) -> Option<ServerEvent> {
        loop {
            match self.inner.next().await? {
                Ok(WsMessage::Text(text)) => return Some(ServerEvent::parse(&text)),
                Ok(WsMessage::Close(frame)) => {
                    tracing::info!("realtime stream closed: {:?}", frame);
                    return None;
                }
                Ok(_) => continue,
                Err(e) => {
                    tracing::error!("realtime stream error: {}", e);
                    return None;
                }
            }
        }
    }
}

#[async_trait]
impl RealtimeSink for OpenAiRealtimeSink {
    async fn send(&mut self, command: ClientCommand) -> Result<()> {
        let wire = command.to_wire().to_string();
        self.inner.send(WsMessage::Text(wire.into())).await?;
        Ok(())
    }
}

// ============ Orchestrator ============

/// Handle to a running voice session.
pub struct VoiceHandle {
    audio_tx: mpsc::Sender<String>,
    task: tokio::task::JoinHandle<()>,
}

impl VoiceHandle {
    /// Feed base64 microphone audio from the transport into the session.
    pub async fn append_audio(&self, audio: String) {
        if self.audio_tx.send(audio).await.is_err() {
            tracing::warn!("voice session is gone, dropping audio");
        }
    }

    /// Stop the session. In-flight turn audio is not recoverable.
    pub fn stop(self) {
        self.task.abort();
    }

    /// Wait for the session to end on its own.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Orchestrates one assistant's realtime voice sessions.
pub struct VoiceOrchestrator {
    assistant: Assistant,
    storage: Arc<dyn Storage>,
    quota: Arc<dyn Quota>,
    retriever: Retriever,
    voice_config: VoiceConfig,
    transcription_model: String,
    similarity_threshold: f32,
    top_k: usize,
}

impl VoiceOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        assistant: Assistant,
        storage: Arc<dyn Storage>,
        provider: Arc<dyn AiProvider>,
        quota: Arc<dyn Quota>,
        embeddings: Arc<EmbeddingStore>,
        voice_config: VoiceConfig,
        transcription_model: String,
        similarity_threshold: f32,
        top_k: usize,
    ) -> Self {
        let retriever = Retriever::new(storage.clone(), provider, embeddings);
        Self {
            assistant,
            storage,
            quota,
            retriever,
            voice_config,
            transcription_model,
            similarity_threshold,
            top_k,
        }
    }

    /// Session configuration for a new connection, with the
    /// language-keyed instruction block and synthesis voice.
    async fn session_params(&self) -> SessionParams {
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

        let transcription_language = match self.assistant.preferred_language {
            LanguagePref::En => Some("en".to_string()),
            LanguagePref::Ms => Some("ms".to_string()),
            LanguagePref::Auto => None,
        };

        SessionParams {
            instructions: prompt::realtime_instructions(&self.assistant, &qnas, &knowledge),
            voice: voice_for_language(self.assistant.preferred_language).to_string(),
            transcription_model: self.transcription_model.clone(),
            transcription_language,
            vad: VadParams {
                threshold: self.voice_config.vad_threshold,
                prefix_padding_ms: self.voice_config.prefix_padding_ms,
                silence_duration_ms: self.voice_config.silence_duration_ms,
            },
            temperature: self.voice_config.temperature,
        }
    }

    /// Start a session over an already-open upstream stream, returning a
    /// handle for audio input and shutdown. Quota is checked before any
    /// upstream traffic.
    pub async fn spawn<S, K>(
        self: Arc<Self>,
        sink: K,
        stream: S,
        client: Arc<dyn ClientSink>,
        source: SessionSource,
    ) -> Result<VoiceHandle>
    where
        S: RealtimeStream + 'static,
        K: RealtimeSink + 'static,
    {
        if !self.quota.can_make_request() {
            return Err(anyhow!("api_limit_exceeded"));
        }

        let (audio_tx, audio_rx) = mpsc::channel(CHANNEL_DEPTH);
        let task = tokio::spawn(async move {
            if let Err(e) = self.run(sink, stream, client, source, audio_rx).await {
                tracing::error!("voice session ended with error: {}", e);
            }
        });

        Ok(VoiceHandle { audio_tx, task })
    }

    /// The per-connection event loop. Runs until the upstream stream
    /// closes.
    pub async fn run<S, K>(
        &self,
        mut sink: K,
        mut stream: S,
        client: Arc<dyn ClientSink>,
        source: SessionSource,
        mut audio_rx: mpsc::Receiver<String>,
    ) -> Result<()>
    where
        S: RealtimeStream + 'static,
        K: RealtimeSink + 'static,
    {
        // Voice sessions store transcripts but never allocate a thread.
        let session = ChatSession::new(&self.assistant.id, None, source);
        self.storage.insert_session(&session).await?;
        tracing::info!("created voice session {}", session.id);

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<ClientCommand>(CHANNEL_DEPTH);
        let (out_tx, mut out_rx) = mpsc::channel::<OutboundEvent>(CHANNEL_DEPTH);

        // Writer task: sole owner of the upstream send half.
        let writer = tokio::spawn(async move {
            while let Some(command) = cmd_rx.recv().await {
                if let Err(e) = sink.send(command).await {
                    tracing::error!("upstream send failed: {}", e);
                    break;
                }
            }
        });

        // Outbound forwarder: delivery failures are logged, never raised.
        let forwarder_client = client.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                if !forwarder_client.is_live() {
                    tracing::debug!("client is gone, skipping event");
                    continue;
                }
                if let Err(e) = forwarder_client.deliver(event).await {
                    tracing::warn!("failed to deliver client event: {}", e);
                }
            }
        });

        // Audio forwarder: microphone audio into upstream append commands.
        let audio_cmd_tx = cmd_tx.clone();
        let audio_task = tokio::spawn(async move {
            while let Some(audio) = audio_rx.recv().await {
                if audio_cmd_tx
                    .send(ClientCommand::AppendAudio { audio })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        // Configure the upstream session before anything else.
        let params = self.session_params().await;
        cmd_tx.send(ClientCommand::SessionUpdate(params)).await?;

        let mut user_transcript = String::new();
        let mut assistant_response = String::new();

        while let Some(event) = stream.next_event().await {
            match event {
                ServerEvent::SessionUpdated => {
                    tracing::info!("voice session configured");
                }
                ServerEvent::SpeechStarted => {
                    let _ = out_tx.send(OutboundEvent::VoiceStarted).await;
                }
                ServerEvent::SpeechStopped => {
                    // The upstream does not auto-trigger responses.
                    let _ = out_tx.send(OutboundEvent::VoiceStopped).await;
                    cmd_tx.send(ClientCommand::CreateResponse).await?;
                }
                ServerEvent::AudioCommitted => {}
                ServerEvent::InputTranscriptDelta { delta, item_id } => {
                    if !delta.is_empty() {
                        let _ = out_tx
                            .send(OutboundEvent::UserTranscriptDelta { delta, item_id })
                            .await;
                    }
                }
                ServerEvent::InputTranscriptDone {
                    transcript,
                    item_id,
                } => {
                    if !transcript.is_empty() {
                        user_transcript = transcript.clone();
                        let _ = out_tx
                            .send(OutboundEvent::UserTranscript {
                                transcript,
                                item_id,
                            })
                            .await;
                    }
                }
                ServerEvent::InputTranscriptFailed { error } => {
                    tracing::warn!("user transcription failed: {}", error);
                    let _ = out_tx
                        .send(OutboundEvent::UserTranscriptError { error })
                        .await;
                }
                ServerEvent::OutputAudioStarted { response_id } => {
                    let _ = out_tx
                        .send(OutboundEvent::AudioBufferStart { response_id })
                        .await;
                }
                ServerEvent::AudioDelta { delta } => {
                    let _ = out_tx
                        .send(OutboundEvent::AiAudioDelta { audio: delta })
                        .await;
                }
                ServerEvent::AudioDone { response_id } => {
                    let _ = out_tx
                        .send(OutboundEvent::AudioBufferComplete { response_id })
                        .await;
                }
                ServerEvent::ResponseTranscriptDelta { .. } => {}
                ServerEvent::ResponseTranscriptDone { transcript } => {
                    if !transcript.is_empty() {
                        assistant_response = transcript.clone();
                        let _ = out_tx
                            .send(OutboundEvent::AiResponseText { text: transcript })
                            .await;
                    }
                }
                ServerEvent::FunctionCall {
                    name,
                    arguments,
                    call_id,
                } => {
                    let output = self.handle_function_call(&name, &arguments).await;
                    cmd_tx
                        .send(ClientCommand::FunctionCallOutput { call_id, output })
                        .await?;
                    cmd_tx.send(ClientCommand::CreateResponse).await?;
                }
                ServerEvent::TurnDone { usage } => {
                    self.finish_turn(&session, &mut user_transcript, &mut assistant_response)
                        .await;

                    // One realtime turn = one API request, tokens or not.
                    let tokens = usage.map(|u| u.total()).unwrap_or(0);
                    self.quota.record_usage("/ws/voice/realtime/", tokens);
                }
                ServerEvent::Error { message } => {
                    tracing::error!("upstream error: {}", message);
                    let _ = out_tx
                        .send(OutboundEvent::OpenaiError { error: message })
                        .await;
                }
                ServerEvent::Other(kind) => {
                    tracing::debug!("unhandled event: {}", kind);
                }
            }
        }

        // Flush and wind down the helper tasks.
        audio_task.abort();
        drop(cmd_tx);
        drop(out_tx);
        let _ = writer.await;
        let _ = forwarder.await;
        tracing::info!("voice session {} closed", session.id);
        Ok(())
    }

    /// Persist one completed exchange: user transcript first, assistant
    /// response second, both flagged as voice. Buffers reset afterwards.
    async fn finish_turn(
        &self,
        session: &ChatSession,
        user_transcript: &mut String,
        assistant_response: &mut String,
    ) {
        if !user_transcript.trim().is_empty() {
            let message =
                ChatMessage::new(&session.id, MessageRole::User, user_transcript, true);
            if let Err(e) = self.storage.insert_message(&message).await {
                tracing::error!("failed to save user transcript: {}", e);
            }
        }
        if !assistant_response.trim().is_empty() {
            let message = ChatMessage::new(
                &session.id,
                MessageRole::Assistant,
                assistant_response,
                true,
            );
            if let Err(e) = self.storage.insert_message(&message).await {
                tracing::error!("failed to save assistant transcript: {}", e);
            }
        }
        user_transcript.clear();
        assistant_response.clear();
    }

    /// Run the `search_knowledge` tool: the same Q&A-then-retrieval
    /// ladder as text chat, with up to three results formatted compactly.
    /// Always produces a structured output, even on failure.
    async fn handle_function_call(&self, name: &str, arguments: &str) -> serde_json::Value {
        if name != "search_knowledge" {
            return json!({ "success": false, "error": "Unknown function" });
        }

        let query = serde_json::from_str::<serde_json::Value>(arguments)
            .ok()
            .and_then(|v| v["query"].as_str().map(str::to_string))
            .unwrap_or_default();
        tracing::info!("knowledge search called with query: {:?}", query);

        let qnas = match self.storage.qna_entries(&self.assistant.id).await {
            Ok(qnas) => qnas,
            Err(e) => {
                tracing::error!("knowledge search failed: {}", e);
                return json!({
                    "success": false,
                    "error": e.to_string(),
                    "message": "I encountered an error searching the knowledge base. \
                        Let me try to help with general information.",
                });
            }
        };

        if let Some(answer) = match_qna(&query, &qnas) {
            return json!({
                "success": true,
                "source": "qna",
                "result": answer,
                "query": query,
            });
        }

        let hits = self
            .retriever
            .find_relevant(
                &self.assistant.id,
                &query,
                self.similarity_threshold,
                self.top_k,
            )
            .await;

        if hits.is_empty() {
            return json!({
                "success": false,
                "source": "none",
                "result": "I don't have specific information about that in our knowledge \
                    base. Let me help you with general information or you can contact us \
                    directly for more details.",
                "query": query,
            });
        }

        let sources: Vec<&str> = hits.iter().take(3).map(|h| h.source_label.as_str()).collect();
        json!({
            "success": true,
            "source": "knowledge_base",
            "result": prompt::format_knowledge_for_realtime(&hits),
            "sources": sources,
            "query": query,
        })
    }
}
