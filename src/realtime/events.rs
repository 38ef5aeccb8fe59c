//! Wire types for the realtime voice session.
//!
//! Three vocabularies meet here:
//! - [`ServerEvent`] — typed events parsed from the upstream duplex
//!   stream's JSON (`type`-discriminated);
//! - [`ClientCommand`] — commands the orchestrator sends upstream,
//!   serialized to the realtime API's wire format;
//! - [`OutboundEvent`] — `type`-tagged JSON events delivered to the
//!   connected widget/browser client.

use serde::Serialize;
use serde_json::{json, Value};

/// Token usage reported on turn completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TurnUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TurnUsage {
    /// Total with the input/output fallback the upstream sometimes needs.
    pub fn total(&self) -> u64 {
        if self.total_tokens > 0 {
            self.total_tokens
        } else {
            self.input_tokens + self.output_tokens
        }
    }
}

/// Typed events received from the upstream stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SessionUpdated,
    SpeechStarted,
    SpeechStopped,
    AudioCommitted,
    InputTranscriptDelta { delta: String, item_id: String },
    InputTranscriptDone { transcript: String, item_id: String },
    InputTranscriptFailed { error: String },
    OutputAudioStarted { response_id: String },
    AudioDelta { delta: String },
    AudioDone { response_id: String },
    ResponseTranscriptDelta { delta: String },
    ResponseTranscriptDone { transcript: String },
    FunctionCall { name: String, arguments: String, call_id: String },
    TurnDone { usage: Option<TurnUsage> },
    Error { message: String },
    /// Anything this engine has no handling for; kept for logging.
    Other(String),
}

impl ServerEvent {
    /// Parse one upstream JSON message into a typed event. Unknown event
    /// types become [`ServerEvent::Other`]; malformed JSON becomes an
    /// [`ServerEvent::Error`] so the loop can report it without dying.
    pub fn parse(text: &str) -> ServerEvent {
        let event: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                return ServerEvent::Error {
                    message: format!("invalid event JSON: {}", e),
                }
            }
        };

        let event_type = event["type"].as_str().unwrap_or("unknown");
        match event_type {
            "session.updated" => ServerEvent::SessionUpdated,
            "input_audio_buffer.speech_started" => ServerEvent::SpeechStarted,
            "input_audio_buffer.speech_stopped" => ServerEvent::SpeechStopped,
            "input_audio_buffer.committed" => ServerEvent::AudioCommitted,
            "conversation.item.input_audio_transcription.delta" => {
                ServerEvent::InputTranscriptDelta {
                    delta: event["delta"].as_str().unwrap_or("").to_string(),
                    item_id: event["item_id"].as_str().unwrap_or("").to_string(),
                }
            }
            "conversation.item.input_audio_transcription.completed" => {
                ServerEvent::InputTranscriptDone {
                    transcript: event["transcript"].as_str().unwrap_or("").to_string(),
                    item_id: event["item_id"].as_str().unwrap_or("").to_string(),
                }
            }
            "conversation.item.input_audio_transcription.failed" => {
                ServerEvent::InputTranscriptFailed {
                    error: event["error"].to_string(),
                }
            }
            "output_audio_buffer.started" => ServerEvent::OutputAudioStarted {
                response_id: event["response_id"].as_str().unwrap_or("").to_string(),
            },
            "response.audio.delta" => ServerEvent::AudioDelta {
                delta: event["delta"].as_str().unwrap_or("").to_string(),
            },
            "response.audio.done" => ServerEvent::AudioDone {
                response_id: event["response_id"].as_str().unwrap_or("").to_string(),
            },
            "response.audio_transcript.delta" => ServerEvent::ResponseTranscriptDelta {
                delta: event["delta"].as_str().unwrap_or("").to_string(),
            },
            "response.audio_transcript.done" => ServerEvent::ResponseTranscriptDone {
                transcript: event["transcript"].as_str().unwrap_or("").to_string(),
            },
            "response.function_call_arguments.done" => ServerEvent::FunctionCall {
                name: event["name"].as_str().unwrap_or("").to_string(),
                arguments: event["arguments"].as_str().unwrap_or("{}").to_string(),
                call_id: event["call_id"].as_str().unwrap_or("").to_string(),
            },
            "response.done" => {
                let usage = event["response"]["usage"].as_object().map(|u| TurnUsage {
                    input_tokens: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
                    output_tokens: u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
                    total_tokens: u.get("total_tokens").and_then(Value::as_u64).unwrap_or(0),
                });
                ServerEvent::TurnDone { usage }
            }
            "error" => ServerEvent::Error {
                message: event["error"]["message"]
                    .as_str()
                    .or_else(|| event["message"].as_str())
                    .unwrap_or("unknown error")
                    .to_string(),
            },
            other => ServerEvent::Other(other.to_string()),
        }
    }
}

/// Server-side voice-activity-detection parameters sent with the session
/// configuration.
#[derive(Debug, Clone, Copy)]
pub struct VadParams {
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

/// Session configuration sent as the first command after connecting.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub instructions: String,
    pub voice: String,
    pub transcription_model: String,
    /// `None` lets the upstream auto-detect the spoken language.
    pub transcription_language: Option<String>,
    pub vad: VadParams,
    pub temperature: f32,
}

/// Commands sent to the upstream stream.
#[derive(Debug, Clone)]
pub enum ClientCommand {
    SessionUpdate(SessionParams),
    AppendAudio { audio: String },
    CreateResponse,
    FunctionCallOutput { call_id: String, output: Value },
}

impl ClientCommand {
    /// The single `search_knowledge` tool declaration exposed for
    /// function-calling.
    pub fn knowledge_tools() -> Value {
        json!([{
            "type": "function",
            "name": "search_knowledge",
            "description": "Search the knowledge base for information relevant to the \
                customer's question. Use this whenever customers ask about business-specific \
                information like services, policies, hours, contact details, etc.",
            "parameters": {
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The customer's question or key terms to search for \
                            in the knowledge base"
                    }
                },
                "required": ["query"]
            }
        }])
    }

    /// Serialize to the upstream wire format.
    pub fn to_wire(&self) -> Value {
        match self {
            ClientCommand::SessionUpdate(params) => {
                let mut transcription = json!({ "model": params.transcription_model });
                if let Some(lang) = &params.transcription_language {
                    transcription["language"] = json!(lang);
                }
                json!({
                    "type": "session.update",
                    "session": {
                        "instructions": params.instructions,
                        "voice": params.voice,
                        "input_audio_format": "pcm16",
                        "output_audio_format": "pcm16",
                        "input_audio_transcription": transcription,
                        "turn_detection": {
                            "type": "server_vad",
                            "threshold": params.vad.threshold,
                            "prefix_padding_ms": params.vad.prefix_padding_ms,
                            "silence_duration_ms": params.vad.silence_duration_ms,
                        },
                        "tools": Self::knowledge_tools(),
                        "tool_choice": "auto",
                        "modalities": ["text", "audio"],
                        "temperature": params.temperature,
                    }
                })
            }
            ClientCommand::AppendAudio { audio } => json!({
                "type": "input_audio_buffer.append",
                "audio": audio,
            }),
            ClientCommand::CreateResponse => json!({ "type": "response.create" }),
            ClientCommand::FunctionCallOutput { call_id, output } => json!({
                "type": "conversation.item.create",
                "item": {
                    "type": "function_call_output",
                    "call_id": call_id,
                    "output": output.to_string(),
                }
            }),
        }
    }
}

/// Events delivered to the connected widget/browser client. The `type`
/// tag is the transport contract.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    VoiceStarted,
    VoiceStopped,
    AiAudioDelta { audio: String },
    AiResponseText { text: String },
    UserTranscriptDelta { delta: String, item_id: String },
    UserTranscript { transcript: String, item_id: String },
    UserTranscriptError { error: String },
    AudioBufferStart { response_id: String },
    AudioBufferComplete { response_id: String },
    OpenaiError { error: String },
    Error { message: String },
}
