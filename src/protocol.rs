//! JSON messages exchanged with the realtime agent over the session channel.

use crate::codec::{self, EncodedChunk};
use crate::config::{SessionConfig, INPUT_SAMPLE_RATE};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A function call requested by the agent
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Everything the session reacts to, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    InputTranscript(String),
    OutputTranscript(String),
    ToolCall(ToolInvocation),
    /// Raw 16-bit PCM at the output sample rate
    AudioFragment(Vec<u8>),
    Interrupted,
    TurnComplete,
    Error(String),
    Closed,
}

/// Acknowledgement for one tool invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

/// Messages the session sends to the agent
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Audio(EncodedChunk),
    ToolResponse(ToolResponse),
}

impl OutboundMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let message = match self {
            OutboundMessage::Audio(chunk) => ClientMessage::RealtimeInput(RealtimeInput {
                media_chunks: vec![MediaChunk {
                    mime_type: input_mime_type(),
                    data: chunk.data.clone(),
                }],
            }),
            OutboundMessage::ToolResponse(response) => {
                ClientMessage::ToolResponse(ToolResponseBody {
                    function_responses: vec![response.clone()],
                })
            }
        };
        serde_json::to_string(&message)
    }
}

pub fn input_mime_type() -> String {
    format!("audio/pcm;rate={}", INPUT_SAMPLE_RATE)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponseBody),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<MediaChunk>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaChunk {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolResponseBody {
    function_responses: Vec<ToolResponse>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    system_instruction: Content,
    tools: Vec<ToolSet>,
    input_audio_transcription: Empty,
    output_audio_transcription: Empty,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<&'static str>,
    speech_config: SpeechConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Serialize)]
struct Content {
    parts: Vec<TextPart>,
}

#[derive(Serialize)]
struct TextPart {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolSet {
    function_declarations: Vec<Value>,
}

#[derive(Serialize)]
struct Empty {}

/// The first message on a new channel: audio-only responses, transcripts
/// in both directions, the fixed tool set, persona and voice.
pub fn setup_message(
    config: &SessionConfig,
    declarations: Vec<Value>,
) -> Result<String, serde_json::Error> {
    let setup = ClientMessage::Setup(Setup {
        model: config.model.clone(),
        generation_config: GenerationConfig {
            response_modalities: vec!["AUDIO"],
            speech_config: SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig {
                        voice_name: config.voice.clone(),
                    },
                },
            },
        },
        system_instruction: Content {
            parts: vec![TextPart {
                text: config.instructions.clone(),
            }],
        },
        tools: vec![ToolSet {
            function_declarations: declarations,
        }],
        input_audio_transcription: Empty {},
        output_audio_transcription: Empty {},
    });
    serde_json::to_string(&setup)
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<Value>,
    server_content: Option<ServerContent>,
    tool_call: Option<ToolCallBody>,
    go_away: Option<Value>,
    error: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<ServerPart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerPart {
    inline_data: Option<InlineData>,
}

#[derive(Deserialize)]
struct InlineData {
    data: String,
}

#[derive(Deserialize)]
struct Transcription {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallBody {
    #[serde(default)]
    function_calls: Vec<FunctionCall>,
}

#[derive(Deserialize)]
struct FunctionCall {
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Value,
}

/// One decoded server message.
#[derive(Debug, Default, PartialEq)]
pub struct ServerFrame {
    pub setup_complete: bool,
    pub events: Vec<InboundEvent>,
}

/// Parse a server message into events.
///
/// `Interrupted` is emitted before any audio carried in the same message so
/// the flush happens first. Audio parts whose transport encoding is invalid
/// are skipped.
pub fn parse_server_message(text: &str) -> Result<ServerFrame, serde_json::Error> {
    let message: ServerMessage = serde_json::from_str(text)?;
    let mut frame = ServerFrame {
        setup_complete: message.setup_complete.is_some(),
        events: Vec::new(),
    };

    if let Some(content) = message.server_content {
        if content.interrupted {
            frame.events.push(InboundEvent::Interrupted);
        }
        if let Some(text) = content.input_transcription.and_then(|t| t.text) {
            frame.events.push(InboundEvent::InputTranscript(text));
        }
        if let Some(text) = content.output_transcription.and_then(|t| t.text) {
            frame.events.push(InboundEvent::OutputTranscript(text));
        }
        for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
            let Some(inline) = part.inline_data else { continue };
            match codec::from_transport(&inline.data) {
                Ok(bytes) => frame.events.push(InboundEvent::AudioFragment(bytes)),
                Err(e) => log::warn!("Skipping audio part with invalid encoding: {}", e),
            }
        }
        if content.turn_complete {
            frame.events.push(InboundEvent::TurnComplete);
        }
    }

    if let Some(tool_call) = message.tool_call {
        for call in tool_call.function_calls {
            frame.events.push(InboundEvent::ToolCall(ToolInvocation {
                id: call.id.unwrap_or_default(),
                name: call.name,
                arguments: call.args,
            }));
        }
    }

    if let Some(go_away) = message.go_away {
        log::warn!("Server will close the session soon: {}", go_away);
    }

    if let Some(error) = message.error {
        frame.events.push(InboundEvent::Error(error.to_string()));
    }

    Ok(frame)
}
