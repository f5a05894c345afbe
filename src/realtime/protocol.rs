//! Gemini Live `BidiGenerateContent` wire format

use serde::{Deserialize, Serialize};

use super::{ChannelEvent, Outbound, PendingToolCall, Speaker, ToolResult};
use crate::Result;
use crate::voice::EncodedFrame;

/// What the session asks for when the channel opens
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSetup {
    /// Model name, with or without the `models/` prefix
    pub model: String,
    /// Prebuilt voice name
    pub voice: String,
    /// System prompt
    pub system_instruction: Option<String>,
    /// Function declarations offered to the model
    pub function_declarations: Vec<serde_json::Value>,
}

/// Outbound wire message
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) enum ClientMessage {
    Setup(SetupPayload),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponse),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SetupPayload {
    model: String,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
    input_audio_transcription: Empty,
    output_audio_transcription: Empty,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<String>,
    speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Debug, Clone, Default, Serialize)]
struct Empty {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct RealtimeInput {
    audio: EncodedFrame,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ToolResponse {
    function_responses: Vec<FunctionResponse>,
}

#[derive(Debug, Clone, Serialize)]
struct FunctionResponse {
    id: String,
    name: String,
    response: serde_json::Value,
}

impl ClientMessage {
    /// Build the opening setup message
    pub(crate) fn setup(setup: &SessionSetup) -> Self {
        let model = if setup.model.starts_with("models/") {
            setup.model.clone()
        } else {
            format!("models/{}", setup.model)
        };

        let tools = if setup.function_declarations.is_empty() {
            Vec::new()
        } else {
            vec![serde_json::json!({ "functionDeclarations": setup.function_declarations })]
        };

        Self::Setup(SetupPayload {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: setup.voice.clone(),
                        },
                    },
                },
            },
            system_instruction: setup.system_instruction.as_ref().map(|text| Content {
                parts: vec![Part {
                    text: Some(text.clone()),
                    inline_data: None,
                }],
            }),
            tools,
            input_audio_transcription: Empty {},
            output_audio_transcription: Empty {},
        })
    }

    /// Wrap a queued outbound message
    pub(crate) fn from_outbound(outbound: Outbound) -> Self {
        match outbound {
            Outbound::Audio(audio) => Self::RealtimeInput(RealtimeInput { audio }),
            Outbound::ToolResult(ToolResult { id, name, payload }) => {
                Self::ToolResponse(ToolResponse {
                    function_responses: vec![FunctionResponse {
                        id,
                        name,
                        response: payload,
                    }],
                })
            }
        }
    }

    /// Serialize to a JSON text frame
    pub(crate) fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    #[serde(default)]
    setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    server_content: Option<ServerContent>,
    #[serde(default)]
    tool_call: Option<ToolCall>,
    #[serde(default)]
    tool_call_cancellation: Option<ToolCallCancellation>,
    #[serde(default)]
    go_away: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    model_turn: Option<Content>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    input_transcription: Option<Transcription>,
    #[serde(default)]
    output_transcription: Option<Transcription>,
}

#[derive(Debug, Default, Deserialize)]
struct Transcription {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCall {
    #[serde(default)]
    function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct ToolCallCancellation {
    #[serde(default)]
    ids: Vec<String>,
}

/// Turns server frames into [`ChannelEvent`]s
///
/// The server streams transcription as fragments. The decoder keeps the
/// text of the current turn per speaker and reports the whole turn so far
/// with every fragment, resetting when the turn completes.
#[derive(Debug, Default)]
pub struct ServerDecoder {
    user: String,
    agent: String,
}

impl ServerDecoder {
    /// Create a decoder with empty turn buffers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one JSON frame
    ///
    /// # Errors
    ///
    /// Returns error if the frame is not valid JSON
    pub fn decode(&mut self, payload: &str) -> Result<Vec<ChannelEvent>> {
        let message: ServerMessage = serde_json::from_str(payload)?;
        let mut events = Vec::new();

        if message.setup_complete.is_some() {
            events.push(ChannelEvent::Ready);
        }

        if let Some(content) = message.server_content {
            if let Some(fragment) = content.input_transcription {
                if let Some(event) = Self::append(&mut self.user, Speaker::User, &fragment.text) {
                    events.push(event);
                }
            }
            if let Some(fragment) = content.output_transcription {
                if let Some(event) = Self::append(&mut self.agent, Speaker::Agent, &fragment.text) {
                    events.push(event);
                }
            }

            for part in content.model_turn.map(|turn| turn.parts).unwrap_or_default() {
                if let Some(inline) = part.inline_data {
                    if inline.mime_type.starts_with("audio/") {
                        events.push(ChannelEvent::Audio {
                            mime_type: inline.mime_type,
                            data: inline.data,
                        });
                    }
                }
            }

            if content.interrupted {
                events.push(ChannelEvent::Interrupted);
            }
            if content.turn_complete {
                self.user.clear();
                self.agent.clear();
                events.push(ChannelEvent::TurnComplete);
            }
        }

        if let Some(call) = message.tool_call {
            for function in call.function_calls {
                let id = function
                    .id
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                events.push(ChannelEvent::ToolCall(PendingToolCall {
                    id,
                    name: function.name,
                    arguments: function.args,
                }));
            }
        }

        if let Some(cancellation) = message.tool_call_cancellation {
            tracing::debug!(ids = ?cancellation.ids, "server cancelled tool calls");
        }

        if message.go_away.is_some() {
            tracing::warn!("server announced disconnect");
        }

        Ok(events)
    }

    fn append(buffer: &mut String, speaker: Speaker, fragment: &str) -> Option<ChannelEvent> {
        if fragment.is_empty() {
            return None;
        }
        buffer.push_str(fragment);
        Some(ChannelEvent::PartialTranscript {
            speaker,
            text: buffer.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_message_shape() {
        let setup = SessionSetup {
            model: "gemini-live-2.5-flash-preview".to_string(),
            voice: "Puck".to_string(),
            system_instruction: Some("Be brief.".to_string()),
            function_declarations: vec![serde_json::json!({"name": "shutdown"})],
        };

        let json: serde_json::Value =
            serde_json::from_str(&ClientMessage::setup(&setup).to_json().unwrap()).unwrap();
        let body = &json["setup"];

        assert_eq!(body["model"], "models/gemini-live-2.5-flash-preview");
        assert_eq!(body["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            body["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Puck"
        );
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "Be brief.");
        assert_eq!(body["tools"][0]["functionDeclarations"][0]["name"], "shutdown");
        assert!(body["inputAudioTranscription"].is_object());
    }

    #[test]
    fn test_audio_and_tool_response_messages() {
        let audio = ClientMessage::from_outbound(Outbound::Audio(EncodedFrame {
            mime_type: "audio/pcm;rate=16000".to_string(),
            data: "AAA=".to_string(),
        }));
        let json: serde_json::Value = serde_json::from_str(&audio.to_json().unwrap()).unwrap();
        assert_eq!(json["realtimeInput"]["audio"]["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(json["realtimeInput"]["audio"]["data"], "AAA=");

        let result = ClientMessage::from_outbound(Outbound::ToolResult(ToolResult {
            id: "42".to_string(),
            name: "searchWeb".to_string(),
            payload: serde_json::json!({"error": "boom"}),
        }));
        let json: serde_json::Value = serde_json::from_str(&result.to_json().unwrap()).unwrap();
        let response = &json["toolResponse"]["functionResponses"][0];
        assert_eq!(response["id"], "42");
        assert_eq!(response["name"], "searchWeb");
        assert_eq!(response["response"]["error"], "boom");
    }

    #[test]
    fn test_transcript_fragments_become_snapshots() {
        let mut decoder = ServerDecoder::new();

        let first = decoder
            .decode(r#"{"serverContent":{"inputTranscription":{"text":"What's the"}}}"#)
            .unwrap();
        let second = decoder
            .decode(r#"{"serverContent":{"inputTranscription":{"text":" weather?"}}}"#)
            .unwrap();

        assert_eq!(
            first,
            vec![ChannelEvent::PartialTranscript {
                speaker: Speaker::User,
                text: "What's the".to_string()
            }]
        );
        assert_eq!(
            second,
            vec![ChannelEvent::PartialTranscript {
                speaker: Speaker::User,
                text: "What's the weather?".to_string()
            }]
        );

        let done = decoder.decode(r#"{"serverContent":{"turnComplete":true}}"#).unwrap();
        assert_eq!(done, vec![ChannelEvent::TurnComplete]);

        let next = decoder
            .decode(r#"{"serverContent":{"outputTranscription":{"text":"Sunny."}}}"#)
            .unwrap();
        assert_eq!(
            next,
            vec![ChannelEvent::PartialTranscript {
                speaker: Speaker::Agent,
                text: "Sunny.".to_string()
            }]
        );
    }

    #[test]
    fn test_model_turn_audio_and_interrupt() {
        let mut decoder = ServerDecoder::new();
        let events = decoder
            .decode(
                r#"{"serverContent":{"modelTurn":{"parts":[
                    {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAAA"}},
                    {"text":"ignored"}
                ]},"interrupted":true}}"#,
            )
            .unwrap();

        assert_eq!(
            events,
            vec![
                ChannelEvent::Audio {
                    mime_type: "audio/pcm;rate=24000".to_string(),
                    data: "AAAA".to_string()
                },
                ChannelEvent::Interrupted
            ]
        );
    }

    #[test]
    fn test_tool_calls_and_setup_complete() {
        let mut decoder = ServerDecoder::new();

        assert_eq!(
            decoder.decode(r#"{"setupComplete":{}}"#).unwrap(),
            vec![ChannelEvent::Ready]
        );

        let events = decoder
            .decode(
                r#"{"toolCall":{"functionCalls":[
                    {"id":"42","name":"searchWeb","args":{"query":"rust"}},
                    {"name":"shutdown"}
                ]}}"#,
            )
            .unwrap();

        assert_eq!(events.len(), 2);
        let ChannelEvent::ToolCall(first) = &events[0] else {
            panic!("expected tool call");
        };
        assert_eq!(first.id, "42");
        assert_eq!(first.arguments["query"], "rust");

        let ChannelEvent::ToolCall(second) = &events[1] else {
            panic!("expected tool call");
        };
        assert_eq!(second.name, "shutdown");
        assert!(!second.id.is_empty());
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(ServerDecoder::new().decode("not json").is_err());
    }
}
