//! Wire messages of the live voice service (BidiGenerateContent over WebSocket).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audio::{InboundAudioChunk, PcmBlob};

/// What a session asks the service for when it connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetup {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
}

// ======================== Client → Server ========================

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(SetupMessage),
    RealtimeInput(RealtimeInput),
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TextPart {
    pub text: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

impl ClientMessage {
    pub fn setup(setup: &SessionSetup) -> Self {
        ClientMessage::Setup(SetupMessage {
            model: setup.model.clone(),
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
            system_instruction: Content {
                parts: vec![TextPart {
                    text: setup.system_instruction.clone(),
                }],
            },
        })
    }

    pub fn realtime_audio(blob: &PcmBlob) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: blob.mime_type.clone(),
                data: blob.to_base64(),
            }],
        })
    }
}

// ======================== Server → Client ========================

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<Value>,
    pub server_content: Option<ServerContent>,
    pub go_away: Option<GoAway>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Deserialize, Debug, Default)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub inline_data: Option<InlineData>,
    pub text: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    pub time_left: Option<String>,
}

/// One thing the service told us, in the order it has to be handled.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SetupComplete,
    Audio(InboundAudioChunk),
    Interrupted,
    TurnComplete,
    GoAway(Option<String>),
    Closed(Option<String>),
}

impl ServerMessage {
    pub fn parse(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }

    /// Flatten into events: audio first, then the interruption, then turn end.
    pub fn into_events(self) -> Vec<ServerEvent> {
        let mut events = Vec::new();

        if self.setup_complete.is_some() {
            events.push(ServerEvent::SetupComplete);
        }

        if let Some(content) = self.server_content {
            let parts = content.model_turn.map(|turn| turn.parts).unwrap_or_default();
            for part in parts {
                if let Some(text) = part.text {
                    log::debug!("Model text part: {}", text.trim());
                }
                match part.inline_data {
                    Some(inline) if inline.mime_type.is_empty() || inline.mime_type.starts_with("audio/") => {
                        events.push(ServerEvent::Audio(InboundAudioChunk {
                            data: inline.data,
                            mime_type: inline.mime_type,
                        }));
                    }
                    Some(inline) => {
                        log::debug!("Ignoring inline data of type {}", inline.mime_type);
                    }
                    None => {}
                }
            }
            if content.interrupted {
                events.push(ServerEvent::Interrupted);
            }
            if content.turn_complete {
                events.push(ServerEvent::TurnComplete);
            }
        }

        if let Some(go_away) = self.go_away {
            events.push(ServerEvent::GoAway(go_away.time_left));
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec;
    use serde_json::json;

    #[test]
    fn setup_message_shape() {
        let setup = SessionSetup {
            model: "models/test-model".to_string(),
            voice: "Kore".to_string(),
            system_instruction: "Be brief in General.".to_string(),
        };
        let value = serde_json::to_value(ClientMessage::setup(&setup)).unwrap();
        assert_eq!(
            value,
            json!({
                "setup": {
                    "model": "models/test-model",
                    "generationConfig": {
                        "responseModalities": ["AUDIO"],
                        "speechConfig": {
                            "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": "Kore" } }
                        }
                    },
                    "systemInstruction": { "parts": [{ "text": "Be brief in General." }] }
                }
            })
        );
    }

    #[test]
    fn realtime_input_carries_base64_pcm() {
        let blob = codec::encode(&[0.0, 1.0], 16000);
        let value = serde_json::to_value(ClientMessage::realtime_audio(&blob)).unwrap();
        let chunk = &value["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(chunk["data"], blob.to_base64());
    }

    #[test]
    fn setup_complete_is_recognised() {
        let msg = ServerMessage::parse(br#"{"setupComplete":{}}"#).unwrap();
        assert_eq!(msg.into_events(), vec![ServerEvent::SetupComplete]);
    }

    #[test]
    fn audio_then_interrupt_then_turn_complete() {
        let payload = json!({
            "serverContent": {
                "modelTurn": { "parts": [
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AAAA" } },
                    { "text": "hello" },
                    { "inlineData": { "mimeType": "image/png", "data": "iVBO" } }
                ]},
                "interrupted": true,
                "turnComplete": true
            }
        });
        let msg = ServerMessage::parse(payload.to_string().as_bytes()).unwrap();
        assert_eq!(
            msg.into_events(),
            vec![
                ServerEvent::Audio(InboundAudioChunk {
                    data: "AAAA".to_string(),
                    mime_type: "audio/pcm;rate=24000".to_string(),
                }),
                ServerEvent::Interrupted,
                ServerEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let msg = ServerMessage::parse(br#"{"usageMetadata":{"totalTokenCount":3}}"#).unwrap();
        assert!(msg.into_events().is_empty());

        let msg = ServerMessage::parse(br#"{"goAway":{"timeLeft":"5s"}}"#).unwrap();
        assert_eq!(msg.into_events(), vec![ServerEvent::GoAway(Some("5s".to_string()))]);
    }
}
