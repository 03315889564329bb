//! Gemini Live API message types for bidirectional streaming
//!
//! Defines the JSON message format for the `BidiGenerateContent` WebSocket
//! protocol: a setup message sent once after connect, realtime audio input
//! messages, and the server content messages carrying transcription.

use serde::{Deserialize, Serialize};

/// PCM mime type for outbound audio (16-bit little-endian mono, 16 kHz)
pub const PCM_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Messages sent to the Gemini Live API
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) enum ClientMessage {
    /// Session configuration sent once after connection
    Setup(SetupConfig),
    /// Streamed media input
    RealtimeInput(RealtimeInput),
}

/// Session configuration for the live channel
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SetupConfig {
    /// Model resource name (e.g. "models/gemini-2.5-flash-native-audio-preview-12-2025")
    pub model: String,
    pub generation_config: GenerationConfig,
    /// Enables transcription of the user's speech
    pub input_audio_transcription: TranscriptionConfig,
    /// Enables transcription of the model's spoken reply
    pub output_audio_transcription: TranscriptionConfig,
    /// Scribe-only role: the model transcribes, it does not converse
    pub system_instruction: SystemInstruction,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerationConfig {
    pub response_modalities: Vec<String>,
}

/// Empty object on the wire; presence enables the transcription direction
#[derive(Debug, Default, Serialize)]
pub(crate) struct TranscriptionConfig {}

#[derive(Debug, Serialize)]
pub(crate) struct SystemInstruction {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TextPart {
    pub text: String,
}

impl SetupConfig {
    /// Create a setup message for audio-in, audio-out transcription
    pub fn new(model: &str, system_instruction: &str) -> Self {
        Self {
            model: model.to_string(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
            },
            input_audio_transcription: TranscriptionConfig::default(),
            output_audio_transcription: TranscriptionConfig::default(),
            system_instruction: SystemInstruction {
                parts: vec![TextPart {
                    text: system_instruction.to_string(),
                }],
            },
        }
    }
}

/// Streamed realtime media input
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

/// One base64-enveloped block of PCM audio
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MediaChunk {
    /// Base64 of little-endian PCM16 samples
    pub data: String,
    pub mime_type: String,
}

impl ClientMessage {
    /// Build a realtime input message from already-encoded PCM audio
    pub fn audio_input(base64_pcm: String) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![MediaChunk {
                data: base64_pcm,
                mime_type: PCM_MIME_TYPE.to_string(),
            }],
        })
    }
}

/// Messages received from the Gemini Live API
///
/// The server sends a single JSON object per frame with one of several
/// optional top-level fields. Fields this client does not understand are
/// ignored by serde rather than treated as protocol errors.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ServerMessage {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<ServerContent>,
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ServerContent {
    /// Incremental transcription of the model's spoken reply
    pub output_transcription: Option<Transcription>,
    /// Transcription of the user's speech
    pub input_transcription: Option<Transcription>,
    /// Marks the end of one model turn
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Transcription {
    pub text: Option<String>,
}

/// Server-initiated shutdown notice
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GoAway {
    pub time_left: Option<String>,
}

/// Events consumed by the session state machine, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    /// A fragment of the model's spoken reply; accumulated until the turn
    /// completes
    PartialOutput(String),
    /// A finalized line of the user's speech
    FinalInput(String),
    /// Boundary of one model turn; flushes the pending output buffer
    TurnComplete,
    /// The channel reported a failure; terminal
    ChannelError(String),
    /// The channel was closed by the remote side; terminal, not a failure
    ChannelClosed,
    /// A message shape this client does not recognize
    Unknown,
}

impl ServerMessage {
    /// Convert a server message into the events it carries, preserving the
    /// order the service defines: output transcription, input
    /// transcription, then the turn boundary
    pub fn into_events(self) -> Vec<TranscriptEvent> {
        let mut events = Vec::new();

        if let Some(content) = self.server_content {
            if let Some(text) = content.output_transcription.and_then(|t| t.text) {
                if !text.is_empty() {
                    events.push(TranscriptEvent::PartialOutput(text));
                }
            }
            if let Some(text) = content.input_transcription.and_then(|t| t.text) {
                if !text.is_empty() {
                    events.push(TranscriptEvent::FinalInput(text));
                }
            }
            if content.turn_complete {
                events.push(TranscriptEvent::TurnComplete);
            }
        } else if let Some(go_away) = self.go_away {
            tracing::info!(time_left = ?go_away.time_left, "Server sent goAway");
            events.push(TranscriptEvent::ChannelClosed);
        } else if self.setup_complete.is_none() {
            events.push(TranscriptEvent::Unknown);
        }

        events
    }

    /// Whether this message acknowledges session setup
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_serializes_with_scribe_instruction() {
        let msg = ClientMessage::Setup(SetupConfig::new("models/test-model", "You are a scribe."));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"setup\""));
        assert!(json.contains("models/test-model"));
        assert!(json.contains("\"responseModalities\":[\"AUDIO\"]"));
        assert!(json.contains("\"inputAudioTranscription\""));
        assert!(json.contains("\"outputAudioTranscription\""));
        assert!(json.contains("You are a scribe."));
    }

    #[test]
    fn audio_input_carries_pcm_mime_type() {
        let msg = ClientMessage::audio_input("cGNtZGF0YQ==".to_string());
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"realtimeInput\""));
        assert!(json.contains("\"mimeType\":\"audio/pcm;rate=16000\""));
        assert!(json.contains("cGNtZGF0YQ=="));
    }

    #[test]
    fn output_transcription_becomes_partial_output() {
        let json = r#"{"serverContent":{"outputTranscription":{"text":"Hel"}}}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg.into_events(),
            vec![TranscriptEvent::PartialOutput("Hel".to_string())]
        );
    }

    #[test]
    fn combined_content_preserves_event_order() {
        let json = r#"{"serverContent":{
            "outputTranscription":{"text":"lo"},
            "inputTranscription":{"text":"Hi there"},
            "turnComplete":true}}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg.into_events(),
            vec![
                TranscriptEvent::PartialOutput("lo".to_string()),
                TranscriptEvent::FinalInput("Hi there".to_string()),
                TranscriptEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn setup_complete_yields_no_events() {
        let json = r#"{"setupComplete":{}}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert!(msg.is_setup_complete());
        assert!(msg.into_events().is_empty());
    }

    #[test]
    fn unrecognized_message_maps_to_unknown() {
        let json = r#"{"toolCall":{"functionCalls":[]}}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.into_events(), vec![TranscriptEvent::Unknown]);
    }

    #[test]
    fn go_away_maps_to_channel_closed() {
        let json = r#"{"goAway":{"timeLeft":"10s"}}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.into_events(), vec![TranscriptEvent::ChannelClosed]);
    }
}
