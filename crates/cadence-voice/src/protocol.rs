//! Wire frames exchanged with the realtime speech model.
//!
//! JSON objects tagged by `"type"`. Audio payloads travel as base64 text in `bytes`.

use crate::config::{VadSettings, WIRE_SAMPLE_RATE};
use crate::error::VoiceError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn pcm16_24k() -> Self {
        Self {
            encoding: "pcm16".to_string(),
            sample_rate: WIRE_SAMPLE_RATE,
            channels: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VadParameters {
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl From<&VadSettings> for VadParameters {
    fn from(v: &VadSettings) -> Self {
        Self {
            threshold: v.threshold,
            prefix_padding_ms: v.prefix_padding_ms,
            silence_duration_ms: v.silence_duration_ms,
        }
    }
}

/// Payload of the one configuration frame sent after the socket opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfiguration {
    pub voice: String,
    pub instructions: String,
    pub temperature: f32,
    pub input_format: AudioFormat,
    pub output_format: AudioFormat,
    pub vad: VadParameters,
}

/// Frames sent by this client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "session.configure")]
    SessionConfigure(SessionConfiguration),

    #[serde(rename = "audio.append")]
    AudioAppend { bytes: String },

    #[serde(rename = "text.submit")]
    TextSubmit { text: String },
}

impl ClientFrame {
    pub fn to_json(&self) -> Result<String, VoiceError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::SessionConfigure(_) => "session.configure",
            ClientFrame::AudioAppend { .. } => "audio.append",
            ClientFrame::TextSubmit { .. } => "text.submit",
        }
    }
}

/// Frames produced by the remote model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "session.ready")]
    SessionReady,

    /// Server-side VAD heard the user start talking.
    #[serde(rename = "speech.started")]
    SpeechStarted,

    #[serde(rename = "speech.stopped")]
    SpeechStopped,

    /// Finalized transcript of the user's speech.
    #[serde(rename = "transcript.user.delta")]
    UserTranscriptDelta { text: String },

    #[serde(rename = "transcript.assistant.delta")]
    AssistantTranscriptDelta { text: String },

    /// Base64 PCM16 chunk of assistant speech.
    #[serde(rename = "audio.delta")]
    AudioDelta { bytes: String },

    #[serde(rename = "audio.done")]
    AudioDone,

    #[serde(rename = "response.done")]
    ResponseDone,

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
    },

    /// Any frame type this client does not act on.
    #[serde(other)]
    Unknown,
}

impl ServerFrame {
    pub fn parse(text: &str) -> Result<Self, VoiceError> {
        serde_json::from_str(text).map_err(|e| VoiceError::MalformedFrame(e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::SessionReady => "session.ready",
            ServerFrame::SpeechStarted => "speech.started",
            ServerFrame::SpeechStopped => "speech.stopped",
            ServerFrame::UserTranscriptDelta { .. } => "transcript.user.delta",
            ServerFrame::AssistantTranscriptDelta { .. } => "transcript.assistant.delta",
            ServerFrame::AudioDelta { .. } => "audio.delta",
            ServerFrame::AudioDone => "audio.done",
            ServerFrame::ResponseDone => "response.done",
            ServerFrame::Error { .. } => "error",
            ServerFrame::Unknown => "unknown",
        }
    }
}
