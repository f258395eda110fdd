//! Error types for the Cadence voice pipeline
//!
//! Each component boundary has its own error enum; `VoiceError` collects them for
//! the orchestrator, which is the only place that decides whether a failure ends
//! the session.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// PCM16 / transport-text conversion failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("PCM16 buffer has odd length ({0} bytes)")]
    OddLength(usize),

    #[error("Invalid transport text: {0}")]
    InvalidTransportText(String),
}

/// Microphone failures. Reported to the caller, never thrown across the capture thread.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Microphone unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Capture stream error: {0}")]
    Stream(String),
}

/// Failures while opening the realtime session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The auth/billing collaborator returned no credential (signed out or no balance).
    #[error("Ephemeral credential unavailable")]
    CredentialUnavailable,

    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),
}

/// Errors that can occur anywhere in the voice pipeline
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Transport closed: {0}")]
    TransportClosed(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Human-readable status line for UI surfaces. Never exposes raw protocol text
    /// for connection failures.
    pub fn user_message(&self) -> String {
        match self {
            VoiceError::Connect(ConnectError::CredentialUnavailable) => {
                "Session expired or balance exhausted".to_string()
            }
            VoiceError::Connect(ConnectError::Timeout(_)) => "Connection timed out".to_string(),
            VoiceError::Connect(_) | VoiceError::NotConnected => "Failed to connect".to_string(),
            VoiceError::TransportClosed(_) => "Disconnected".to_string(),
            VoiceError::Capture(e) => format!("Microphone error: {}", e),
            VoiceError::Remote(message) => format!("Error: {}", message),
            VoiceError::AudioDevice(_) | VoiceError::Playback(_) => {
                "Audio output error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl From<cpal::DevicesError> for CaptureError {
    fn from(err: cpal::DevicesError) -> Self {
        CaptureError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for CaptureError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => {
                CaptureError::DeviceUnavailable("input device not available".to_string())
            }
            cpal::BuildStreamError::StreamConfigNotSupported => {
                CaptureError::DeviceUnavailable("24 kHz mono capture not supported".to_string())
            }
            cpal::BuildStreamError::BackendSpecific { err } => {
                let text = err.description.to_lowercase();
                if text.contains("denied") || text.contains("permission") {
                    CaptureError::PermissionDenied(err.description)
                } else {
                    CaptureError::Stream(err.description)
                }
            }
            other => CaptureError::Stream(other.to_string()),
        }
    }
}

impl From<cpal::PlayStreamError> for CaptureError {
    fn from(err: cpal::PlayStreamError) -> Self {
        match err {
            cpal::PlayStreamError::DeviceNotAvailable => {
                CaptureError::DeviceUnavailable("input device not available".to_string())
            }
            other => CaptureError::Stream(other.to_string()),
        }
    }
}
