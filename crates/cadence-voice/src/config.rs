//! Voice pipeline configuration.
//!
//! Layered the same way as the gateway config: built-in defaults, then an optional
//! file (`CADENCE_CONFIG`, default `config/voice`), then `CADENCE__*` environment
//! variables.
//!
//! | Env | Default |
//! |-----|---------|
//! | CADENCE__ENDPOINT | wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview |
//! | CADENCE__CREDENTIAL_URL | http://localhost:3000/api/realtime/session |
//! | CADENCE__CONNECT_TIMEOUT_MS | 10000 |
//! | CADENCE__SESSION__VOICE | alloy |
//! | CADENCE__SESSION__TEMPERATURE | 0.8 |
//! | CADENCE__AUDIO__SAMPLE_RATE | 24000 |
//! | CADENCE__AUDIO__CAPTURE_BLOCK_SIZE | 4096 |
//! | CADENCE__AUDIO__FADE_OUT_MS | 30 |
//! | CADENCE__VAD__THRESHOLD | 0.5 |

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;

/// Sample rate of both directions of the wire (PCM16 mono).
pub const WIRE_SAMPLE_RATE: u32 = 24_000;

/// Sampling temperatures the realtime model accepts.
pub const TEMPERATURE_RANGE: RangeInclusive<f32> = 0.6..=1.2;

/// Per-conversation defaults sent in `session.configure`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDefaults {
    pub voice: String,
    pub instructions: String,
    pub temperature: f32,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            voice: "alloy".to_string(),
            instructions:
                "You are a helpful voice assistant. Keep answers short and conversational."
                    .to_string(),
            temperature: 0.8,
        }
    }
}

/// Device-side audio settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    /// Capture and playback rate in Hz (default: 24000)
    pub sample_rate: u32,
    /// Samples per outbound block (default: 4096, ~170ms at 24kHz)
    pub capture_block_size: usize,
    /// Gain ramp applied to in-flight audio on interrupt (default: 30ms)
    pub fade_out_ms: u64,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: WIRE_SAMPLE_RATE,
            capture_block_size: 4096,
            fade_out_ms: 30,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Server-side voice-activity detection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadSettings {
    /// Activation threshold, 0.0..=1.0 (higher = less sensitive)
    pub threshold: f32,
    /// Audio kept before detected speech start
    pub prefix_padding_ms: u32,
    /// Silence required before the remote declares speech stopped
    pub silence_duration_ms: u32,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Realtime websocket endpoint
    pub endpoint: String,
    /// Auth/billing endpoint that mints ephemeral credentials
    pub credential_url: String,
    /// Optional bearer forwarded to the credential endpoint (app session token)
    #[serde(default)]
    pub credential_bearer: Option<String>,
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub session: SessionDefaults,
    #[serde(default)]
    pub audio: AudioSettings,
    #[serde(default)]
    pub vad: VadSettings,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview".to_string(),
            credential_url: "http://localhost:3000/api/realtime/session".to_string(),
            credential_bearer: None,
            connect_timeout_ms: 10_000,
            session: SessionDefaults::default(),
            audio: AudioSettings::default(),
            vad: VadSettings::default(),
        }
    }
}

impl VoiceConfig {
    /// Load defaults + optional file + `CADENCE__*` env.
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var("CADENCE_CONFIG").unwrap_or_else(|_| "config/voice".to_string());
        Self::load_from(Some(Path::new(&config_path)))
    }

    pub fn load_from(path: Option<&Path>) -> VoiceResult<Self> {
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&VoiceConfig::default())?);

        let builder = match path {
            Some(p) if p.exists() || p.with_extension("toml").exists() => {
                builder.add_source(config::File::from(p))
            }
            _ => builder,
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("CADENCE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: VoiceConfig = built.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a TOML document layered over the defaults (no env).
    pub fn from_toml_str(toml: &str) -> VoiceResult<Self> {
        let cfg: VoiceConfig = config::Config::builder()
            .add_source(config::Config::try_from(&VoiceConfig::default())?)
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> VoiceResult<()> {
        // Both devices run at the wire rate; the remote only speaks PCM16 at 24 kHz.
        if self.audio.sample_rate != WIRE_SAMPLE_RATE {
            return Err(VoiceError::Config(format!(
                "audio.sample_rate must be {}, got {}",
                WIRE_SAMPLE_RATE, self.audio.sample_rate
            )));
        }
        if self.audio.capture_block_size == 0 {
            return Err(VoiceError::Config(
                "audio.capture_block_size must be > 0".to_string(),
            ));
        }
        if !TEMPERATURE_RANGE.contains(&self.session.temperature) {
            return Err(VoiceError::Config(format!(
                "session.temperature must be within 0.6..=1.2, got {}",
                self.session.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.vad.threshold) {
            return Err(VoiceError::Config(format!(
                "vad.threshold must be within 0.0..=1.0, got {}",
                self.vad.threshold
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(VoiceError::Config("connect_timeout_ms must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn fade_out(&self) -> Duration {
        Duration::from_millis(self.audio.fade_out_ms)
    }
}
