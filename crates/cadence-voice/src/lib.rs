//! # Cadence Voice - Real-time Voice Conversation Pipeline
//!
//! Captures the microphone, streams it to a remote speech model over one
//! persistent websocket, and plays the model's spoken reply back gaplessly, with
//! barge-in when the user talks over the assistant.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          VoiceSession                            │
//! │  ┌──────────────┐  audio.append  ┌──────────────────┐            │
//! │  │ CaptureEngine│ ─────────────▶ │ SessionTransport │ ◀─ remote  │
//! │  │    (cpal)    │                │  (websocket)     │            │
//! │  └──────────────┘                └──────────────────┘            │
//! │                                          │ frames                │
//! │                                          ▼                       │
//! │  ┌──────────────────┐  schedule  ┌──────────────────────┐        │
//! │  │ PlaybackScheduler│ ◀───────── │ ProtocolStateMachine │ ─▶ UI  │
//! │  │ (rodio timeline) │  interrupt │  (ConversationState) │        │
//! │  └──────────────────┘            └──────────────────────┘        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use cadence_voice::{
//!     ConnectOptions, HttpCredentialProvider, NativeAudio, NullObserver, VoiceConfig,
//!     VoiceSession,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = VoiceConfig::load()?;
//! let credentials = HttpCredentialProvider::new(config.credential_url.clone(), None)?;
//! let mut session = VoiceSession::new(
//!     config,
//!     Arc::new(credentials),
//!     Arc::new(NativeAudio),
//!     Arc::new(NullObserver),
//! );
//! session.connect(ConnectOptions::default().with_voice("alloy")).await?;
//! session.start_capture().await?;
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod capture;
pub mod codec;
pub mod config;
pub mod conversation;
pub mod credential;
pub mod error;
pub mod events;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod transport;

pub use audio::{
    list_input_devices, AudioBackend, CpalMicrophone, HeadlessAudio, NativeAudio, RodioOutput,
};
pub use capture::{AudioFrame, AudioSource, CaptureEngine, CaptureOptions};
pub use codec::{
    bytes_to_transport_text, decode_pcm16_to_float, encode_float_to_pcm16,
    transport_text_to_bytes,
};
pub use config::{AudioSettings, SessionDefaults, VadSettings, VoiceConfig, WIRE_SAMPLE_RATE};
pub use conversation::{ConversationState, Disposition, ProtocolStateMachine};
pub use credential::{
    CredentialProvider, EphemeralCredential, HttpCredentialProvider, StaticCredential,
};
pub use error::{CaptureError, CodecError, ConnectError, VoiceError, VoiceResult};
pub use events::{ChannelObserver, NullObserver, SessionEvent, SessionObserver};
pub use playback::{
    AudioSink, ChunkSlot, OutputDevice, PlaybackScheduler, ScheduledChunk, VirtualClock,
    VirtualLog, VirtualOutput,
};
pub use protocol::{ClientFrame, ServerFrame, SessionConfiguration};
pub use session::{ConnectOptions, VoiceSession};
pub use transport::{SessionTransport, TransportEvent};
