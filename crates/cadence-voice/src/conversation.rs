//! Conversation state machine driven by inbound frames.
//!
//! ```text
//! Idle ─connect─▶ Connecting ─ok─▶ Listening ─speech.stopped─▶ Processing
//!                                     ▲   ▲                        │
//!                                     │   └─speech.started─┐       │ audio / assistant text
//!                      response.done  │   (barge-in)       │       ▼
//!                      + drained ─────┴────────────────── Speaking ◀─ audio.delta
//! any ─transport close─▶ Disconnected        any ─error frame─▶ Error ─▶ Disconnected
//! ```
//!
//! One frame is handled at a time by the session driver; nothing else mutates
//! the state.

use crate::codec::transport_text_to_bytes;
use crate::events::SessionObserver;
use crate::playback::AudioSink;
use crate::protocol::ServerFrame;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Idle,
    Connecting,
    Listening,
    Processing,
    Speaking,
    Disconnected,
    Error,
}

impl ConversationState {
    /// Status line for the UI.
    pub fn status_text(&self) -> &'static str {
        match self {
            ConversationState::Idle => "Ready",
            ConversationState::Connecting => "Connecting...",
            ConversationState::Listening => "Listening",
            ConversationState::Processing => "Thinking...",
            ConversationState::Speaking => "Speaking",
            ConversationState::Disconnected => "Disconnected",
            ConversationState::Error => "Error",
        }
    }

    /// States in which inbound conversation frames are acted on.
    fn is_live(&self) -> bool {
        matches!(
            self,
            ConversationState::Listening
                | ConversationState::Processing
                | ConversationState::Speaking
        )
    }
}

/// What the driver should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    /// Remote reported an error; tear the session down.
    Terminate,
}

pub struct ProtocolStateMachine {
    state: ConversationState,
    /// `response.done` arrived while audio was still rendering.
    awaiting_drain: bool,
    observer: Arc<dyn SessionObserver>,
    state_tx: watch::Sender<ConversationState>,
}

impl ProtocolStateMachine {
    pub fn new(observer: Arc<dyn SessionObserver>) -> Self {
        let (state_tx, _) = watch::channel(ConversationState::Idle);
        Self {
            state: ConversationState::Idle,
            awaiting_drain: false,
            observer,
            state_tx,
        }
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationState> {
        self.state_tx.subscribe()
    }

    pub fn awaiting_drain(&self) -> bool {
        self.awaiting_drain
    }

    fn set_state(&mut self, next: ConversationState) {
        if self.state == next {
            return;
        }
        debug!("Conversation: {:?} -> {:?}", self.state, next);
        self.state = next;
        self.state_tx.send_replace(next);
        self.observer.on_status_change(next);
    }

    /// Lifecycle: a connect attempt started.
    pub fn begin_connect(&mut self) {
        self.awaiting_drain = false;
        self.set_state(ConversationState::Connecting);
    }

    /// Lifecycle: transport open and configured.
    pub fn connected(&mut self) {
        if matches!(
            self.state,
            ConversationState::Idle | ConversationState::Connecting
        ) {
            self.set_state(ConversationState::Listening);
            self.observer.on_connected();
        }
    }

    /// Lifecycle: the user typed a message.
    pub fn text_submitted(&mut self) {
        if self.state == ConversationState::Listening {
            self.set_state(ConversationState::Processing);
        }
    }

    /// Lifecycle: a connect attempt or the session failed.
    pub fn fail(&mut self, message: &str) {
        self.awaiting_drain = false;
        self.observer.on_error(message);
        self.set_state(ConversationState::Error);
    }

    /// Transport closed, remote error handled, or explicit hangup. Idempotent.
    pub fn disconnected(&mut self) {
        self.awaiting_drain = false;
        if self.state == ConversationState::Disconnected {
            return;
        }
        self.set_state(ConversationState::Disconnected);
        self.observer.on_disconnected();
    }

    /// The timer armed from the scheduler's drain deadline fired.
    pub fn playback_drained(&mut self, sink: &dyn AudioSink) {
        if !self.awaiting_drain || sink.is_playing() {
            return;
        }
        self.awaiting_drain = false;
        if self.state == ConversationState::Speaking {
            info!("Assistant turn finished");
            self.set_state(ConversationState::Listening);
        }
    }

    /// Apply one inbound frame. Frames that make no sense in the current state are
    /// ignored.
    pub fn handle(&mut self, frame: ServerFrame, sink: &mut dyn AudioSink) -> Disposition {
        use ConversationState as S;

        if let ServerFrame::Error { message } = &frame {
            if matches!(self.state, S::Idle | S::Disconnected | S::Error) {
                return Disposition::Continue;
            }
            warn!("Remote error: {}", message);
            self.fail(message);
            return Disposition::Terminate;
        }

        if self.state == S::Connecting {
            if frame == ServerFrame::SessionReady {
                self.connected();
            } else {
                debug!("Ignoring {} while connecting", frame.kind());
            }
            return Disposition::Continue;
        }

        if !self.state.is_live() {
            debug!("Ignoring {} in {:?}", frame.kind(), self.state);
            return Disposition::Continue;
        }

        match frame {
            ServerFrame::SessionReady => {
                debug!("Session ready");
            }

            ServerFrame::SpeechStarted => {
                // Barge-in: the remote heard the user, so the assistant stops now.
                let was_playing = sink.is_playing();
                sink.interrupt();
                self.awaiting_drain = false;
                if was_playing {
                    info!("⚡ Barge-in: assistant playback interrupted");
                    self.observer.on_interrupted();
                }
                self.set_state(S::Listening);
            }

            ServerFrame::SpeechStopped => {
                if self.state == S::Listening {
                    self.set_state(S::Processing);
                }
            }

            ServerFrame::UserTranscriptDelta { text } => {
                if !text.is_empty() {
                    self.observer.on_transcript(&text, true);
                }
            }

            ServerFrame::AssistantTranscriptDelta { text } => {
                if matches!(self.state, S::Listening | S::Processing) {
                    self.set_state(S::Speaking);
                }
                if !text.is_empty() {
                    self.observer.on_transcript(&text, false);
                }
            }

            ServerFrame::AudioDelta { bytes } => {
                let pcm = match transport_text_to_bytes(&bytes) {
                    Ok(pcm) => pcm,
                    Err(e) => {
                        warn!("Dropping malformed audio.delta: {}", e);
                        return Disposition::Continue;
                    }
                };
                match sink.schedule_chunk(&pcm) {
                    Ok(Some(_)) => {
                        // A new response may start before the last one drained.
                        self.awaiting_drain = false;
                        self.set_state(S::Speaking);
                    }
                    Ok(None) => debug!("Playback closed, audio.delta discarded"),
                    Err(e) => warn!("Dropping malformed audio.delta: {}", e),
                }
            }

            ServerFrame::AudioDone => {
                debug!("Assistant audio stream complete");
            }

            ServerFrame::ResponseDone => match self.state {
                S::Speaking if sink.is_playing() => {
                    self.awaiting_drain = true;
                }
                S::Speaking | S::Processing => {
                    self.set_state(S::Listening);
                }
                _ => {}
            },

            ServerFrame::Error { .. } => {}

            ServerFrame::Unknown => {
                debug!("Ignoring unknown frame");
            }
        }

        Disposition::Continue
    }
}
