//! Callbacks into the UI layer.

use crate::conversation::ConversationState;
use tokio::sync::mpsc;

/// UI-facing callbacks. Every method defaults to a no-op.
pub trait SessionObserver: Send + Sync {
    fn on_connected(&self) {}

    fn on_disconnected(&self) {}

    /// `is_user` distinguishes the user's transcript from assistant text.
    fn on_transcript(&self, _text: &str, _is_user: bool) {}

    fn on_status_change(&self, _state: ConversationState) {}

    fn on_error(&self, _message: &str) {}

    /// Assistant playback was cut off because the user started talking.
    fn on_interrupted(&self) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl SessionObserver for NullObserver {}

/// Owned form of every observer callback.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Transcript { text: String, is_user: bool },
    StatusChanged(ConversationState),
    Error(String),
    Interrupted,
}

/// Forwards callbacks into a channel, for consumers that prefer `recv().await`.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: SessionEvent) {
        // Receiver dropped means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl SessionObserver for ChannelObserver {
    fn on_connected(&self) {
        self.emit(SessionEvent::Connected);
    }

    fn on_disconnected(&self) {
        self.emit(SessionEvent::Disconnected);
    }

    fn on_transcript(&self, text: &str, is_user: bool) {
        self.emit(SessionEvent::Transcript {
            text: text.to_string(),
            is_user,
        });
    }

    fn on_status_change(&self, state: ConversationState) {
        self.emit(SessionEvent::StatusChanged(state));
    }

    fn on_error(&self, message: &str) {
        self.emit(SessionEvent::Error(message.to_string()));
    }

    fn on_interrupted(&self) {
        self.emit(SessionEvent::Interrupted);
    }
}
