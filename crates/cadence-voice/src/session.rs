//! **VoiceSession** — the public lifecycle API.
//!
//! A connected session is driven by one private task that exclusively owns the
//! state machine, the playback scheduler, the capture engine and the transport.
//! `VoiceSession` is a handle that sends it commands, so every state transition
//! happens on that task, one event at a time:
//!
//! ```text
//!   VoiceSession ──commands──▶ ┌──────────── driver task ────────────┐
//!                              │  ProtocolStateMachine               │
//!   mic ─▶ CaptureEngine ─frames─▶ SessionTransport ─events─▶ handle()│──▶ SessionObserver
//!                              │        PlaybackScheduler ◀──────────┘
//!                              └──────────────────────────────────────┘
//! ```
//!
//! Teardown always runs capture, then playback, then transport.

use crate::audio::AudioBackend;
use crate::capture::{AudioFrame, CaptureEngine, CaptureOptions, FrameCallback};
use crate::codec::bytes_to_transport_text;
use crate::config::{VoiceConfig, TEMPERATURE_RANGE};
use crate::conversation::{ConversationState, Disposition, ProtocolStateMachine};
use crate::credential::CredentialProvider;
use crate::error::{CaptureError, ConnectError, VoiceError, VoiceResult};
use crate::events::SessionObserver;
use crate::playback::{AudioSink, PlaybackScheduler};
use crate::protocol::{AudioFormat, ClientFrame, SessionConfiguration, VadParameters};
use crate::transport::{SessionTransport, TransportEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Per-connect session parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub voice: String,
    pub instructions: String,
    pub temperature: f32,
}

impl ConnectOptions {
    pub fn from_config(config: &VoiceConfig) -> Self {
        Self {
            voice: config.session.voice.clone(),
            instructions: config.session.instructions.clone(),
            temperature: config.session.temperature,
        }
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::from_config(&VoiceConfig::default())
    }
}

enum Command {
    StartCapture(oneshot::Sender<Result<(), CaptureError>>),
    StopCapture(oneshot::Sender<()>),
    SendText(String, oneshot::Sender<VoiceResult<()>>),
    Disconnect(oneshot::Sender<()>),
}

struct ActiveSession {
    id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    capturing: Arc<AtomicBool>,
    driver: JoinHandle<()>,
}

/// One conversation at a time. A second `connect` tears the first one down.
pub struct VoiceSession {
    config: VoiceConfig,
    credentials: Arc<dyn CredentialProvider>,
    audio: Arc<dyn AudioBackend>,
    observer: Arc<dyn SessionObserver>,
    state: watch::Receiver<ConversationState>,
    active: Option<ActiveSession>,
}

impl VoiceSession {
    pub fn new(
        config: VoiceConfig,
        credentials: Arc<dyn CredentialProvider>,
        audio: Arc<dyn AudioBackend>,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        let (_, state) = watch::channel(ConversationState::Idle);
        Self {
            config,
            credentials,
            audio,
            observer,
            state,
            active: None,
        }
    }

    pub fn config(&self) -> &VoiceConfig {
        &self.config
    }

    pub fn state(&self) -> ConversationState {
        *self.state.borrow()
    }

    /// Watch state transitions as they happen.
    pub fn subscribe_state(&self) -> watch::Receiver<ConversationState> {
        self.state.clone()
    }

    pub fn status_text(&self) -> &'static str {
        self.state().status_text()
    }

    /// Id of the current connection, if any.
    pub fn session_id(&self) -> Option<Uuid> {
        self.active.as_ref().map(|a| a.id)
    }

    pub fn is_connected(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| !a.driver.is_finished())
    }

    pub fn is_capturing(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.capturing.load(Ordering::Acquire))
    }

    /// Fetch a credential, open the socket, configure the remote, open the speaker.
    pub async fn connect(&mut self, options: ConnectOptions) -> VoiceResult<()> {
        if !TEMPERATURE_RANGE.contains(&options.temperature) {
            return Err(VoiceError::Config(format!(
                "temperature must be within 0.6..=1.2, got {}",
                options.temperature
            )));
        }

        if self.active.is_some() {
            info!("Replacing existing session");
            self.disconnect().await;
        }

        let mut machine = ProtocolStateMachine::new(Arc::clone(&self.observer));
        self.state = machine.subscribe();
        machine.begin_connect();

        let id = Uuid::new_v4();
        info!(session_id = %id, voice = %options.voice, "🎙️ Connecting voice session");

        let configuration = SessionConfiguration {
            voice: options.voice,
            instructions: options.instructions,
            temperature: options.temperature,
            input_format: AudioFormat::pcm16_24k(),
            output_format: AudioFormat::pcm16_24k(),
            vad: VadParameters::from(&self.config.vad),
        };

        let connected = SessionTransport::connect(
            self.credentials.as_ref(),
            &self.config.endpoint,
            configuration,
            self.config.connect_timeout(),
        )
        .await;

        let (mut transport, events) = match connected {
            Ok(pair) => pair,
            Err(e) => {
                warn!(session_id = %id, "Connect failed: {}", e);
                let terminal = e == ConnectError::CredentialUnavailable;
                let err = VoiceError::from(e);
                machine.fail(&err.user_message());
                if !terminal {
                    machine.disconnected();
                }
                return Err(err);
            }
        };

        let audio = Arc::clone(&self.audio);
        let sample_rate = self.config.audio.sample_rate;
        let opened = tokio::task::spawn_blocking(move || audio.open_output(sample_rate))
            .await
            .unwrap_or_else(|e| Err(VoiceError::AudioDevice(e.to_string())));
        let device = match opened {
            Ok(device) => device,
            Err(e) => {
                error!(session_id = %id, "Failed to open audio output: {}", e);
                transport.disconnect();
                machine.fail(&e.user_message());
                machine.disconnected();
                return Err(e);
            }
        };
        let playback = PlaybackScheduler::new(device, self.config.fade_out());

        machine.connected();
        info!(session_id = %id, "✅ Voice session connected");

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let capturing = Arc::new(AtomicBool::new(false));

        let driver = Driver {
            id,
            machine,
            playback,
            transport,
            capture: None,
            capture_options: CaptureOptions::from(&self.config.audio),
            audio: Arc::clone(&self.audio),
            observer: Arc::clone(&self.observer),
            capturing: Arc::clone(&capturing),
            commands: command_rx,
            events,
            frame_tx,
            frames: frame_rx,
        };

        self.active = Some(ActiveSession {
            id,
            commands: command_tx,
            capturing,
            driver: tokio::spawn(driver.run()),
        });
        Ok(())
    }

    /// Open the microphone and stream it to the remote. A microphone failure is
    /// reported but does not end the session.
    pub async fn start_capture(&self) -> VoiceResult<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::StartCapture(tx))?;
        rx.await.map_err(|_| VoiceError::NotConnected)??;
        Ok(())
    }

    /// Stop streaming the microphone. Conversation state is unchanged.
    pub async fn stop_capture(&self) {
        let (tx, rx) = oneshot::channel();
        if self.command(Command::StopCapture(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn send_text(&self, text: impl Into<String>) -> VoiceResult<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::SendText(text.into(), tx))?;
        rx.await.map_err(|_| VoiceError::NotConnected)?
    }

    /// Hang up. Idempotent.
    pub async fn disconnect(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let (tx, rx) = oneshot::channel();
        if active.commands.send(Command::Disconnect(tx)).is_ok() {
            let _ = rx.await;
        }
        if let Err(e) = active.driver.await {
            if e.is_panic() {
                error!(session_id = %active.id, "Session driver panicked");
            }
        }
    }

    fn command(&self, command: Command) -> VoiceResult<()> {
        let active = self.active.as_ref().ok_or(VoiceError::NotConnected)?;
        active
            .commands
            .send(command)
            .map_err(|_| VoiceError::NotConnected)
    }
}

/// Owns every resource of one connected session.
struct Driver {
    id: Uuid,
    machine: ProtocolStateMachine,
    playback: PlaybackScheduler,
    transport: SessionTransport,
    capture: Option<CaptureEngine>,
    capture_options: CaptureOptions,
    audio: Arc<dyn AudioBackend>,
    observer: Arc<dyn SessionObserver>,
    capturing: Arc<AtomicBool>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    frame_tx: mpsc::UnboundedSender<AudioFrame>,
    frames: mpsc::UnboundedReceiver<AudioFrame>,
}

enum Flow {
    Continue,
    Stop(Option<oneshot::Sender<()>>),
}

impl Driver {
    async fn run(mut self) {
        let hangup = loop {
            let drain = self.drain_deadline();

            let flow = tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    // Handle dropped without disconnect().
                    None => Flow::Stop(None),
                },

                event = self.events.recv() => self.on_event(event),

                Some(frame) = self.frames.recv() => {
                    self.on_capture_frame(frame);
                    Flow::Continue
                }

                _ = tokio::time::sleep(drain.unwrap_or_default()), if drain.is_some() => {
                    self.machine.playback_drained(&self.playback);
                    Flow::Continue
                }
            };

            if let Flow::Stop(reply) = flow {
                break reply;
            }
        };

        self.teardown();
        if let Some(reply) = hangup {
            let _ = reply.send(());
        }
    }

    /// Time until queued assistant audio has rendered, while a finished response is
    /// waiting on it.
    fn drain_deadline(&self) -> Option<Duration> {
        if !self.machine.awaiting_drain() {
            return None;
        }
        Some(self.playback.time_until_drained().unwrap_or(Duration::ZERO))
    }

    async fn on_command(&mut self, command: Command) -> Flow {
        match command {
            Command::StartCapture(reply) => {
                let _ = reply.send(self.start_capture().await);
            }
            Command::StopCapture(reply) => {
                self.stop_capture();
                let _ = reply.send(());
            }
            Command::SendText(text, reply) => {
                let sent = self.transport.send(ClientFrame::TextSubmit { text });
                if sent.is_ok() {
                    self.machine.text_submitted();
                }
                let _ = reply.send(sent);
            }
            Command::Disconnect(reply) => {
                info!(session_id = %self.id, "Hanging up");
                return Flow::Stop(Some(reply));
            }
        }
        Flow::Continue
    }

    fn on_event(&mut self, event: Option<TransportEvent>) -> Flow {
        match event {
            Some(TransportEvent::Frame(frame)) => {
                debug!(session_id = %self.id, frame = frame.kind(), "Inbound frame");
                match self.machine.handle(frame, &mut self.playback) {
                    Disposition::Continue => Flow::Continue,
                    Disposition::Terminate => Flow::Stop(None),
                }
            }
            Some(TransportEvent::Malformed(reason)) => {
                debug!(session_id = %self.id, "Malformed frame dropped: {}", reason);
                Flow::Continue
            }
            Some(TransportEvent::Closed(reason)) => {
                warn!(
                    session_id = %self.id,
                    "Remote closed the session ({})",
                    reason.as_deref().unwrap_or("no reason")
                );
                Flow::Stop(None)
            }
            None => Flow::Stop(None),
        }
    }

    fn on_capture_frame(&mut self, frame: AudioFrame) {
        let bytes = bytes_to_transport_text(&frame.payload);
        if let Err(e) = self.transport.send(ClientFrame::AudioAppend { bytes }) {
            debug!(session_id = %self.id, "Capture frame not sent: {}", e);
        }
    }

    async fn start_capture(&mut self) -> Result<(), CaptureError> {
        if self.capture.as_ref().is_some_and(CaptureEngine::is_active) {
            return Ok(());
        }

        let mut engine = CaptureEngine::new(self.audio.input(), self.capture_options.clone());
        let frames = self.frame_tx.clone();
        let on_frame: FrameCallback = Arc::new(move |frame: AudioFrame| {
            let _ = frames.send(frame);
        });

        // Device open blocks on the hardware thread's handshake.
        let opened = tokio::task::spawn_blocking(move || {
            let started = engine.start(on_frame);
            (engine, started)
        })
        .await;
        let (engine, started) = match opened {
            Ok(pair) => pair,
            Err(e) => return Err(CaptureError::Stream(e.to_string())),
        };

        match started {
            Ok(()) => {
                self.capture = Some(engine);
                self.capturing.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                warn!(session_id = %self.id, "Microphone failed: {}", e);
                self.observer
                    .on_error(&VoiceError::Capture(e.clone()).user_message());
                Err(e)
            }
        }
    }

    fn stop_capture(&mut self) {
        if let Some(mut engine) = self.capture.take() {
            engine.stop();
        }
        self.capturing.store(false, Ordering::Release);
        // Frames captured before stop but not yet sent are discarded.
        while self.frames.try_recv().is_ok() {}
    }

    fn teardown(&mut self) {
        self.stop_capture();
        self.playback.shutdown();
        self.transport.disconnect();
        self.machine.disconnected();
        info!(session_id = %self.id, "👋 Voice session closed");
    }
}
