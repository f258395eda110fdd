//! End-to-end tests for the voice session
//!
//! A local websocket server stands in for the remote model and a manual-clock
//! virtual output stands in for the speaker. Tests that need real audio devices
//! are `#[ignore]`d.

use cadence_voice::playback::frames_to_duration;
use cadence_voice::{
    bytes_to_transport_text, encode_float_to_pcm16, transport_text_to_bytes, AudioBackend,
    AudioSource, CaptureError, CaptureOptions, ChannelObserver, ConnectError, ConnectOptions,
    ConversationState, OutputDevice, SessionEvent, StaticCredential, VirtualClock, VirtualLog,
    VirtualOutput, VoiceConfig, VoiceError, VoiceResult, VoiceSession,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

// ---------------------------------------------------------------------------
// Fake remote model
// ---------------------------------------------------------------------------

struct Connection {
    to_client: mpsc::UnboundedSender<Message>,
    from_client: mpsc::UnboundedReceiver<Value>,
}

impl Connection {
    fn send(&self, frame: Value) {
        self.to_client.send(Message::Text(frame.to_string())).unwrap();
    }

    fn send_raw(&self, text: &str) {
        self.to_client.send(Message::Text(text.to_string())).unwrap();
    }

    fn close(&self) {
        self.to_client.send(Message::Close(None)).unwrap();
    }

    async fn recv(&mut self) -> Value {
        timeout(WAIT, self.from_client.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("client went away")
    }

    /// Wait until the client has closed the socket.
    async fn closed(&mut self) {
        timeout(WAIT, async { while self.from_client.recv().await.is_some() {} })
            .await
            .expect("client never closed the socket");
    }
}

struct FakeRealtime {
    addr: SocketAddr,
    connections: mpsc::UnboundedReceiver<Connection>,
}

impl FakeRealtime {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (conn_tx, connections) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let Ok(ws) = tokio_tungstenite::accept_async(tcp).await else {
                    continue;
                };
                let (mut sink, mut stream) = ws.split();
                let (to_client, mut outbound) = mpsc::unbounded_channel::<Message>();
                let (inbound, from_client) = mpsc::unbounded_channel::<Value>();

                tokio::spawn(async move {
                    while let Some(message) = outbound.recv().await {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                });
                tokio::spawn(async move {
                    while let Some(Ok(message)) = stream.next().await {
                        if let Message::Text(text) = message {
                            let _ = inbound.send(serde_json::from_str(&text).unwrap());
                        }
                    }
                });

                if conn_tx
                    .send(Connection {
                        to_client,
                        from_client,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });

        Self { addr, connections }
    }

    fn endpoint(&self) -> String {
        format!("ws://{}", self.addr)
    }

    async fn accept(&mut self) -> Connection {
        timeout(WAIT, self.connections.recv())
            .await
            .expect("no connection")
            .expect("server stopped")
    }
}

// ---------------------------------------------------------------------------
// Fake audio devices
// ---------------------------------------------------------------------------

/// Sends `blocks` blocks on open and keeps the channel open until closed.
struct ScriptedMic {
    blocks: usize,
    fail: Option<CaptureError>,
    open_delay: Duration,
    closes: Arc<AtomicUsize>,
    tx: Option<mpsc::UnboundedSender<Vec<f32>>>,
}

impl AudioSource for ScriptedMic {
    fn open(
        &mut self,
        options: &CaptureOptions,
        blocks: mpsc::UnboundedSender<Vec<f32>>,
    ) -> Result<(), CaptureError> {
        // Real devices block on their stream thread while opening.
        std::thread::sleep(self.open_delay);
        if let Some(e) = self.fail.clone() {
            return Err(e);
        }
        for _ in 0..self.blocks {
            let _ = blocks.send(vec![0.25; options.block_size]);
        }
        self.tx = Some(blocks);
        Ok(())
    }

    fn close(&mut self) {
        if self.tx.take().is_some() {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct TestAudio {
    clock: VirtualClock,
    outputs: Mutex<Vec<Arc<Mutex<VirtualLog>>>>,
    mic_blocks: usize,
    mic_fail: Option<CaptureError>,
    mic_closes: Arc<AtomicUsize>,
    open_delay: Duration,
}

impl TestAudio {
    fn build(
        mic_blocks: usize,
        mic_fail: Option<CaptureError>,
        open_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            clock: VirtualClock::manual(),
            outputs: Mutex::new(Vec::new()),
            mic_blocks,
            mic_fail,
            mic_closes: Arc::new(AtomicUsize::new(0)),
            open_delay,
        })
    }

    fn new() -> Arc<Self> {
        Self::build(2, None, Duration::ZERO)
    }

    fn with_broken_mic(error: CaptureError) -> Arc<Self> {
        Self::build(0, Some(error), Duration::ZERO)
    }

    /// Both devices take `delay` to open, like hardware does.
    fn with_slow_devices(delay: Duration) -> Arc<Self> {
        Self::build(2, None, delay)
    }

    fn output(&self, index: usize) -> VirtualLog {
        self.outputs.lock().unwrap()[index].lock().unwrap().clone()
    }

    fn last_output(&self) -> VirtualLog {
        let outputs = self.outputs.lock().unwrap();
        let log = outputs.last().expect("no output opened").lock().unwrap().clone();
        log
    }
}

impl AudioBackend for TestAudio {
    fn open_output(&self, sample_rate: u32) -> VoiceResult<Box<dyn OutputDevice>> {
        std::thread::sleep(self.open_delay);
        let device = VirtualOutput::new(sample_rate, self.clock.clone());
        self.outputs.lock().unwrap().push(device.log_handle());
        Ok(Box::new(device))
    }

    fn input(&self) -> Box<dyn AudioSource> {
        Box::new(ScriptedMic {
            blocks: self.mic_blocks,
            fail: self.mic_fail.clone(),
            open_delay: self.open_delay,
            closes: Arc::clone(&self.mic_closes),
            tx: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config(endpoint: String) -> VoiceConfig {
    VoiceConfig {
        endpoint,
        ..VoiceConfig::default()
    }
}

fn session_with(
    config: VoiceConfig,
    audio: Arc<TestAudio>,
) -> (VoiceSession, mpsc::UnboundedReceiver<SessionEvent>) {
    let (observer, events) = ChannelObserver::new();
    let session = VoiceSession::new(
        config,
        Arc::new(StaticCredential::new("sk-ephemeral")),
        audio,
        Arc::new(observer),
    );
    (session, events)
}

fn audio_delta(samples: usize) -> Value {
    json!({
        "type": "audio.delta",
        "bytes": bytes_to_transport_text(&encode_float_to_pcm16(&vec![0.2; samples])),
    })
}

async fn wait_for_state(session: &VoiceSession, want: ConversationState) {
    let mut state = session.subscribe_state();
    timeout(WAIT, state.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("never reached {:?}, stuck in {:?}", want, session.state()))
        .unwrap();
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

fn drain(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_happy_path_gapless_playback() {
    init_tracing();
    let mut server = FakeRealtime::start().await;
    let audio = TestAudio::new();
    let (mut session, mut events) = session_with(config(server.endpoint()), audio.clone());

    session
        .connect(ConnectOptions::default().with_voice("a"))
        .await
        .unwrap();
    assert_eq!(session.state(), ConversationState::Listening);
    assert!(session.session_id().is_some());

    let mut remote = server.accept().await;
    let configure = remote.recv().await;
    assert_eq!(configure["type"], "session.configure");
    assert_eq!(configure["voice"], "a");
    assert_eq!(configure["output_format"]["sample_rate"], 24000);
    assert_eq!(configure["vad"]["silence_duration_ms"], 500);

    session.start_capture().await.unwrap();
    assert!(session.is_capturing());
    for _ in 0..2 {
        let append = remote.recv().await;
        assert_eq!(append["type"], "audio.append");
        let pcm = transport_text_to_bytes(append["bytes"].as_str().unwrap()).unwrap();
        assert_eq!(pcm.len(), 4096 * 2);
    }

    audio.clock.advance(1_200);
    for _ in 0..3 {
        remote.send(audio_delta(4096));
    }
    wait_for_state(&session, ConversationState::Speaking).await;
    eventually(|| audio.last_output().chunks.len() == 3).await;

    let chunks = audio.last_output().chunks;
    let t0 = chunks[0].0;
    assert_eq!(t0, 1_200);
    let offsets: Vec<f64> = chunks
        .iter()
        .map(|(start, _)| frames_to_duration(start - t0, 24_000).as_secs_f64() * 1000.0)
        .collect();
    assert!(offsets[0].abs() < 0.01);
    assert!((offsets[1] - 170.7).abs() < 0.1, "offset {}", offsets[1]);
    assert!((offsets[2] - 341.3).abs() < 0.1, "offset {}", offsets[2]);

    remote.send(json!({"type": "audio.done"}));
    remote.send(json!({"type": "response.done"}));
    tokio::time::sleep(Duration::from_millis(100)).await;
    // Still audible: response.done alone does not end the turn.
    assert_eq!(session.state(), ConversationState::Speaking);

    audio.clock.advance(3 * 4096);
    wait_for_state(&session, ConversationState::Listening).await;

    session.disconnect().await;
    assert_eq!(session.state(), ConversationState::Disconnected);

    let seen = drain(&mut events);
    assert_eq!(seen.first(), Some(&SessionEvent::StatusChanged(ConversationState::Connecting)));
    assert!(seen.contains(&SessionEvent::Connected));
    assert_eq!(seen.last(), Some(&SessionEvent::Disconnected));
}

#[tokio::test]
async fn test_barge_in_fades_and_restarts_timeline() {
    init_tracing();
    let mut server = FakeRealtime::start().await;
    let audio = TestAudio::new();
    let (mut session, mut events) = session_with(config(server.endpoint()), audio.clone());

    session.connect(ConnectOptions::default()).await.unwrap();
    let mut remote = server.accept().await;
    remote.recv().await;

    remote.send(audio_delta(4800));
    remote.send(audio_delta(4800));
    wait_for_state(&session, ConversationState::Speaking).await;
    eventually(|| audio.last_output().chunks.len() == 2).await;

    audio.clock.advance(1_000);
    remote.send(json!({"type": "speech.started"}));
    wait_for_state(&session, ConversationState::Listening).await;

    // 30 ms fade at 24 kHz, starting at the device clock.
    eventually(|| audio.last_output().fades == vec![(1_000, 720)]).await;

    // The next response starts now, not behind the interrupted audio.
    remote.send(audio_delta(480));
    eventually(|| audio.last_output().chunks.len() == 3).await;
    assert_eq!(audio.last_output().chunks[2], (1_000, 480));

    assert!(drain(&mut events).contains(&SessionEvent::Interrupted));
    session.disconnect().await;
}

#[tokio::test]
async fn test_text_turn_and_transcripts() {
    init_tracing();
    let mut server = FakeRealtime::start().await;
    let audio = TestAudio::new();
    let (mut session, mut events) = session_with(config(server.endpoint()), audio.clone());

    session.connect(ConnectOptions::default()).await.unwrap();
    let mut remote = server.accept().await;
    remote.recv().await;

    session.send_text("what time is it").await.unwrap();
    assert_eq!(session.state(), ConversationState::Processing);
    assert_eq!(session.status_text(), "Thinking...");
    let submitted = remote.recv().await;
    assert_eq!(submitted, json!({"type": "text.submit", "text": "what time is it"}));

    remote.send(json!({"type": "transcript.user.delta", "text": "what time is it"}));
    remote.send(json!({"type": "transcript.assistant.delta", "text": "Noon."}));
    wait_for_state(&session, ConversationState::Speaking).await;
    remote.send(json!({"type": "response.done"}));
    wait_for_state(&session, ConversationState::Listening).await;

    let seen = drain(&mut events);
    assert!(seen.contains(&SessionEvent::Transcript {
        text: "what time is it".into(),
        is_user: true
    }));
    assert!(seen.contains(&SessionEvent::Transcript {
        text: "Noon.".into(),
        is_user: false
    }));
    session.disconnect().await;
}

#[tokio::test]
async fn test_malformed_frames_are_dropped() {
    init_tracing();
    let mut server = FakeRealtime::start().await;
    let audio = TestAudio::new();
    let (mut session, mut events) = session_with(config(server.endpoint()), audio.clone());

    session.connect(ConnectOptions::default()).await.unwrap();
    let mut remote = server.accept().await;
    remote.recv().await;

    remote.send_raw("{not json");
    remote.send(json!({"type": "audio.delta", "bytes": "@@@"}));
    remote.send(json!({"type": "audio.delta", "bytes": bytes_to_transport_text(&[1, 2, 3])}));
    remote.send(json!({"type": "rate_limits.updated"}));
    remote.send(json!({"type": "transcript.user.delta", "text": "still here"}));

    let transcript = SessionEvent::Transcript {
        text: "still here".into(),
        is_user: true,
    };
    let mut seen = Vec::new();
    eventually(|| {
        seen.extend(drain(&mut events));
        seen.contains(&transcript)
    })
    .await;

    assert!(session.is_connected());
    assert_eq!(session.state(), ConversationState::Listening);
    assert!(audio.last_output().chunks.is_empty());
    session.disconnect().await;
}

#[tokio::test]
async fn test_remote_error_forces_error_then_disconnected() {
    init_tracing();
    let mut server = FakeRealtime::start().await;
    let audio = TestAudio::new();
    let (mut session, mut events) = session_with(config(server.endpoint()), audio.clone());

    session.connect(ConnectOptions::default()).await.unwrap();
    session.start_capture().await.unwrap();
    let mut remote = server.accept().await;
    remote.recv().await;

    remote.send(json!({"type": "error", "message": "insufficient_quota"}));
    wait_for_state(&session, ConversationState::Disconnected).await;
    remote.closed().await;

    let seen = drain(&mut events);
    let error_at = seen
        .iter()
        .position(|e| *e == SessionEvent::StatusChanged(ConversationState::Error))
        .unwrap();
    let disconnected_at = seen
        .iter()
        .position(|e| *e == SessionEvent::StatusChanged(ConversationState::Disconnected))
        .unwrap();
    assert!(error_at < disconnected_at);
    assert!(seen.contains(&SessionEvent::Error("insufficient_quota".into())));

    assert_eq!(audio.mic_closes.load(Ordering::SeqCst), 1);
    assert_eq!(audio.last_output().closes, 1);
    assert!(!session.is_capturing());

    session.disconnect().await;
    assert_eq!(audio.last_output().closes, 1);
}

#[tokio::test]
async fn test_remote_close_disconnects() {
    init_tracing();
    let mut server = FakeRealtime::start().await;
    let audio = TestAudio::new();
    let (mut session, mut events) = session_with(config(server.endpoint()), audio.clone());

    session.connect(ConnectOptions::default()).await.unwrap();
    let mut remote = server.accept().await;
    remote.recv().await;

    remote.close();
    wait_for_state(&session, ConversationState::Disconnected).await;
    eventually(|| !session.is_connected()).await;
    assert_eq!(audio.last_output().closes, 1);
    assert!(drain(&mut events).contains(&SessionEvent::Disconnected));

    // A caller may retry.
    session.connect(ConnectOptions::default()).await.unwrap();
    assert_eq!(session.state(), ConversationState::Listening);
    session.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    init_tracing();
    let mut server = FakeRealtime::start().await;
    let audio = TestAudio::new();
    let (mut session, mut events) = session_with(config(server.endpoint()), audio.clone());

    session.connect(ConnectOptions::default()).await.unwrap();
    session.start_capture().await.unwrap();
    session.start_capture().await.unwrap();
    let mut remote = server.accept().await;
    remote.recv().await;

    session.disconnect().await;
    session.disconnect().await;
    session.stop_capture().await;
    remote.closed().await;

    assert_eq!(session.state(), ConversationState::Disconnected);
    assert_eq!(audio.mic_closes.load(Ordering::SeqCst), 1);
    assert_eq!(audio.last_output().closes, 1);
    assert_eq!(
        drain(&mut events)
            .iter()
            .filter(|e| **e == SessionEvent::Disconnected)
            .count(),
        1
    );
}

#[tokio::test]
async fn test_second_connect_replaces_first_session() {
    init_tracing();
    let mut server = FakeRealtime::start().await;
    let audio = TestAudio::new();
    let (mut session, _events) = session_with(config(server.endpoint()), audio.clone());

    session.connect(ConnectOptions::default()).await.unwrap();
    let first_id = session.session_id();
    let mut first = server.accept().await;
    first.recv().await;

    session.connect(ConnectOptions::default()).await.unwrap();
    let mut second = server.accept().await;
    second.recv().await;
    first.closed().await;

    assert_ne!(session.session_id(), first_id);
    assert_eq!(audio.output(0).closes, 1);
    assert_eq!(audio.output(1).closes, 0);
    assert_eq!(session.state(), ConversationState::Listening);
    session.disconnect().await;
}

#[tokio::test]
async fn test_microphone_failure_keeps_session() {
    init_tracing();
    let mut server = FakeRealtime::start().await;
    let denied = CaptureError::PermissionDenied("denied by user".into());
    let audio = TestAudio::with_broken_mic(denied);
    let (mut session, mut events) = session_with(config(server.endpoint()), audio.clone());

    session.connect(ConnectOptions::default()).await.unwrap();
    let mut remote = server.accept().await;
    remote.recv().await;

    let err = session.start_capture().await.unwrap_err();
    assert!(matches!(
        err,
        VoiceError::Capture(CaptureError::PermissionDenied(_))
    ));
    assert!(err.user_message().starts_with("Microphone error:"));
    assert!(!session.is_capturing());

    // Playback still works.
    remote.send(audio_delta(480));
    wait_for_state(&session, ConversationState::Speaking).await;
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, SessionEvent::Error(m) if m.starts_with("Microphone error:"))));
    session.disconnect().await;
}

#[tokio::test]
async fn test_missing_credential_fails_fast() {
    init_tracing();
    let server = FakeRealtime::start().await;
    let (observer, mut events) = ChannelObserver::new();
    let mut session = VoiceSession::new(
        config(server.endpoint()),
        Arc::new(StaticCredential::unavailable()),
        TestAudio::new(),
        Arc::new(observer),
    );

    let err = session.connect(ConnectOptions::default()).await.unwrap_err();
    assert!(matches!(
        err,
        VoiceError::Connect(ConnectError::CredentialUnavailable)
    ));
    assert_eq!(err.user_message(), "Session expired or balance exhausted");
    assert_eq!(session.state(), ConversationState::Error);
    assert!(!drain(&mut events).contains(&SessionEvent::Connected));
}

#[tokio::test]
async fn test_connect_timeout() {
    init_tracing();
    // Accepts TCP and never completes the upgrade.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((tcp, _)) = listener.accept().await {
            held.push(tcp);
        }
    });

    let mut cfg = config(format!("ws://{addr}"));
    cfg.connect_timeout_ms = 200;
    let audio = TestAudio::new();
    let (mut session, mut events) = session_with(cfg, audio.clone());

    let err = session.connect(ConnectOptions::default()).await.unwrap_err();
    assert!(matches!(err, VoiceError::Connect(ConnectError::Timeout(_))));
    assert_eq!(err.user_message(), "Connection timed out");
    assert_eq!(session.state(), ConversationState::Disconnected);
    assert!(audio.outputs.lock().unwrap().is_empty());
    assert!(drain(&mut events).contains(&SessionEvent::Error("Connection timed out".into())));
}

#[tokio::test]
async fn test_slow_device_open_does_not_stall_runtime() {
    init_tracing();
    let mut server = FakeRealtime::start().await;
    let audio = TestAudio::with_slow_devices(Duration::from_millis(300));
    let (mut session, _events) = session_with(config(server.endpoint()), audio.clone());

    // Single-threaded runtime: this only ticks while nothing blocks it.
    let ticks = Arc::new(AtomicUsize::new(0));
    let ticker = tokio::spawn({
        let ticks = Arc::clone(&ticks);
        async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                ticks.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    session.connect(ConnectOptions::default()).await.unwrap();
    let mut remote = server.accept().await;
    remote.recv().await;
    session.start_capture().await.unwrap();
    ticker.abort();

    assert!(session.is_capturing());
    assert_eq!(remote.recv().await["type"], "audio.append");
    let ticks = ticks.load(Ordering::SeqCst);
    assert!(ticks >= 20, "runtime stalled during device open ({ticks} ticks)");
    session.disconnect().await;
}

#[tokio::test]
async fn test_out_of_range_temperature_is_rejected_before_connecting() {
    init_tracing();
    let server = FakeRealtime::start().await;
    let audio = TestAudio::new();
    let (mut session, mut events) = session_with(config(server.endpoint()), audio.clone());

    let err = session
        .connect(ConnectOptions::default().with_temperature(5.0))
        .await
        .unwrap_err();
    assert!(matches!(err, VoiceError::Config(_)));
    assert_eq!(session.state(), ConversationState::Idle);
    assert!(session.session_id().is_none());
    assert!(audio.outputs.lock().unwrap().is_empty());
    assert!(drain(&mut events).is_empty());
}

#[tokio::test]
#[ignore] // Requires audio hardware and a running credential endpoint
async fn test_native_devices_smoke() {
    init_tracing();
    let config = VoiceConfig::load().expect("config");
    let credentials =
        cadence_voice::HttpCredentialProvider::new(config.credential_url.clone(), None).unwrap();
    let (observer, _events) = ChannelObserver::new();
    let mut session = VoiceSession::new(
        config,
        Arc::new(credentials),
        Arc::new(cadence_voice::NativeAudio),
        Arc::new(observer),
    );

    session.connect(ConnectOptions::default()).await.unwrap();
    session.start_capture().await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    session.disconnect().await;
}
