//! Audio capture and playback using CPAL and Rodio
//!
//! Native implementations of [`AudioSource`] and [`OutputDevice`]. cpal and rodio
//! streams are `!Send` on some platforms, so each one lives on a dedicated thread
//! that holds it until told to stop; the handles returned here are `Send`.

use crate::capture::{AudioSource, CaptureOptions};
use crate::error::{CaptureError, VoiceError, VoiceResult};
use crate::playback::{OutputDevice, ScheduledChunk, VirtualClock, VirtualOutput};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Opens fresh devices for each session / capture start.
///
/// Opening blocks until the device is running; the session calls it from the
/// blocking pool.
pub trait AudioBackend: Send + Sync {
    fn open_output(&self, sample_rate: u32) -> VoiceResult<Box<dyn OutputDevice>>;

    fn input(&self) -> Box<dyn AudioSource>;
}

/// Default host devices: cpal microphone, rodio speaker.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeAudio;

impl AudioBackend for NativeAudio {
    fn open_output(&self, sample_rate: u32) -> VoiceResult<Box<dyn OutputDevice>> {
        Ok(Box::new(RodioOutput::open(sample_rate)?))
    }

    fn input(&self) -> Box<dyn AudioSource> {
        Box::new(CpalMicrophone::new())
    }
}

/// No hardware: wall-clock virtual output and no microphone.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessAudio;

impl AudioBackend for HeadlessAudio {
    fn open_output(&self, sample_rate: u32) -> VoiceResult<Box<dyn OutputDevice>> {
        Ok(Box::new(VirtualOutput::new(
            sample_rate,
            VirtualClock::realtime(sample_rate),
        )))
    }

    fn input(&self) -> Box<dyn AudioSource> {
        Box::new(NoMicrophone)
    }
}

struct NoMicrophone;

impl AudioSource for NoMicrophone {
    fn open(
        &mut self,
        _options: &CaptureOptions,
        _blocks: mpsc::UnboundedSender<Vec<f32>>,
    ) -> Result<(), CaptureError> {
        Err(CaptureError::DeviceUnavailable(
            "headless backend has no microphone".to_string(),
        ))
    }

    fn close(&mut self) {}
}

/// List available input devices
pub fn list_input_devices() -> Result<Vec<String>, CaptureError> {
    let host = cpal::default_host();
    let devices = host.input_devices()?;

    let mut device_names = Vec::new();
    for device in devices {
        if let Ok(name) = device.name() {
            device_names.push(name);
        }
    }

    Ok(device_names)
}

// ---------------------------------------------------------------------------
// Microphone
// ---------------------------------------------------------------------------

/// Stop signal for a thread that holds a `!Send` stream. The thread drops the
/// stream itself, so stopping never waits on the audio host.
struct StreamThread {
    stop_tx: std_mpsc::Sender<()>,
}

impl StreamThread {
    fn stop(self) {
        let _ = self.stop_tx.send(());
    }
}

/// Default input device via cpal.
#[derive(Default)]
pub struct CpalMicrophone {
    worker: Option<StreamThread>,
}

impl CpalMicrophone {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioSource for CpalMicrophone {
    fn open(
        &mut self,
        options: &CaptureOptions,
        blocks: mpsc::UnboundedSender<Vec<f32>>,
    ) -> Result<(), CaptureError> {
        if self.worker.is_some() {
            return Ok(());
        }

        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), CaptureError>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let options = options.clone();

        thread::Builder::new()
            .name("cadence-capture".to_string())
            .spawn(move || match build_input_stream(&options, blocks) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Hold the stream until close() (or the engine is dropped).
                    let _ = stop_rx.recv();
                    drop(stream);
                    debug!("Capture stream dropped");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| CaptureError::Stream(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(StreamThread { stop_tx });
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CaptureError::Stream("capture thread exited".to_string())),
        }
    }

    fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_input_stream(
    options: &CaptureOptions,
    blocks: mpsc::UnboundedSender<Vec<f32>>,
) -> Result<cpal::Stream, CaptureError> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| CaptureError::DeviceUnavailable("No input device available".to_string()))?;

    info!(
        "📱 Using input device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    if options.echo_cancellation || options.noise_suppression || options.auto_gain_control {
        // cpal exposes no DSP controls; the OS voice-processing defaults apply.
        debug!("Echo cancellation / noise suppression / AGC left to the host audio stack");
    }

    let mono = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(options.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    match open_blocks(&device, &mono, options.block_size, blocks.clone()) {
        Ok(stream) => Ok(stream),
        Err(e @ CaptureError::PermissionDenied(_)) => Err(e),
        Err(first) => {
            // Some devices refuse mono; take their channel count and downmix.
            let default_channels = device
                .default_input_config()
                .map(|c| c.channels())
                .unwrap_or(2);
            if default_channels <= 1 {
                return Err(first);
            }
            warn!(
                "Mono capture refused ({}), retrying with {} channels",
                first, default_channels
            );
            let multi = cpal::StreamConfig {
                channels: default_channels,
                ..mono
            };
            open_blocks(&device, &multi, options.block_size, blocks)
        }
    }
}

fn open_blocks(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    block_size: usize,
    blocks: mpsc::UnboundedSender<Vec<f32>>,
) -> Result<cpal::Stream, CaptureError> {
    let channels = config.channels.max(1) as usize;
    let mut block = Vec::with_capacity(block_size);

    let stream = device.build_input_stream(
        config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            for frame in data.chunks(channels) {
                let sample = if channels == 1 {
                    frame[0]
                } else {
                    frame.iter().sum::<f32>() / frame.len() as f32
                };
                block.push(sample);

                if block.len() >= block_size {
                    let full = std::mem::replace(&mut block, Vec::with_capacity(block_size));
                    // Receiver gone means capture is stopping; drop silently.
                    let _ = blocks.send(full);
                }
            }
        },
        move |err| {
            warn!("Audio stream error: {}", err);
        },
        None,
    )?;

    stream.play()?;
    Ok(stream)
}

// ---------------------------------------------------------------------------
// Speaker
// ---------------------------------------------------------------------------

/// How often (in frames) the render thread drains its command queue.
const COMMAND_POLL_FRAMES: u64 = 32;

pub(crate) enum RenderCommand {
    Enqueue(ScheduledChunk),
    FadeOut { frames: u64 },
}

struct Playing {
    chunk: ScheduledChunk,
    read: usize,
}

struct Fade {
    remaining: u64,
    total: u64,
    start_gain: f32,
}

impl Fade {
    fn gain(&self) -> f32 {
        self.start_gain * self.remaining as f32 / self.total as f32
    }
}

/// One endless mono source on the rodio mixer. Every frame it yields advances the
/// shared clock, so the clock is exactly what has been rendered.
pub(crate) struct TimelineSource {
    commands: std_mpsc::Receiver<RenderCommand>,
    clock: Arc<AtomicU64>,
    stopped: Arc<AtomicBool>,
    sample_rate: u32,
    position: u64,
    live: VecDeque<Playing>,
    fading: VecDeque<Playing>,
    fade: Option<Fade>,
}

impl TimelineSource {
    pub(crate) fn new(
        commands: std_mpsc::Receiver<RenderCommand>,
        clock: Arc<AtomicU64>,
        stopped: Arc<AtomicBool>,
        sample_rate: u32,
    ) -> Self {
        Self {
            commands,
            clock,
            stopped,
            sample_rate,
            position: 0,
            live: VecDeque::new(),
            fading: VecDeque::new(),
            fade: None,
        }
    }

    fn poll_commands(&mut self) {
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                RenderCommand::Enqueue(chunk) => self.live.push_back(Playing { chunk, read: 0 }),
                RenderCommand::FadeOut { frames } => {
                    let start_gain = self.fade.as_ref().map(Fade::gain).unwrap_or(1.0);
                    self.fading.extend(self.live.drain(..));
                    self.fade = Some(Fade {
                        remaining: frames.max(1),
                        total: frames.max(1),
                        start_gain,
                    });
                }
            }
        }
    }

    /// Next sample from a queue. A chunk starts once the timeline reaches its start
    /// frame and then plays every sample back to back.
    fn pull(queue: &mut VecDeque<Playing>, position: u64) -> f32 {
        while let Some(front) = queue.front_mut() {
            if front.read == 0 && front.chunk.start_frame > position {
                return 0.0;
            }
            if front.read < front.chunk.samples.len() {
                let sample = front.chunk.samples[front.read];
                front.read += 1;
                if front.read == front.chunk.samples.len() {
                    queue.pop_front();
                }
                return sample;
            }
            queue.pop_front();
        }
        0.0
    }
}

impl Iterator for TimelineSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.stopped.load(Ordering::Acquire) {
            return None;
        }
        if self.position % COMMAND_POLL_FRAMES == 0 {
            self.poll_commands();
        }

        let mut out = Self::pull(&mut self.live, self.position);

        if let Some(fade) = self.fade.as_mut() {
            out += fade.gain() * Self::pull(&mut self.fading, self.position);
            fade.remaining -= 1;
            if fade.remaining == 0 {
                self.fading.clear();
                self.fade = None;
            }
        }

        self.position += 1;
        self.clock.store(self.position, Ordering::Release);
        Some(out)
    }
}

impl rodio::Source for TimelineSource {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

/// Default output device via rodio, driven by a [`TimelineSource`].
pub struct RodioOutput {
    sample_rate: u32,
    commands: std_mpsc::Sender<RenderCommand>,
    clock: Arc<AtomicU64>,
    stopped: Arc<AtomicBool>,
    worker: Option<StreamThread>,
}

impl RodioOutput {
    pub fn open(sample_rate: u32) -> VoiceResult<Self> {
        info!("🔊 Initializing audio playback ({}Hz)", sample_rate);

        let (commands, command_rx) = std_mpsc::channel();
        let clock = Arc::new(AtomicU64::new(0));
        let stopped = Arc::new(AtomicBool::new(false));
        let source = TimelineSource::new(
            command_rx,
            Arc::clone(&clock),
            Arc::clone(&stopped),
            sample_rate,
        );

        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<VoiceResult<()>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        thread::Builder::new()
            .name("cadence-playback".to_string())
            .spawn(move || {
                let (stream, handle) = match rodio::OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(VoiceError::AudioDevice(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = handle.play_raw(source) {
                    let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Playback stream dropped");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(VoiceError::Playback("playback thread exited".to_string())),
        }

        info!("✅ Audio playback initialized");
        Ok(Self {
            sample_rate,
            commands,
            clock,
            stopped,
            worker: Some(StreamThread { stop_tx }),
        })
    }
}

impl OutputDevice for RodioOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn clock(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    fn enqueue(&mut self, chunk: ScheduledChunk) {
        let _ = self.commands.send(RenderCommand::Enqueue(chunk));
    }

    fn fade_out(&mut self, frames: u64) {
        let _ = self.commands.send(RenderCommand::FadeOut { frames });
    }

    fn close(&mut self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
    }
}

impl Drop for RodioOutput {
    fn drop(&mut self) {
        self.close();
    }
}
