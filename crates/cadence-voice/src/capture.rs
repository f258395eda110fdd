//! **CaptureEngine** — microphone blocks to outbound PCM16 frames.
//!
//! The source delivers fixed-size f32 blocks from its own hardware thread over an
//! unbounded channel (no encoding in the callback). A pump task encodes each block
//! and hands it to the registered frame callback in capture order.

use crate::codec::encode_float_to_pcm16;
use crate::config::AudioSettings;
use crate::error::CaptureError;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Encoded capture block, ready for `audio.append`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub sample_count: usize,
    /// PCM16 LE bytes
    pub payload: Vec<u8>,
}

/// What the capture device is asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOptions {
    pub sample_rate: u32,
    pub block_size: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl From<&AudioSettings> for CaptureOptions {
    fn from(a: &AudioSettings) -> Self {
        Self {
            sample_rate: a.sample_rate,
            block_size: a.capture_block_size,
            echo_cancellation: a.echo_cancellation,
            noise_suppression: a.noise_suppression,
            auto_gain_control: a.auto_gain_control,
        }
    }
}

/// A raw microphone. Implementations own the device exclusively.
pub trait AudioSource: Send {
    /// Acquire the device and start sending blocks of exactly `options.block_size`
    /// samples. Must not block inside the hardware callback.
    fn open(
        &mut self,
        options: &CaptureOptions,
        blocks: mpsc::UnboundedSender<Vec<f32>>,
    ) -> Result<(), CaptureError>;

    /// Release the device. Safe when not open.
    fn close(&mut self);
}

/// Receives each encoded frame.
pub type FrameCallback = Arc<dyn Fn(AudioFrame) + Send + Sync>;

pub struct CaptureEngine {
    source: Box<dyn AudioSource>,
    options: CaptureOptions,
    pump: Option<JoinHandle<()>>,
}

impl CaptureEngine {
    pub fn new(source: Box<dyn AudioSource>, options: CaptureOptions) -> Self {
        Self {
            source,
            options,
            pump: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.pump.is_some()
    }

    /// Open the microphone and start forwarding frames. No-op when already active.
    /// Must be called inside a tokio runtime.
    pub fn start(&mut self, on_frame: FrameCallback) -> Result<(), CaptureError> {
        if self.is_active() {
            return Ok(());
        }

        info!(
            "🎤 Starting capture ({}Hz, {} samples/block)",
            self.options.sample_rate, self.options.block_size
        );

        let (block_tx, mut block_rx) = mpsc::unbounded_channel::<Vec<f32>>();
        self.source.open(&self.options, block_tx)?;

        let sample_rate = self.options.sample_rate;
        self.pump = Some(tokio::spawn(async move {
            while let Some(block) = block_rx.recv().await {
                let frame = AudioFrame {
                    sample_rate,
                    sample_count: block.len(),
                    payload: encode_float_to_pcm16(&block),
                };
                on_frame(frame);
            }
            debug!("Capture pump ended");
        }));

        info!("✅ Capture started");
        Ok(())
    }

    /// Stop forwarding and release the microphone. Idempotent.
    pub fn stop(&mut self) {
        let Some(pump) = self.pump.take() else {
            return;
        };
        // Stop forwarding first so no frame leaves after stop() returns.
        pump.abort();
        self.source.close();
        info!("🛑 Capture stopped");
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
