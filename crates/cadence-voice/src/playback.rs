//! Gapless playback of assistant speech, with barge-in.
//!
//! The scheduler owns one output device and one cursor: the next free frame on the
//! device timeline. Every decoded chunk starts at `max(cursor, device clock)` and
//! pushes the cursor forward by its length, so consecutive chunks abut exactly.
//! `interrupt()` fades whatever is already queued and pulls the cursor back to the
//! device clock; `shutdown()` closes the device for good.

use crate::codec::decode_pcm16_to_float;
use crate::error::CodecError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Convert a frame count to wall time at `sample_rate`.
pub fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let nanos = frames as u128 * 1_000_000_000u128 / sample_rate as u128;
    Duration::from_nanos(nanos as u64)
}

/// Convert wall time to a whole number of frames at `sample_rate`.
pub fn duration_to_frames(duration: Duration, sample_rate: u32) -> u64 {
    (duration.as_nanos() * sample_rate as u128 / 1_000_000_000u128) as u64
}

/// Decoded PCM bound to an absolute start frame on the device timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledChunk {
    pub start_frame: u64,
    pub samples: Vec<f32>,
}

impl ScheduledChunk {
    pub fn frames(&self) -> u64 {
        self.samples.len() as u64
    }

    pub fn end_frame(&self) -> u64 {
        self.start_frame + self.frames()
    }
}

/// Where a chunk landed on the timeline (returned to callers; the samples go to the device).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSlot {
    pub start_frame: u64,
    pub frames: u64,
    pub sample_rate: u32,
}

impl ChunkSlot {
    pub fn end_frame(&self) -> u64 {
        self.start_frame + self.frames
    }

    pub fn start_time(&self) -> Duration {
        frames_to_duration(self.start_frame, self.sample_rate)
    }

    pub fn duration(&self) -> Duration {
        frames_to_duration(self.frames, self.sample_rate)
    }
}

/// A mono output timeline. The clock is the number of frames the device has
/// actually rendered since it was opened.
pub trait OutputDevice: Send {
    fn sample_rate(&self) -> u32;

    fn clock(&self) -> u64;

    /// Hand a chunk to the renderer. Chunks arrive in timeline order.
    fn enqueue(&mut self, chunk: ScheduledChunk);

    /// Ramp everything enqueued so far to silence over `frames`, then drop it.
    /// Chunks enqueued afterwards play at full gain.
    fn fade_out(&mut self, frames: u64);

    /// Release the device. Called at most once by the scheduler.
    fn close(&mut self);
}

/// Playback capability consumed by the conversation state machine.
pub trait AudioSink: Send {
    /// Decode and schedule one PCM16 chunk. `Ok(None)` after shutdown.
    fn schedule_chunk(&mut self, pcm: &[u8]) -> Result<Option<ChunkSlot>, CodecError>;

    /// Silence in-flight and pending audio; the next chunk starts "now".
    fn interrupt(&mut self);

    /// Release the output device. Idempotent.
    fn shutdown(&mut self);

    /// True while scheduled audio has not finished rendering.
    fn is_playing(&self) -> bool;
}

pub struct PlaybackScheduler {
    device: Box<dyn OutputDevice>,
    sample_rate: u32,
    cursor: u64,
    fade_frames: u64,
    closed: bool,
}

impl PlaybackScheduler {
    /// Take ownership of a freshly opened device. Reconnecting always builds a new
    /// scheduler around a new device.
    pub fn new(device: Box<dyn OutputDevice>, fade_out: Duration) -> Self {
        let sample_rate = device.sample_rate();
        let cursor = device.clock();
        info!("🔊 Playback scheduler ready ({}Hz, fade {:?})", sample_rate, fade_out);
        Self {
            device,
            sample_rate,
            cursor,
            fade_frames: duration_to_frames(fade_out, sample_rate).max(1),
            closed: false,
        }
    }

    /// Next free frame on the timeline.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn device_clock(&self) -> u64 {
        self.device.clock()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed
    }

    /// Wall time until the last scheduled frame has rendered. `None` when idle.
    pub fn time_until_drained(&self) -> Option<Duration> {
        if self.closed {
            return None;
        }
        let now = self.device.clock();
        if now >= self.cursor {
            None
        } else {
            Some(frames_to_duration(self.cursor - now, self.sample_rate))
        }
    }
}

impl AudioSink for PlaybackScheduler {
    fn schedule_chunk(&mut self, pcm: &[u8]) -> Result<Option<ChunkSlot>, CodecError> {
        if self.closed {
            debug!("Playback: chunk after shutdown ignored ({} bytes)", pcm.len());
            return Ok(None);
        }

        let samples = decode_pcm16_to_float(pcm)?;
        if samples.is_empty() {
            return Ok(None);
        }

        let start_frame = self.cursor.max(self.device.clock());
        let chunk = ScheduledChunk {
            start_frame,
            samples,
        };
        let slot = ChunkSlot {
            start_frame,
            frames: chunk.frames(),
            sample_rate: self.sample_rate,
        };
        self.cursor = chunk.end_frame();
        self.device.enqueue(chunk);

        debug!(
            "Playback: scheduled {} frames at {} (cursor {})",
            slot.frames, slot.start_frame, self.cursor
        );
        Ok(Some(slot))
    }

    fn interrupt(&mut self) {
        if self.closed {
            return;
        }
        let now = self.device.clock();
        self.device.fade_out(self.fade_frames);
        self.cursor = now;
        info!("⏹️ Playback interrupted at frame {}", now);
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.device.close();
        info!("🔇 Playback device released");
    }

    fn is_playing(&self) -> bool {
        !self.closed && self.device.clock() < self.cursor
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Headless output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum ClockSource {
    Manual(Arc<AtomicU64>),
    Realtime { origin: Instant, sample_rate: u32 },
}

/// Clock for [`VirtualOutput`]: either stepped by hand or free-running from wall time.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    source: ClockSource,
}

impl VirtualClock {
    pub fn manual() -> Self {
        Self {
            source: ClockSource::Manual(Arc::new(AtomicU64::new(0))),
        }
    }

    pub fn realtime(sample_rate: u32) -> Self {
        Self {
            source: ClockSource::Realtime {
                origin: Instant::now(),
                sample_rate,
            },
        }
    }

    pub fn now(&self) -> u64 {
        match &self.source {
            ClockSource::Manual(frames) => frames.load(Ordering::Acquire),
            ClockSource::Realtime {
                origin,
                sample_rate,
            } => duration_to_frames(origin.elapsed(), *sample_rate),
        }
    }

    /// Step a manual clock forward. No effect on a realtime clock.
    pub fn advance(&self, frames: u64) {
        if let ClockSource::Manual(f) = &self.source {
            f.fetch_add(frames, Ordering::AcqRel);
        }
    }
}

/// What a [`VirtualOutput`] was asked to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualLog {
    /// `(start_frame, frames)` per enqueued chunk
    pub chunks: Vec<(u64, u64)>,
    /// `(clock_at_fade, fade_frames)` per fade
    pub fades: Vec<(u64, u64)>,
    pub closes: usize,
}

/// Output device without hardware. Records every request; used on headless hosts
/// and in tests.
pub struct VirtualOutput {
    sample_rate: u32,
    clock: VirtualClock,
    log: Arc<Mutex<VirtualLog>>,
}

impl VirtualOutput {
    pub fn new(sample_rate: u32, clock: VirtualClock) -> Self {
        Self {
            sample_rate,
            clock,
            log: Arc::new(Mutex::new(VirtualLog::default())),
        }
    }

    /// Shared view of the request log, readable after the device moved into a scheduler.
    pub fn log_handle(&self) -> Arc<Mutex<VirtualLog>> {
        Arc::clone(&self.log)
    }

    fn record(&self, f: impl FnOnce(&mut VirtualLog)) {
        let mut log = self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut log);
    }
}

impl OutputDevice for VirtualOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn clock(&self) -> u64 {
        self.clock.now()
    }

    fn enqueue(&mut self, chunk: ScheduledChunk) {
        self.record(|log| log.chunks.push((chunk.start_frame, chunk.frames())));
    }

    fn fade_out(&mut self, frames: u64) {
        let at = self.clock.now();
        self.record(|log| log.fades.push((at, frames)));
    }

    fn close(&mut self) {
        self.record(|log| log.closes += 1);
    }
}
