//! Generated content for demos and tests.
//!
//! All synthetic backends run on tokio time, so a paused test runtime makes
//! them fully deterministic. Their native clock starts at an arbitrary
//! origin and can run fast or slow, which exercises calibration and drift
//! correction the same way real hardware does.

use std::f64::consts::TAU;
use std::time::Duration;

use syncap_common::config::{AudioConfig, ScreenConfig};
use syncap_common::error::{RecorderError, RecorderResult};
use syncap_input_tracker::{InputBackend, WindowBackend};
use syncap_sample_model::{
    AudioBlock, ButtonState, Captured, InputEvent, MouseButton, VideoFrame, WindowEvent,
};
use tokio::time::Instant;

use super::{AudioSource, FrameSource};

const DEFAULT_WIDTH: u32 = 160;
const DEFAULT_HEIGHT: u32 = 90;
const TONE_HZ: f64 = 440.0;

/// Fixed-rate schedule with a fake native clock.
///
/// Slot `k` falls due `k * interval` after [`restart`](Self::restart) and is
/// stamped with the native clock reading at that moment.
#[derive(Debug, Clone)]
pub struct Pacer {
    started: Instant,
    origin_ns: u64,
    drift_ppm: f64,
    interval: Duration,
    next_slot: u64,
    limit: Option<u64>,
    silent: Option<(u64, u64)>,
    fail_at: Option<u64>,
    clock_available: bool,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            started: Instant::now(),
            origin_ns: 7_000_000_000,
            drift_ppm: 0.0,
            interval: interval.max(Duration::from_nanos(1)),
            next_slot: 0,
            limit: None,
            silent: None,
            fail_at: None,
            clock_available: true,
        }
    }

    /// Native clock reading at the start of the schedule.
    pub fn with_origin(mut self, origin_ns: u64) -> Self {
        self.origin_ns = origin_ns;
        self
    }

    /// Make the native clock run fast (positive) or slow (negative).
    pub fn with_drift_ppm(mut self, drift_ppm: f64) -> Self {
        self.drift_ppm = drift_ppm;
        self
    }

    /// Produce exactly `slots` slots, then report exhaustion.
    pub fn with_limit(mut self, slots: u64) -> Self {
        self.limit = Some(slots);
        self
    }

    /// Slots in `from..to` fall due but produce nothing.
    pub fn with_silence(mut self, from: u64, to: u64) -> Self {
        self.silent = Some((from, to));
        self
    }

    /// Reading slot `slot` fails with a capture error.
    pub fn failing_at(mut self, slot: u64) -> Self {
        self.fail_at = Some(slot);
        self
    }

    /// Make the native clock unreadable, so calibration fails.
    pub fn with_unavailable_clock(mut self) -> Self {
        self.clock_available = false;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Restart the schedule at slot 0 from now.
    pub fn restart(&mut self) {
        self.started = Instant::now();
        self.next_slot = 0;
    }

    pub fn is_exhausted(&self) -> bool {
        self.limit.is_some_and(|limit| self.next_slot >= limit)
    }

    pub fn native_now_ns(&self) -> RecorderResult<u64> {
        if !self.clock_available {
            return Err(RecorderError::capture("synthetic clock unavailable"));
        }
        Ok(self.to_native(self.started.elapsed()))
    }

    /// Next due slot and its native timestamp.
    pub fn next_due(&mut self) -> RecorderResult<Option<(u64, u64)>> {
        loop {
            if self.is_exhausted() {
                return Ok(None);
            }
            let slot = self.next_slot;
            let due = self.interval.saturating_mul(slot.min(u32::MAX as u64) as u32);
            if self.started.elapsed() < due {
                return Ok(None);
            }
            if self.fail_at == Some(slot) {
                return Err(RecorderError::capture(format!("synthetic read failed at slot {slot}")));
            }
            self.next_slot += 1;
            if self.silent.is_some_and(|(from, to)| (from..to).contains(&slot)) {
                continue;
            }
            return Ok(Some((slot, self.to_native(due))));
        }
    }

    fn to_native(&self, elapsed: Duration) -> u64 {
        let scaled = elapsed.as_nanos() as f64 * (1.0 + self.drift_ppm / 1_000_000.0);
        self.origin_ns.saturating_add(scaled.round() as u64)
    }
}

/// Moving-bar test pattern in raw BGRx.
pub struct SyntheticFrames {
    pacer: Pacer,
    width: u32,
    height: u32,
}

impl SyntheticFrames {
    pub fn new(pacer: Pacer, width: u32, height: u32) -> Self {
        Self {
            pacer,
            width: width.max(1),
            height: height.max(1),
        }
    }

    pub fn from_config(config: &ScreenConfig) -> Self {
        Self::new(
            Pacer::new(config.frame_interval()),
            config.width.unwrap_or(DEFAULT_WIDTH),
            config.height.unwrap_or(DEFAULT_HEIGHT),
        )
    }

    fn render(&self, slot: u64) -> VideoFrame {
        let (w, h) = (self.width as usize, self.height as usize);
        let bar = (slot as usize * 4) % w;
        let mut data = vec![0u8; w * h * 4];
        for (i, px) in data.chunks_exact_mut(4).enumerate() {
            let x = i % w;
            let lit = x >= bar && x < bar + 8;
            px[0] = if lit { 0xFF } else { (x * 255 / w) as u8 };
            px[1] = if lit { 0xFF } else { ((i / w) * 255 / h) as u8 };
            px[2] = if lit { 0xFF } else { 0x40 };
        }
        VideoFrame {
            width: self.width,
            height: self.height,
            codec: "raw-bgrx".to_string(),
            data,
        }
    }
}

impl FrameSource for SyntheticFrames {
    fn start(&mut self) -> RecorderResult<()> {
        self.pacer.restart();
        Ok(())
    }

    fn next_frame(&mut self) -> RecorderResult<Option<Captured<VideoFrame>>> {
        Ok(self
            .pacer
            .next_due()?
            .map(|(slot, native_ns)| Captured::new(native_ns, self.render(slot))))
    }

    fn native_clock_ns(&mut self) -> RecorderResult<u64> {
        self.pacer.native_now_ns()
    }

    fn name(&self) -> &str {
        "synthetic-screen"
    }

    fn is_exhausted(&self) -> bool {
        self.pacer.is_exhausted()
    }
}

/// 440 Hz sine in interleaved S16LE.
pub struct SyntheticAudio {
    pacer: Pacer,
    sample_rate: u32,
    channels: u16,
    block_frames: u32,
}

impl SyntheticAudio {
    pub fn new(pacer: Pacer, sample_rate: u32, channels: u16, block_frames: u32) -> Self {
        Self {
            pacer,
            sample_rate: sample_rate.max(1),
            channels: channels.max(1),
            block_frames,
        }
    }

    pub fn from_config(config: &AudioConfig) -> Self {
        Self::new(
            Pacer::new(config.block_duration()),
            config.sample_rate,
            config.channels,
            config.block_frames,
        )
    }

    fn render(&self, slot: u64) -> AudioBlock {
        let first = slot * self.block_frames as u64;
        let mut data = Vec::with_capacity(self.block_frames as usize * self.channels as usize * 2);
        for n in 0..self.block_frames as u64 {
            let t = (first + n) as f64 / self.sample_rate as f64;
            let value = ((TAU * TONE_HZ * t).sin() * i16::MAX as f64 * 0.25) as i16;
            for _ in 0..self.channels {
                data.extend_from_slice(&value.to_le_bytes());
            }
        }
        AudioBlock {
            sample_rate: self.sample_rate,
            channels: self.channels,
            frames: self.block_frames,
            data,
        }
    }
}

impl AudioSource for SyntheticAudio {
    fn start(&mut self) -> RecorderResult<()> {
        self.pacer.restart();
        Ok(())
    }

    fn next_block(&mut self) -> RecorderResult<Option<Captured<AudioBlock>>> {
        Ok(self
            .pacer
            .next_due()?
            .map(|(slot, native_ns)| Captured::new(native_ns, self.render(slot))))
    }

    fn native_clock_ns(&mut self) -> RecorderResult<u64> {
        self.pacer.native_now_ns()
    }

    fn name(&self) -> &str {
        "synthetic-audio"
    }

    fn is_exhausted(&self) -> bool {
        self.pacer.is_exhausted()
    }
}

/// Pointer circling the desktop every 2 s, with a left click each lap.
pub struct SyntheticInput {
    pacer: Pacer,
}

const INPUT_SLOTS_PER_LAP: u64 = 40;

impl SyntheticInput {
    pub fn new() -> Self {
        Self::with_pacer(Pacer::new(Duration::from_millis(50)).with_origin(3_000_000_000))
    }

    pub fn with_pacer(pacer: Pacer) -> Self {
        Self { pacer }
    }

    fn event(slot: u64) -> InputEvent {
        let phase = (slot % INPUT_SLOTS_PER_LAP) as f64 / INPUT_SLOTS_PER_LAP as f64;
        let x = 0.5 + 0.3 * (TAU * phase).cos();
        let y = 0.5 + 0.3 * (TAU * phase).sin();
        match slot % INPUT_SLOTS_PER_LAP {
            0 if slot > 0 => InputEvent::click(MouseButton::Left, ButtonState::Down, x, y),
            1 if slot > 1 => InputEvent::click(MouseButton::Left, ButtonState::Up, x, y),
            _ => InputEvent::pointer(x, y),
        }
    }
}

impl Default for SyntheticInput {
    fn default() -> Self {
        Self::new()
    }
}

impl InputBackend for SyntheticInput {
    fn poll(&mut self) -> RecorderResult<Option<Captured<InputEvent>>> {
        Ok(self
            .pacer
            .next_due()?
            .map(|(slot, native_ns)| Captured::new(native_ns, Self::event(slot))))
    }

    fn native_clock_ns(&mut self) -> RecorderResult<u64> {
        self.pacer.native_now_ns()
    }

    fn name(&self) -> &str {
        "synthetic-input"
    }

    fn is_available(&self) -> bool {
        true
    }
}

/// Focus moving between three fake windows every 3 s.
pub struct SyntheticWindow {
    pacer: Pacer,
    pending_geometry: Option<Captured<WindowEvent>>,
}

const WINDOWS: [(&str, &str); 3] = [
    ("Terminal", "org.syncap.Terminal"),
    ("Editor", "org.syncap.Editor"),
    ("Browser", "org.syncap.Browser"),
];

impl SyntheticWindow {
    pub fn new() -> Self {
        Self::with_pacer(Pacer::new(Duration::from_secs(3)).with_origin(11_000_000_000))
    }

    pub fn with_pacer(pacer: Pacer) -> Self {
        Self {
            pacer,
            pending_geometry: None,
        }
    }
}

impl Default for SyntheticWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowBackend for SyntheticWindow {
    fn poll(&mut self) -> RecorderResult<Option<Captured<WindowEvent>>> {
        if let Some(geometry) = self.pending_geometry.take() {
            return Ok(Some(geometry));
        }
        let Some((slot, native_ns)) = self.pacer.next_due()? else {
            return Ok(None);
        };
        let (title, app_id) = WINDOWS[(slot % WINDOWS.len() as u64) as usize];
        let offset = (slot % WINDOWS.len() as u64) as i32 * 40;
        self.pending_geometry = Some(Captured::new(
            native_ns,
            WindowEvent::Geometry {
                x: offset,
                y: offset,
                width: 1280,
                height: 720,
            },
        ));
        Ok(Some(Captured::new(
            native_ns,
            WindowEvent::focus(title, Some(app_id.to_string()), Some(4_000 + slot as u32)),
        )))
    }

    fn native_clock_ns(&mut self) -> RecorderResult<u64> {
        self.pacer.native_now_ns()
    }

    fn name(&self) -> &str {
        "synthetic-window"
    }
}
