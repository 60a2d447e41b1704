//! Recorder configuration.
//!
//! The recording core treats a [`RecorderConfig`] as already validated input.
//! Loading from disk and the CLI overrides live at the edges.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RecorderError, RecorderResult};

/// Global recorder configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RecorderConfig {
    /// Where and how artifacts are written.
    pub output: OutputConfig,

    /// Per-source capture settings.
    pub sources: SourcesConfig,

    /// Queue bounds and merge timing.
    pub sync: SyncConfig,

    /// Clock calibration settings.
    pub clock: ClockConfig,

    /// Session lifecycle timeouts and the process-identity handle.
    pub session: SessionSettings,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Output artifact settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Artifact stem. `out/run1` produces `out/run1.media`,
    /// `out/run1.events.jsonl` and `out/run1.session.json`.
    pub path: PathBuf,

    /// Replace artifacts left by a previous run with the same stem.
    pub overwrite: bool,

    /// Flush the writers after this many samples, in addition to every tick.
    pub flush_every_samples: u64,

    /// Call `fsync` on every flush.
    pub fsync_on_flush: bool,
}

/// Which native implementation a source uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendChoice {
    /// Platform capture (GStreamer, evdev, X11).
    #[default]
    Native,
    /// Deterministic generated content.
    Synthetic,
}

/// Encoding of captured frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VideoCodec {
    /// Uncompressed BGRx.
    #[default]
    RawBgrx,
    /// H.264 byte stream, one access unit per frame.
    H264,
}

impl VideoCodec {
    /// Name stored in each frame's `codec` field.
    pub fn as_str(self) -> &'static str {
        match self {
            VideoCodec::RawBgrx => "raw-bgrx",
            VideoCodec::H264 => "h264",
        }
    }
}

/// All source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub screen: ScreenConfig,
    /// System output mix.
    pub audio: AudioConfig,
    /// Second audio track from the default input device. Always captured
    /// without loopback.
    pub microphone: AudioConfig,
    pub input: InputConfig,
    pub window: WindowConfig,
}

/// Screen capture settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenConfig {
    pub enabled: bool,
    pub backend: BackendChoice,

    /// Target interval between frames, in microseconds.
    pub frame_interval_us: u64,

    /// Output size; `None` keeps the source size.
    pub width: Option<u32>,
    pub height: Option<u32>,

    /// Zero-based monitor index.
    pub monitor_index: usize,

    /// Whether the system cursor is drawn into frames.
    pub show_cursor: bool,

    /// Frame encoding produced by the capture pipeline.
    pub codec: VideoCodec,

    /// Consecutive missed frames before the source reports Stalled.
    pub stall_after_missed: u32,
}

/// Audio capture settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub enabled: bool,
    pub backend: BackendChoice,

    /// Sample rate in Hz.
    pub sample_rate: u32,

    /// Interleaved channel count.
    pub channels: u16,

    /// Frames per emitted block.
    pub block_frames: u32,

    /// Capture system output (loopback) instead of the microphone.
    pub loopback: bool,

    /// Consecutive missed blocks before the source reports Stalled.
    pub stall_after_missed: u32,
}

/// Keyboard/mouse capture settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub enabled: bool,
    pub backend: BackendChoice,

    /// Sleep between empty backend polls, in milliseconds.
    pub poll_interval_ms: u64,
}

/// Window focus/geometry capture settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub enabled: bool,
    pub backend: BackendChoice,

    /// Sleep between empty backend polls, in milliseconds.
    pub poll_interval_ms: u64,
}

/// Queue bounds and merge timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub video_queue_capacity: usize,
    pub audio_queue_capacity: usize,
    pub microphone_queue_capacity: usize,
    pub input_queue_capacity: usize,
    pub window_queue_capacity: usize,

    /// How long an Input/WindowEvent producer waits on a full queue before
    /// the source overflows.
    pub push_timeout_ms: u64,

    /// A running stream whose frontier does not advance for this long is
    /// excluded from the watermark.
    pub stall_timeout_ms: u64,

    /// Consumer tick period.
    pub tick_interval_ms: u64,

    /// How far behind "now" an idle source promises progress.
    pub max_lateness_ms: u64,

    /// Warn when a sample reaches the writer this long after it was
    /// captured; 0 disables the warning.
    pub latency_warn_ms: u64,
}

/// Clock calibration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Readings taken per source at startup.
    pub calibration_points: usize,

    /// Startup calibration budget per source.
    pub calibration_timeout_ms: u64,

    /// Interval between drift re-estimates; 0 disables recalibration.
    pub recalibration_interval_ms: u64,

    /// Upper bound on the applied drift rate.
    pub max_drift_ppm: f64,
}

/// Session lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Upper bound on the Draining phase.
    pub drain_timeout_ms: u64,

    /// Period of the health log; 0 disables it.
    pub health_check_interval_ms: u64,

    /// Countdown before sources start.
    pub start_after_ms: Option<u64>,

    /// Stop automatically after this long in Recording.
    pub stop_after_ms: Option<u64>,

    /// Process-identity handle location; `None` uses [`default_pid_file`].
    pub pid_file: Option<PathBuf>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "syncap=debug,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,

    /// Optional log file path.
    pub file: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("recording"),
            overwrite: false,
            flush_every_samples: 256,
            fsync_on_flush: false,
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            screen: ScreenConfig::default(),
            audio: AudioConfig::default(),
            microphone: AudioConfig {
                enabled: false,
                channels: 1,
                loopback: false,
                ..AudioConfig::default()
            },
            input: InputConfig::default(),
            window: WindowConfig::default(),
        }
    }
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: BackendChoice::Native,
            frame_interval_us: 16_667,
            width: None,
            height: None,
            monitor_index: 0,
            show_cursor: true,
            codec: VideoCodec::RawBgrx,
            stall_after_missed: 30,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: BackendChoice::Native,
            sample_rate: 48_000,
            channels: 2,
            block_frames: 1024,
            loopback: true,
            stall_after_missed: 8,
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: BackendChoice::Native,
            poll_interval_ms: 1,
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: BackendChoice::Native,
            poll_interval_ms: 200,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            video_queue_capacity: 120,
            audio_queue_capacity: 256,
            microphone_queue_capacity: 256,
            input_queue_capacity: 4096,
            window_queue_capacity: 256,
            push_timeout_ms: 500,
            stall_timeout_ms: 2_000,
            tick_interval_ms: 10,
            max_lateness_ms: 50,
            latency_warn_ms: 100,
        }
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            calibration_points: 8,
            calibration_timeout_ms: 3_000,
            recalibration_interval_ms: 10_000,
            max_drift_ppm: 500.0,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 5_000,
            health_check_interval_ms: 5_000,
            start_after_ms: None,
            stop_after_ms: None,
            pid_file: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl ScreenConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(self.frame_interval_us)
    }
}

impl AudioConfig {
    /// Wall-clock length of one block.
    pub fn block_duration(&self) -> Duration {
        Duration::from_nanos(self.block_frames as u64 * 1_000_000_000 / self.sample_rate as u64)
    }

    /// Size of one block of interleaved S16LE samples.
    pub fn block_bytes(&self) -> usize {
        self.block_frames as usize * self.channels as usize * 2
    }
}

impl SyncConfig {
    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// `None` when the latency warning is disabled.
    pub fn latency_warn(&self) -> Option<Duration> {
        (self.latency_warn_ms > 0).then(|| Duration::from_millis(self.latency_warn_ms))
    }
}

impl ClockConfig {
    pub fn calibration_timeout(&self) -> Duration {
        Duration::from_millis(self.calibration_timeout_ms)
    }

    /// `None` when recalibration is disabled.
    pub fn recalibration_interval(&self) -> Option<Duration> {
        (self.recalibration_interval_ms > 0)
            .then(|| Duration::from_millis(self.recalibration_interval_ms))
    }
}

impl SessionSettings {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn start_after(&self) -> Option<Duration> {
        self.start_after_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Configured pid file, or the well-known default.
    pub fn pid_file_path(&self) -> PathBuf {
        self.pid_file.clone().unwrap_or_else(default_pid_file)
    }
}

impl RecorderConfig {
    /// Load config from the standard location, falling back to defaults.
    pub fn load() -> Self {
        let config_path = config_file_path();
        if config_path.exists() {
            match Self::load_from(&config_path) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Failed to load config at {:?}: {}", config_path, e);
                }
            }
        }
        Self::default()
    }

    /// Load config from an explicit path.
    pub fn load_from(path: &Path) -> RecorderResult<Self> {
        if !path.exists() {
            return Err(RecorderError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Reject settings the recording core cannot run with.
    pub fn validate(&self) -> RecorderResult<()> {
        let s = &self.sources;
        if !(s.screen.enabled
            || s.audio.enabled
            || s.microphone.enabled
            || s.input.enabled
            || s.window.enabled)
        {
            return Err(RecorderError::config("at least one source must be enabled"));
        }
        if self.output.path.as_os_str().is_empty() {
            return Err(RecorderError::config("output path is empty"));
        }
        if s.screen.enabled && s.screen.frame_interval_us == 0 {
            return Err(RecorderError::config("screen.frame_interval_us must be > 0"));
        }
        for (name, audio) in [("audio", &s.audio), ("microphone", &s.microphone)] {
            if audio.enabled
                && (audio.block_frames == 0 || audio.sample_rate == 0 || audio.channels == 0)
            {
                return Err(RecorderError::config(format!(
                    "{name} block_frames, sample_rate and channels must be > 0"
                )));
            }
        }
        for (name, capacity) in [
            ("video_queue_capacity", self.sync.video_queue_capacity),
            ("audio_queue_capacity", self.sync.audio_queue_capacity),
            ("microphone_queue_capacity", self.sync.microphone_queue_capacity),
            ("input_queue_capacity", self.sync.input_queue_capacity),
            ("window_queue_capacity", self.sync.window_queue_capacity),
        ] {
            if capacity == 0 {
                return Err(RecorderError::config(format!("sync.{name} must be > 0")));
            }
        }
        if self.sync.tick_interval_ms == 0 {
            return Err(RecorderError::config("sync.tick_interval_ms must be > 0"));
        }
        if self.clock.calibration_points == 0 {
            return Err(RecorderError::config("clock.calibration_points must be > 0"));
        }
        if self.clock.max_drift_ppm.is_nan() || self.clock.max_drift_ppm < 0.0 {
            return Err(RecorderError::config("clock.max_drift_ppm must be >= 0"));
        }
        if self.session.drain_timeout_ms == 0 {
            return Err(RecorderError::config("session.drain_timeout_ms must be > 0"));
        }
        Ok(())
    }
}

/// Standard config file location.
fn config_file_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("syncap").join("config.json")
}

/// Well-known location of the process-identity handle.
pub fn default_pid_file() -> PathBuf {
    let base = std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir());
    base.join("syncap").join("syncap.pid")
}
