//! Source adapters: one producer task per enabled source.
//!
//! An adapter owns its native backend and a [`ClockNormalizer`]. It stamps
//! every reading on the session clock and pushes it into its own queue of
//! the [`SyncBuffer`](crate::sync::SyncBuffer). Screen and Audio are paced
//! by a fixed interval and report missed slots as gap markers; Input and
//! WindowEvent are polled, never drop, and promise progress while idle.

mod continuous;
mod discrete;
mod emitter;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use syncap_common::clock::{CalibrationPoint, ClockNormalizer, RecordingClock};
use syncap_common::config::{ClockConfig, RecorderConfig};
use syncap_common::error::{RecorderError, RecorderResult};
use syncap_input_tracker::{InputBackend, WindowBackend};
use syncap_sample_model::{SourceHealth, SourceKind, SourceSummary};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

use crate::backend::{self, AudioSource, FrameSource};
use crate::sync::{QueueProducer, SyncBuffer};

pub(crate) use emitter::Emitter;

/// Something the controller should know about a source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// Health changed: stalled, recovered, ended or failed.
    Health {
        kind: SourceKind,
        health: SourceHealth,
        detail: Option<String>,
    },
    /// A non-droppable queue stayed full past the push timeout.
    Overflow { kind: SourceKind, waited: Duration },
    /// The normalizer clamped regressing timestamps; `total` so far.
    ClockCorrection { kind: SourceKind, total: u64 },
    /// Drift re-estimated during recording.
    Drift {
        kind: SourceKind,
        drift_ppm: f64,
        error_ns: i64,
    },
}

impl SourceEvent {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceEvent::Health { kind, .. }
            | SourceEvent::Overflow { kind, .. }
            | SourceEvent::ClockCorrection { kind, .. }
            | SourceEvent::Drift { kind, .. } => *kind,
        }
    }
}

/// Settings for fixed-rate media adapters.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Cadence {
    pub interval: Duration,
    /// Consecutive empty slots before the source reports Stalled.
    pub stall_after_missed: u32,
}

enum Backend {
    Screen(Box<dyn FrameSource>, Cadence),
    Audio(Box<dyn AudioSource>, Cadence),
    Input(Box<dyn InputBackend>, Duration),
    Window(Box<dyn WindowBackend>, Duration),
}

impl Backend {
    fn name(&self) -> &str {
        match self {
            Backend::Screen(b, _) => b.name(),
            Backend::Audio(b, _) => b.name(),
            Backend::Input(b, _) => b.name(),
            Backend::Window(b, _) => b.name(),
        }
    }

    fn start(&mut self) -> RecorderResult<()> {
        match self {
            Backend::Screen(b, _) => b.start(),
            Backend::Audio(b, _) => b.start(),
            Backend::Input(..) | Backend::Window(..) => Ok(()),
        }
    }

    fn native_clock_ns(&mut self) -> RecorderResult<u64> {
        match self {
            Backend::Screen(b, _) => b.native_clock_ns(),
            Backend::Audio(b, _) => b.native_clock_ns(),
            Backend::Input(b, _) => b.native_clock_ns(),
            Backend::Window(b, _) => b.native_clock_ns(),
        }
    }

    fn stop(&mut self) {
        let result = match self {
            Backend::Screen(b, _) => b.stop(),
            Backend::Audio(b, _) => b.stop(),
            Backend::Input(..) | Backend::Window(..) => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!(backend = %self.name(), error = %e, "Backend did not stop cleanly");
        }
    }
}

/// One source, not yet running.
pub struct SourceAdapter {
    kind: SourceKind,
    name: String,
    /// `None` once a calibration attempt timed out with the backend still
    /// busy on the blocking pool.
    backend: Option<Backend>,
}

impl SourceAdapter {
    fn new(kind: SourceKind, backend: Backend) -> Self {
        Self {
            kind,
            name: backend.name().to_string(),
            backend: Some(backend),
        }
    }

    pub fn screen(
        backend: Box<dyn FrameSource>,
        frame_interval: Duration,
        stall_after_missed: u32,
    ) -> Self {
        let cadence = Cadence {
            interval: frame_interval,
            stall_after_missed,
        };
        Self::new(SourceKind::Video, Backend::Screen(backend, cadence))
    }

    pub fn audio(
        backend: Box<dyn AudioSource>,
        block_interval: Duration,
        stall_after_missed: u32,
    ) -> Self {
        Self::audio_as(SourceKind::Audio, backend, block_interval, stall_after_missed)
    }

    /// Audio adapter recording under `kind`, e.g. a microphone track next
    /// to the system mix.
    pub fn audio_as(
        kind: SourceKind,
        backend: Box<dyn AudioSource>,
        block_interval: Duration,
        stall_after_missed: u32,
    ) -> Self {
        let cadence = Cadence {
            interval: block_interval,
            stall_after_missed,
        };
        Self::new(kind, Backend::Audio(backend, cadence))
    }

    pub fn input(backend: Box<dyn InputBackend>, poll_interval: Duration) -> Self {
        Self::new(SourceKind::Input, Backend::Input(backend, poll_interval))
    }

    pub fn window(backend: Box<dyn WindowBackend>, poll_interval: Duration) -> Self {
        Self::new(SourceKind::WindowEvent, Backend::Window(backend, poll_interval))
    }

    /// Open the backend of every enabled source.
    ///
    /// A backend that cannot be opened is reported per source; the session
    /// treats it like a calibration failure. Opening may run helper
    /// processes, so call it off the async workers.
    pub fn open_enabled(config: &RecorderConfig) -> Vec<(SourceKind, RecorderResult<Self>)> {
        let s = &config.sources;
        let mut adapters = Vec::new();
        if s.screen.enabled {
            let adapter = backend::open_frame_source(&s.screen).map(|b| {
                Self::screen(b, s.screen.frame_interval(), s.screen.stall_after_missed)
            });
            adapters.push((SourceKind::Video, adapter));
        }
        if s.audio.enabled {
            let adapter = backend::open_audio_source(&s.audio).map(|b| {
                Self::audio(b, s.audio.block_duration(), s.audio.stall_after_missed)
            });
            adapters.push((SourceKind::Audio, adapter));
        }
        if s.microphone.enabled {
            let microphone = syncap_common::config::AudioConfig {
                loopback: false,
                ..s.microphone.clone()
            };
            let adapter = backend::open_audio_source(&microphone).map(|b| {
                Self::audio_as(
                    SourceKind::Microphone,
                    b,
                    s.microphone.block_duration(),
                    s.microphone.stall_after_missed,
                )
            });
            adapters.push((SourceKind::Microphone, adapter));
        }
        if s.input.enabled {
            let adapter = backend::open_input_backend(&s.input)
                .map(|b| Self::input(b, Duration::from_millis(s.input.poll_interval_ms.max(1))));
            adapters.push((SourceKind::Input, adapter));
        }
        if s.window.enabled {
            let adapter = backend::open_window_backend(&s.window)
                .map(|b| Self::window(b, Duration::from_millis(s.window.poll_interval_ms.max(1))));
            adapters.push((SourceKind::WindowEvent, adapter));
        }
        adapters
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn backend_name(&self) -> &str {
        &self.name
    }

    /// Start the backend and fit a normalizer to its native clock.
    ///
    /// Takes `calibration_points` bracketed readings 1 ms apart. The start
    /// and the readings run on the blocking pool so the calibration timeout
    /// holds even when the backend blocks. Fails with `CalibrationFailure`
    /// if the backend cannot start, its clock cannot be read, or the whole
    /// sequence takes longer than the timeout; a backend still busy at the
    /// timeout is stopped once it returns.
    pub async fn calibrate(
        &mut self,
        clock: &RecordingClock,
        config: &ClockConfig,
    ) -> RecorderResult<ClockNormalizer> {
        let kind = self.kind;
        let timeout = config.calibration_timeout();
        let Some(backend) = self.backend.take() else {
            return Err(RecorderError::calibration(
                kind.as_str(),
                "backend still busy with an earlier calibration",
            ));
        };

        let session_clock = clock.clone();
        let count = config.calibration_points;
        let mut readings = tokio::task::spawn_blocking(move || {
            let mut backend = backend;
            let points = backend
                .start()
                .and_then(|()| read_calibration_points(&mut backend, &session_clock, count));
            (backend, points)
        });

        let points = match tokio::time::timeout(timeout, &mut readings).await {
            Ok(Ok((backend, points))) => {
                self.backend = Some(backend);
                points
            }
            Ok(Err(e)) => {
                return Err(RecorderError::calibration(
                    kind.as_str(),
                    format!("calibration task failed: {e}"),
                ))
            }
            Err(_) => {
                let name = self.name.clone();
                tokio::spawn(async move {
                    if let Ok((backend, _)) = readings.await {
                        tracing::debug!(backend = %name, "Releasing backend after late calibration");
                        release(backend).await;
                    }
                });
                return Err(RecorderError::calibration(
                    kind.as_str(),
                    format!("no calibration within {timeout:?}"),
                ));
            }
        };

        let points = points.map_err(|e| match e {
            e @ RecorderError::CalibrationFailure { .. } => e,
            other => RecorderError::calibration(kind.as_str(), other.to_string()),
        })?;
        let normalizer =
            ClockNormalizer::calibrate(kind.as_str(), &points, config.max_drift_ppm)?;
        tracing::info!(
            source = %kind,
            backend = %self.name,
            offset_ns = normalizer.offset_ns(),
            points = points.len(),
            "Source calibrated"
        );
        Ok(normalizer)
    }

    /// Release a backend that will not be recorded (calibration failed).
    pub async fn discard(self) {
        if let Some(backend) = self.backend {
            release(backend).await;
        }
    }

    /// Spawn the producer task.
    pub(crate) fn spawn(self, ctx: AdapterContext) -> AdapterHandle {
        let kind = self.kind;
        let stop = Arc::new(AtomicBool::new(false));
        let buffer = ctx.buffer.clone();
        let backend_name = self.name;
        let emitter = Emitter::new(
            kind,
            ctx.clock,
            ctx.normalizer,
            ctx.producer,
            ctx.events,
            ctx.max_lateness,
        );
        let run = RunSettings {
            stop: stop.clone(),
            recalibration: ctx.recalibration,
        };

        let join = match self.backend {
            Some(Backend::Screen(b, cadence)) => {
                tokio::spawn(continuous::run(b, emitter, cadence, run))
            }
            Some(Backend::Audio(b, cadence)) => {
                tokio::spawn(continuous::run(b, emitter, cadence, run))
            }
            Some(Backend::Input(b, poll)) => tokio::spawn(discrete::run(b, emitter, poll, run)),
            Some(Backend::Window(b, poll)) => tokio::spawn(discrete::run(b, emitter, poll, run)),
            None => {
                let name = backend_name.clone();
                tokio::spawn(async move {
                    emitter.finish(name, Some("backend was never calibrated".to_string()))
                })
            }
        };

        tracing::info!(source = %kind, backend = %backend_name, "Source adapter started");
        AdapterHandle {
            kind,
            backend: backend_name,
            stop,
            buffer,
            join,
        }
    }
}

/// Everything a running adapter needs from the session.
pub(crate) struct AdapterContext {
    pub clock: RecordingClock,
    pub normalizer: ClockNormalizer,
    pub producer: QueueProducer,
    pub buffer: SyncBuffer,
    pub events: mpsc::UnboundedSender<SourceEvent>,
    pub recalibration: Option<Duration>,
    pub max_lateness: Duration,
}

/// Loop controls shared by both adapter kinds.
pub(crate) struct RunSettings {
    pub stop: Arc<AtomicBool>,
    pub recalibration: Option<Duration>,
}

impl RunSettings {
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Ticker for drift re-estimation; never fires when disabled.
    pub fn recalibration_ticker(&self) -> Option<tokio::time::Interval> {
        self.recalibration.map(|period| {
            let mut ticker =
                tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker
        })
    }
}

/// Wait for the next recalibration tick, or forever when disabled.
pub(crate) async fn next_recalibration(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Run a backend call on the blocking pool and hand the backend back.
///
/// Backend calls that can block (pipeline state changes, helper processes,
/// device reads) go through here so they never hold an async worker.
pub(crate) async fn on_blocking_pool<B, T, F>(mut backend: B, call: F) -> RecorderResult<(B, T)>
where
    B: Send + 'static,
    T: Send + 'static,
    F: FnOnce(&mut B) -> T + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let out = call(&mut backend);
        (backend, out)
    })
    .await
    .map_err(|e| RecorderError::capture(format!("backend call did not complete: {e}")))
}

fn read_calibration_points(
    backend: &mut Backend,
    clock: &RecordingClock,
    count: usize,
) -> RecorderResult<Vec<CalibrationPoint>> {
    let mut points = Vec::with_capacity(count);
    for i in 0..count {
        if i > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        points.push(clock.bracket(|| backend.native_clock_ns())?);
    }
    Ok(points)
}

async fn release(backend: Backend) {
    let name = backend.name().to_string();
    if let Err(e) = on_blocking_pool(backend, |b| b.stop()).await {
        tracing::warn!(backend = %name, error = %e, "Backend release did not complete");
    }
}

/// A running adapter.
pub struct AdapterHandle {
    kind: SourceKind,
    backend: String,
    stop: Arc<AtomicBool>,
    buffer: SyncBuffer,
    join: JoinHandle<AdapterReport>,
}

impl AdapterHandle {
    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn health(&self) -> SourceHealth {
        self.buffer.health(self.kind).unwrap_or(SourceHealth::Failed)
    }

    /// Ask the adapter to finish its current sample and end.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Abort a task that did not stop in time.
    pub fn abort(&self) {
        self.join.abort();
    }

    /// Wait for the task and collect its report.
    pub async fn join(mut self) -> AdapterReport {
        let result = (&mut self.join).await;
        self.into_report(result)
    }

    /// Wait until `deadline`, then abort. The flag is true when the task
    /// had to be aborted.
    pub async fn join_until(mut self, deadline: Instant) -> (AdapterReport, bool) {
        match tokio::time::timeout_at(deadline, &mut self.join).await {
            Ok(result) => (self.into_report(result), false),
            Err(_) => {
                tracing::warn!(source = %self.kind, "Adapter missed the drain deadline; aborting");
                self.join.abort();
                let result = (&mut self.join).await;
                (self.into_report(result), true)
            }
        }
    }

    fn into_report(self, result: Result<AdapterReport, JoinError>) -> AdapterReport {
        match result {
            Ok(report) => report,
            Err(e) => {
                let reason = if e.is_cancelled() {
                    "aborted after the drain timeout".to_string()
                } else {
                    format!("adapter task panicked: {e}")
                };
                self.buffer.set_health(self.kind, SourceHealth::Failed);
                AdapterReport::failed(self.kind, self.backend, reason)
            }
        }
    }
}

/// What an adapter did over its lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterReport {
    pub kind: SourceKind,
    pub backend: String,
    pub samples: u64,
    pub gaps: u64,
    pub missing: u64,
    pub corrections: u64,
    pub offset_ns: i64,
    pub drift_ppm: f64,
    pub final_health: SourceHealth,
    pub error: Option<String>,
}

impl AdapterReport {
    pub fn failed(kind: SourceKind, backend: String, error: String) -> Self {
        Self {
            kind,
            backend,
            samples: 0,
            gaps: 0,
            missing: 0,
            corrections: 0,
            offset_ns: 0,
            drift_ppm: 0.0,
            final_health: SourceHealth::Failed,
            error: Some(error),
        }
    }

    pub fn to_summary(&self) -> SourceSummary {
        SourceSummary {
            kind: self.kind,
            backend: self.backend.clone(),
            final_health: self.final_health,
            samples: self.samples,
            missing: self.missing,
            clock_corrections: self.corrections,
            clock_offset_ns: self.offset_ns,
            drift_ppm: self.drift_ppm,
            error: self.error.clone(),
        }
    }
}
