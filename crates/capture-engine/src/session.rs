//! Recording session management.
//!
//! The [`SessionController`] owns one session from start to close:
//!
//! 1. **Starting:** write the pid file, count down `start_after_ms`, start
//!    the session clock, prepare the output stem, calibrate every enabled
//!    source, open the Mux/Writer and spawn the adapters and the consumer
//!    task.
//! 2. **Recording:** log source events and periodic health until a stop
//!    request, the shutdown signal, `stop_after_ms`, a writer failure, or
//!    every source ending on its own.
//! 3. **Draining:** stop the adapters, let the consumer release and write
//!    everything left, then close the writer. The whole phase is bounded by
//!    `drain_timeout_ms`; past it the writer closes with a truncation marker.
//! 4. **Closed/Failed:** write the manifest and remove the pid file.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use syncap_common::clock::RecordingClock;
use syncap_common::config::{BackendChoice, RecorderConfig};
use syncap_common::error::{RecorderError, RecorderResult};
use syncap_sample_model::{
    ArtifactPaths, CloseStatus, Sample, SessionEnvironment, SessionManifest, SessionOutcome,
    SourceHealth, SourceKind, SourceSummary, MANIFEST_VERSION,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};

use crate::mux::{prepare_output, FileSinks, MuxHeader, MuxSummary, MuxWriter, SinkFactory};
use crate::pid::PidFile;
use crate::shutdown::{ShutdownHandle, ShutdownReason};
use crate::source::{AdapterContext, AdapterHandle, AdapterReport, SourceAdapter, SourceEvent};
use crate::sync::SyncBuffer;

/// Extra time the consumer gets past the drain deadline to write its
/// marker before it is abandoned.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// At most one slow-delivery warning per this period.
const LATENCY_WARN_EVERY: Duration = Duration::from_secs(1);

/// Current state of a recording session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    /// Not started yet.
    Idle,
    /// Calibrating sources and opening artifacts.
    Starting,
    /// Adapters running, consumer writing.
    Recording,
    /// Stop requested; flushing what is left.
    Draining,
    /// Artifacts closed with a marker.
    Closed,
    /// Ended on an unrecoverable error.
    Failed,
}

impl SessionStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, SessionStatus::Closed | SessionStatus::Failed)
    }
}

/// Outcome of a finished session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub session_id: String,
    pub status: SessionStatus,

    /// Marker written into the artifacts; `None` when the writer failed or
    /// never opened.
    pub close_status: Option<CloseStatus>,

    pub paths: ArtifactPaths,
    pub sources: Vec<SourceSummary>,
    pub samples_written: u64,

    /// Samples still queued when the drain deadline passed.
    pub discarded: u64,

    pub last_watermark_ns: Option<u64>,
    pub error: Option<String>,
}

impl SessionReport {
    /// Closed with a completion marker.
    pub fn is_complete(&self) -> bool {
        self.status == SessionStatus::Closed && self.close_status == Some(CloseStatus::Complete)
    }

    pub fn source(&self, kind: SourceKind) -> Option<&SourceSummary> {
        self.sources.iter().find(|s| s.kind == kind)
    }
}

/// Why Recording ended.
#[derive(Debug)]
enum StopTrigger {
    Requested(ShutdownReason),
    StopAfter,
    SourcesEnded,
    WriterExited(Result<RecorderResult<ConsumerOutcome>, JoinError>),
}

/// Sent once to the consumer when the session starts draining.
#[derive(Debug, Clone, Copy)]
struct DrainRequest {
    deadline: Instant,
    /// An adapter had to be aborted; the artifacts cannot claim completion.
    forced: bool,
}

#[derive(Debug)]
struct ConsumerOutcome {
    summary: MuxSummary,
    discarded: u64,
}

/// Everything that exists only while a session runs.
struct ActiveSession {
    session_id: String,
    clock: RecordingClock,
    paths: ArtifactPaths,
    pid: PidFile,
    environment: SessionEnvironment,
    buffer: SyncBuffer,
    adapters: Vec<AdapterHandle>,
    excluded: Vec<AdapterReport>,
    consumer: JoinHandle<RecorderResult<ConsumerOutcome>>,
    drain_tx: Option<oneshot::Sender<DrainRequest>>,
    events: mpsc::UnboundedReceiver<SourceEvent>,
    recording_since: Instant,
}

/// Drives one recording session.
pub struct SessionController {
    config: RecorderConfig,
    pending: Option<Vec<(SourceKind, RecorderResult<SourceAdapter>)>>,
    status: watch::Sender<SessionStatus>,
    shutdown: ShutdownHandle,
    shutdown_rx: mpsc::Receiver<ShutdownReason>,
    sinks: Arc<dyn SinkFactory>,
    active: Option<ActiveSession>,
    report: Option<SessionReport>,
}

impl SessionController {
    /// Session whose sources are opened from `config` at start.
    pub fn new(config: RecorderConfig) -> Self {
        Self::build(config, None)
    }

    /// Session recording exactly `adapters`; the `sources` section of
    /// `config` is ignored.
    pub fn with_adapters(config: RecorderConfig, adapters: Vec<SourceAdapter>) -> Self {
        let pending = adapters.into_iter().map(|a| (a.kind(), Ok(a))).collect();
        Self::build(config, Some(pending))
    }

    fn build(
        config: RecorderConfig,
        pending: Option<Vec<(SourceKind, RecorderResult<SourceAdapter>)>>,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::Idle);
        let (shutdown, shutdown_rx) = ShutdownHandle::channel();
        Self {
            config,
            pending,
            status,
            shutdown,
            shutdown_rx,
            sinks: Arc::new(FileSinks),
            active: None,
            report: None,
        }
    }

    /// Write the artifacts through `sinks` instead of plain files.
    pub fn with_sinks(mut self, sinks: Arc<dyn SinkFactory>) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Follow status transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Trigger for stopping from another task or a signal handler.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn session_id(&self) -> Option<&str> {
        match (&self.active, &self.report) {
            (Some(active), _) => Some(&active.session_id),
            (None, Some(report)) => Some(&report.session_id),
            (None, None) => None,
        }
    }

    /// Session clock seconds since start, 0 before start.
    pub fn elapsed_secs(&self) -> f64 {
        self.active
            .as_ref()
            .map(|a| a.clock.elapsed_secs())
            .unwrap_or(0.0)
    }

    /// Start recording.
    ///
    /// Succeeds once at least one source calibrated. Sources that fail are
    /// excluded and show up as Failed in the report.
    pub async fn start(&mut self) -> RecorderResult<()> {
        let status = self.status();
        if status != SessionStatus::Idle {
            return Err(RecorderError::session(format!(
                "Cannot start a session that is {status:?}"
            )));
        }

        match self.open().await {
            Ok(active) => {
                tracing::info!(
                    session_id = %active.session_id,
                    sources = active.adapters.len(),
                    excluded = active.excluded.len(),
                    "Recording"
                );
                self.active = Some(active);
                self.set_status(SessionStatus::Recording);
                Ok(())
            }
            Err((e, excluded)) => {
                tracing::error!(error = %e, "Session failed to start");
                self.report = Some(SessionReport {
                    session_id: String::new(),
                    status: SessionStatus::Failed,
                    close_status: None,
                    paths: ArtifactPaths::from_stem(&self.config.output.path),
                    sources: excluded.iter().map(AdapterReport::to_summary).collect(),
                    samples_written: 0,
                    discarded: 0,
                    last_watermark_ns: None,
                    error: Some(e.to_string()),
                });
                self.set_status(SessionStatus::Failed);
                Err(e)
            }
        }
    }

    async fn open(&mut self) -> Result<ActiveSession, (RecorderError, Vec<AdapterReport>)> {
        let no_reports = |e: RecorderError| (e, Vec::new());
        self.config.validate().map_err(no_reports)?;
        self.set_status(SessionStatus::Starting);

        let pid = PidFile::create(self.config.session.pid_file_path()).map_err(no_reports)?;
        if let Some(delay) = self.config.session.start_after() {
            self.count_down(delay).await.map_err(no_reports)?;
        }
        let clock = RecordingClock::start();
        let paths = ArtifactPaths::from_stem(&self.config.output.path);
        prepare_output(&paths, self.config.output.overwrite).map_err(no_reports)?;

        let from_config = self.pending.is_none();
        let pending = match self.pending.take() {
            Some(pending) => pending,
            None => {
                let config = self.config.clone();
                tokio::task::spawn_blocking(move || SourceAdapter::open_enabled(&config))
                    .await
                    .map_err(|e| {
                        no_reports(RecorderError::session(format!(
                            "opening sources did not complete: {e}"
                        )))
                    })?
            }
        };

        let environment = if from_config {
            self.read_environment().await
        } else {
            SessionEnvironment::default()
        };

        let mut calibrated = Vec::new();
        let mut excluded = Vec::new();
        for (kind, opened) in pending {
            let mut adapter = match opened {
                Ok(adapter) => adapter,
                Err(e) => {
                    tracing::warn!(source = %kind, error = %e, "Source unavailable; excluding it");
                    excluded.push(AdapterReport::failed(kind, "unavailable".into(), e.to_string()));
                    continue;
                }
            };
            match adapter.calibrate(&clock, &self.config.clock).await {
                Ok(normalizer) => calibrated.push((adapter, normalizer)),
                Err(e) => {
                    tracing::warn!(source = %kind, error = %e, "Calibration failed; excluding source");
                    excluded.push(AdapterReport::failed(
                        kind,
                        adapter.backend_name().to_string(),
                        e.to_string(),
                    ));
                    adapter.discard().await;
                }
            }
        }

        if calibrated.is_empty() {
            let detail = excluded
                .iter()
                .map(|r| format!("{}: {}", r.kind, r.error.as_deref().unwrap_or("unknown")))
                .collect::<Vec<_>>()
                .join("; ");
            return Err((
                RecorderError::session(format!("No source could be calibrated ({detail})")),
                excluded,
            ));
        }
        if !excluded.is_empty() {
            tracing::warn!(
                excluded = ?excluded.iter().map(|r| r.kind).collect::<Vec<_>>(),
                "Recording without some sources"
            );
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let header = MuxHeader {
            session_id: session_id.clone(),
            epoch_wall: clock.epoch_wall().to_string(),
            sources: calibrated.iter().map(|(a, _)| a.kind()).collect(),
        };
        let mux = match MuxWriter::create_with(&*self.sinks, &paths, &header, &self.config.output) {
            Ok(mux) => mux,
            Err(e) => {
                for (adapter, _) in calibrated {
                    adapter.discard().await;
                }
                return Err((e, excluded));
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let buffer = SyncBuffer::with_events(&self.config.sync, events_tx.clone());

        // Every queue exists before the first sample so the watermark
        // never runs ahead of a source that has not started pushing.
        let mut producers = Vec::with_capacity(calibrated.len());
        for (adapter, _) in &calibrated {
            producers.push(buffer.register(adapter.kind()).map_err(|e| (e, Vec::new()))?);
        }

        let recalibration = self.config.clock.recalibration_interval();
        let max_lateness = Duration::from_millis(self.config.sync.max_lateness_ms);
        let adapters = calibrated
            .into_iter()
            .zip(producers)
            .map(|((adapter, normalizer), producer)| {
                adapter.spawn(AdapterContext {
                    clock: clock.clone(),
                    normalizer,
                    producer,
                    buffer: buffer.clone(),
                    events: events_tx.clone(),
                    recalibration,
                    max_lateness,
                })
            })
            .collect();

        let (drain_tx, drain_rx) = oneshot::channel();
        let consumer = tokio::spawn(run_consumer(
            buffer.clone(),
            mux,
            self.config.sync.tick_interval(),
            LatencyWatch::new(clock.clone(), self.config.sync.latency_warn()),
            drain_rx,
        ));

        Ok(ActiveSession {
            session_id,
            clock,
            paths,
            pid,
            environment,
            buffer,
            adapters,
            excluded,
            consumer,
            drain_tx: Some(drain_tx),
            events: events_rx,
            recording_since: Instant::now(),
        })
    }

    /// Wait out the start delay, logging once a second. A shutdown request
    /// during the countdown cancels the session before any source starts.
    async fn count_down(&mut self, delay: Duration) -> RecorderResult<()> {
        let start_at = Instant::now() + delay;
        loop {
            let remaining = start_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            tracing::info!(
                remaining_secs = remaining.as_secs_f64().ceil() as u64,
                "Recording starts soon"
            );
            tokio::select! {
                reason = self.shutdown_rx.recv() => {
                    let reason = reason.unwrap_or(ShutdownReason::Explicit);
                    tracing::info!(?reason, "Stopped during the start countdown");
                    return Err(RecorderError::session(format!(
                        "stopped during the start countdown ({reason:?})"
                    )));
                }
                _ = tokio::time::sleep(remaining.min(Duration::from_secs(1))) => {}
            }
        }
    }

    /// Desktop input settings, read only when real input is captured.
    async fn read_environment(&self) -> SessionEnvironment {
        let input = &self.config.sources.input;
        if !input.enabled || input.backend != BackendChoice::Native {
            return SessionEnvironment::default();
        }
        let environment = tokio::task::spawn_blocking(syncap_input_tracker::read_environment)
            .await
            .unwrap_or_default();
        tracing::debug!(?environment, "Input environment");
        environment
    }

    /// Record until something ends the session, then drain and close.
    pub async fn wait(&mut self) -> RecorderResult<SessionReport> {
        if let Some(report) = &self.report {
            return Ok(report.clone());
        }
        let Some(active) = self.active.as_mut() else {
            return Err(RecorderError::session("Session not started"));
        };

        let settings = &self.config.session;
        let mut health = (settings.health_check_interval_ms > 0).then(|| {
            let period = Duration::from_millis(settings.health_check_interval_ms);
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let stop_at = settings
            .stop_after_ms
            .map(|ms| active.recording_since + Duration::from_millis(ms));

        let trigger = loop {
            tokio::select! {
                reason = self.shutdown_rx.recv() => {
                    break StopTrigger::Requested(reason.unwrap_or(ShutdownReason::Explicit));
                }
                Some(event) = active.events.recv() => {
                    log_event(&event);
                    if active.buffer.all_terminal() {
                        break StopTrigger::SourcesEnded;
                    }
                }
                _ = next_tick(&mut health) => {
                    log_health(active);
                    if active.buffer.all_terminal() {
                        break StopTrigger::SourcesEnded;
                    }
                }
                _ = sleep_until(stop_at) => break StopTrigger::StopAfter,
                result = &mut active.consumer => break StopTrigger::WriterExited(result),
            }
        };

        self.finish(trigger).await
    }

    /// Start, record until stopped, and return the report.
    pub async fn run(&mut self) -> RecorderResult<SessionReport> {
        self.start().await?;
        self.wait().await
    }

    /// Stop recording now: drain and close.
    ///
    /// Calling it again after the session finished returns the same report.
    pub async fn stop(&mut self) -> RecorderResult<SessionReport> {
        if let Some(report) = &self.report {
            return Ok(report.clone());
        }
        if self.active.is_none() {
            return Err(RecorderError::session("Session not recording"));
        }
        self.finish(StopTrigger::Requested(ShutdownReason::Explicit))
            .await
    }

    async fn finish(&mut self, trigger: StopTrigger) -> RecorderResult<SessionReport> {
        let Some(mut active) = self.active.take() else {
            return Err(RecorderError::session("Session not recording"));
        };

        let drain_timeout = self.config.session.drain_timeout();
        let deadline = Instant::now() + drain_timeout;
        self.set_status(SessionStatus::Draining);
        tracing::info!(
            trigger = ?TriggerLabel(&trigger),
            elapsed_secs = active.clock.elapsed_secs(),
            ?drain_timeout,
            "Draining session"
        );

        // Producers first, so nothing new arrives while the consumer
        // empties the queues.
        for adapter in &active.adapters {
            adapter.stop();
        }
        let mut reports = std::mem::take(&mut active.excluded);
        let mut forced = false;
        for adapter in std::mem::take(&mut active.adapters) {
            let (report, aborted) = adapter.join_until(deadline).await;
            forced |= aborted;
            reports.push(report);
        }
        while let Ok(event) = active.events.try_recv() {
            log_event(&event);
        }

        let consumer = match trigger {
            StopTrigger::WriterExited(result) => flatten_consumer(result),
            _ => {
                if let Some(tx) = active.drain_tx.take() {
                    let _ = tx.send(DrainRequest { deadline, forced });
                }
                match tokio::time::timeout_at(deadline + CLOSE_GRACE, &mut active.consumer).await {
                    Ok(result) => flatten_consumer(result),
                    Err(_) => {
                        active.consumer.abort();
                        Err(RecorderError::DrainTimeout {
                            timeout: drain_timeout,
                        })
                    }
                }
            }
        };

        reports.sort_by_key(|r| r.kind);
        let (status, close_status, mut report) = match consumer {
            Ok(outcome) => {
                let sources = reports
                    .iter()
                    .map(|r| {
                        let mut summary = r.to_summary();
                        if let Some(counters) = outcome.summary.per_kind.get(&r.kind) {
                            summary.samples = counters.samples;
                            summary.missing = counters.missing;
                        }
                        summary
                    })
                    .collect();
                let close_status = outcome.summary.status;
                (
                    SessionStatus::Closed,
                    Some(close_status),
                    SessionReport {
                        session_id: active.session_id.clone(),
                        status: SessionStatus::Closed,
                        close_status: Some(close_status),
                        paths: active.paths.clone(),
                        sources,
                        samples_written: outcome.summary.samples_written,
                        discarded: outcome.discarded,
                        last_watermark_ns: active.buffer.watermark(),
                        error: None,
                    },
                )
            }
            Err(e) => {
                tracing::error!(error = %e, "Writer failed; session artifacts are incomplete");
                (
                    SessionStatus::Failed,
                    None,
                    SessionReport {
                        session_id: active.session_id.clone(),
                        status: SessionStatus::Failed,
                        close_status: None,
                        paths: active.paths.clone(),
                        sources: reports.iter().map(AdapterReport::to_summary).collect(),
                        samples_written: 0,
                        discarded: 0,
                        last_watermark_ns: active.buffer.watermark(),
                        error: Some(e.to_string()),
                    },
                )
            }
        };

        let manifest = SessionManifest {
            version: MANIFEST_VERSION.to_string(),
            session_id: active.session_id.clone(),
            started_at: active.clock.epoch_wall().to_string(),
            closed_at: chrono::Utc::now().to_rfc3339(),
            outcome: close_status
                .map(SessionOutcome::from)
                .unwrap_or(SessionOutcome::Failed),
            media_file: file_name(&active.paths.media),
            events_file: file_name(&active.paths.events),
            last_watermark_ns: report.last_watermark_ns,
            sources: report.sources.clone(),
            environment: active.environment.clone(),
            error: report.error.clone(),
        };
        if let Err(e) = manifest.save(&active.paths.manifest) {
            tracing::error!(error = %e, "Failed to write session manifest");
            report.status = SessionStatus::Failed;
            report.error.get_or_insert_with(|| e.to_string());
        }

        if let Err(e) = active.pid.remove() {
            tracing::warn!(path = %active.pid.path().display(), error = %e, "Failed to remove pid file");
        }

        tracing::info!(
            session_id = %report.session_id,
            ?status,
            ?close_status,
            samples = report.samples_written,
            discarded = report.discarded,
            manifest = %active.paths.manifest.display(),
            "Session finished"
        );

        self.set_status(report.status);
        self.report = Some(report.clone());
        Ok(report)
    }

    fn set_status(&self, status: SessionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            tracing::debug!(from = ?previous, to = ?status, "Session status changed");
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            tracing::warn!(session_id = %active.session_id, "Session dropped while recording; aborting tasks");
            for adapter in &active.adapters {
                adapter.abort();
            }
            active.consumer.abort();
        }
    }
}

/// Warns when released samples reach the writer long after capture.
struct LatencyWatch {
    clock: RecordingClock,
    threshold_ns: Option<u64>,
    last_warning: Option<Instant>,
    slow: u64,
}

impl LatencyWatch {
    fn new(clock: RecordingClock, threshold: Option<Duration>) -> Self {
        Self {
            clock,
            threshold_ns: threshold.map(|t| t.as_nanos() as u64),
            last_warning: None,
            slow: 0,
        }
    }

    /// Check one released batch. Returns the worst latency when a warning
    /// was logged.
    fn observe(&mut self, released: &[Sample]) -> Option<Duration> {
        let threshold = self.threshold_ns?;
        let now = self.clock.elapsed_ns();
        let mut worst: Option<&Sample> = None;
        for sample in released {
            if now.saturating_sub(sample.timestamp_ns) > threshold {
                self.slow += 1;
                if worst.map_or(true, |w| sample.timestamp_ns < w.timestamp_ns) {
                    worst = Some(sample);
                }
            }
        }
        let worst = worst?;
        if self
            .last_warning
            .is_some_and(|at| at.elapsed() < LATENCY_WARN_EVERY)
        {
            return None;
        }

        let latency = Duration::from_nanos(now - worst.timestamp_ns);
        tracing::warn!(
            source = %worst.kind,
            latency_ms = latency.as_millis() as u64,
            slow_samples = self.slow,
            "High latency between capture and write"
        );
        self.last_warning = Some(Instant::now());
        self.slow = 0;
        Some(latency)
    }
}

/// Single writer of the artifacts: release, write and flush every tick.
async fn run_consumer(
    buffer: SyncBuffer,
    mut mux: MuxWriter,
    tick: Duration,
    mut latency: LatencyWatch,
    mut drain_rx: oneshot::Receiver<DrainRequest>,
) -> RecorderResult<ConsumerOutcome> {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut drain: Option<DrainRequest> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            request = &mut drain_rx, if drain.is_none() => {
                // A dropped sender means the controller is gone: close now.
                drain = Some(request.unwrap_or(DrainRequest {
                    deadline: Instant::now(),
                    forced: true,
                }));
            }
        }

        let ready = buffer.poll_ready();
        if !ready.is_empty() {
            latency.observe(&ready);
            mux.write_all(&ready)?;
        }
        mux.flush()?;

        let Some(request) = drain else {
            continue;
        };
        if !request.forced && buffer.is_drained() {
            let summary = mux.close(CloseStatus::Complete)?;
            return Ok(ConsumerOutcome {
                summary,
                discarded: 0,
            });
        }
        if request.forced || Instant::now() >= request.deadline {
            let discarded = buffer.discard_remaining();
            tracing::warn!(discarded, "Drain deadline passed; closing with a truncation marker");
            let summary = mux.close(CloseStatus::Truncated)?;
            return Ok(ConsumerOutcome { summary, discarded });
        }
    }
}

fn flatten_consumer(
    result: Result<RecorderResult<ConsumerOutcome>, JoinError>,
) -> RecorderResult<ConsumerOutcome> {
    result.map_err(|e| RecorderError::write(format!("consumer task ended abnormally: {e}")))?
}

fn log_event(event: &SourceEvent) {
    match event {
        SourceEvent::Health {
            kind,
            health: SourceHealth::Failed,
            detail,
        } => tracing::error!(source = %kind, detail = ?detail, "Source failed"),
        SourceEvent::Health {
            kind,
            health,
            detail,
        } => tracing::info!(source = %kind, ?health, detail = ?detail, "Source health changed"),
        SourceEvent::Overflow { kind, waited } => {
            tracing::error!(source = %kind, ?waited, "Queue overflow; source excluded")
        }
        SourceEvent::ClockCorrection { kind, total } => {
            tracing::debug!(source = %kind, total, "Clamped regressing timestamps")
        }
        SourceEvent::Drift {
            kind,
            drift_ppm,
            error_ns,
        } => tracing::debug!(source = %kind, drift_ppm, error_ns, "Drift re-estimated"),
    }
}

fn log_health(active: &ActiveSession) {
    let stats = active.buffer.stats();
    for adapter in &active.adapters {
        let kind = adapter.kind();
        let health = adapter.health();
        let queue = active.buffer.queue_stats(kind);
        if health == SourceHealth::Running {
            tracing::debug!(source = %kind, ?queue, "Source healthy");
        } else {
            tracing::warn!(source = %kind, ?health, ?queue, "Source unhealthy");
        }
    }
    tracing::info!(
        elapsed_secs = active.clock.elapsed_secs(),
        released = stats.released,
        queued = stats.queued,
        watermark_ns = ?stats.last_watermark_ns,
        "Session health"
    );
}

async fn next_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Trigger without the consumer result, for logging.
struct TriggerLabel<'a>(&'a StopTrigger);

impl std::fmt::Debug for TriggerLabel<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            StopTrigger::Requested(reason) => write!(f, "{reason:?}"),
            StopTrigger::StopAfter => f.write_str("StopAfter"),
            StopTrigger::SourcesEnded => f.write_str("SourcesEnded"),
            StopTrigger::WriterExited(_) => f.write_str("WriterExited"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncap_common::config::{OutputConfig, SyncConfig};
    use syncap_sample_model::InputEvent;

    #[test]
    fn test_finished_states() {
        assert!(SessionStatus::Closed.is_finished());
        assert!(SessionStatus::Failed.is_finished());
        assert!(!SessionStatus::Draining.is_finished());
        assert!(!SessionStatus::Idle.is_finished());
    }

    #[test]
    fn test_file_name_is_relative() {
        let paths = ArtifactPaths::from_stem("out/run1");
        assert_eq!(file_name(&paths.media), "run1.media");
        assert_eq!(file_name(&paths.events), "run1.events.jsonl");
    }

    fn consumer_fixture(dir: &Path) -> (SyncBuffer, MuxWriter) {
        let paths = ArtifactPaths::from_stem(dir.join("run"));
        let header = MuxHeader {
            session_id: "consumer".to_string(),
            epoch_wall: "2026-01-01T00:00:00Z".to_string(),
            sources: vec![SourceKind::Input, SourceKind::WindowEvent],
        };
        let mux = MuxWriter::create(&paths, &header, &OutputConfig::default()).unwrap();
        (SyncBuffer::new(&SyncConfig::default()), mux)
    }

    fn quiet() -> LatencyWatch {
        LatencyWatch::new(RecordingClock::start(), None)
    }

    fn click(ts: u64, seq: u64) -> Sample {
        Sample::input(ts, seq, InputEvent::pointer(0.5, 0.5))
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_closes_complete_once_drained() {
        let dir = tempfile::tempdir().unwrap();
        let (buffer, mux) = consumer_fixture(dir.path());
        let input = buffer.register(SourceKind::Input).unwrap();
        let window = buffer.register(SourceKind::WindowEvent).unwrap();
        input.push(click(1_000, 0)).await.unwrap();
        input.end();
        window.end();

        let (tx, rx) = oneshot::channel();
        let consumer = tokio::spawn(run_consumer(buffer, mux, Duration::from_millis(10), quiet(), rx));
        tx.send(DrainRequest {
            deadline: Instant::now() + Duration::from_secs(1),
            forced: false,
        })
        .unwrap();

        let outcome = consumer.await.unwrap().unwrap();
        assert_eq!(outcome.summary.status, CloseStatus::Complete);
        assert_eq!(outcome.summary.samples_written, 1);
        assert_eq!(outcome.discarded, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_truncates_at_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let (buffer, mux) = consumer_fixture(dir.path());
        let input = buffer.register(SourceKind::Input).unwrap();
        // Never pushes, so the watermark never covers the click.
        let _window = buffer.register(SourceKind::WindowEvent).unwrap();
        input.push(click(1_000, 0)).await.unwrap();

        let (tx, rx) = oneshot::channel();
        let consumer = tokio::spawn(run_consumer(buffer, mux, Duration::from_millis(10), quiet(), rx));
        let deadline = Instant::now() + Duration::from_millis(100);
        tx.send(DrainRequest {
            deadline,
            forced: false,
        })
        .unwrap();

        let outcome = consumer.await.unwrap().unwrap();
        assert!(Instant::now() >= deadline);
        assert_eq!(outcome.summary.status, CloseStatus::Truncated);
        assert_eq!(outcome.summary.samples_written, 0);
        assert_eq!(outcome.discarded, 1);

        let log = crate::mux::read_event_log(dir.path().join("run.events.jsonl")).unwrap();
        assert!(!log.is_complete());
        assert_eq!(log.trailer.unwrap().status, CloseStatus::Truncated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_drain_never_claims_completion() {
        let dir = tempfile::tempdir().unwrap();
        let (buffer, mux) = consumer_fixture(dir.path());
        let input = buffer.register(SourceKind::Input).unwrap();
        input.push(click(1_000, 0)).await.unwrap();
        input.end();
        buffer.set_health(SourceKind::WindowEvent, SourceHealth::Failed);

        let (tx, rx) = oneshot::channel();
        let consumer = tokio::spawn(run_consumer(buffer, mux, Duration::from_millis(10), quiet(), rx));
        tx.send(DrainRequest {
            deadline: Instant::now() + Duration::from_secs(1),
            forced: true,
        })
        .unwrap();

        let outcome = consumer.await.unwrap().unwrap();
        assert_eq!(outcome.summary.status, CloseStatus::Truncated);
        // Everything releasable was still written first.
        assert_eq!(outcome.summary.samples_written, 1);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_an_error() {
        let mut session = SessionController::new(RecorderConfig::default());
        assert!(session.stop().await.is_err());
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_start() {
        let mut config = RecorderConfig::default();
        config.sources.screen.enabled = false;
        config.sources.audio.enabled = false;
        config.sources.input.enabled = false;
        config.sources.window.enabled = false;
        let mut session = SessionController::new(config);
        assert!(session.start().await.is_err());
        assert_eq!(session.status(), SessionStatus::Failed);
        // A failed session still reports.
        let report = session.wait().await.unwrap();
        assert_eq!(report.status, SessionStatus::Failed);
        assert!(report.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_warning_is_rate_limited() {
        let clock = RecordingClock::start();
        let mut watch = LatencyWatch::new(clock.clone(), Some(Duration::from_millis(100)));
        tokio::time::advance(Duration::from_millis(500)).await;

        // 450 ms and 50 ms old.
        let batch = [click(50_000_000, 0), click(450_000_000, 1)];
        assert_eq!(watch.observe(&batch), Some(Duration::from_millis(450)));
        // Within a second of the last warning: counted, not logged.
        assert_eq!(watch.observe(&[click(100_000_000, 2)]), None);
        assert_eq!(watch.slow, 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(watch.observe(&[click(1_450_000_000, 3)]).is_none());
        assert!(watch.observe(&[click(0, 4)]).is_some());
        assert_eq!(watch.slow, 0);

        let mut off = LatencyWatch::new(clock, None);
        assert_eq!(off.observe(&[click(0, 5)]), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_countdown_cancels_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RecorderConfig::default();
        config.output.path = dir.path().join("run");
        config.session.pid_file = Some(dir.path().join("syncap.pid"));
        config.session.start_after_ms = Some(5_000);
        let mut session = SessionController::with_adapters(config, Vec::new());

        let handle = session.shutdown_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_500)).await;
            handle.request(ShutdownReason::Signal);
        });
        let started = Instant::now();
        let err = session.start().await.unwrap_err();

        assert!(err.to_string().contains("countdown"));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(1_500) && waited < Duration::from_secs(2));
        assert_eq!(session.status(), SessionStatus::Failed);
        assert!(!dir.path().join("syncap.pid").exists());
        assert!(!dir.path().join("run.media").exists());
    }
}
