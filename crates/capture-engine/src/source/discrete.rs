//! Input and WindowEvent adapters: polled, event-driven, never dropping.
//!
//! Each poll drains every ready event. Backends read devices and run
//! helper processes, so the reads happen on the blocking pool in batches
//! and only the pushes run on the adapter task. A full queue makes the
//! push wait; past the push timeout the source fails with `Overflow` and
//! the session carries on without it. Between events the adapter promises
//! progress so the watermark keeps moving.

use std::time::Duration;

use syncap_common::error::{RecorderError, RecorderResult};
use syncap_input_tracker::{InputBackend, WindowBackend};
use syncap_sample_model::{Captured, Payload};
use tokio::time::MissedTickBehavior;

use super::{next_recalibration, on_blocking_pool, AdapterReport, Emitter, RunSettings};

/// Most events read per trip to the blocking pool.
const POLL_BATCH: usize = 256;

pub(crate) trait EventBackend: Send + 'static {
    fn next(&mut self) -> RecorderResult<Option<Captured<Payload>>>;
    fn native_clock_ns(&mut self) -> RecorderResult<u64>;
    fn name(&self) -> &str;
}

impl EventBackend for Box<dyn InputBackend> {
    fn next(&mut self) -> RecorderResult<Option<Captured<Payload>>> {
        Ok(self
            .poll()?
            .map(|c| Captured::new(c.native_ns, Payload::Input(c.value))))
    }

    fn native_clock_ns(&mut self) -> RecorderResult<u64> {
        InputBackend::native_clock_ns(self.as_mut())
    }

    fn name(&self) -> &str {
        InputBackend::name(self.as_ref())
    }
}

impl EventBackend for Box<dyn WindowBackend> {
    fn next(&mut self) -> RecorderResult<Option<Captured<Payload>>> {
        Ok(self
            .poll()?
            .map(|c| Captured::new(c.native_ns, Payload::Window(c.value))))
    }

    fn native_clock_ns(&mut self) -> RecorderResult<u64> {
        WindowBackend::native_clock_ns(self.as_mut())
    }

    fn name(&self) -> &str {
        WindowBackend::name(self.as_ref())
    }
}

pub(crate) async fn run<B: EventBackend>(
    backend: B,
    mut emitter: Emitter,
    poll_interval: Duration,
    settings: RunSettings,
) -> AdapterReport {
    let name = backend.name().to_string();
    let mut backend = Some(backend);
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut recalibration = settings.recalibration_ticker();
    let mut error = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = next_recalibration(&mut recalibration) => {
                if let Some(backend) = backend.as_mut() {
                    emitter.recalibrate(|| backend.native_clock_ns());
                }
                continue;
            }
        }
        if settings.stop_requested() {
            break;
        }
        if let Err(e) = drain_ready(&mut backend, &mut emitter, &settings).await {
            error = Some(e.to_string());
            break;
        }
        emitter.promise_idle();
    }

    if error.is_none() {
        if let Err(e) = drain_ready(&mut backend, &mut emitter, &settings).await {
            error = Some(e.to_string());
        }
    }
    emitter.finish(name, error)
}

/// Push every event the backend has ready. A stop request ends the drain
/// early only between batches.
async fn drain_ready<B: EventBackend>(
    slot: &mut Option<B>,
    emitter: &mut Emitter,
    settings: &RunSettings,
) -> RecorderResult<()> {
    loop {
        let backend = slot
            .take()
            .ok_or_else(|| RecorderError::capture("backend lost by an earlier failed read"))?;
        let (backend, (batch, failure)) = on_blocking_pool(backend, read_batch).await?;
        *slot = Some(backend);

        let full = batch.len() == POLL_BATCH;
        for captured in batch {
            emitter.push(captured.native_ns, captured.value).await?;
        }
        if let Some(e) = failure {
            return Err(e);
        }
        if !full || settings.stop_requested() {
            return Ok(());
        }
    }
}

/// Read up to [`POLL_BATCH`] ready events. Events read before a failure
/// are still returned.
fn read_batch<B: EventBackend>(
    backend: &mut B,
) -> (Vec<Captured<Payload>>, Option<RecorderError>) {
    let mut batch = Vec::new();
    while batch.len() < POLL_BATCH {
        match backend.next() {
            Ok(Some(captured)) => batch.push(captured),
            Ok(None) => break,
            Err(e) => return (batch, Some(e)),
        }
    }
    (batch, None)
}
