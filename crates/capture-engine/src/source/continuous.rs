//! Screen and Audio adapters: fixed-rate media.
//!
//! The adapter wakes once per slot and drains whatever the backend has
//! ready. Slots the device skipped are reported as one `stalled` gap
//! marker when capture resumes; frames are never fabricated.

use std::time::Duration;

use syncap_common::error::RecorderResult;
use syncap_sample_model::{Captured, GapReason, Payload, SourceHealth};
use tokio::time::{Instant, MissedTickBehavior};

use super::{next_recalibration, on_blocking_pool, AdapterReport, Cadence, Emitter, RunSettings};
use crate::backend::{AudioSource, FrameSource};

/// Common face of the two media backends.
pub(crate) trait MediaBackend: Send + 'static {
    fn next(&mut self) -> RecorderResult<Option<Captured<Payload>>>;
    fn native_clock_ns(&mut self) -> RecorderResult<u64>;
    fn name(&self) -> &str;
    fn is_exhausted(&self) -> bool;
    fn end_stream(&mut self) -> RecorderResult<()>;
    fn stop(&mut self) -> RecorderResult<()>;
}

impl MediaBackend for Box<dyn FrameSource> {
    fn next(&mut self) -> RecorderResult<Option<Captured<Payload>>> {
        Ok(self
            .next_frame()?
            .map(|c| Captured::new(c.native_ns, Payload::Video(c.value))))
    }

    fn native_clock_ns(&mut self) -> RecorderResult<u64> {
        FrameSource::native_clock_ns(self.as_mut())
    }

    fn name(&self) -> &str {
        FrameSource::name(self.as_ref())
    }

    fn is_exhausted(&self) -> bool {
        FrameSource::is_exhausted(self.as_ref())
    }

    fn end_stream(&mut self) -> RecorderResult<()> {
        FrameSource::end_stream(self.as_mut())
    }

    fn stop(&mut self) -> RecorderResult<()> {
        FrameSource::stop(self.as_mut())
    }
}

impl MediaBackend for Box<dyn AudioSource> {
    fn next(&mut self) -> RecorderResult<Option<Captured<Payload>>> {
        Ok(self
            .next_block()?
            .map(|c| Captured::new(c.native_ns, Payload::Audio(c.value))))
    }

    fn native_clock_ns(&mut self) -> RecorderResult<u64> {
        AudioSource::native_clock_ns(self.as_mut())
    }

    fn name(&self) -> &str {
        AudioSource::name(self.as_ref())
    }

    fn is_exhausted(&self) -> bool {
        AudioSource::is_exhausted(self.as_ref())
    }

    fn end_stream(&mut self) -> RecorderResult<()> {
        AudioSource::end_stream(self.as_mut())
    }

    fn stop(&mut self) -> RecorderResult<()> {
        AudioSource::stop(self.as_mut())
    }
}

/// Tracks which slots produced a sample.
struct SlotTracker {
    interval_ns: u64,
    stall_after_missed: u32,
    last_native_ns: Option<u64>,
    last_sample_at: Instant,
}

impl SlotTracker {
    fn new(cadence: Cadence) -> Self {
        Self {
            interval_ns: (cadence.interval.as_nanos() as u64).max(1),
            stall_after_missed: cadence.stall_after_missed.max(1),
            last_native_ns: None,
            last_sample_at: Instant::now(),
        }
    }

    /// Slots skipped between the previous sample and one read at
    /// `native_ns`, with the native time of the first skipped slot.
    fn missed_before(&self, native_ns: u64) -> Option<(u64, u64)> {
        let last = self.last_native_ns?;
        let span = native_ns.checked_sub(last)?;
        let slots = (span + self.interval_ns / 2) / self.interval_ns;
        let missing = slots.checked_sub(1).filter(|m| *m > 0)?;
        Some((last + self.interval_ns, missing))
    }

    /// Whole slots missed between the previous sample and `native_ns`,
    /// without rounding up a slot still in progress.
    fn missed_until(&self, native_ns: u64) -> Option<(u64, u64)> {
        let last = self.last_native_ns?;
        let slots = native_ns.checked_sub(last)? / self.interval_ns;
        let missing = slots.checked_sub(1).filter(|m| *m > 0)?;
        Some((last + self.interval_ns, missing))
    }

    fn record(&mut self, native_ns: u64) {
        self.last_native_ns = Some(native_ns);
        self.last_sample_at = Instant::now();
    }

    fn consecutive_missed(&self) -> u64 {
        self.last_sample_at.elapsed().as_nanos() as u64 / self.interval_ns
    }
}

pub(crate) async fn run<B: MediaBackend>(
    backend: B,
    mut emitter: Emitter,
    cadence: Cadence,
    settings: RunSettings,
) -> AdapterReport {
    let name = backend.name().to_string();
    let mut backend = backend;
    let mut slots = SlotTracker::new(cadence);
    let mut ticker = tokio::time::interval(cadence.interval.max(Duration::from_micros(100)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut recalibration = settings.recalibration_ticker();
    let mut error = None;
    let mut exhausted = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = next_recalibration(&mut recalibration) => {
                emitter.recalibrate(|| backend.native_clock_ns());
                continue;
            }
        }
        if settings.stop_requested() {
            break;
        }
        if let Err(e) = drain_due(&mut backend, &mut emitter, &mut slots).await {
            error = Some(e.to_string());
            break;
        }
        if backend.is_exhausted() {
            tracing::info!(source = %emitter.kind(), backend = %name, "Backend exhausted");
            exhausted = true;
            break;
        }

        let missed = slots.consecutive_missed();
        if missed >= slots.stall_after_missed as u64 && emitter.health() == SourceHealth::Running {
            emitter.report_stalled(format!("{missed} consecutive slots missed"));
        }
    }

    // End the stream, take everything the device still delivers, then
    // account for the tail.
    if error.is_none() && !exhausted {
        match on_blocking_pool(backend, |b| b.end_stream()).await {
            Ok((returned, result)) => {
                backend = returned;
                if let Err(e) = result {
                    tracing::warn!(backend = %name, error = %e, "Stream did not end cleanly");
                }
            }
            Err(e) => return emitter.finish(name, Some(e.to_string())),
        }
        if let Err(e) = drain_due(&mut backend, &mut emitter, &mut slots).await {
            error = Some(e.to_string());
        }
    }
    if error.is_none() && !exhausted {
        if let Err(e) = push_tail_gap(&mut backend, &mut emitter, &slots).await {
            error = Some(e.to_string());
        }
    }
    // Stopping a pipeline waits for its end-of-stream.
    match on_blocking_pool(backend, |b| b.stop()).await {
        Ok((_, Ok(()))) => {}
        Ok((_, Err(e))) | Err(e) => {
            tracing::warn!(backend = %name, error = %e, "Backend did not stop cleanly");
        }
    }
    emitter.finish(name, error)
}

async fn drain_due<B: MediaBackend>(
    backend: &mut B,
    emitter: &mut Emitter,
    slots: &mut SlotTracker,
) -> RecorderResult<()> {
    while let Some(captured) = backend.next()? {
        if let Some((at, missing)) = slots.missed_before(captured.native_ns) {
            emitter.push_gap(at, missing, GapReason::Stalled).await?;
        }
        emitter.push(captured.native_ns, captured.value).await?;
        slots.record(captured.native_ns);
    }
    Ok(())
}

async fn push_tail_gap<B: MediaBackend>(
    backend: &mut B,
    emitter: &mut Emitter,
    slots: &SlotTracker,
) -> RecorderResult<()> {
    let now = backend.native_clock_ns()?;
    if let Some((at, missing)) = slots.missed_until(now) {
        emitter.push_gap(at, missing, GapReason::Stalled).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> SlotTracker {
        SlotTracker::new(Cadence {
            interval: Duration::from_nanos(100),
            stall_after_missed: 3,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_gap_for_consecutive_slots() {
        let mut slots = tracker();
        assert_eq!(slots.missed_before(1_000), None);
        slots.record(1_000);
        assert_eq!(slots.missed_before(1_100), None);
        // Jitter within half a slot is not a miss.
        assert_eq!(slots.missed_before(1_140), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_slots_counted_from_native_time() {
        let mut slots = tracker();
        slots.record(1_000);
        assert_eq!(slots.missed_before(1_400), Some((1_100, 3)));
        assert_eq!(slots.missed_until(1_150), None);
        assert_eq!(slots.missed_until(1_350), Some((1_100, 2)));
    }
}
