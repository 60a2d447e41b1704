//! Stamping and pushing on behalf of one adapter.

use std::time::Duration;

use syncap_common::clock::{ClockNormalizer, RecordingClock};
use syncap_common::error::{RecorderError, RecorderResult};
use syncap_sample_model::{GapReason, Payload, Sample, SourceHealth, SourceKind, TimestampNs};
use tokio::sync::mpsc;

use super::{AdapterReport, SourceEvent};
use crate::sync::QueueProducer;

/// Owns the normalizer, sequence counter and producer of one source.
pub(crate) struct Emitter {
    kind: SourceKind,
    clock: RecordingClock,
    normalizer: ClockNormalizer,
    producer: QueueProducer,
    events: mpsc::UnboundedSender<SourceEvent>,
    max_lateness_ns: u64,
    next_sequence: u64,
    samples: u64,
    gaps: u64,
    missing: u64,
    reported_corrections: u64,
}

impl Emitter {
    pub fn new(
        kind: SourceKind,
        clock: RecordingClock,
        normalizer: ClockNormalizer,
        producer: QueueProducer,
        events: mpsc::UnboundedSender<SourceEvent>,
        max_lateness: Duration,
    ) -> Self {
        Self {
            kind,
            clock,
            normalizer,
            producer,
            events,
            max_lateness_ns: max_lateness.as_nanos() as u64,
            next_sequence: 0,
            samples: 0,
            gaps: 0,
            missing: 0,
            reported_corrections: 0,
        }
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn health(&self) -> SourceHealth {
        self.producer.health()
    }

    /// Stamp a native reading and push it.
    pub async fn push(&mut self, native_ns: u64, payload: Payload) -> RecorderResult<TimestampNs> {
        let ts = self.normalizer.normalize(native_ns);
        let sample = Sample::new(self.kind, ts, self.next_sequence, payload);
        self.producer.push(sample).await?;
        self.next_sequence += 1;
        self.samples += 1;
        self.report_corrections();
        Ok(ts)
    }

    /// Push a gap standing in for `missing` samples that should have been
    /// read at `native_ns`. The gap consumes their sequence numbers.
    pub async fn push_gap(
        &mut self,
        native_ns: u64,
        missing: u64,
        reason: GapReason,
    ) -> RecorderResult<()> {
        if missing == 0 {
            return Ok(());
        }
        let ts = self.normalizer.normalize(native_ns);
        let gap = Sample::gap(self.kind, ts, self.next_sequence, missing, reason);
        self.producer.push(gap).await?;
        self.next_sequence += missing;
        self.gaps += 1;
        self.missing += missing;
        tracing::debug!(source = %self.kind, missing, ?reason, t = ts, "Recorded gap");
        Ok(())
    }

    /// Promise that nothing older than `max_lateness` before now will be
    /// pushed, so an idle source does not hold the watermark back.
    pub fn promise_idle(&mut self) {
        let bound = self.clock.elapsed_ns().saturating_sub(self.max_lateness_ns);
        if self.normalizer.last_emitted_ns().is_some_and(|last| last > bound) {
            // Pushed samples already carry the frontier further.
            return;
        }
        let promised = self.normalizer.promise(bound);
        self.producer.promise(promised);
    }

    /// Re-estimate drift from a fresh bracketed reading.
    pub fn recalibrate<F>(&mut self, read_native: F)
    where
        F: FnOnce() -> RecorderResult<u64>,
    {
        let point = match self.clock.bracket(read_native) {
            Ok(point) => point,
            Err(e) => {
                tracing::warn!(source = %self.kind, error = %e, "Recalibration reading failed");
                return;
            }
        };
        if let Some(measurement) = self.normalizer.recalibrate(point) {
            let _ = self.events.send(SourceEvent::Drift {
                kind: self.kind,
                drift_ppm: self.normalizer.drift_ppm(),
                error_ns: measurement.drift_ns(),
            });
        }
    }

    /// Mark the stream Stalled if it is running.
    pub fn report_stalled(&mut self, detail: String) {
        if self.producer.set_health(SourceHealth::Stalled) {
            let stall = RecorderError::stalled(self.kind.as_str(), detail);
            tracing::warn!(error = %stall, "Source stalled");
            let _ = self.events.send(SourceEvent::Health {
                kind: self.kind,
                health: SourceHealth::Stalled,
                detail: Some(stall.to_string()),
            });
        }
    }

    /// Close the stream and build the adapter report.
    ///
    /// With an error the stream ends Failed; already-queued samples still
    /// drain either way.
    pub fn finish(self, backend: String, error: Option<String>) -> AdapterReport {
        let target = if error.is_some() {
            SourceHealth::Failed
        } else {
            SourceHealth::Ended
        };
        self.producer.set_health(target);
        let final_health = self.producer.health();

        match &error {
            Some(e) => tracing::error!(source = %self.kind, error = %e, "Source failed"),
            None => tracing::info!(
                source = %self.kind,
                samples = self.samples,
                gaps = self.gaps,
                "Source ended"
            ),
        }
        let _ = self.events.send(SourceEvent::Health {
            kind: self.kind,
            health: final_health,
            detail: error.clone(),
        });

        AdapterReport {
            kind: self.kind,
            backend,
            samples: self.samples,
            gaps: self.gaps,
            missing: self.missing,
            corrections: self.normalizer.corrections(),
            offset_ns: self.normalizer.offset_ns(),
            drift_ppm: self.normalizer.drift_ppm(),
            final_health,
            error,
        }
    }

    fn report_corrections(&mut self) {
        let total = self.normalizer.corrections();
        if total > self.reported_corrections {
            self.reported_corrections = total;
            let _ = self.events.send(SourceEvent::ClockCorrection {
                kind: self.kind,
                total,
            });
        }
    }
}
