//! Clock and timing utilities for stream synchronization.
//!
//! Every sample is stamped on one session clock: monotonic nanoseconds since
//! the session started. Each source reports time in its own native domain
//! (a pipeline clock, a device counter, wall time) and owns a
//! [`ClockNormalizer`] that maps those readings onto the session clock.

use tokio::time::Instant;

use crate::error::{RecorderError, RecorderResult};

/// A recording clock that provides monotonic timestamps relative to
/// a fixed epoch (the moment the session started).
///
/// Built on tokio's `Instant`, so a paused test runtime drives it.
#[derive(Debug, Clone)]
pub struct RecordingClock {
    /// The instant recording started.
    epoch: Instant,

    /// Wall-clock time at epoch (ISO 8601 string).
    epoch_wall: String,
}

impl RecordingClock {
    /// Create a new recording clock anchored to now.
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
            epoch_wall: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Get nanoseconds elapsed since recording start.
    pub fn elapsed_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Get seconds elapsed since recording start.
    pub fn elapsed_secs(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Wall-clock time at recording start.
    pub fn epoch_wall(&self) -> &str {
        &self.epoch_wall
    }

    /// The underlying epoch instant.
    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    /// Take one calibration reading.
    ///
    /// The native read is bracketed by two session-clock reads and paired
    /// with their midpoint, which halves the error introduced by the read
    /// itself.
    pub fn bracket<F>(&self, read_native: F) -> RecorderResult<CalibrationPoint>
    where
        F: FnOnce() -> RecorderResult<u64>,
    {
        let before = self.elapsed_ns();
        let native_ns = read_native()?;
        let after = self.elapsed_ns();
        Ok(CalibrationPoint {
            native_ns,
            session_ns: before + (after - before) / 2,
        })
    }
}

/// Drift measurement between two streams.
#[derive(Debug, Clone, Copy)]
pub struct DriftMeasurement {
    /// Timestamp in the reference stream (ns).
    pub reference_ns: u64,
    /// Timestamp in the measured stream (ns).
    pub measured_ns: u64,
}

impl DriftMeasurement {
    /// Drift in nanoseconds (positive = measured is ahead).
    pub fn drift_ns(&self) -> i64 {
        self.measured_ns as i64 - self.reference_ns as i64
    }

    /// Drift in milliseconds.
    pub fn drift_ms(&self) -> f64 {
        self.drift_ns() as f64 / 1_000_000.0
    }
}

/// A simultaneous reading of a native clock and the session clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationPoint {
    pub native_ns: u64,
    pub session_ns: u64,
}

impl CalibrationPoint {
    /// Session minus native, in nanoseconds.
    pub fn offset_ns(&self) -> i128 {
        self.session_ns as i128 - self.native_ns as i128
    }
}

/// Per-source mapping from a native timestamp domain to the session clock.
///
/// The mapping is linear: an anchor point plus a drift rate. Output is
/// monotonic per source. A reading that would land before the last emitted
/// timestamp is clamped to one past it, one at or before a progress promise
/// to one past the promise; both count as a correction.
#[derive(Debug, Clone)]
pub struct ClockNormalizer {
    label: String,
    anchor: CalibrationPoint,
    drift_ppm: f64,
    max_drift_ppm: f64,
    last_emitted_ns: Option<u64>,
    promised_ns: Option<u64>,
    corrections: u64,
}

impl ClockNormalizer {
    /// Build a normalizer from startup readings.
    ///
    /// The offset is the median of the per-reading offsets, so one slow
    /// read does not skew the whole source.
    pub fn calibrate(
        label: impl Into<String>,
        points: &[CalibrationPoint],
        max_drift_ppm: f64,
    ) -> RecorderResult<Self> {
        let label = label.into();
        if points.is_empty() {
            return Err(RecorderError::calibration(label, "no calibration readings"));
        }

        let mut offsets: Vec<i128> = points.iter().map(CalibrationPoint::offset_ns).collect();
        offsets.sort_unstable();
        let median = offsets[offsets.len() / 2];

        let latest = points
            .iter()
            .max_by_key(|p| p.native_ns)
            .copied()
            .unwrap_or(points[0]);
        let anchor_session = (latest.native_ns as i128 + median).clamp(0, u64::MAX as i128) as u64;

        Ok(Self {
            label,
            anchor: CalibrationPoint {
                native_ns: latest.native_ns,
                session_ns: anchor_session,
            },
            drift_ppm: 0.0,
            max_drift_ppm,
            last_emitted_ns: None,
            promised_ns: None,
            corrections: 0,
        })
    }

    /// Source label used in logs.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Session minus native at the anchor, in nanoseconds.
    pub fn offset_ns(&self) -> i64 {
        self.anchor.offset_ns().clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    /// Currently applied drift rate in parts per million.
    pub fn drift_ppm(&self) -> f64 {
        self.drift_ppm
    }

    /// Number of clamped readings so far.
    pub fn corrections(&self) -> u64 {
        self.corrections
    }

    /// Last timestamp handed out by [`normalize`](Self::normalize).
    pub fn last_emitted_ns(&self) -> Option<u64> {
        self.last_emitted_ns
    }

    /// Lowest timestamp the next sample may carry.
    pub fn floor_ns(&self) -> Option<u64> {
        let after_promise = self.promised_ns.map(|p| p.saturating_add(1));
        match (self.last_emitted_ns, after_promise) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Map a native reading onto the session clock without side effects.
    pub fn project(&self, native_ns: u64) -> u64 {
        let delta = native_ns as i128 - self.anchor.native_ns as i128;
        let scaled = (delta as f64 * (1.0 + self.drift_ppm / 1_000_000.0)).round() as i128;
        (self.anchor.session_ns as i128 + scaled).clamp(0, u64::MAX as i128) as u64
    }

    /// Map a native reading onto the session clock, enforcing monotonicity.
    pub fn normalize(&mut self, native_ns: u64) -> u64 {
        let projected = self.project(native_ns);
        let mut stamped = projected;
        if let Some(last) = self.last_emitted_ns {
            if stamped < last {
                stamped = last.saturating_add(1);
            }
        }
        if let Some(promised) = self.promised_ns {
            if stamped <= promised {
                stamped = promised.saturating_add(1);
            }
        }

        if stamped != projected {
            self.corrections += 1;
            tracing::trace!(
                source = %self.label,
                projected,
                stamped,
                "Clamped regressing timestamp"
            );
        }
        self.last_emitted_ns = Some(stamped);
        stamped
    }

    /// Promise that no later sample is stamped at or before `session_ns`.
    ///
    /// Returns the promised bound, which never moves backwards.
    pub fn promise(&mut self, session_ns: u64) -> u64 {
        let promised = self.promised_ns.map_or(session_ns, |p| p.max(session_ns));
        self.promised_ns = Some(promised);
        promised
    }

    /// Re-estimate the drift rate from a fresh reading.
    ///
    /// Returns the error of the previous mapping at `point`.
    pub fn recalibrate(&mut self, point: CalibrationPoint) -> Option<DriftMeasurement> {
        let native_span = point.native_ns as i128 - self.anchor.native_ns as i128;
        if native_span <= 0 {
            return None;
        }
        let measurement = DriftMeasurement {
            reference_ns: point.session_ns,
            measured_ns: self.project(point.native_ns),
        };

        let session_span = point.session_ns as i128 - self.anchor.session_ns as i128;
        let rate = session_span as f64 / native_span as f64 - 1.0;
        let ppm = (rate * 1_000_000.0).clamp(-self.max_drift_ppm, self.max_drift_ppm);
        if (ppm - self.drift_ppm).abs() > f64::EPSILON {
            tracing::debug!(
                source = %self.label,
                previous_ppm = self.drift_ppm,
                drift_ppm = ppm,
                error_ms = measurement.drift_ms(),
                "Clock drift re-estimated"
            );
        }
        self.drift_ppm = ppm;
        Some(measurement)
    }
}
