//! Per-source bounded queue.
//!
//! One producer (the source adapter) and one consumer (the synchronization
//! buffer). The queue does not block; waiting for space is the producer
//! handle's job.

use std::collections::VecDeque;

use syncap_sample_model::{GapReason, Payload, Sample, SourceHealth, SourceKind, TimestampNs};
use tokio::time::Instant;

/// Result of offering a sample to a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Appended as-is.
    Queued,
    /// Appended after evicting the oldest queued sample.
    Evicted,
    /// Arrived at or behind the queue floor. Droppable samples were turned
    /// into a `late` gap; others were moved just past the floor and queued.
    Late,
    /// No space and the sample may not be dropped.
    Full,
    /// The stream is terminal and accepts nothing.
    Closed,
}

/// Evicted samples not yet represented in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingGap {
    first_ts: TimestampNs,
    first_seq: u64,
    missing: u64,
}

/// Counters kept for the session manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: u64,
    pub evicted: u64,
    pub late: u64,
    pub clamped: u64,
    pub released: u64,
    /// Samples the gap markers released so far stand in for.
    pub missing: u64,
}

#[derive(Debug)]
pub struct SourceQueue {
    kind: SourceKind,
    capacity: usize,
    items: VecDeque<Sample>,
    pending_gap: Option<PendingGap>,
    health: SourceHealth,
    high_water_ns: Option<TimestampNs>,
    floor_ns: Option<TimestampNs>,
    last_progress: Instant,
    stats: QueueStats,
}

impl SourceQueue {
    pub fn new(kind: SourceKind, capacity: usize) -> Self {
        Self {
            kind,
            capacity: capacity.max(1),
            items: VecDeque::with_capacity(capacity.min(4096)),
            pending_gap: None,
            health: SourceHealth::Running,
            high_water_ns: None,
            floor_ns: None,
            last_progress: Instant::now(),
            stats: QueueStats::default(),
        }
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queued samples, not counting a pending gap marker.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.pending_gap.is_none()
    }

    pub fn health(&self) -> SourceHealth {
        self.health
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    pub fn high_water_ns(&self) -> Option<TimestampNs> {
        self.high_water_ns
    }

    pub fn floor_ns(&self) -> Option<TimestampNs> {
        self.floor_ns
    }

    pub fn last_progress(&self) -> Instant {
        self.last_progress
    }

    /// Change health. Terminal states are final.
    ///
    /// Returns whether the health actually changed.
    pub fn set_health(&mut self, health: SourceHealth) -> bool {
        if self.health.is_terminal() || self.health == health {
            return false;
        }
        self.health = health;
        if health == SourceHealth::Running {
            self.last_progress = Instant::now();
        }
        true
    }

    /// Whether the stream holds the watermark back.
    pub fn is_active(&self) -> bool {
        self.health == SourceHealth::Running
    }

    /// Timestamp of the next sample the consumer would take.
    pub fn front_ns(&self) -> Option<TimestampNs> {
        match self.pending_gap {
            Some(gap) => Some(gap.first_ts),
            None => self.items.front().map(|s| s.timestamp_ns),
        }
    }

    /// Oldest unconsumed timestamp, or the highest pushed/promised one
    /// when nothing is queued.
    pub fn frontier_ns(&self) -> Option<TimestampNs> {
        self.front_ns().or(self.high_water_ns)
    }

    /// Record that nothing at or before `ts` will be pushed.
    pub fn promise(&mut self, ts: TimestampNs) {
        if self.health.is_terminal() {
            return;
        }
        if self.advance_high_water(ts) && self.health == SourceHealth::Stalled {
            self.health = SourceHealth::Running;
        }
    }

    /// Offer a sample without waiting.
    ///
    /// The floor is inclusive: a sample stamped exactly at an instant the
    /// buffer already released is late too. Samples at one instant go out
    /// in source priority order, so one arriving after that instant was
    /// written could land behind a lower-priority sample of the same
    /// instant. Sequence numbers only order samples within one source and
    /// cannot settle that.
    pub fn offer(&mut self, mut sample: Sample) -> PushOutcome {
        if self.health.is_terminal() {
            return PushOutcome::Closed;
        }

        let late_at = self
            .floor_ns
            .filter(|floor| sample.timestamp_ns <= *floor)
            .map(|floor| floor.saturating_add(1));
        if let Some(at) = late_at {
            if self.kind.is_droppable() {
                self.record_late(at, &sample);
                return PushOutcome::Late;
            }
        }

        let mut outcome = PushOutcome::Queued;
        if self.items.len() >= self.capacity {
            if !self.kind.is_droppable() {
                return PushOutcome::Full;
            }
            self.evict_front();
            outcome = PushOutcome::Evicted;
        }

        if let Some(at) = late_at {
            sample.timestamp_ns = at;
            self.stats.clamped += 1;
            outcome = PushOutcome::Late;
        }

        if !sample.is_gap() && self.health == SourceHealth::Stalled {
            self.health = SourceHealth::Running;
        }
        self.advance_high_water(sample.timestamp_ns);
        self.stats.pushed += 1;
        self.items.push_back(sample);
        outcome
    }

    /// Take the next sample if it is at or before `watermark`.
    pub fn pop_ready(&mut self, watermark: TimestampNs) -> Option<Sample> {
        if self.front_ns()? > watermark {
            return None;
        }

        let sample = match self.pending_gap.take() {
            Some(gap) => Sample::gap(
                self.kind,
                gap.first_ts,
                gap.first_seq,
                gap.missing,
                GapReason::Evicted,
            ),
            None => self.items.pop_front()?,
        };

        self.stats.released += 1;
        if let Payload::Gap(marker) = &sample.payload {
            self.stats.missing += marker.missing;
        }
        Some(sample)
    }

    /// Raise the floor at or below which pushes count as late.
    pub fn raise_floor(&mut self, ts: TimestampNs) {
        self.floor_ns = Some(self.floor_ns.map_or(ts, |f| f.max(ts)));
    }

    /// Drop everything still queued. Returns how many samples were lost.
    pub fn discard(&mut self) -> u64 {
        let gap = self.pending_gap.take().map_or(0, |g| g.missing);
        let dropped = self.items.len() as u64;
        self.items.clear();
        gap + dropped
    }

    fn advance_high_water(&mut self, ts: TimestampNs) -> bool {
        if self.high_water_ns.map_or(true, |hw| ts > hw) {
            self.high_water_ns = Some(ts);
            self.last_progress = Instant::now();
            return true;
        }
        false
    }

    fn evict_front(&mut self) {
        let Some(evicted) = self.items.pop_front() else {
            return;
        };
        let count = match &evicted.payload {
            Payload::Gap(marker) => marker.missing,
            _ => 1,
        };
        self.stats.evicted += count;
        match self.pending_gap.as_mut() {
            Some(gap) => gap.missing += count,
            None => {
                self.pending_gap = Some(PendingGap {
                    first_ts: evicted.timestamp_ns,
                    first_seq: evicted.sequence,
                    missing: count,
                })
            }
        }
    }

    /// Fold a droppable sample that arrived behind the floor into a `late`
    /// gap marker stamped at `at`.
    fn record_late(&mut self, at: TimestampNs, sample: &Sample) {
        let count = match &sample.payload {
            Payload::Gap(marker) => marker.missing,
            _ => 1,
        };
        self.stats.late += count;

        if let Some(back) = self.items.back_mut() {
            if back.timestamp_ns == at {
                if let Payload::Gap(marker) = &mut back.payload {
                    if marker.reason == GapReason::Late {
                        marker.missing += count;
                        return;
                    }
                }
            }
        }

        let gap = Sample::gap(self.kind, at, sample.sequence, count, GapReason::Late);
        if self.items.len() >= self.capacity {
            self.evict_front();
        }
        self.advance_high_water(at);
        self.items.push_back(gap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncap_sample_model::{AudioBlock, InputEvent, VideoFrame};

    fn frame(ts: u64, seq: u64) -> Sample {
        Sample::video(
            ts,
            seq,
            VideoFrame {
                width: 2,
                height: 2,
                codec: "raw-bgrx".into(),
                data: vec![0; 16],
            },
        )
    }

    fn block(ts: u64, seq: u64) -> Sample {
        Sample::audio(
            ts,
            seq,
            AudioBlock {
                sample_rate: 48_000,
                channels: 2,
                frames: 4,
                data: vec![0; 16],
            },
        )
    }

    fn click(ts: u64, seq: u64) -> Sample {
        Sample::input(ts, seq, InputEvent::pointer(0.5, 0.5))
    }

    #[test]
    fn test_droppable_overflow_evicts_oldest_and_reports_gap() {
        let mut queue = SourceQueue::new(SourceKind::Video, 2);
        assert_eq!(queue.offer(frame(10, 0)), PushOutcome::Queued);
        assert_eq!(queue.offer(frame(20, 1)), PushOutcome::Queued);
        assert_eq!(queue.offer(frame(30, 2)), PushOutcome::Evicted);
        assert_eq!(queue.offer(frame(40, 3)), PushOutcome::Evicted);

        // The gap stands in for frames 0 and 1 and comes out first.
        assert_eq!(queue.front_ns(), Some(10));
        let gap = queue.pop_ready(u64::MAX).unwrap();
        assert_eq!(gap.sequence, 0);
        match gap.payload {
            Payload::Gap(marker) => {
                assert_eq!(marker.missing, 2);
                assert_eq!(marker.reason, GapReason::Evicted);
            }
            other => panic!("expected gap, got {other:?}"),
        }
        assert_eq!(queue.pop_ready(u64::MAX).unwrap().sequence, 2);
        assert_eq!(queue.pop_ready(u64::MAX).unwrap().sequence, 3);
        assert!(queue.is_empty());
        assert_eq!(queue.stats().evicted, 2);
        assert_eq!(queue.stats().missing, 2);
    }

    #[test]
    fn test_non_droppable_overflow_is_full() {
        let mut queue = SourceQueue::new(SourceKind::Input, 1);
        assert_eq!(queue.offer(click(1, 0)), PushOutcome::Queued);
        assert_eq!(queue.offer(click(2, 1)), PushOutcome::Full);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_ready(5).unwrap().timestamp_ns, 1);
        assert_eq!(queue.offer(click(2, 1)), PushOutcome::Queued);
    }

    #[test]
    fn test_pop_respects_watermark() {
        let mut queue = SourceQueue::new(SourceKind::Audio, 8);
        queue.offer(block(100, 0));
        queue.offer(block(200, 1));
        assert_eq!(queue.pop_ready(99), None);
        assert_eq!(queue.pop_ready(150).unwrap().timestamp_ns, 100);
        assert_eq!(queue.pop_ready(150), None);
        assert_eq!(queue.frontier_ns(), Some(200));
    }

    #[test]
    fn test_frontier_falls_back_to_promise() {
        let mut queue = SourceQueue::new(SourceKind::Input, 8);
        assert_eq!(queue.frontier_ns(), None);
        queue.promise(500);
        assert_eq!(queue.frontier_ns(), Some(500));
        queue.promise(300);
        assert_eq!(queue.frontier_ns(), Some(500));
    }

    #[test]
    fn test_late_samples_at_or_below_floor() {
        let mut video = SourceQueue::new(SourceKind::Video, 8);
        video.raise_floor(1_000);
        assert_eq!(video.offer(frame(400, 7)), PushOutcome::Late);
        assert_eq!(video.offer(frame(1_000, 8)), PushOutcome::Late);
        assert_eq!(video.offer(frame(1_200, 9)), PushOutcome::Queued);
        assert_eq!(video.len(), 2);
        let gap = video.pop_ready(1_001).unwrap();
        assert_eq!(gap.timestamp_ns, 1_001);
        assert_eq!(gap.sequence, 7);
        assert!(matches!(
            gap.payload,
            Payload::Gap(marker) if marker.missing == 2 && marker.reason == GapReason::Late
        ));
        assert_eq!(video.stats().late, 2);

        let mut input = SourceQueue::new(SourceKind::Input, 8);
        input.raise_floor(1_000);
        assert_eq!(input.offer(click(400, 0)), PushOutcome::Late);
        let clamped = input.pop_ready(1_001).unwrap();
        assert_eq!(clamped.timestamp_ns, 1_001);
        assert!(!clamped.is_gap());
        assert_eq!(input.stats().clamped, 1);
    }

    #[test]
    fn test_sample_at_released_instant_is_late() {
        // Video at t=1000 was released, which raised every floor to 1000.
        let mut audio = SourceQueue::new(SourceKind::Audio, 8);
        audio.raise_floor(1_000);
        assert_eq!(audio.offer(block(1_000, 3)), PushOutcome::Late);
        let gap = audio.pop_ready(u64::MAX).unwrap();
        assert_eq!(gap.timestamp_ns, 1_001);
        assert_eq!(gap.sequence, 3);
        assert!(matches!(
            gap.payload,
            Payload::Gap(marker) if marker.missing == 1 && marker.reason == GapReason::Late
        ));
        // One past the floor is on time.
        assert_eq!(audio.offer(block(1_001, 4)), PushOutcome::Queued);
    }

    #[test]
    fn test_terminal_health_is_final() {
        let mut queue = SourceQueue::new(SourceKind::Input, 4);
        assert!(queue.set_health(SourceHealth::Ended));
        assert!(!queue.set_health(SourceHealth::Running));
        assert_eq!(queue.offer(click(1, 0)), PushOutcome::Closed);
    }

    #[test]
    fn test_real_sample_recovers_stalled_stream() {
        let mut queue = SourceQueue::new(SourceKind::Video, 4);
        queue.set_health(SourceHealth::Stalled);
        queue.offer(Sample::gap(SourceKind::Video, 5, 0, 1, GapReason::Stalled));
        assert_eq!(queue.health(), SourceHealth::Stalled);
        queue.offer(frame(10, 1));
        assert_eq!(queue.health(), SourceHealth::Running);
    }
}
