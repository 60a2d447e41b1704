//! Synchronization buffer: per-source queues merged under a watermark.
//!
//! The watermark is the minimum frontier over streams that are still
//! running. A frontier is the oldest queued timestamp of a stream or, when
//! its queue is empty, the highest timestamp it has pushed or promised.
//! Everything at or below the watermark is released in session-time order,
//! ties broken by source priority and then queue order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use syncap_common::config::SyncConfig;
use syncap_common::error::{RecorderError, RecorderResult};
use syncap_sample_model::{Sample, SourceHealth, SourceKind, TimestampNs};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use crate::queue::{PushOutcome, QueueStats, SourceQueue};
use crate::source::SourceEvent;

/// Release counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub released: u64,
    pub queued: usize,
    pub last_watermark_ns: Option<TimestampNs>,
}

struct BufferState {
    queues: Vec<SourceQueue>,
    last_watermark_ns: Option<TimestampNs>,
    released: u64,
}

struct Shared {
    state: Mutex<BufferState>,
    space: HashMap<SourceKind, Notify>,
    events: Option<mpsc::UnboundedSender<SourceEvent>>,
    config: SyncConfig,
}

/// Consumer side of the per-source queues. Cheap to clone.
#[derive(Clone)]
pub struct SyncBuffer {
    shared: Arc<Shared>,
}

/// Producer side of one queue, owned by its source adapter.
pub struct QueueProducer {
    kind: SourceKind,
    shared: Arc<Shared>,
}

impl SyncBuffer {
    pub fn new(config: &SyncConfig) -> Self {
        Self::build(config, None)
    }

    /// Report stalls, recoveries and overflows on `events`.
    pub fn with_events(config: &SyncConfig, events: mpsc::UnboundedSender<SourceEvent>) -> Self {
        Self::build(config, Some(events))
    }

    fn build(config: &SyncConfig, events: Option<mpsc::UnboundedSender<SourceEvent>>) -> Self {
        let space = SourceKind::ALL
            .iter()
            .map(|kind| (*kind, Notify::new()))
            .collect();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BufferState {
                    queues: Vec::new(),
                    last_watermark_ns: None,
                    released: 0,
                }),
                space,
                events,
                config: config.clone(),
            }),
        }
    }

    /// Add a queue for `kind` and hand out its producer.
    pub fn register(&self, kind: SourceKind) -> RecorderResult<QueueProducer> {
        let mut state = self.shared.lock();
        if state.queues.iter().any(|q| q.kind() == kind) {
            return Err(RecorderError::session(format!(
                "{kind} queue registered twice"
            )));
        }
        let capacity = queue_capacity(&self.shared.config, kind);
        state.queues.push(SourceQueue::new(kind, capacity));
        tracing::debug!(source = %kind, capacity, "Registered source queue");
        Ok(QueueProducer {
            kind,
            shared: self.shared.clone(),
        })
    }

    /// Release every sample at or below the current watermark, merged in
    /// session-time order.
    pub fn poll_ready(&self) -> Vec<Sample> {
        let now = Instant::now();
        let stall_timeout = self.shared.config.stall_timeout();
        let mut state = self.shared.lock();

        for queue in state.queues.iter_mut() {
            if queue.is_active()
                && queue.is_empty()
                && now.duration_since(queue.last_progress()) >= stall_timeout
            {
                queue.set_health(SourceHealth::Stalled);
                tracing::warn!(
                    source = %queue.kind(),
                    frontier_ns = ?queue.frontier_ns(),
                    "Source made no progress; excluding it from the watermark"
                );
                self.shared.emit(SourceEvent::Health {
                    kind: queue.kind(),
                    health: SourceHealth::Stalled,
                    detail: Some(
                        RecorderError::stalled(
                            queue.kind().as_str(),
                            format!("no progress for {stall_timeout:?}"),
                        )
                        .to_string(),
                    ),
                });
            }
        }

        // Releasing the oldest samples moves frontiers forward, so keep
        // recomputing until the watermark stops uncovering anything.
        let mut released = Vec::new();
        let mut watermark = None;
        while let Some(w) = state.compute_watermark() {
            watermark = Some(w);
            let mut progressed = false;
            for queue in state.queues.iter_mut() {
                let before = released.len();
                while let Some(sample) = queue.pop_ready(w) {
                    released.push(sample);
                }
                if released.len() > before {
                    progressed = true;
                    if let Some(notify) = self.shared.space.get(&queue.kind()) {
                        notify.notify_one();
                    }
                }
            }
            if !progressed || w == TimestampNs::MAX {
                break;
            }
        }
        let Some(watermark) = watermark else {
            return released;
        };
        released.sort_by_key(Sample::merge_key);

        let bounded = state.queues.iter().any(SourceQueue::is_active);
        let next = if bounded {
            Some(watermark)
        } else {
            released
                .last()
                .map(|s| s.timestamp_ns)
                .max(state.last_watermark_ns)
        };
        state.last_watermark_ns = next.max(state.last_watermark_ns);
        if let Some(floor) = state.last_watermark_ns {
            for queue in state.queues.iter_mut() {
                queue.raise_floor(floor);
            }
        }
        state.released += released.len() as u64;

        if !released.is_empty() {
            tracing::trace!(
                count = released.len(),
                watermark_ns = ?state.last_watermark_ns,
                "Released samples"
            );
        }
        released
    }

    /// Last released watermark; never decreases.
    pub fn watermark(&self) -> Option<TimestampNs> {
        self.shared.lock().last_watermark_ns
    }

    pub fn sources(&self) -> Vec<SourceKind> {
        self.shared.lock().queues.iter().map(|q| q.kind()).collect()
    }

    pub fn health(&self, kind: SourceKind) -> Option<SourceHealth> {
        self.shared
            .lock()
            .queues
            .iter()
            .find(|q| q.kind() == kind)
            .map(SourceQueue::health)
    }

    pub fn queue_stats(&self, kind: SourceKind) -> Option<QueueStats> {
        self.shared
            .lock()
            .queues
            .iter()
            .find(|q| q.kind() == kind)
            .map(SourceQueue::stats)
    }

    /// Force a stream's health from outside its adapter.
    pub fn set_health(&self, kind: SourceKind, health: SourceHealth) -> bool {
        self.shared.set_health(kind, health)
    }

    /// Every registered stream is Ended or Failed.
    pub fn all_terminal(&self) -> bool {
        self.shared
            .lock()
            .queues
            .iter()
            .all(|q| q.health().is_terminal())
    }

    /// No stream is still running.
    pub fn none_running(&self) -> bool {
        !self
            .shared
            .lock()
            .queues
            .iter()
            .any(|q| q.health() == SourceHealth::Running)
    }

    /// All streams terminal and nothing left to release.
    pub fn is_drained(&self) -> bool {
        let state = self.shared.lock();
        state
            .queues
            .iter()
            .all(|q| q.health().is_terminal() && q.is_empty())
    }

    /// Drop every unreleased sample. Returns how many were lost.
    pub fn discard_remaining(&self) -> u64 {
        let mut state = self.shared.lock();
        let mut lost = 0;
        for queue in state.queues.iter_mut() {
            let dropped = queue.discard();
            if dropped > 0 {
                tracing::warn!(source = %queue.kind(), dropped, "Discarded unreleased samples");
            }
            lost += dropped;
        }
        lost
    }

    pub fn stats(&self) -> BufferStats {
        let state = self.shared.lock();
        BufferStats {
            released: state.released,
            queued: state.queues.iter().map(SourceQueue::len).sum(),
            last_watermark_ns: state.last_watermark_ns,
        }
    }
}

impl BufferState {
    /// `None` while a running stream has no frontier yet.
    fn compute_watermark(&self) -> Option<TimestampNs> {
        let mut bound: Option<TimestampNs> = None;
        let mut any_active = false;
        for queue in self.queues.iter().filter(|q| q.is_active()) {
            any_active = true;
            let frontier = queue.frontier_ns()?;
            bound = Some(bound.map_or(frontier, |b| b.min(frontier)));
        }

        if !any_active {
            return Some(TimestampNs::MAX);
        }
        bound.map(|b| b.max(self.last_watermark_ns.unwrap_or(0)))
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SourceEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn set_health(&self, kind: SourceKind, health: SourceHealth) -> bool {
        let changed = self
            .lock()
            .queues
            .iter_mut()
            .find(|q| q.kind() == kind)
            .is_some_and(|q| q.set_health(health));
        if changed {
            if let Some(notify) = self.space.get(&kind) {
                notify.notify_one();
            }
        }
        changed
    }

    fn with_queue<R>(&self, kind: SourceKind, f: impl FnOnce(&mut SourceQueue) -> R) -> Option<R> {
        self.lock().queues.iter_mut().find(|q| q.kind() == kind).map(f)
    }
}

impl QueueProducer {
    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Push one sample.
    ///
    /// Droppable sources never wait: a full queue evicts its oldest sample.
    /// Other sources wait for space up to the push timeout, after which the
    /// stream is marked Failed and `Overflow` is returned.
    pub async fn push(&self, sample: Sample) -> RecorderResult<PushOutcome> {
        let timeout = self.shared.config.push_timeout();
        let deadline = Instant::now() + timeout;
        let Some(space) = self.shared.space.get(&self.kind) else {
            return Err(RecorderError::session(format!("{} queue has no notifier", self.kind)));
        };

        loop {
            // Register interest before checking so a release in between is
            // not missed.
            let notified = space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let outcome = self.offer(sample.clone());
            match outcome {
                PushOutcome::Full => {}
                PushOutcome::Closed => {
                    return Err(RecorderError::capture(format!(
                        "{} stream is closed",
                        self.kind
                    )))
                }
                other => return Ok(other),
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                self.shared.set_health(self.kind, SourceHealth::Failed);
                tracing::error!(
                    source = %self.kind,
                    waited_ms = timeout.as_millis() as u64,
                    "Queue full past the push timeout; source excluded"
                );
                self.shared.emit(SourceEvent::Overflow {
                    kind: self.kind,
                    waited: timeout,
                });
                return Err(RecorderError::overflow(self.kind.as_str(), timeout));
            }
        }
    }

    /// Offer without waiting.
    pub fn offer(&self, sample: Sample) -> PushOutcome {
        let result = self.shared.with_queue(self.kind, |queue| {
            let before = queue.health();
            let outcome = queue.offer(sample);
            (outcome, before, queue.health())
        });
        let Some((outcome, before, after)) = result else {
            return PushOutcome::Closed;
        };
        self.report_recovery(before, after);
        if outcome == PushOutcome::Evicted {
            tracing::trace!(source = %self.kind, "Queue full; evicted oldest sample");
        }
        outcome
    }

    /// Promise that nothing at or before `ts` will be pushed.
    pub fn promise(&self, ts: TimestampNs) {
        if let Some((before, after)) = self.shared.with_queue(self.kind, |queue| {
            let before = queue.health();
            queue.promise(ts);
            (before, queue.health())
        }) {
            self.report_recovery(before, after);
        }
    }

    pub fn health(&self) -> SourceHealth {
        self.shared
            .with_queue(self.kind, |q| q.health())
            .unwrap_or(SourceHealth::Failed)
    }

    /// Returns whether the health changed.
    pub fn set_health(&self, health: SourceHealth) -> bool {
        self.shared.set_health(self.kind, health)
    }

    /// No further samples; queued ones still drain.
    pub fn end(&self) {
        self.set_health(SourceHealth::Ended);
    }

    fn report_recovery(&self, before: SourceHealth, after: SourceHealth) {
        if before == SourceHealth::Stalled && after == SourceHealth::Running {
            tracing::info!(source = %self.kind, "Source recovered");
            self.shared.emit(SourceEvent::Health {
                kind: self.kind,
                health: SourceHealth::Running,
                detail: None,
            });
        }
    }
}

fn queue_capacity(config: &SyncConfig, kind: SourceKind) -> usize {
    match kind {
        SourceKind::Video => config.video_queue_capacity,
        SourceKind::Audio => config.audio_queue_capacity,
        SourceKind::Microphone => config.microphone_queue_capacity,
        SourceKind::Input => config.input_queue_capacity,
        SourceKind::WindowEvent => config.window_queue_capacity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;
    use syncap_sample_model::{AudioBlock, GapReason, InputEvent, Payload, VideoFrame, WindowEvent};

    fn config() -> SyncConfig {
        SyncConfig {
            video_queue_capacity: 4,
            audio_queue_capacity: 4,
            microphone_queue_capacity: 4,
            input_queue_capacity: 4,
            window_queue_capacity: 4,
            push_timeout_ms: 50,
            stall_timeout_ms: 1_000,
            tick_interval_ms: 10,
            max_lateness_ms: 0,
            latency_warn_ms: 100,
        }
    }

    fn sample(kind: SourceKind, ts: u64, seq: u64) -> Sample {
        match kind {
            SourceKind::Video => Sample::video(
                ts,
                seq,
                VideoFrame {
                    width: 1,
                    height: 1,
                    codec: "raw-bgrx".into(),
                    data: vec![0; 4],
                },
            ),
            SourceKind::Audio | SourceKind::Microphone => Sample::new(
                kind,
                ts,
                seq,
                Payload::Audio(AudioBlock {
                    sample_rate: 48_000,
                    channels: 1,
                    frames: 1,
                    data: vec![0; 2],
                }),
            ),
            SourceKind::Input => Sample::input(ts, seq, InputEvent::pointer(0.1, 0.2)),
            SourceKind::WindowEvent => {
                Sample::window(ts, seq, WindowEvent::focus("term", None, None))
            }
        }
    }

    #[tokio::test]
    async fn test_watermark_holds_back_until_every_stream_passes() {
        let buffer = SyncBuffer::new(&config());
        let video = buffer.register(SourceKind::Video).unwrap();
        let input = buffer.register(SourceKind::Input).unwrap();

        video.offer(sample(SourceKind::Video, 100, 0));
        video.offer(sample(SourceKind::Video, 200, 1));
        // Input has no frontier yet.
        assert!(buffer.poll_ready().is_empty());

        input.promise(150);
        let out = buffer.poll_ready();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamp_ns, 100);
        assert_eq!(buffer.watermark(), Some(150));

        input.offer(sample(SourceKind::Input, 250, 0));
        let out = buffer.poll_ready();
        assert_eq!(out.iter().map(|s| s.timestamp_ns).collect::<Vec<_>>(), [200]);
    }

    #[tokio::test]
    async fn test_ties_break_by_source_priority() {
        let buffer = SyncBuffer::new(&config());
        let producers: Vec<_> = SourceKind::ALL
            .iter()
            .map(|k| buffer.register(*k).unwrap())
            .collect();
        for producer in &producers {
            producer.offer(sample(producer.kind(), 500, 0));
            producer.end();
        }

        let kinds: Vec<_> = buffer.poll_ready().iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            [
                SourceKind::WindowEvent,
                SourceKind::Input,
                SourceKind::Audio,
                SourceKind::Microphone,
                SourceKind::Video
            ]
        );
        assert!(buffer.is_drained());
    }

    #[tokio::test]
    async fn test_ended_streams_drain_and_stop_holding_watermark() {
        let buffer = SyncBuffer::new(&config());
        let audio = buffer.register(SourceKind::Audio).unwrap();
        let input = buffer.register(SourceKind::Input).unwrap();
        audio.offer(sample(SourceKind::Audio, 10, 0));
        audio.offer(sample(SourceKind::Audio, 20, 1));
        input.promise(5);

        assert!(buffer.poll_ready().is_empty());
        input.end();
        assert_eq!(buffer.poll_ready().len(), 2);
        assert!(!buffer.is_drained());
        audio.end();
        assert!(buffer.is_drained());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_stream_is_excluded_after_stall_timeout() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let buffer = SyncBuffer::with_events(&config(), tx);
        let video = buffer.register(SourceKind::Video).unwrap();
        let window = buffer.register(SourceKind::WindowEvent).unwrap();
        window.promise(0);
        video.offer(sample(SourceKind::Video, 100, 0));
        assert!(buffer.poll_ready().is_empty());

        tokio::time::advance(Duration::from_millis(1_001)).await;
        let out = buffer.poll_ready();
        assert_eq!(out.len(), 1);
        assert_eq!(buffer.health(SourceKind::WindowEvent), Some(SourceHealth::Stalled));
        assert_eq!(
            rx.try_recv().unwrap(),
            SourceEvent::Health {
                kind: SourceKind::WindowEvent,
                health: SourceHealth::Stalled,
                detail: Some("Source window_event stalled: no progress for 1s".to_string()),
            }
        );

        // A late event is moved past the floor and the stream recovers.
        window.offer(sample(SourceKind::WindowEvent, 50, 0));
        assert_eq!(buffer.health(SourceKind::WindowEvent), Some(SourceHealth::Running));
        assert!(matches!(
            rx.try_recv().unwrap(),
            SourceEvent::Health { health: SourceHealth::Running, .. }
        ));
        video.offer(sample(SourceKind::Video, 200, 1));
        let out = buffer.poll_ready();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, SourceKind::WindowEvent);
        assert_eq!(out[0].timestamp_ns, 101);
    }

    #[tokio::test(start_paused = true)]
    async fn test_droppable_overflow_never_blocks() {
        let buffer = SyncBuffer::new(&config());
        let video = buffer.register(SourceKind::Video).unwrap();
        for seq in 0..6 {
            let outcome = video.push(sample(SourceKind::Video, seq * 10, seq)).await.unwrap();
            let expected = if seq < 4 { PushOutcome::Queued } else { PushOutcome::Evicted };
            assert_eq!(outcome, expected);
        }
        video.end();
        let out = buffer.poll_ready();
        assert!(matches!(
            out[0].payload,
            Payload::Gap(marker) if marker.missing == 2 && marker.reason == GapReason::Evicted
        ));
        assert_eq!(out.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_droppable_overflow_fails_stream_after_timeout() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let buffer = SyncBuffer::with_events(&config(), tx);
        let input = buffer.register(SourceKind::Input).unwrap();
        let video = buffer.register(SourceKind::Video).unwrap();
        video.promise(0);
        for seq in 0..4 {
            input.push(sample(SourceKind::Input, 100 + seq, seq)).await.unwrap();
        }

        let err = input
            .push(sample(SourceKind::Input, 200, 4))
            .await
            .unwrap_err();
        assert!(matches!(err, RecorderError::Overflow { .. }));
        assert_eq!(input.health(), SourceHealth::Failed);
        assert!(matches!(rx.try_recv().unwrap(), SourceEvent::Overflow { kind: SourceKind::Input, .. }));

        // The failed stream no longer holds the watermark, and what it had
        // queued still drains once video moves on.
        video.offer(sample(SourceKind::Video, 150, 0));
        let out = buffer.poll_ready();
        assert_eq!(out.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_push_resumes_when_consumer_releases() {
        let buffer = SyncBuffer::new(&config());
        let input = buffer.register(SourceKind::Input).unwrap();
        for seq in 0..4 {
            input.offer(sample(SourceKind::Input, seq, seq));
        }

        let consumer = buffer.clone();
        let drain = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            consumer.poll_ready().len()
        });

        let outcome = input.push(sample(SourceKind::Input, 10, 4)).await.unwrap();
        assert_eq!(outcome, PushOutcome::Queued);
        assert_eq!(drain.await.unwrap(), 4);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Push(usize, u64),
        Promise(usize, u64),
        End(usize),
        Poll,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0..5usize, 0..50u64).prop_map(|(k, dt)| Op::Push(k, dt)),
            2 => (0..5usize, 0..80u64).prop_map(|(k, dt)| Op::Promise(k, dt)),
            1 => (0..5usize).prop_map(Op::End),
            3 => Just(Op::Poll),
        ]
    }

    proptest! {
        /// Jittery producers advancing at their own pace never make the
        /// merged output or the watermark go backwards.
        #[test]
        fn prop_output_and_watermark_never_regress(ops in prop::collection::vec(op(), 1..300)) {
            let buffer = SyncBuffer::new(&SyncConfig {
                stall_timeout_ms: 60_000,
                ..config()
            });
            let producers: Vec<_> = SourceKind::ALL
                .iter()
                .map(|k| buffer.register(*k).unwrap())
                .collect();
            let mut clocks = [0u64; 5];
            let mut seqs = [0u64; 5];
            let mut emitted: Vec<Sample> = Vec::new();
            let mut last_watermark = None;

            for op in ops.into_iter().chain(std::iter::once(Op::Poll)) {
                match op {
                    Op::Push(k, dt) => {
                        clocks[k] += dt;
                        producers[k].offer(sample(producers[k].kind(), clocks[k], seqs[k]));
                        seqs[k] += 1;
                    }
                    Op::Promise(k, dt) => {
                        clocks[k] += dt;
                        producers[k].promise(clocks[k]);
                    }
                    Op::End(k) => producers[k].end(),
                    Op::Poll => {
                        emitted.extend(buffer.poll_ready());
                        let watermark = buffer.watermark();
                        prop_assert!(watermark >= last_watermark);
                        last_watermark = watermark;
                    }
                }
            }

            for pair in emitted.windows(2) {
                prop_assert!(pair[0].merge_key() <= pair[1].merge_key());
            }
            // Per source, queue order is kept.
            for kind in SourceKind::ALL {
                let seqs: Vec<u64> = emitted
                    .iter()
                    .filter(|s| s.kind == kind && !s.is_gap())
                    .map(|s| s.sequence)
                    .collect();
                prop_assert!(seqs.windows(2).all(|w| w[0] < w[1]));
            }
        }
    }
}
