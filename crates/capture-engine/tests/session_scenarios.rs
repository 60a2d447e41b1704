use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use syncap_capture_engine::backend::{FrameSource, Pacer, SyntheticAudio, SyntheticFrames};
use syncap_capture_engine::mux::{ArtifactSink, FileSinks, SinkFactory};
use syncap_capture_engine::{
    read_event_log, read_media, SessionController, SessionStatus, ShutdownReason, SourceAdapter,
};
use syncap_common::config::RecorderConfig;
use syncap_common::error::RecorderResult;
use syncap_input_tracker::scripted::ScriptedInputBackend;
use syncap_sample_model::{
    ButtonState, Captured, CloseStatus, GapReason, InputEvent, MouseButton, Payload, Sample,
    SessionManifest, SessionOutcome, SourceHealth, SourceKind, VideoFrame,
};
use tokio::time::Instant;

const FRAME: Duration = Duration::from_micros(33_333);
const BLOCK: Duration = Duration::from_millis(10);
const INPUT_POLL: Duration = Duration::from_millis(10);

fn test_config(dir: &Path) -> RecorderConfig {
    let mut config = RecorderConfig::default();
    config.output.path = dir.join("run");
    config.session.pid_file = Some(dir.join("syncap.pid"));
    config.session.health_check_interval_ms = 0;
    config.clock.calibration_points = 3;
    config.clock.recalibration_interval_ms = 0;
    config
}

fn screen(pacer: Pacer) -> SourceAdapter {
    SourceAdapter::screen(Box::new(SyntheticFrames::new(pacer, 16, 9)), FRAME, 5)
}

fn audio(pacer: Pacer) -> SourceAdapter {
    SourceAdapter::audio(Box::new(SyntheticAudio::new(pacer, 48_000, 1, 480)), BLOCK, 5)
}

fn scripted_input(offsets_ms: &[u64]) -> SourceAdapter {
    let events = offsets_ms.iter().enumerate().map(|(i, ms)| {
        let state = if i % 2 == 0 {
            ButtonState::Down
        } else {
            ButtonState::Up
        };
        (
            ms * 1_000_000,
            InputEvent::click(MouseButton::Left, state, 0.25, 0.75),
        )
    });
    SourceAdapter::input(
        Box::new(ScriptedInputBackend::from_offsets(
            "scripted-input",
            3_000_000_000,
            events,
        )),
        INPUT_POLL,
    )
}

/// Every sample from both artifacts, merged back into session order.
fn read_all(config: &RecorderConfig) -> Vec<Sample> {
    let stem = &config.output.path;
    let paths = syncap_sample_model::ArtifactPaths::from_stem(stem);
    let media = read_media(&paths.media).unwrap();
    let events = read_event_log(&paths.events).unwrap();
    let mut all = media.samples;
    all.extend(events.records.iter().map(|r| r.to_sample()));
    all.sort_by_key(Sample::merge_key);
    all
}

fn count(samples: &[Sample], kind: SourceKind) -> usize {
    samples
        .iter()
        .filter(|s| s.kind == kind && !s.is_gap())
        .count()
}

#[tokio::test(start_paused = true)]
async fn screen_audio_input_drain_on_shutdown_signal() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let pid_path = config.session.pid_file_path();

    let mut session = SessionController::with_adapters(
        config.clone(),
        vec![
            screen(Pacer::new(FRAME).with_limit(100)),
            audio(Pacer::new(BLOCK).with_origin(2_000_000_000).with_limit(300)),
            scripted_input(&[100, 400, 800, 1_200, 1_600]),
        ],
    );
    session.start().await.unwrap();
    assert_eq!(session.status(), SessionStatus::Recording);
    assert!(pid_path.exists());

    let handle = session.shutdown_handle();
    let started = Instant::now();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.request(ShutdownReason::Signal);
    });

    let report = session.wait().await.unwrap();
    assert!(report.is_complete(), "{report:?}");
    assert_eq!(session.status(), SessionStatus::Closed);
    assert!(!pid_path.exists());

    let paths = &report.paths;
    let media = read_media(&paths.media).unwrap();
    assert!(media.is_time_ordered());
    assert!(!media.torn_tail);
    assert_eq!(media.trailer.unwrap().status, CloseStatus::Complete);

    let events = read_event_log(&paths.events).unwrap();
    assert!(events.is_complete());
    assert!(events.is_time_ordered());

    let all = read_all(&config);
    assert_eq!(all.len() as u64, report.samples_written);
    let watermark = report.last_watermark_ns.unwrap();
    assert!(all.iter().all(|s| s.timestamp_ns <= watermark));

    // Two seconds of 30 fps and 100 blocks/s, plus what was due at stop.
    let frames = count(&all, SourceKind::Video);
    let blocks = count(&all, SourceKind::Audio);
    assert!((58..=64).contains(&frames), "frames = {frames}");
    assert!((195..=205).contains(&blocks), "blocks = {blocks}");
    assert_eq!(count(&all, SourceKind::Input), 5);

    for kind in [SourceKind::Video, SourceKind::Audio, SourceKind::Input] {
        let source = report.source(kind).unwrap();
        assert_eq!(source.final_health, SourceHealth::Ended, "{kind}");
    }

    let manifest = SessionManifest::load(&paths.manifest).unwrap();
    assert_eq!(manifest.outcome, SessionOutcome::Complete);
    assert_eq!(manifest.session_id, report.session_id);
    assert_eq!(manifest.media_file, "run.media");
    assert_eq!(manifest.sources.len(), 3);

    // Paused time: the drain finished well inside its bound.
    assert!(started.elapsed() < Duration::from_secs(2) + config.session.drain_timeout());
}

#[tokio::test(start_paused = true)]
async fn audio_calibration_failure_excludes_only_audio() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.session.stop_after_ms = Some(500);

    let mut session = SessionController::with_adapters(
        config,
        vec![
            screen(Pacer::new(FRAME)),
            audio(Pacer::new(BLOCK).with_unavailable_clock()),
            scripted_input(&[100, 200]),
        ],
    );
    session.start().await.unwrap();
    assert_eq!(session.status(), SessionStatus::Recording);

    let report = session.wait().await.unwrap();
    assert!(report.is_complete());

    let audio = report.source(SourceKind::Audio).unwrap();
    assert_eq!(audio.final_health, SourceHealth::Failed);
    assert!(audio.error.as_deref().unwrap().contains("Calibration failed"));
    assert_eq!(audio.samples, 0);

    let video = report.source(SourceKind::Video).unwrap();
    assert_eq!(video.final_health, SourceHealth::Ended);
    assert!(video.samples > 0);
    assert_eq!(report.source(SourceKind::Input).unwrap().samples, 2);

    // The media header lists only what was recorded.
    let media = read_media(&report.paths.media).unwrap();
    assert_eq!(media.header.sources, vec![SourceKind::Video, SourceKind::Input]);

    // Stopping again returns the same report.
    assert_eq!(session.stop().await.unwrap(), report);
}

#[tokio::test(start_paused = true)]
async fn input_burst_overflows_without_stalling_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.sync.input_queue_capacity = 8;
    config.sync.push_timeout_ms = 100;
    config.sync.stall_timeout_ms = 60_000;
    config.session.stop_after_ms = Some(1_500);

    // The screen goes quiet after five frames and holds the watermark, so
    // the burst cannot be released.
    let quiet_screen = SourceAdapter::screen(
        Box::new(SyntheticFrames::new(
            Pacer::new(FRAME).with_silence(5, u64::MAX),
            16,
            9,
        )),
        FRAME,
        u32::MAX,
    );
    let burst: Vec<u64> = (0..50).map(|i| 300 + i).collect();

    let mut session =
        SessionController::with_adapters(config, vec![quiet_screen, scripted_input(&burst)]);
    session.start().await.unwrap();
    let report = session.wait().await.unwrap();

    assert_eq!(report.status, SessionStatus::Closed);
    assert_eq!(report.close_status, Some(CloseStatus::Complete));

    let input = report.source(SourceKind::Input).unwrap();
    assert_eq!(input.final_health, SourceHealth::Failed);
    assert!(input.error.as_deref().unwrap().contains("overflow"));
    // What was queued before the overflow still reached the log.
    assert_eq!(input.samples, 8);

    let video = report.source(SourceKind::Video).unwrap();
    assert_eq!(video.final_health, SourceHealth::Ended);
    assert_eq!(video.samples, 5);
    // The silent stretch is accounted for, not fabricated.
    assert!(video.missing > 0);
}

#[tokio::test(start_paused = true)]
async fn droppable_overflow_leaves_gap_markers() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.sync.video_queue_capacity = 4;
    config.sync.stall_timeout_ms = 60_000;
    config.session.stop_after_ms = Some(1_000);

    // Audio delivers one block and then nothing, pinning the watermark.
    let silent_audio = SourceAdapter::audio(
        Box::new(SyntheticAudio::new(
            Pacer::new(BLOCK).with_silence(1, u64::MAX),
            48_000,
            1,
            480,
        )),
        BLOCK,
        u32::MAX,
    );

    let mut session = SessionController::with_adapters(
        config.clone(),
        vec![screen(Pacer::new(FRAME)), silent_audio],
    );
    let report = session.run().await.unwrap();
    assert!(report.is_complete());

    let all = read_all(&config);
    let evicted: u64 = all
        .iter()
        .filter(|s| s.kind == SourceKind::Video)
        .filter_map(|s| match &s.payload {
            Payload::Gap(gap) if gap.reason == GapReason::Evicted => Some(gap.missing),
            _ => None,
        })
        .sum();
    assert!(evicted > 0);

    // Written frames plus evicted ones account for every sequence number.
    let video: Vec<&Sample> = all.iter().filter(|s| s.kind == SourceKind::Video).collect();
    let frames = video.iter().filter(|s| !s.is_gap()).count() as u64;
    let last_seq = video.iter().map(|s| s.sequence).max().unwrap();
    assert!(frames + evicted >= last_seq);
    assert_eq!(report.source(SourceKind::Video).unwrap().final_health, SourceHealth::Ended);
}

#[tokio::test(start_paused = true)]
async fn timestamps_round_trip_through_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.session.stop_after_ms = Some(1_000);

    let offsets = [50, 130, 300, 301, 720];
    let mut session = SessionController::with_adapters(
        config.clone(),
        vec![
            screen(Pacer::new(FRAME).with_origin(42_000_000_000)),
            scripted_input(&offsets),
        ],
    );
    let report = session.run().await.unwrap();
    assert!(report.is_complete());

    let all = read_all(&config);
    let frames: Vec<u64> = all
        .iter()
        .filter(|s| s.kind == SourceKind::Video && !s.is_gap())
        .map(|s| s.timestamp_ns)
        .collect();
    assert!(frames.len() > 20);
    let interval = FRAME.as_nanos() as i64;
    for pair in frames.windows(2) {
        let step = pair[1] as i64 - pair[0] as i64;
        assert!((step - interval).abs() <= 1_000, "frame step {step}");
    }

    let inputs: Vec<u64> = all
        .iter()
        .filter(|s| s.kind == SourceKind::Input)
        .map(|s| s.timestamp_ns)
        .collect();
    assert_eq!(inputs.len(), offsets.len());
    for (i, pair) in inputs.windows(2).enumerate() {
        let expected = (offsets[i + 1] - offsets[i]) as i64 * 1_000_000;
        let actual = pair[1] as i64 - pair[0] as i64;
        assert!((actual - expected).abs() <= 1_000, "input step {actual} vs {expected}");
    }
}

#[tokio::test(start_paused = true)]
async fn existing_output_is_not_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    std::fs::write(dir.path().join("run.media"), b"previous").unwrap();

    let mut session =
        SessionController::with_adapters(config.clone(), vec![screen(Pacer::new(FRAME))]);
    assert!(session.start().await.is_err());
    assert_eq!(session.status(), SessionStatus::Failed);
    assert_eq!(
        std::fs::read(dir.path().join("run.media")).unwrap(),
        b"previous"
    );
    assert!(!config.session.pid_file_path().exists());

    let mut config = config;
    config.output.overwrite = true;
    config.session.stop_after_ms = Some(200);
    let mut session = SessionController::with_adapters(config, vec![screen(Pacer::new(FRAME))]);
    assert!(session.run().await.unwrap().is_complete());
}

#[tokio::test(start_paused = true)]
async fn all_sources_failing_calibration_fails_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    let mut session = SessionController::with_adapters(
        config.clone(),
        vec![audio(Pacer::new(BLOCK).with_unavailable_clock())],
    );
    let err = session.start().await.unwrap_err();
    assert!(err.to_string().contains("No source could be calibrated"));
    assert_eq!(session.status(), SessionStatus::Failed);
    assert!(!config.session.pid_file_path().exists());

    let report = session.wait().await.unwrap();
    assert_eq!(report.status, SessionStatus::Failed);
    assert_eq!(
        report.source(SourceKind::Audio).unwrap().final_health,
        SourceHealth::Failed
    );
}

#[tokio::test(start_paused = true)]
async fn finite_sources_drain_on_their_own() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    let mut session = SessionController::with_adapters(
        config,
        vec![
            screen(Pacer::new(FRAME).with_limit(10)),
            audio(Pacer::new(BLOCK).with_limit(30)),
        ],
    );
    let mut status = session.subscribe();
    let report = session.run().await.unwrap();

    assert!(report.is_complete());
    assert_eq!(report.source(SourceKind::Video).unwrap().samples, 10);
    assert_eq!(report.source(SourceKind::Audio).unwrap().samples, 30);
    assert_eq!(*status.borrow_and_update(), SessionStatus::Closed);
}

/// Real files that start refusing writes once `left` bytes, shared across
/// every artifact, have gone through.
struct FillingDisk {
    left: Arc<AtomicUsize>,
}

struct MeteredFile {
    inner: Box<dyn ArtifactSink>,
    left: Arc<AtomicUsize>,
}

impl SinkFactory for FillingDisk {
    fn open(&self, path: &Path) -> io::Result<Box<dyn ArtifactSink>> {
        Ok(Box::new(MeteredFile {
            inner: FileSinks.open(path)?,
            left: self.left.clone(),
        }))
    }
}

impl Write for MeteredFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let taken = self
            .left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(buf.len())
            });
        if taken.is_err() {
            return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
        }
        self.inner.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl ArtifactSink for MeteredFile {
    fn sync_data(&mut self) -> io::Result<()> {
        self.inner.sync_data()
    }
}

#[tokio::test(start_paused = true)]
async fn disk_filling_mid_recording_fails_without_a_marker() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    // Only the artifact limit ends this session.
    config.session.stop_after_ms = Some(60_000);
    let pid_path = config.session.pid_file_path();

    // Room for the headers and roughly a second of 16x9 frames.
    let disk = Arc::new(FillingDisk {
        left: Arc::new(AtomicUsize::new(24 * 1024)),
    });
    let mut session = SessionController::with_adapters(
        config.clone(),
        vec![screen(Pacer::new(FRAME)), scripted_input(&[100, 200])],
    )
    .with_sinks(disk);
    session.start().await.unwrap();
    assert_eq!(session.status(), SessionStatus::Recording);

    let started = Instant::now();
    let report = session.wait().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));

    assert_eq!(report.status, SessionStatus::Failed);
    assert_eq!(session.status(), SessionStatus::Failed);
    assert_eq!(report.close_status, None);
    assert!(report.error.as_deref().unwrap().contains("disk full"), "{report:?}");
    assert!(!pid_path.exists());

    // What reached the disk before the failure stays readable, unmarked.
    let media = read_media(&report.paths.media).unwrap();
    assert!(!media.samples.is_empty());
    assert!(media.trailer.is_none());
    assert!(media.is_time_ordered());
    let events = read_event_log(&report.paths.events).unwrap();
    assert!(events.trailer.is_none());

    let manifest = SessionManifest::load(&report.paths.manifest).unwrap();
    assert_eq!(manifest.outcome, SessionOutcome::Failed);
    assert!(manifest.error.as_deref().unwrap().contains("disk full"));
}

/// A screen whose encoder never finishes: ending the stream blocks.
struct StuckEncoder {
    frames: SyntheticFrames,
    hang: Duration,
}

impl FrameSource for StuckEncoder {
    fn next_frame(&mut self) -> RecorderResult<Option<Captured<VideoFrame>>> {
        self.frames.next_frame()
    }

    fn native_clock_ns(&mut self) -> RecorderResult<u64> {
        self.frames.native_clock_ns()
    }

    fn name(&self) -> &str {
        "stuck-encoder"
    }

    fn end_stream(&mut self) -> RecorderResult<()> {
        std::thread::sleep(self.hang);
        Ok(())
    }
}

// Real time: the hang is a blocking call that a paused clock cannot skip.
#[tokio::test]
async fn hung_source_is_abandoned_at_the_drain_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.session.stop_after_ms = Some(300);
    config.session.drain_timeout_ms = 300;
    let drain_timeout = config.session.drain_timeout();
    let pid_path = config.session.pid_file_path();

    let stuck = SourceAdapter::screen(
        Box::new(StuckEncoder {
            frames: SyntheticFrames::new(Pacer::new(FRAME), 16, 9),
            hang: Duration::from_secs(3),
        }),
        FRAME,
        5,
    );
    let mut session =
        SessionController::with_adapters(config.clone(), vec![stuck, scripted_input(&[50, 100])]);
    session.start().await.unwrap();

    let mut status = session.subscribe();
    let closing = tokio::spawn(async move {
        status
            .wait_for(|s| *s == SessionStatus::Draining)
            .await
            .unwrap();
        Instant::now()
    });
    let report = session.wait().await.unwrap();
    let drain_started = closing.await.unwrap();

    // Two seconds is the writer's grace past the drain deadline.
    assert!(drain_started.elapsed() < drain_timeout + Duration::from_secs(2));

    assert_eq!(report.status, SessionStatus::Closed);
    assert_eq!(report.close_status, Some(CloseStatus::Truncated));
    // The aborted stream stops holding the watermark, so every queued
    // sample is still released; nothing is left to discard.
    assert_eq!(report.discarded, 0);
    assert!(!pid_path.exists());

    let video = report.source(SourceKind::Video).unwrap();
    assert_eq!(video.final_health, SourceHealth::Failed);
    assert!(video.error.as_deref().unwrap().contains("drain timeout"));
    assert!(video.samples > 0);
    assert_eq!(report.source(SourceKind::Input).unwrap().samples, 2);

    let media = read_media(&report.paths.media).unwrap();
    let marker = media.trailer.unwrap();
    assert_eq!(marker.status, CloseStatus::Truncated);
    assert_eq!(read_all(&config).len() as u64, report.samples_written);

    let manifest = SessionManifest::load(&report.paths.manifest).unwrap();
    assert_eq!(manifest.outcome, SessionOutcome::Truncated);
}

#[tokio::test(start_paused = true)]
async fn microphone_records_as_its_own_track() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.session.stop_after_ms = Some(500);

    let mic = SourceAdapter::audio_as(
        SourceKind::Microphone,
        Box::new(SyntheticAudio::new(Pacer::new(BLOCK), 16_000, 1, 160)),
        BLOCK,
        5,
    );
    let mut session = SessionController::with_adapters(
        config.clone(),
        vec![audio(Pacer::new(BLOCK)), mic],
    );
    let report = session.run().await.unwrap();
    assert!(report.is_complete());

    let media = read_media(&report.paths.media).unwrap();
    assert_eq!(media.header.sources, vec![SourceKind::Audio, SourceKind::Microphone]);
    let mic_blocks: Vec<&Sample> = media
        .samples
        .iter()
        .filter(|s| s.kind == SourceKind::Microphone && !s.is_gap())
        .collect();
    assert!((45..=55).contains(&mic_blocks.len()), "{}", mic_blocks.len());
    assert!(mic_blocks
        .iter()
        .all(|s| matches!(&s.payload, Payload::Audio(b) if b.sample_rate == 16_000)));
    // Each track keeps its own sequence.
    assert_eq!(mic_blocks[0].sequence, 0);
    assert!(count(&media.samples, SourceKind::Audio) > 0);
    assert_eq!(
        report.source(SourceKind::Microphone).unwrap().final_health,
        SourceHealth::Ended
    );
}
