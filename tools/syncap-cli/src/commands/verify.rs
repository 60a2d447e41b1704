//! Check a recording's artifacts against each other and their markers.

use std::collections::BTreeMap;
use std::path::PathBuf;

use syncap_capture_engine::mux::MediaContents;
use syncap_capture_engine::{read_event_log, read_media};
use syncap_sample_model::{
    ArtifactPaths, CloseStatus, EventLog, Payload, Sample, SessionManifest, SourceKind,
    TimestampNs,
};

/// Outcome of checking one recording.
#[derive(Debug, Default)]
pub struct Findings {
    pub problems: Vec<String>,
    pub warnings: Vec<String>,
    pub media_samples: usize,
    pub event_records: usize,
}

impl Findings {
    fn problem(&mut self, message: impl Into<String>) {
        self.problems.push(message.into());
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

pub fn run(output: PathBuf) -> anyhow::Result<()> {
    let paths = ArtifactPaths::from_stem(&output);
    println!("Verifying {}", output.display());

    let findings = check(&paths)?;

    println!("  Media samples: {}", findings.media_samples);
    println!("  Event records: {}", findings.event_records);
    for warning in &findings.warnings {
        println!("  warning: {warning}");
    }
    for problem in &findings.problems {
        println!("  problem: {problem}");
    }

    if !findings.is_clean() {
        anyhow::bail!("{} problem(s) found", findings.problems.len());
    }
    println!("OK");
    Ok(())
}

/// Read both artifacts and the manifest and cross-check them.
pub fn check(paths: &ArtifactPaths) -> anyhow::Result<Findings> {
    let media = read_media(&paths.media)?;
    let events = read_event_log(&paths.events)?;
    let mut findings = Findings {
        media_samples: media.samples.len(),
        event_records: events.records.len(),
        ..Findings::default()
    };

    check_order(&media, &events, &mut findings);
    check_markers(&media, &events, &mut findings);
    check_sequences(&media, &events, &mut findings);

    match SessionManifest::load(&paths.manifest) {
        Ok(manifest) => check_manifest(&manifest, &media, &events, &mut findings),
        Err(e) if !paths.manifest.exists() => {
            tracing::debug!(error = %e, "No manifest");
            findings.warn(format!("no manifest at {}", paths.manifest.display()));
        }
        Err(e) => findings.problem(format!("unreadable manifest: {e}")),
    }

    Ok(findings)
}

fn check_order(media: &MediaContents, events: &EventLog, findings: &mut Findings) {
    if !media.is_time_ordered() {
        findings.problem("media samples are not in time order");
    }
    if !events.is_time_ordered() {
        findings.problem("event records are not in time order");
    }
    if media.torn_tail {
        findings.warn("media ends in a partially written record");
    }
    if events.torn_tail {
        findings.warn("event log ends in a partially written line");
    }
}

fn check_markers(media: &MediaContents, events: &EventLog, findings: &mut Findings) {
    let marker = match (&media.trailer, &events.trailer) {
        (Some(m), Some(e)) => {
            if m.status != e.status || m.samples_written != e.samples_written {
                findings.problem(format!(
                    "markers disagree: media {:?}/{} vs events {:?}/{}",
                    m.status, m.samples_written, e.status, e.samples_written
                ));
            }
            m
        }
        (None, None) => {
            findings.problem("no completion marker in either artifact");
            return;
        }
        (Some(_), None) => {
            findings.problem("event log has no completion marker");
            return;
        }
        (None, Some(_)) => {
            findings.problem("media has no completion marker");
            return;
        }
    };

    let total = (media.samples.len() + events.records.len()) as u64;
    if total != marker.samples_written {
        findings.problem(format!(
            "marker counts {} samples but the artifacts hold {total}",
            marker.samples_written
        ));
    }

    let latest = latest_timestamp(media, events);
    if latest != marker.last_timestamp_ns {
        findings.problem(format!(
            "marker ends at {:?} but the last sample is at {latest:?}",
            marker.last_timestamp_ns
        ));
    }
    if marker.status != CloseStatus::Complete {
        findings.warn(format!("recording closed as {:?}", marker.status));
    }
}

fn check_sequences(media: &MediaContents, events: &EventLog, findings: &mut Findings) {
    let mut samples: Vec<Sample> = media.samples.clone();
    samples.extend(events.records.iter().map(|r| r.to_sample()));

    let mut expected: BTreeMap<SourceKind, u64> = BTreeMap::new();
    for sample in &samples {
        let covers = match &sample.payload {
            Payload::Gap(gap) => gap.missing,
            _ => 1,
        };
        let next = expected.entry(sample.kind).or_insert(sample.sequence);
        if sample.sequence > *next {
            findings.warn(format!(
                "{} jumps from sequence {next} to {} without a gap marker",
                sample.kind, sample.sequence
            ));
        }
        *next = (*next).max(sample.sequence + covers);
    }
}

fn check_manifest(
    manifest: &SessionManifest,
    media: &MediaContents,
    events: &EventLog,
    findings: &mut Findings,
) {
    if manifest.session_id != media.header.session_id {
        findings.problem(format!(
            "manifest session {} does not match media session {}",
            manifest.session_id, media.header.session_id
        ));
    }
    match &events.header {
        Some(header) if header.session_id != manifest.session_id => {
            findings.problem(format!(
                "manifest session {} does not match event log session {}",
                manifest.session_id, header.session_id
            ));
        }
        Some(_) => {}
        None => findings.problem("event log has no header"),
    }

    if let Some(marker) = &media.trailer {
        if manifest.outcome != marker.status.into() {
            findings.problem(format!(
                "manifest outcome {:?} does not match marker {:?}",
                manifest.outcome, marker.status
            ));
        }
    }

    if let (Some(watermark), Some(latest)) =
        (manifest.last_watermark_ns, latest_timestamp(media, events))
    {
        if latest > watermark {
            findings.problem(format!(
                "sample at {latest} was written past the final watermark {watermark}"
            ));
        }
    }

    for source in &manifest.sources {
        if let Some(error) = &source.error {
            findings.warn(format!("{} ended with: {error}", source.kind));
        }
    }
}

fn latest_timestamp(media: &MediaContents, events: &EventLog) -> Option<TimestampNs> {
    let media_last = media.samples.last().map(|s| s.timestamp_ns);
    let events_last = events.records.last().map(|r| r.timestamp_ns);
    media_last.max(events_last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncap_capture_engine::{MuxHeader, MuxWriter};
    use syncap_common::config::OutputConfig;
    use syncap_sample_model::{ButtonState, InputEvent, MouseButton, VideoFrame};

    fn frame(ts: u64, seq: u64) -> Sample {
        Sample::video(
            ts,
            seq,
            VideoFrame {
                width: 2,
                height: 2,
                codec: "raw-bgrx".to_string(),
                data: vec![0; 16],
            },
        )
    }

    fn click(ts: u64, seq: u64) -> Sample {
        Sample::input(
            ts,
            seq,
            InputEvent::click(MouseButton::Left, ButtonState::Down, 1.0, 2.0),
        )
    }

    fn record(
        dir: &tempfile::TempDir,
        samples: &[Sample],
        close: Option<CloseStatus>,
    ) -> ArtifactPaths {
        let paths = ArtifactPaths::from_stem(dir.path().join("run"));
        let header = MuxHeader {
            session_id: "s-1".to_string(),
            epoch_wall: "2026-01-01T00:00:00Z".to_string(),
            sources: vec![SourceKind::Video, SourceKind::Input],
        };
        let mut mux = MuxWriter::create(&paths, &header, &OutputConfig::default()).unwrap();
        mux.write_all(samples).unwrap();
        match close {
            Some(status) => {
                mux.close(status).unwrap();
            }
            None => {
                mux.flush().unwrap();
                drop(mux);
            }
        }
        paths
    }

    #[test]
    fn test_complete_recording_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let paths = record(
            &dir,
            &[frame(0, 0), click(10, 0), frame(33, 1), frame(66, 2)],
            Some(CloseStatus::Complete),
        );
        let findings = check(&paths).unwrap();
        assert!(findings.is_clean(), "{:?}", findings.problems);
        assert_eq!(findings.media_samples, 3);
        assert_eq!(findings.event_records, 1);
        // No manifest was written by the bare writer.
        assert_eq!(findings.warnings.len(), 1);
    }

    #[test]
    fn test_missing_marker_is_a_problem() {
        let dir = tempfile::tempdir().unwrap();
        let paths = record(&dir, &[frame(0, 0), click(5, 0)], None);
        let findings = check(&paths).unwrap();
        assert!(!findings.is_clean());
        assert!(findings.problems[0].contains("no completion marker"));
    }

    #[test]
    fn test_sequence_jump_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let paths = record(&dir, &[frame(0, 0), frame(33, 4)], Some(CloseStatus::Truncated));
        let findings = check(&paths).unwrap();
        assert!(findings.is_clean());
        assert!(findings
            .warnings
            .iter()
            .any(|w| w.contains("jumps from sequence 1 to 4")));
        assert!(findings.warnings.iter().any(|w| w.contains("Truncated")));
    }

    #[test]
    fn test_missing_artifacts_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::from_stem(dir.path().join("absent"));
        assert!(check(&paths).is_err());
    }
}
