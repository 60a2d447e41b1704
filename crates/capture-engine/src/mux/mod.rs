//! Mux/Writer: routes released samples to the media container or the event
//! log, flushes incrementally and writes the completion markers.
//!
//! The writer is owned by the consumer task for the whole session; nothing
//! else touches the artifact handles.

pub mod event_log;
pub mod media;
pub mod sink;

use std::collections::BTreeMap;

use syncap_common::config::OutputConfig;
use syncap_common::error::{RecorderError, RecorderResult};
use syncap_sample_model::{
    ArtifactPaths, CloseStatus, CompletionMarker, EventLogHeader, EventRecord, Payload, Sample,
    SourceKind, TimestampNs, EVENT_LOG_SCHEMA_VERSION,
};

pub use event_log::{read_event_log, EventLogWriter};
pub use media::{read_media, MediaContents, MediaEntry, MediaHeader, MediaReader, MediaWriter};
pub use sink::{ArtifactSink, FileSinks, SinkFactory};

/// Identity shared by both artifacts of a session.
#[derive(Debug, Clone)]
pub struct MuxHeader {
    pub session_id: String,
    pub epoch_wall: String,
    pub sources: Vec<SourceKind>,
}

/// Per-kind write counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindCounters {
    pub samples: u64,
    pub gaps: u64,
    pub missing: u64,
}

/// What the writer did over the session.
#[derive(Debug, Clone, PartialEq)]
pub struct MuxSummary {
    pub status: CloseStatus,
    pub samples_written: u64,
    pub last_timestamp_ns: Option<TimestampNs>,
    pub per_kind: BTreeMap<SourceKind, KindCounters>,
}

pub struct MuxWriter {
    media: MediaWriter,
    events: EventLogWriter,
    flush_every: u64,
    fsync: bool,
    since_flush: u64,
    samples_written: u64,
    last_timestamp_ns: Option<TimestampNs>,
    per_kind: BTreeMap<SourceKind, KindCounters>,
}

/// Make sure the output stem is free, or clear it when overwriting is
/// allowed.
pub fn prepare_output(paths: &ArtifactPaths, overwrite: bool) -> RecorderResult<()> {
    let existing = paths.existing();
    if !existing.is_empty() {
        if !overwrite {
            let list = existing
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(RecorderError::config(format!(
                "Output already exists ({list}); pass overwrite to replace it"
            )));
        }
        for path in existing {
            tracing::info!(path = %path.display(), "Removing previous artifact");
            std::fs::remove_file(path)?;
        }
    }
    if let Some(parent) = paths.media.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

impl MuxWriter {
    /// Open both artifacts as files and write their headers.
    pub fn create(
        paths: &ArtifactPaths,
        header: &MuxHeader,
        config: &OutputConfig,
    ) -> RecorderResult<Self> {
        Self::create_with(&FileSinks, paths, header, config)
    }

    pub fn create_with(
        sinks: &dyn SinkFactory,
        paths: &ArtifactPaths,
        header: &MuxHeader,
        config: &OutputConfig,
    ) -> RecorderResult<Self> {
        let media = MediaWriter::create_with(
            sinks,
            paths.media.clone(),
            &MediaHeader {
                format_version: media::MEDIA_FORMAT_VERSION,
                session_id: header.session_id.clone(),
                epoch_wall: header.epoch_wall.clone(),
                sources: header.sources.clone(),
            },
        )?;
        let events = EventLogWriter::create_with(
            sinks,
            paths.events.clone(),
            &EventLogHeader {
                schema_version: EVENT_LOG_SCHEMA_VERSION.to_string(),
                session_id: header.session_id.clone(),
                epoch_wall: header.epoch_wall.clone(),
                sources: header.sources.clone(),
            },
        )?;

        tracing::info!(
            media = %paths.media.display(),
            events = %paths.events.display(),
            "Opened output artifacts"
        );

        Ok(Self {
            media,
            events,
            flush_every: config.flush_every_samples.max(1),
            fsync: config.fsync_on_flush,
            since_flush: 0,
            samples_written: 0,
            last_timestamp_ns: None,
            per_kind: BTreeMap::new(),
        })
    }

    /// Append one released sample.
    ///
    /// Samples must arrive in non-decreasing session time; anything older
    /// than the last written sample is rejected.
    pub fn write(&mut self, sample: &Sample) -> RecorderResult<()> {
        if let Some(last) = self.last_timestamp_ns {
            if sample.timestamp_ns < last {
                return Err(RecorderError::write(format!(
                    "Out-of-order {} sample: t={} after t={last}",
                    sample.kind, sample.timestamp_ns
                )));
            }
        }

        if sample.kind.is_media() {
            self.media.append(sample)?;
        } else {
            let record = EventRecord::from_sample(sample).ok_or_else(|| {
                RecorderError::write(format!("{} sample has a media payload", sample.kind))
            })?;
            self.events.append(&record)?;
        }

        let counters = self.per_kind.entry(sample.kind).or_default();
        match &sample.payload {
            Payload::Gap(marker) => {
                counters.gaps += 1;
                counters.missing += marker.missing;
            }
            _ => counters.samples += 1,
        }

        self.samples_written += 1;
        self.last_timestamp_ns = Some(sample.timestamp_ns);
        self.since_flush += 1;
        if self.since_flush >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    pub fn write_all(&mut self, samples: &[Sample]) -> RecorderResult<()> {
        for sample in samples {
            self.write(sample)?;
        }
        Ok(())
    }

    /// Flush both artifacts, syncing to disk if configured.
    pub fn flush(&mut self) -> RecorderResult<()> {
        self.media.flush(self.fsync)?;
        self.events.flush(self.fsync)?;
        self.since_flush = 0;
        Ok(())
    }

    /// Write the completion marker into both artifacts.
    pub fn close(mut self, status: CloseStatus) -> RecorderResult<MuxSummary> {
        self.flush()?;
        let marker = CompletionMarker {
            status,
            samples_written: self.samples_written,
            last_timestamp_ns: self.last_timestamp_ns,
            closed_wall: chrono::Utc::now().to_rfc3339(),
        };
        self.media.finish(&marker)?;
        self.events.finish(&marker)?;

        tracing::info!(
            ?status,
            samples = self.samples_written,
            media_bytes = self.media.bytes_written(),
            last_timestamp_ns = ?self.last_timestamp_ns,
            "Closed output artifacts"
        );

        Ok(MuxSummary {
            status,
            samples_written: self.samples_written,
            last_timestamp_ns: self.last_timestamp_ns,
            per_kind: std::mem::take(&mut self.per_kind),
        })
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    pub fn last_timestamp_ns(&self) -> Option<TimestampNs> {
        self.last_timestamp_ns
    }

    pub fn counters(&self, kind: SourceKind) -> KindCounters {
        self.per_kind.get(&kind).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncap_sample_model::{AudioBlock, GapReason, InputEvent, WindowEvent};

    fn header() -> MuxHeader {
        MuxHeader {
            session_id: "mux".to_string(),
            epoch_wall: "2026-01-01T00:00:00Z".to_string(),
            sources: SourceKind::ALL.to_vec(),
        }
    }

    fn block(ts: u64, seq: u64) -> Sample {
        Sample::audio(
            ts,
            seq,
            AudioBlock {
                sample_rate: 8_000,
                channels: 1,
                frames: 2,
                data: vec![0, 1, 2, 3],
            },
        )
    }

    #[test]
    fn test_samples_routed_by_kind() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::from_stem(dir.path().join("run"));
        prepare_output(&paths, false).unwrap();
        let mut mux = MuxWriter::create(&paths, &header(), &OutputConfig::default()).unwrap();

        mux.write_all(&[
            Sample::window(0, 0, WindowEvent::focus("shell", None, Some(7))),
            block(10, 0),
            Sample::input(15, 0, InputEvent::key("KeyA", syncap_sample_model::ButtonState::Down)),
            Sample::gap(SourceKind::Audio, 20, 1, 2, GapReason::Evicted),
            Sample::gap(SourceKind::Input, 25, 1, 1, GapReason::Late),
        ])
        .unwrap();
        assert_eq!(mux.counters(SourceKind::Audio).missing, 2);
        let summary = mux.close(CloseStatus::Complete).unwrap();
        assert_eq!(summary.samples_written, 5);
        assert_eq!(summary.last_timestamp_ns, Some(25));

        let media = read_media(&paths.media).unwrap();
        assert_eq!(media.samples.len(), 2);
        assert_eq!(media.trailer.unwrap().status, CloseStatus::Complete);

        let log = read_event_log(&paths.events).unwrap();
        assert_eq!(log.records.len(), 3);
        assert!(log.is_complete());
        assert_eq!(log.trailer.unwrap().samples_written, 5);
    }

    #[test]
    fn test_out_of_order_sample_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::from_stem(dir.path().join("order"));
        let mut mux = MuxWriter::create(&paths, &header(), &OutputConfig::default()).unwrap();
        mux.write(&block(100, 0)).unwrap();
        mux.write(&block(100, 1)).unwrap();
        let err = mux.write(&block(99, 2)).unwrap_err();
        assert!(matches!(err, RecorderError::WriteFailure { .. }));
    }

    #[test]
    fn test_flushes_every_n_samples() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::from_stem(dir.path().join("flush"));
        let config = OutputConfig {
            flush_every_samples: 2,
            ..OutputConfig::default()
        };
        let mut mux = MuxWriter::create(&paths, &header(), &config).unwrap();
        mux.write(&Sample::input(1, 0, InputEvent::pointer(0.0, 0.0))).unwrap();
        mux.write(&Sample::input(2, 1, InputEvent::pointer(0.1, 0.0))).unwrap();

        // Visible on disk without closing.
        let log = read_event_log(&paths.events).unwrap();
        assert_eq!(log.records.len(), 2);
        assert!(log.trailer.is_none());
    }

    #[test]
    fn test_prepare_output_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::from_stem(dir.path().join("taken"));
        std::fs::write(&paths.events, "# {}\n").unwrap();

        let err = prepare_output(&paths, false).unwrap_err();
        assert!(matches!(err, RecorderError::Config { .. }));
        prepare_output(&paths, true).unwrap();
        assert!(!paths.events.exists());
    }
}
