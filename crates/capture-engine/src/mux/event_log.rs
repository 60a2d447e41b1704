//! Append-only JSONL writer for discrete samples.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use syncap_common::error::{RecorderError, RecorderResult};
use syncap_sample_model::{parse_event_log, CompletionMarker, EventLog, EventLogHeader, EventRecord};

use super::sink::{ArtifactSink, FileSinks, SinkFactory};

/// Writes event records to a JSONL file in append-only mode.
pub struct EventLogWriter {
    writer: BufWriter<Box<dyn ArtifactSink>>,
    path: PathBuf,
    records_written: u64,
    finished: bool,
}

impl EventLogWriter {
    /// Create the log, writing the header as the first line.
    pub fn create(path: PathBuf, header: &EventLogHeader) -> RecorderResult<Self> {
        Self::create_with(&FileSinks, path, header)
    }

    pub fn create_with(
        sinks: &dyn SinkFactory,
        path: PathBuf,
        header: &EventLogHeader,
    ) -> RecorderResult<Self> {
        let mut writer = BufWriter::new(sinks.open(&path)?);

        writeln!(writer, "{}", header.to_line()?)
            .map_err(|e| RecorderError::write(format!("Failed to write event log header: {e}")))?;

        Ok(Self {
            writer,
            path,
            records_written: 0,
            finished: false,
        })
    }

    /// Write a single record as a JSONL line.
    pub fn append(&mut self, record: &EventRecord) -> RecorderResult<()> {
        let json = serde_json::to_string(record)?;
        writeln!(self.writer, "{json}")
            .map_err(|e| RecorderError::write(format!("Failed to write event record: {e}")))?;
        self.records_written += 1;
        Ok(())
    }

    /// Push buffered lines to the OS, and to disk when `sync` is set.
    pub fn flush(&mut self, sync: bool) -> RecorderResult<()> {
        self.writer
            .flush()
            .map_err(|e| RecorderError::write(format!("Failed to flush event log: {e}")))?;
        if sync {
            self.writer
                .get_mut()
                .sync_data()
                .map_err(|e| RecorderError::write(format!("Failed to sync event log: {e}")))?;
        }
        Ok(())
    }

    /// Append the completion marker and sync the file.
    pub fn finish(&mut self, marker: &CompletionMarker) -> RecorderResult<()> {
        writeln!(self.writer, "{}", marker.to_line()?)
            .map_err(|e| RecorderError::write(format!("Failed to write completion marker: {e}")))?;
        self.flush(true)?;
        self.finished = true;
        Ok(())
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for EventLogWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.writer.flush();
        }
    }
}

/// Read and parse an event log from disk.
pub fn read_event_log(path: impl AsRef<Path>) -> RecorderResult<EventLog> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(RecorderError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let content = std::fs::read_to_string(path)?;
    parse_event_log(&content).map_err(|e| RecorderError::Other(anyhow::Error::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncap_sample_model::{
        ButtonState, CloseStatus, InputEvent, MouseButton, Sample, SourceKind, WindowEvent,
    };

    fn header() -> EventLogHeader {
        EventLogHeader {
            schema_version: "1.0".to_string(),
            session_id: "test".to_string(),
            epoch_wall: "2026-01-01T00:00:00Z".to_string(),
            sources: vec![SourceKind::Input, SourceKind::WindowEvent],
        }
    }

    #[test]
    fn test_event_log_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.events.jsonl");

        let samples = [
            Sample::window(5, 0, WindowEvent::focus("editor", Some("code".into()), None)),
            Sample::input(10, 0, InputEvent::pointer(0.5, 0.5)),
            Sample::input(
                100_000_000,
                1,
                InputEvent::click(MouseButton::Left, ButtonState::Down, 0.5, 0.5),
            ),
        ];

        {
            let mut writer = EventLogWriter::create(path.clone(), &header()).unwrap();
            for sample in &samples {
                writer
                    .append(&EventRecord::from_sample(sample).unwrap())
                    .unwrap();
            }
            writer
                .finish(&CompletionMarker {
                    status: CloseStatus::Complete,
                    samples_written: 3,
                    last_timestamp_ns: Some(100_000_000),
                    closed_wall: "2026-01-01T00:00:01Z".to_string(),
                })
                .unwrap();
            assert_eq!(writer.records_written(), 3);
        }

        let log = read_event_log(&path).unwrap();
        assert_eq!(log.header, Some(header()));
        assert!(log.is_complete());
        assert!(log.is_time_ordered());
        let restored: Vec<Sample> = log.records.iter().map(EventRecord::to_sample).collect();
        assert_eq!(restored, samples);
    }

    #[test]
    fn test_dropped_writer_leaves_no_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crash.events.jsonl");
        {
            let mut writer = EventLogWriter::create(path.clone(), &header()).unwrap();
            writer
                .append(&EventRecord::from_sample(&Sample::input(1, 0, InputEvent::pointer(0.0, 0.0))).unwrap())
                .unwrap();
        }

        let log = read_event_log(&path).unwrap();
        assert_eq!(log.records.len(), 1);
        assert!(log.trailer.is_none());
        assert!(!log.is_complete());
    }

    #[test]
    fn test_missing_log_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_event_log(dir.path().join("nope.events.jsonl")).unwrap_err();
        assert!(matches!(err, RecorderError::FileNotFound { .. }));
    }
}
