//! The event log: a JSONL stream of discrete samples.
//!
//! Layout:
//! ```text
//! # {"schema_version":"1.0","session_id":"...",...}      header
//! {"t":120,"seq":0,"source":"input","input":{...}}       one record per sample
//! #! {"status":"complete","samples_written":42,...}     completion marker
//! ```
//! The log is append-only; a missing `#!` line means the recording did not
//! end cleanly.

use serde::{Deserialize, Serialize};

use crate::event::{InputEvent, WindowEvent};
use crate::sample::{GapMarker, Payload, Sample, SourceKind, TimestampNs};

/// Current event log schema version.
pub const EVENT_LOG_SCHEMA_VERSION: &str = "1.0";

const HEADER_PREFIX: &str = "# ";
const TRAILER_PREFIX: &str = "#! ";

/// First line of the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogHeader {
    /// Schema version for forward compatibility.
    pub schema_version: String,

    /// Session identifier shared by every artifact of the session.
    pub session_id: String,

    /// Wall-clock time at session clock zero (ISO 8601).
    pub epoch_wall: String,

    /// Sources that were recording when the log was opened.
    pub sources: Vec<SourceKind>,
}

/// One discrete sample as stored in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Session-clock timestamp.
    #[serde(rename = "t")]
    pub timestamp_ns: TimestampNs,

    #[serde(rename = "seq")]
    pub sequence: u64,

    pub source: SourceKind,

    #[serde(flatten)]
    pub body: RecordBody,
}

/// Record content; serialized under a key naming its variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordBody {
    Input(InputEvent),
    Window(WindowEvent),
    Gap(GapMarker),
}

/// How the writer closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseStatus {
    /// Every stream terminated and the final flush succeeded.
    Complete,
    /// Drain timed out; samples past the last watermark were discarded.
    Truncated,
}

/// Last line of a cleanly closed artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub status: CloseStatus,
    pub samples_written: u64,
    pub last_timestamp_ns: Option<TimestampNs>,
    /// Wall-clock time of the close (ISO 8601).
    pub closed_wall: String,
}

/// A parsed event log.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    pub header: Option<EventLogHeader>,
    pub records: Vec<EventRecord>,
    pub trailer: Option<CompletionMarker>,
    /// The final line was cut off mid-write.
    pub torn_tail: bool,
}

/// Errors reading an event log.
#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("Malformed event log line {line}: {source}")]
    Malformed {
        line: usize,
        source: serde_json::Error,
    },

    #[error("Event log has content after its completion marker (line {line})")]
    AfterTrailer { line: usize },
}

impl EventRecord {
    /// Convert a released sample into a log record.
    ///
    /// Returns `None` for media payloads, which belong in the media
    /// container.
    pub fn from_sample(sample: &Sample) -> Option<Self> {
        let body = match &sample.payload {
            Payload::Input(event) => RecordBody::Input(event.clone()),
            Payload::Window(event) => RecordBody::Window(event.clone()),
            Payload::Gap(marker) if !sample.kind.is_media() => RecordBody::Gap(*marker),
            _ => return None,
        };
        Some(Self {
            timestamp_ns: sample.timestamp_ns,
            sequence: sample.sequence,
            source: sample.kind,
            body,
        })
    }

    /// Rebuild the sample this record was written from.
    pub fn to_sample(&self) -> Sample {
        let payload = match &self.body {
            RecordBody::Input(event) => Payload::Input(event.clone()),
            RecordBody::Window(event) => Payload::Window(event.clone()),
            RecordBody::Gap(marker) => Payload::Gap(*marker),
        };
        Sample::new(self.source, self.timestamp_ns, self.sequence, payload)
    }
}

impl EventLogHeader {
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        Ok(format!("{HEADER_PREFIX}{}", serde_json::to_string(self)?))
    }
}

impl CompletionMarker {
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        Ok(format!("{TRAILER_PREFIX}{}", serde_json::to_string(self)?))
    }
}

impl EventLog {
    /// Whether the log carries a completion marker.
    pub fn is_complete(&self) -> bool {
        matches!(
            self.trailer,
            Some(CompletionMarker {
                status: CloseStatus::Complete,
                ..
            })
        )
    }

    /// Whether record timestamps never decrease.
    pub fn is_time_ordered(&self) -> bool {
        self.records
            .windows(2)
            .all(|w| w[0].timestamp_ns <= w[1].timestamp_ns)
    }
}

/// Parse an event log.
///
/// An unparseable final line is tolerated when no completion marker follows
/// it: that is the signature of a crash mid-write.
pub fn parse_event_log(content: &str) -> Result<EventLog, EventLogError> {
    let mut log = EventLog::default();
    let lines: Vec<(usize, &str)> = content
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty())
        .collect();
    let last_line = lines.last().map(|(n, _)| *n);

    for (line_no, line) in lines {
        if log.trailer.is_some() {
            return Err(EventLogError::AfterTrailer { line: line_no });
        }

        let parsed = if let Some(json) = line.strip_prefix(TRAILER_PREFIX) {
            serde_json::from_str(json).map(|t| log.trailer = Some(t))
        } else if let Some(json) = line.strip_prefix(HEADER_PREFIX) {
            serde_json::from_str(json).map(|h| log.header = Some(h))
        } else {
            serde_json::from_str(line).map(|r| log.records.push(r))
        };

        if let Err(source) = parsed {
            if Some(line_no) == last_line {
                log.torn_tail = true;
            } else {
                return Err(EventLogError::Malformed {
                    line: line_no,
                    source,
                });
            }
        }
    }

    Ok(log)
}

/// Serialize records to JSONL format (no header or trailer).
pub fn serialize_records(records: &[EventRecord]) -> Result<String, serde_json::Error> {
    let mut output = String::new();
    for record in records {
        output.push_str(&serde_json::to_string(record)?);
        output.push('\n');
    }
    Ok(output)
}
