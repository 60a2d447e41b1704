//! Samples and their payloads.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::{InputEvent, WindowEvent};

/// Monotonic timestamp in nanoseconds since session start.
pub type TimestampNs = u64;

/// The signal types a session can record.
///
/// `Audio` is the system mix (loopback); `Microphone` is a second audio
/// track kept apart so it can be mixed or muted later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Video,
    Audio,
    Microphone,
    Input,
    WindowEvent,
}

impl SourceKind {
    pub const ALL: [SourceKind; 5] = [
        SourceKind::Video,
        SourceKind::Audio,
        SourceKind::Microphone,
        SourceKind::Input,
        SourceKind::WindowEvent,
    ];

    /// Tie-break rank at equal timestamps; lower is emitted first.
    ///
    /// Discrete control events go ahead of continuous media recorded at the
    /// same instant: WindowEvent > Input > Audio > Microphone > Video.
    pub fn priority(self) -> u8 {
        match self {
            SourceKind::WindowEvent => 0,
            SourceKind::Input => 1,
            SourceKind::Audio => 2,
            SourceKind::Microphone => 3,
            SourceKind::Video => 4,
        }
    }

    /// Continuous media may lose samples under backpressure.
    pub fn is_droppable(self) -> bool {
        matches!(
            self,
            SourceKind::Video | SourceKind::Audio | SourceKind::Microphone
        )
    }

    /// Media kinds go to the media container, the rest to the event log.
    pub fn is_media(self) -> bool {
        self.is_droppable()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Video => "video",
            SourceKind::Audio => "audio",
            SourceKind::Microphone => "microphone",
            SourceKind::Input => "input",
            SourceKind::WindowEvent => "window_event",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness of one source stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceHealth {
    #[default]
    Running,
    /// Producing nothing for a while; excluded from the watermark until it
    /// recovers.
    Stalled,
    /// Stopped cleanly; no further samples.
    Ended,
    /// Excluded after calibration failure, overflow or a backend error.
    Failed,
}

impl SourceHealth {
    /// Ended and Failed streams never produce again.
    pub fn is_terminal(self) -> bool {
        matches!(self, SourceHealth::Ended | SourceHealth::Failed)
    }
}

/// One timestamped unit from a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub kind: SourceKind,

    /// Session-clock timestamp.
    #[serde(rename = "t")]
    pub timestamp_ns: TimestampNs,

    /// Per-source counter. Gap markers reuse the sequence of the slot they
    /// stand in for, so a reader sees a jump where samples were lost.
    #[serde(rename = "seq")]
    pub sequence: u64,

    pub payload: Payload,
}

/// Sample content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Video(VideoFrame),
    Audio(AudioBlock),
    Input(InputEvent),
    Window(WindowEvent),
    Gap(GapMarker),
}

/// One captured frame, possibly already encoded by the capture pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    /// Encoding of `data`, e.g. `raw-bgrx` or `h264`.
    pub codec: String,
    pub data: Vec<u8>,
}

/// A fixed-size block of interleaved S16LE audio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioBlock {
    pub sample_rate: u32,
    pub channels: u16,
    pub frames: u32,
    pub data: Vec<u8>,
}

/// Stands in for samples that were never recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapMarker {
    /// Number of samples missing at this point.
    pub missing: u64,
    pub reason: GapReason,
}

/// Why samples are missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapReason {
    /// Evicted from a full droppable queue.
    Evicted,
    /// The capture device produced nothing for the expected slots.
    Stalled,
    /// Arrived behind the watermark after the source was excluded as stalled.
    Late,
}

/// A backend reading before normalization: a value plus its native timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Captured<T> {
    pub native_ns: u64,
    pub value: T,
}

impl<T> Captured<T> {
    pub fn new(native_ns: u64, value: T) -> Self {
        Self { native_ns, value }
    }
}

impl Sample {
    pub fn new(kind: SourceKind, timestamp_ns: TimestampNs, sequence: u64, payload: Payload) -> Self {
        Self {
            kind,
            timestamp_ns,
            sequence,
            payload,
        }
    }

    pub fn video(timestamp_ns: TimestampNs, sequence: u64, frame: VideoFrame) -> Self {
        Self::new(SourceKind::Video, timestamp_ns, sequence, Payload::Video(frame))
    }

    pub fn audio(timestamp_ns: TimestampNs, sequence: u64, block: AudioBlock) -> Self {
        Self::new(SourceKind::Audio, timestamp_ns, sequence, Payload::Audio(block))
    }

    pub fn input(timestamp_ns: TimestampNs, sequence: u64, event: InputEvent) -> Self {
        Self::new(SourceKind::Input, timestamp_ns, sequence, Payload::Input(event))
    }

    pub fn window(timestamp_ns: TimestampNs, sequence: u64, event: WindowEvent) -> Self {
        Self::new(
            SourceKind::WindowEvent,
            timestamp_ns,
            sequence,
            Payload::Window(event),
        )
    }

    pub fn gap(
        kind: SourceKind,
        timestamp_ns: TimestampNs,
        sequence: u64,
        missing: u64,
        reason: GapReason,
    ) -> Self {
        Self::new(
            kind,
            timestamp_ns,
            sequence,
            Payload::Gap(GapMarker { missing, reason }),
        )
    }

    pub fn is_gap(&self) -> bool {
        matches!(self.payload, Payload::Gap(_))
    }

    /// Global ordering key: timestamp, then source priority.
    pub fn merge_key(&self) -> (TimestampNs, u8) {
        (self.timestamp_ns, self.kind.priority())
    }

    /// Timestamp as fractional seconds since session start.
    pub fn timestamp_secs(&self) -> f64 {
        self.timestamp_ns as f64 / 1_000_000_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ButtonState;

    #[test]
    fn test_priority_order() {
        let mut kinds = SourceKind::ALL.to_vec();
        kinds.sort_by_key(|k| k.priority());
        assert_eq!(
            kinds,
            vec![
                SourceKind::WindowEvent,
                SourceKind::Input,
                SourceKind::Audio,
                SourceKind::Microphone,
                SourceKind::Video
            ]
        );
    }

    #[test]
    fn test_droppable_kinds() {
        assert!(SourceKind::Video.is_droppable());
        assert!(SourceKind::Audio.is_droppable());
        assert!(SourceKind::Microphone.is_media());
        assert!(!SourceKind::Input.is_droppable());
        assert!(!SourceKind::WindowEvent.is_droppable());
    }

    #[test]
    fn test_merge_key_breaks_ties_by_kind() {
        let key = Sample::input(10, 0, InputEvent::key("KeyA", ButtonState::Down));
        let frame = Sample::video(
            10,
            0,
            VideoFrame {
                width: 1,
                height: 1,
                codec: "raw-bgrx".to_string(),
                data: vec![0; 4],
            },
        );
        assert!(key.merge_key() < frame.merge_key());
    }

    #[test]
    fn test_terminal_health() {
        assert!(SourceHealth::Ended.is_terminal());
        assert!(SourceHealth::Failed.is_terminal());
        assert!(!SourceHealth::Stalled.is_terminal());
        assert!(!SourceHealth::Running.is_terminal());
    }

    #[test]
    fn test_source_kind_serializes_snake_case() {
        let json = serde_json::to_string(&SourceKind::WindowEvent).unwrap();
        assert_eq!(json, "\"window_event\"");
        assert_eq!(SourceKind::WindowEvent.to_string(), "window_event");
    }
}
