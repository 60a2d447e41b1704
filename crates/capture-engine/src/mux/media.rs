//! Media container for video frames and audio blocks.
//!
//! ```text
//! "SYNCAPM1" | u32 header_len | header JSON
//! record*    | u32 record_len | bincode(MediaRecord)
//! ```
//! Lengths are little-endian. The last record of a cleanly closed file is a
//! `Trailer` carrying the completion marker. Frame and block payloads are
//! stored as the capture pipeline produced them.

use std::borrow::Cow;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use syncap_common::error::{RecorderError, RecorderResult};
use syncap_sample_model::{
    AudioBlock, CompletionMarker, GapMarker, Payload, Sample, SourceKind, TimestampNs, VideoFrame,
};

use super::sink::{ArtifactSink, FileSinks, SinkFactory};

pub const MEDIA_MAGIC: &[u8; 8] = b"SYNCAPM1";
pub const MEDIA_FORMAT_VERSION: u32 = 2;

const MAX_HEADER_LEN: u32 = 1 << 20;
const MAX_RECORD_LEN: u32 = 256 << 20;

/// Container header, stored as JSON after the magic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaHeader {
    pub format_version: u32,
    pub session_id: String,
    pub epoch_wall: String,
    pub sources: Vec<SourceKind>,
}

/// One length-prefixed record body.
///
/// Borrowed on the write path so frames are encoded without a copy; the
/// reader always gets owned data back.
#[derive(Debug, Serialize, Deserialize)]
enum MediaRecord<'a> {
    Video {
        t: TimestampNs,
        seq: u64,
        frame: Cow<'a, VideoFrame>,
    },
    Audio {
        kind: SourceKind,
        t: TimestampNs,
        seq: u64,
        block: Cow<'a, AudioBlock>,
    },
    Gap {
        kind: SourceKind,
        t: TimestampNs,
        seq: u64,
        gap: GapMarker,
    },
    Trailer(Cow<'a, CompletionMarker>),
}

impl<'a> MediaRecord<'a> {
    fn from_sample(sample: &'a Sample) -> RecorderResult<Self> {
        let (t, seq) = (sample.timestamp_ns, sample.sequence);
        match &sample.payload {
            Payload::Video(frame) if sample.kind == SourceKind::Video => Ok(MediaRecord::Video {
                t,
                seq,
                frame: Cow::Borrowed(frame),
            }),
            Payload::Audio(block) if sample.kind.is_media() => Ok(MediaRecord::Audio {
                kind: sample.kind,
                t,
                seq,
                block: Cow::Borrowed(block),
            }),
            Payload::Gap(gap) if sample.kind.is_media() => Ok(MediaRecord::Gap {
                kind: sample.kind,
                t,
                seq,
                gap: *gap,
            }),
            _ => Err(RecorderError::write(format!(
                "{} sample does not belong in the media container",
                sample.kind
            ))),
        }
    }

    fn into_entry(self) -> Result<MediaEntry, MediaFormatError> {
        let entry = match self {
            MediaRecord::Video { t, seq, frame } => {
                MediaEntry::Sample(Sample::video(t, seq, frame.into_owned()))
            }
            MediaRecord::Audio {
                kind,
                t,
                seq,
                block,
            } => {
                if !kind.is_media() {
                    return Err(MediaFormatError::ForeignKind(kind));
                }
                MediaEntry::Sample(Sample::new(kind, t, seq, Payload::Audio(block.into_owned())))
            }
            MediaRecord::Gap { kind, t, seq, gap } => {
                if !kind.is_media() {
                    return Err(MediaFormatError::ForeignKind(kind));
                }
                MediaEntry::Sample(Sample::new(kind, t, seq, Payload::Gap(gap)))
            }
            MediaRecord::Trailer(marker) => MediaEntry::Trailer(marker.into_owned()),
        };
        Ok(entry)
    }
}

/// Errors decoding a media container.
#[derive(Debug, thiserror::Error)]
pub enum MediaFormatError {
    #[error("Not a syncap media file (bad magic)")]
    BadMagic,

    #[error("Invalid media header: {0}")]
    Header(#[from] serde_json::Error),

    #[error("Record of {0} bytes exceeds the container limit")]
    Oversized(u32),

    #[error("Malformed media record: {0}")]
    Record(#[from] bincode::Error),

    #[error("{0} samples do not belong in the media container")]
    ForeignKind(SourceKind),

    #[error("Record cut off mid-write")]
    Truncated,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Appends records to a media container.
pub struct MediaWriter {
    writer: BufWriter<Box<dyn ArtifactSink>>,
    path: PathBuf,
    records_written: u64,
    bytes_written: u64,
    finished: bool,
}

impl MediaWriter {
    pub fn create(path: PathBuf, header: &MediaHeader) -> RecorderResult<Self> {
        Self::create_with(&FileSinks, path, header)
    }

    /// Open the container through `sinks` and write the header.
    pub fn create_with(
        sinks: &dyn SinkFactory,
        path: PathBuf,
        header: &MediaHeader,
    ) -> RecorderResult<Self> {
        let mut writer = BufWriter::new(sinks.open(&path)?);

        let json = serde_json::to_vec(header)?;
        let mut prologue = Vec::with_capacity(MEDIA_MAGIC.len() + 4 + json.len());
        prologue.extend_from_slice(MEDIA_MAGIC);
        prologue.extend_from_slice(&(json.len() as u32).to_le_bytes());
        prologue.extend_from_slice(&json);
        writer
            .write_all(&prologue)
            .map_err(|e| RecorderError::write(format!("Failed to write media header: {e}")))?;

        Ok(Self {
            writer,
            path,
            records_written: 0,
            bytes_written: prologue.len() as u64,
            finished: false,
        })
    }

    /// Append one video, audio or gap sample.
    pub fn append(&mut self, sample: &Sample) -> RecorderResult<()> {
        self.write_record(&MediaRecord::from_sample(sample)?)?;
        self.records_written += 1;
        Ok(())
    }

    pub fn flush(&mut self, sync: bool) -> RecorderResult<()> {
        self.writer
            .flush()
            .map_err(|e| RecorderError::write(format!("Failed to flush media: {e}")))?;
        if sync {
            self.writer
                .get_mut()
                .sync_data()
                .map_err(|e| RecorderError::write(format!("Failed to sync media: {e}")))?;
        }
        Ok(())
    }

    /// Append the trailer record and sync the file.
    pub fn finish(&mut self, marker: &CompletionMarker) -> RecorderResult<()> {
        self.write_record(&MediaRecord::Trailer(Cow::Borrowed(marker)))?;
        self.flush(true)?;
        self.finished = true;
        Ok(())
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_record(&mut self, record: &MediaRecord<'_>) -> RecorderResult<()> {
        let body = bincode::serialize(record)
            .map_err(|e| RecorderError::write(format!("Failed to encode media record: {e}")))?;
        let len = u32::try_from(body.len())
            .ok()
            .filter(|len| *len <= MAX_RECORD_LEN)
            .ok_or_else(|| {
                RecorderError::write(format!("Media record too large: {} bytes", body.len()))
            })?;

        self.writer
            .write_all(&len.to_le_bytes())
            .and_then(|()| self.writer.write_all(&body))
            .map_err(|e| RecorderError::write(format!("Failed to write media record: {e}")))?;
        self.bytes_written += 4 + body.len() as u64;
        Ok(())
    }
}

impl Drop for MediaWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.writer.flush();
        }
    }
}

/// One decoded record.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEntry {
    Sample(Sample),
    Trailer(CompletionMarker),
}

/// Streaming reader over a media container.
pub struct MediaReader<R> {
    reader: R,
    header: MediaHeader,
}

impl MediaReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> RecorderResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(RecorderError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let file = File::open(path)?;
        Self::new(BufReader::new(file)).map_err(|e| RecorderError::Other(anyhow::Error::new(e)))
    }
}

impl<R: Read> MediaReader<R> {
    pub fn new(mut reader: R) -> Result<Self, MediaFormatError> {
        let mut magic = [0u8; 8];
        read_exact_or_truncated(&mut reader, &mut magic)?;
        if &magic != MEDIA_MAGIC {
            return Err(MediaFormatError::BadMagic);
        }
        let len = read_len(&mut reader)?;
        if len > MAX_HEADER_LEN {
            return Err(MediaFormatError::Oversized(len));
        }
        let mut json = vec![0u8; len as usize];
        read_exact_or_truncated(&mut reader, &mut json)?;
        let header = serde_json::from_slice(&json)?;
        Ok(Self { reader, header })
    }

    pub fn header(&self) -> &MediaHeader {
        &self.header
    }

    /// Next record, or `None` at a clean end of file.
    pub fn next_entry(&mut self) -> Result<Option<MediaEntry>, MediaFormatError> {
        let mut first = [0u8; 1];
        match self.reader.read(&mut first) {
            Ok(0) => return Ok(None),
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }
        let mut rest = [0u8; 3];
        read_exact_or_truncated(&mut self.reader, &mut rest)?;
        let len = u32::from_le_bytes([first[0], rest[0], rest[1], rest[2]]);
        if len > MAX_RECORD_LEN {
            return Err(MediaFormatError::Oversized(len));
        }

        let mut body = vec![0u8; len as usize];
        read_exact_or_truncated(&mut self.reader, &mut body)?;
        let record: MediaRecord<'static> = bincode::deserialize(&body)?;
        record.into_entry().map(Some)
    }
}

/// Everything read from a media container.
#[derive(Debug, Clone)]
pub struct MediaContents {
    pub header: MediaHeader,
    pub samples: Vec<Sample>,
    pub trailer: Option<CompletionMarker>,
    /// The last record was cut off mid-write.
    pub torn_tail: bool,
}

impl MediaContents {
    pub fn is_time_ordered(&self) -> bool {
        self.samples
            .windows(2)
            .all(|w| w[0].timestamp_ns <= w[1].timestamp_ns)
    }
}

/// Read a whole container. A record cut off at the end of the file is
/// tolerated and reported through `torn_tail`.
pub fn read_media(path: impl AsRef<Path>) -> RecorderResult<MediaContents> {
    let mut reader = MediaReader::open(path)?;
    let mut contents = MediaContents {
        header: reader.header().clone(),
        samples: Vec::new(),
        trailer: None,
        torn_tail: false,
    };

    loop {
        match reader.next_entry() {
            Ok(Some(MediaEntry::Sample(sample))) => {
                if contents.trailer.is_some() {
                    return Err(RecorderError::write("Media record after trailer"));
                }
                contents.samples.push(sample);
            }
            Ok(Some(MediaEntry::Trailer(marker))) => contents.trailer = Some(marker),
            Ok(None) => break,
            Err(MediaFormatError::Truncated) => {
                contents.torn_tail = true;
                break;
            }
            Err(e) => return Err(RecorderError::Other(anyhow::Error::new(e))),
        }
    }
    Ok(contents)
}

fn read_exact_or_truncated(reader: &mut impl Read, buf: &mut [u8]) -> Result<(), MediaFormatError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => MediaFormatError::Truncated,
        _ => MediaFormatError::Io(e),
    })
}

fn read_len(reader: &mut impl Read) -> Result<u32, MediaFormatError> {
    let mut len = [0u8; 4];
    read_exact_or_truncated(reader, &mut len)?;
    Ok(u32::from_le_bytes(len))
}
