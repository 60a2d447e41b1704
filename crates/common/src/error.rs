//! Error types shared across syncap crates.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for recorder operations.
///
/// The first five variants form the recording failure taxonomy. Per-source
/// variants (`CalibrationFailure`, `SourceStalled`, `Overflow`) are recovered
/// by excluding or downgrading the source; `WriteFailure` is fatal to the
/// session; `DrainTimeout` forces a truncated close.
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("Calibration failed for {stream}: {message}")]
    CalibrationFailure { stream: String, message: String },

    #[error("Source {stream} stalled: {message}")]
    SourceStalled { stream: String, message: String },

    #[error("Queue overflow on {stream}: full for longer than {waited:?}")]
    Overflow { stream: String, waited: Duration },

    #[error("Write failure: {message}")]
    WriteFailure { message: String },

    #[error("Drain did not finish within {timeout:?}")]
    DrainTimeout { timeout: Duration },

    #[error("Capture error: {message}")]
    Capture { message: String },

    #[error("Session error: {message}")]
    Session { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Unsupported operation: {message}")]
    Unsupported { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using RecorderError.
pub type RecorderResult<T> = Result<T, RecorderError>;

impl RecorderError {
    pub fn calibration(source: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CalibrationFailure {
            stream: source.into(),
            message: msg.into(),
        }
    }

    pub fn stalled(source: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SourceStalled {
            stream: source.into(),
            message: msg.into(),
        }
    }

    pub fn overflow(source: impl Into<String>, waited: Duration) -> Self {
        Self::Overflow {
            stream: source.into(),
            waited,
        }
    }

    pub fn write(msg: impl Into<String>) -> Self {
        Self::WriteFailure {
            message: msg.into(),
        }
    }

    pub fn capture(msg: impl Into<String>) -> Self {
        Self::Capture {
            message: msg.into(),
        }
    }

    pub fn session(msg: impl Into<String>) -> Self {
        Self::Session {
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported {
            message: msg.into(),
        }
    }
}
