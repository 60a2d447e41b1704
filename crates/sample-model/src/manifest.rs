//! Session manifest (`<stem>.session.json`).
//!
//! Written once, atomically, when a session closes or fails. Ties the media
//! container and the event log together and records per-source clock and
//! loss statistics.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::log::CloseStatus;
use crate::sample::{SourceHealth, SourceKind};

/// Current manifest schema version.
pub const MANIFEST_VERSION: &str = "1.0";

/// Paths of every artifact belonging to one output stem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPaths {
    pub media: PathBuf,
    pub events: PathBuf,
    pub manifest: PathBuf,
}

impl ArtifactPaths {
    /// `out/run1` → `out/run1.media`, `out/run1.events.jsonl`,
    /// `out/run1.session.json`.
    pub fn from_stem(stem: impl AsRef<Path>) -> Self {
        let stem = stem.as_ref();
        let with = |suffix: &str| {
            let mut name = stem.as_os_str().to_os_string();
            name.push(suffix);
            PathBuf::from(name)
        };
        Self {
            media: with(".media"),
            events: with(".events.jsonl"),
            manifest: with(".session.json"),
        }
    }

    /// Artifacts that already exist on disk.
    pub fn existing(&self) -> Vec<&Path> {
        [&self.media, &self.events, &self.manifest]
            .into_iter()
            .map(PathBuf::as_path)
            .filter(|p| p.exists())
            .collect()
    }
}

/// How the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// Closed with a completion marker.
    Complete,
    /// Closed after the drain timeout; a truncation marker was written.
    Truncated,
    /// Ended on an unrecoverable error; artifacts carry no marker.
    Failed,
}

impl From<CloseStatus> for SessionOutcome {
    fn from(status: CloseStatus) -> Self {
        match status {
            CloseStatus::Complete => SessionOutcome::Complete,
            CloseStatus::Truncated => SessionOutcome::Truncated,
        }
    }
}

/// Final statistics for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub kind: SourceKind,

    /// Backend name (e.g. `gst-screen`, `evdev`, `synthetic`).
    pub backend: String,

    pub final_health: SourceHealth,

    /// Samples written for this source, gap markers excluded.
    pub samples: u64,

    /// Samples represented by gap markers.
    pub missing: u64,

    /// Timestamps clamped by the clock normalizer.
    pub clock_corrections: u64,

    /// Session minus native clock at calibration (ns).
    #[serde(default)]
    pub clock_offset_ns: i64,

    /// Drift rate applied at close.
    #[serde(default)]
    pub drift_ppm: f64,

    /// Why the source failed, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Desktop input settings in effect while recording. They shape how raw
/// input turns into on-screen motion and repeated keystrokes, so replaying
/// the event log faithfully needs them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionEnvironment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointer_ballistics: Option<PointerBallistics>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyboard_repeat: Option<KeyboardRepeat>,
}

impl SessionEnvironment {
    pub fn is_empty(&self) -> bool {
        self.pointer_ballistics.is_none() && self.keyboard_repeat.is_none()
    }
}

/// Pointer acceleration: motion beyond `threshold` pixels per report is
/// multiplied by `acceleration`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointerBallistics {
    pub acceleration: f64,
    pub threshold: u32,
}

/// Key autorepeat timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyboardRepeat {
    pub enabled: bool,
    pub delay_ms: u32,
    pub rate_hz: u32,
}

/// Top-level manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionManifest {
    pub version: String,
    pub session_id: String,

    /// Wall-clock time at session clock zero (ISO 8601).
    pub started_at: String,
    pub closed_at: String,

    pub outcome: SessionOutcome,

    /// Artifact file names, relative to the manifest's directory.
    pub media_file: String,
    pub events_file: String,

    /// Highest watermark the synchronization buffer released.
    pub last_watermark_ns: Option<u64>,

    pub sources: Vec<SourceSummary>,

    #[serde(default, skip_serializing_if = "SessionEnvironment::is_empty")]
    pub environment: SessionEnvironment,

    /// Fatal error message when `outcome` is `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Errors that can occur when reading or writing a manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("I/O error at {path}: {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Parse error in {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl SessionManifest {
    /// Load a manifest from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ManifestError::IoError {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&json).map_err(|e| ManifestError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Write the manifest atomically: temp file in the same directory, then
    /// rename over the target.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ManifestError> {
        let path = path.as_ref();
        let io_err = |source| ManifestError::IoError {
            path: path.to_path_buf(),
            source,
        };

        let json = serde_json::to_string_pretty(self).map_err(|e| ManifestError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut tmp_name = path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }

    /// Summary for one source kind.
    pub fn source(&self, kind: SourceKind) -> Option<&SourceSummary> {
        self.sources.iter().find(|s| s.kind == kind)
    }
}
