//! Backends for platforms without native input capture yet.

use syncap_common::error::{RecorderError, RecorderResult};

use syncap_sample_model::SessionEnvironment;

use crate::scripted::ScriptedInputBackend;
use crate::{InputBackend, WindowBackend};

pub fn detect_best_backend() -> RecorderResult<Box<dyn InputBackend>> {
    tracing::warn!(
        "Input capture backends for this platform are not implemented yet; using idle backend"
    );
    Ok(Box::new(ScriptedInputBackend::empty("idle")))
}

pub fn detect_window_backend() -> RecorderResult<Box<dyn WindowBackend>> {
    Err(RecorderError::unsupported(
        "window tracking is not implemented on this platform",
    ))
}

/// Desktop input settings are only read on Linux/X11 so far.
pub fn read_environment() -> SessionEnvironment {
    SessionEnvironment::default()
}
