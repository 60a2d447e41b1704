//! Native capture backends for the continuous sources.
//!
//! A backend only reads the device. Pacing, timestamp normalization and
//! queueing belong to the source adapters. Every reading carries the
//! backend's own clock so the adapter can map it onto the session clock.

use syncap_common::config::{AudioConfig, BackendChoice, InputConfig, ScreenConfig, WindowConfig};
use syncap_common::error::RecorderResult;
use syncap_input_tracker::{InputBackend, WindowBackend};
use syncap_sample_model::{AudioBlock, Captured, VideoFrame};

mod blocks;
#[cfg(feature = "gstreamer")]
pub mod gst;
pub mod synthetic;

pub use synthetic::{Pacer, SyntheticAudio, SyntheticFrames, SyntheticInput, SyntheticWindow};

/// A source of screen frames.
pub trait FrameSource: Send {
    /// Bring the device up. Called once before calibration.
    fn start(&mut self) -> RecorderResult<()> {
        Ok(())
    }

    /// Next captured frame, if one is ready. Never blocks.
    fn next_frame(&mut self) -> RecorderResult<Option<Captured<VideoFrame>>>;

    /// Current reading of the clock that stamps this backend's frames.
    fn native_clock_ns(&mut self) -> RecorderResult<u64>;

    /// Backend name for logging and the session manifest.
    fn name(&self) -> &str;

    /// The backend will never produce again (end of a finite stream).
    fn is_exhausted(&self) -> bool {
        false
    }

    /// Ask the device to finish: capture ends, and whatever it still holds
    /// (encoder tail, queued frames) becomes readable through `next_frame`.
    /// May block.
    fn end_stream(&mut self) -> RecorderResult<()> {
        Ok(())
    }

    /// Release the device. Frames already returned stay valid. May block.
    fn stop(&mut self) -> RecorderResult<()> {
        Ok(())
    }
}

/// A source of fixed-size audio blocks.
pub trait AudioSource: Send {
    fn start(&mut self) -> RecorderResult<()> {
        Ok(())
    }

    /// Next captured block, if one is ready. Never blocks.
    fn next_block(&mut self) -> RecorderResult<Option<Captured<AudioBlock>>>;

    fn native_clock_ns(&mut self) -> RecorderResult<u64>;

    fn name(&self) -> &str;

    fn is_exhausted(&self) -> bool {
        false
    }

    /// Like [`FrameSource::end_stream`]; a trailing partial block comes
    /// out short.
    fn end_stream(&mut self) -> RecorderResult<()> {
        Ok(())
    }

    fn stop(&mut self) -> RecorderResult<()> {
        Ok(())
    }
}

/// Open the screen backend selected in `config`.
pub fn open_frame_source(config: &ScreenConfig) -> RecorderResult<Box<dyn FrameSource>> {
    match config.backend {
        BackendChoice::Synthetic => Ok(Box::new(SyntheticFrames::from_config(config))),
        BackendChoice::Native => open_native_frame_source(config),
    }
}

/// Open the audio backend selected in `config`.
pub fn open_audio_source(config: &AudioConfig) -> RecorderResult<Box<dyn AudioSource>> {
    match config.backend {
        BackendChoice::Synthetic => Ok(Box::new(SyntheticAudio::from_config(config))),
        BackendChoice::Native => open_native_audio_source(config),
    }
}

/// Open the keyboard/mouse backend selected in `config`.
pub fn open_input_backend(config: &InputConfig) -> RecorderResult<Box<dyn InputBackend>> {
    match config.backend {
        BackendChoice::Synthetic => Ok(Box::new(SyntheticInput::new())),
        BackendChoice::Native => syncap_input_tracker::detect_best_backend(),
    }
}

/// Open the window backend selected in `config`.
pub fn open_window_backend(config: &WindowConfig) -> RecorderResult<Box<dyn WindowBackend>> {
    match config.backend {
        BackendChoice::Synthetic => Ok(Box::new(SyntheticWindow::new())),
        BackendChoice::Native => syncap_input_tracker::detect_window_backend(),
    }
}

#[cfg(feature = "gstreamer")]
fn open_native_frame_source(config: &ScreenConfig) -> RecorderResult<Box<dyn FrameSource>> {
    Ok(Box::new(gst::GstFrameSource::screen(config)?))
}

#[cfg(not(feature = "gstreamer"))]
fn open_native_frame_source(_config: &ScreenConfig) -> RecorderResult<Box<dyn FrameSource>> {
    Err(syncap_common::error::RecorderError::unsupported(
        "native screen capture needs the `gstreamer` feature; use the synthetic backend",
    ))
}

#[cfg(feature = "gstreamer")]
fn open_native_audio_source(config: &AudioConfig) -> RecorderResult<Box<dyn AudioSource>> {
    Ok(Box::new(gst::GstAudioSource::capture(config)?))
}

#[cfg(not(feature = "gstreamer"))]
fn open_native_audio_source(_config: &AudioConfig) -> RecorderResult<Box<dyn AudioSource>> {
    Err(syncap_common::error::RecorderError::unsupported(
        "native audio capture needs the `gstreamer` feature; use the synthetic backend",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_synthetic_backends_open() {
        let screen = ScreenConfig {
            backend: BackendChoice::Synthetic,
            ..ScreenConfig::default()
        };
        let audio = AudioConfig {
            backend: BackendChoice::Synthetic,
            ..AudioConfig::default()
        };
        assert_eq!(open_frame_source(&screen).unwrap().name(), "synthetic-screen");
        assert_eq!(open_audio_source(&audio).unwrap().name(), "synthetic-audio");
    }

    #[cfg(not(feature = "gstreamer"))]
    #[test]
    fn test_native_media_without_gstreamer_is_unsupported() {
        use syncap_common::error::RecorderError;
        let err = open_frame_source(&ScreenConfig::default()).err().unwrap();
        assert!(matches!(err, RecorderError::Unsupported { .. }));
    }
}
