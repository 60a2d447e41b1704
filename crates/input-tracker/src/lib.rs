//! syncap Input Tracker
//!
//! Native backends for the two discrete sources: keyboard/mouse input and
//! window focus/geometry changes. Backends only read the platform; the
//! capture engine's adapters own timestamp normalization, queueing and
//! backpressure.
//!
//! - **Evdev:** keyboards and pointers under `/dev/input`, with
//!   `/dev/input/mice` as a pointer-only fallback (Linux, requires the
//!   `input` group)
//! - **X11:** active-window polling through `xprop`/`xwininfo`
//! - **Scripted:** timed synthetic events for tests and demos

pub mod backends;
pub mod scripted;

use std::time::Instant;

use syncap_common::error::RecorderResult;
use syncap_sample_model::{Captured, InputEvent, WindowEvent};

pub use backends::{detect_best_backend, detect_window_backend, read_environment};

/// Trait for keyboard/mouse backends.
pub trait InputBackend: Send {
    /// Poll for the next input event. Returns `None` if no event is available.
    fn poll(&mut self) -> RecorderResult<Option<Captured<InputEvent>>>;

    /// Current reading of the clock that stamps this backend's events.
    fn native_clock_ns(&mut self) -> RecorderResult<u64>;

    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Check if the backend is available on this system.
    fn is_available(&self) -> bool;
}

/// Trait for window focus/geometry backends.
pub trait WindowBackend: Send {
    /// Poll for the next window event. Returns `None` if nothing changed.
    fn poll(&mut self) -> RecorderResult<Option<Captured<WindowEvent>>>;

    /// Current reading of the clock that stamps this backend's events.
    fn native_clock_ns(&mut self) -> RecorderResult<u64>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

/// Monotonic clock for backends whose platform gives no timestamps of its
/// own. Readings are stamped at the moment they are pulled from the device.
#[derive(Debug, Clone, Copy)]
pub struct BackendClock {
    origin: Instant,
}

impl BackendClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

impl Default for BackendClock {
    fn default() -> Self {
        Self::new()
    }
}
