//! Platform backend selection.
//!
//! Each platform module provides `detect_best_backend` and
//! `detect_window_backend`; when no real backend can be opened they fall
//! back to an idle scripted source and say so in the log.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(not(target_os = "linux"))]
mod non_linux;

#[cfg(target_os = "linux")]
pub use linux::*;
#[cfg(not(target_os = "linux"))]
pub use non_linux::*;
