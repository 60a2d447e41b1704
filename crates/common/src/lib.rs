//! syncap Common Utilities
//!
//! Shared infrastructure for all syncap crates:
//! - Error types and result aliases
//! - The session clock and per-source clock normalization
//! - Tracing/logging initialization
//! - Configuration loading and validation

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;

pub use clock::*;
pub use config::*;
pub use error::*;
