//! syncap Sample Model
//!
//! Defines the data contracts shared by the capture engine and readers of
//! its artifacts:
//! - **Samples:** timestamped units from one of four source kinds
//! - **Events:** input and window payloads carried by discrete sources
//! - **Event log:** the JSONL stream for discrete samples, with header and
//!   completion marker
//! - **Manifest:** per-session summary written at close
//!
//! Every timestamp is on the session clock: monotonic nanoseconds since the
//! session started.

pub mod event;
pub mod log;
pub mod manifest;
pub mod sample;

pub use event::*;
pub use log::*;
pub use manifest::*;
pub use sample::*;
