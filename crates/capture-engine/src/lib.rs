//! syncap Capture Engine
//!
//! Records several independently clocked sources into one synchronized
//! recording. Each source adapter stamps its readings on the session clock
//! and pushes them into its own bounded queue; a single consumer releases
//! samples up to the watermark and hands them to the Mux/Writer in session
//! time order.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    SessionController                     │
//! │  ┌────────┐ ┌────────┐ ┌────────┐ ┌─────────────┐        │
//! │  │ Screen │ │ Audio  │ │ Input  │ │ WindowEvent │ adapters│
//! │  └───┬────┘ └───┬────┘ └───┬────┘ └──────┬──────┘        │
//! │      ▼          ▼          ▼             ▼               │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │     SyncBuffer (bounded queues + watermark)        │  │
//! │  └──────────────────────────┬─────────────────────────┘  │
//! │                             ▼ consumer tick              │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │  MuxWriter: <stem>.media   <stem>.events.jsonl     │  │
//! │  └────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod mux;
pub mod pid;
pub mod queue;
pub mod session;
pub mod shutdown;
pub mod source;
pub mod sync;

pub use mux::{prepare_output, read_event_log, read_media, MuxHeader, MuxSummary, MuxWriter};
pub use pid::PidFile;
pub use session::{SessionController, SessionReport, SessionStatus};
pub use shutdown::{ShutdownHandle, ShutdownReason};
pub use source::{AdapterReport, SourceAdapter, SourceEvent};
pub use sync::{BufferStats, QueueProducer, SyncBuffer};
