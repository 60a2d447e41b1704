//! Scripted backends that replay pre-timed events.
//!
//! The native clock of a scripted backend is tokio time elapsed since the
//! backend was created, shifted by an arbitrary origin so tests exercise a
//! real offset. An event becomes available once that clock reaches its
//! native timestamp, which makes scripts deterministic under a paused tokio
//! runtime.

use std::collections::VecDeque;

use syncap_common::error::{RecorderError, RecorderResult};
use syncap_sample_model::{Captured, InputEvent, WindowEvent};
use tokio::time::Instant;

use crate::{InputBackend, WindowBackend};

/// Replays `Captured<T>` values in native-time order.
#[derive(Debug)]
pub struct ScriptedSource<T> {
    name: String,
    pending: VecDeque<Captured<T>>,
    started: Instant,
    origin_ns: u64,
    clock_available: bool,
}

impl<T> ScriptedSource<T> {
    /// Create a scripted source. Event timestamps are native: they should
    /// include `origin_ns`.
    pub fn new(name: impl Into<String>, origin_ns: u64, mut events: Vec<Captured<T>>) -> Self {
        events.sort_by_key(|e| e.native_ns);
        Self {
            name: name.into(),
            pending: events.into(),
            started: Instant::now(),
            origin_ns,
            clock_available: true,
        }
    }

    /// Build events from offsets relative to the origin.
    pub fn from_offsets(
        name: impl Into<String>,
        origin_ns: u64,
        events: impl IntoIterator<Item = (u64, T)>,
    ) -> Self {
        let events = events
            .into_iter()
            .map(|(offset, value)| Captured::new(origin_ns + offset, value))
            .collect();
        Self::new(name, origin_ns, events)
    }

    /// A source that never produces anything.
    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(name, 0, Vec::new())
    }

    /// Make the native clock unreadable, so calibration fails.
    pub fn with_unavailable_clock(mut self) -> Self {
        self.clock_available = false;
        self
    }

    /// Events not yet released.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    fn now_ns(&self) -> u64 {
        self.origin_ns + self.started.elapsed().as_nanos() as u64
    }

    fn clock(&self) -> RecorderResult<u64> {
        if self.clock_available {
            Ok(self.now_ns())
        } else {
            Err(RecorderError::capture(format!(
                "{}: native clock unavailable",
                self.name
            )))
        }
    }

    fn next_due(&mut self) -> Option<Captured<T>> {
        let now = self.now_ns();
        match self.pending.front() {
            Some(event) if event.native_ns <= now => self.pending.pop_front(),
            _ => None,
        }
    }
}

/// Scripted keyboard/mouse events.
pub type ScriptedInputBackend = ScriptedSource<InputEvent>;

/// Scripted window events.
pub type ScriptedWindowBackend = ScriptedSource<WindowEvent>;

impl InputBackend for ScriptedSource<InputEvent> {
    fn poll(&mut self) -> RecorderResult<Option<Captured<InputEvent>>> {
        Ok(self.next_due())
    }

    fn native_clock_ns(&mut self) -> RecorderResult<u64> {
        self.clock()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        true
    }
}

impl WindowBackend for ScriptedSource<WindowEvent> {
    fn poll(&mut self) -> RecorderResult<Option<Captured<WindowEvent>>> {
        Ok(self.next_due())
    }

    fn native_clock_ns(&mut self) -> RecorderResult<u64> {
        self.clock()
    }

    fn name(&self) -> &str {
        &self.name
    }
}
