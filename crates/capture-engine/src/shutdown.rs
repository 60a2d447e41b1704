//! Stop requests for a running session.

use tokio::sync::mpsc;

/// Why recording is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// `SessionController::stop` or a handle's `request_stop`.
    Explicit,
    /// The process-level interrupt (SIGINT/SIGTERM/Ctrl+C).
    Signal,
}

/// Cloneable trigger for the Recording→Draining transition.
///
/// The session acts on the first request only. While one is pending,
/// further requests are dropped, so signal handlers may fire repeatedly.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: mpsc::Sender<ShutdownReason>,
}

impl ShutdownHandle {
    pub(crate) fn channel() -> (Self, mpsc::Receiver<ShutdownReason>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Request a stop. Returns whether this call was the one delivered.
    pub fn request(&self, reason: ShutdownReason) -> bool {
        let delivered = self.tx.try_send(reason).is_ok();
        if delivered {
            tracing::info!(?reason, "Shutdown requested");
        }
        delivered
    }

    pub fn request_stop(&self) -> bool {
        self.request(ShutdownReason::Explicit)
    }

    /// The session is gone; nothing would observe a request.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
