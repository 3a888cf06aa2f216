//! Best-effort lifecycle notifications for the hosting shell.
//!
//! Only two values ever leave the session: `"streaming"` once the first
//! encoder is producing, and `"idle"` once the session has stopped.
//! Delivery failures are swallowed.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::info;

/// Lifecycle status surfaced to the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamStatus {
    Streaming,
    Idle,
}

impl StreamStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Idle => "idle",
        }
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives status changes. Must not block and must not fail.
pub trait StatusSink: Send + Sync + 'static {
    fn status_changed(&self, status: StreamStatus);
}

/// Logs status changes through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatus;

impl StatusSink for LogStatus {
    fn status_changed(&self, status: StreamStatus) {
        info!(status = status.as_str(), "status changed");
    }
}

/// Discards status changes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatus;

impl StatusSink for NoopStatus {
    fn status_changed(&self, _status: StreamStatus) {}
}

/// Forwards status changes over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelStatus {
    tx: mpsc::UnboundedSender<StreamStatus>,
}

impl ChannelStatus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StreamStatus>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatusSink for ChannelStatus {
    fn status_changed(&self, status: StreamStatus) {
        let _ = self.tx.send(status);
    }
}

impl<F> StatusSink for F
where
    F: Fn(StreamStatus) + Send + Sync + 'static,
{
    fn status_changed(&self, status: StreamStatus) {
        self(status)
    }
}

// ── StatusReporter ───────────────────────────────────────────────

/// Wraps a sink so that each status is emitted at most once per session.
pub struct StatusReporter {
    sink: Box<dyn StatusSink>,
    streaming_sent: AtomicBool,
    idle_sent: AtomicBool,
}

impl StatusReporter {
    pub fn new(sink: impl StatusSink) -> Self {
        Self {
            sink: Box::new(sink),
            streaming_sent: AtomicBool::new(false),
            idle_sent: AtomicBool::new(false),
        }
    }

    /// Report that the session first reached `Streaming`.
    pub fn streaming(&self) {
        if self.idle_sent.load(Ordering::SeqCst) {
            return;
        }
        if !self.streaming_sent.swap(true, Ordering::SeqCst) {
            self.sink.status_changed(StreamStatus::Streaming);
        }
    }

    /// Report that the session stopped.
    pub fn idle(&self) {
        if !self.idle_sent.swap(true, Ordering::SeqCst) {
            self.sink.status_changed(StreamStatus::Idle);
        }
    }
}

impl fmt::Debug for StatusReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusReporter")
            .field("streaming_sent", &self.streaming_sent.load(Ordering::SeqCst))
            .field("idle_sent", &self.idle_sent.load(Ordering::SeqCst))
            .finish()
    }
}
