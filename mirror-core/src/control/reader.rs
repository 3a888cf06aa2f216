//! Control-reader task: turns renegotiation lines into encoder restarts.
//!
//! Runs independently of the frame pump. When the control stream ends the
//! reader simply returns; video keeps flowing at the last resolution.

use std::sync::Arc;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::CaptureCapability;
use crate::codec::{ControlCodec, ControlLine};
use crate::session::EncoderSession;

/// Why the reader returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlExit {
    /// The receiver closed the control stream or it failed.
    Closed,
    /// The session was cancelled.
    Cancelled,
    /// A restart could not complete; the session has been stopped.
    RestartFailed,
}

/// Counters for one reader's lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ControlStats {
    pub messages: u64,
    pub malformed: u64,
}

pub struct ControlReader<S> {
    lines: FramedRead<ReadHalf<S>, ControlCodec>,
    // Held so the link stays fully open for as long as we read.
    _writer: FramedWrite<WriteHalf<S>, ControlCodec>,
    stats: ControlStats,
}

impl<S> ControlReader<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub(crate) fn new(
        lines: FramedRead<ReadHalf<S>, ControlCodec>,
        writer: FramedWrite<WriteHalf<S>, ControlCodec>,
    ) -> Self {
        Self {
            lines,
            _writer: writer,
            stats: ControlStats::default(),
        }
    }

    /// Read renegotiation lines until the stream closes or `cancel` fires.
    ///
    /// Restarts run inline, so requests are applied strictly in line order.
    pub async fn run<C: CaptureCapability>(
        &mut self,
        session: Arc<EncoderSession<C>>,
        cancel: CancellationToken,
    ) -> ControlExit {
        loop {
            let next = tokio::select! {
                line = self.lines.next() => line,
                _ = cancel.cancelled() => return ControlExit::Cancelled,
            };

            let msg = match next {
                None => {
                    info!("control channel closed");
                    return ControlExit::Closed;
                }
                Some(Err(e)) => {
                    warn!("control channel ended: {e}");
                    return ControlExit::Closed;
                }
                Some(Ok(ControlLine::Malformed { line, reason })) => {
                    self.stats.malformed += 1;
                    warn!(%line, "ignoring malformed control line: {reason}");
                    continue;
                }
                Some(Ok(ControlLine::Message(msg))) => msg,
            };

            self.stats.messages += 1;
            let target = match msg.resolution() {
                Ok(r) => r,
                Err(e) => {
                    self.stats.malformed += 1;
                    warn!("ignoring control message: {e}");
                    continue;
                }
            };
            debug!(width = target.width, height = target.height, "control message");

            match session.request_restart(target).await {
                Ok(outcome) => debug!(?outcome, %target, "renegotiation handled"),
                Err(e) => {
                    error!("restart to {target} failed: {e}");
                    cancel.cancel();
                    return ControlExit::RestartFailed;
                }
            }
        }
    }

    pub fn stats(&self) -> ControlStats {
        self.stats
    }
}
