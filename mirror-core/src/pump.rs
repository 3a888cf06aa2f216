//! Frame pump: drains encoded output and forwards it over the video link.
//!
//! The pump is the only consumer of encoder output and the only writer on
//! the video stream. Transport failures are healed by reconnecting; only an
//! encoder failure or the session stopping ends the loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::capture::{CaptureCapability, EncodedBuffer, EncoderHandle};
use crate::error::MirrorError;
use crate::network::{Dialer, Endpoint, TransportConnector};
use crate::session::{DrainTarget, EncoderSession};

pub const DEFAULT_DEQUEUE_TIMEOUT: Duration = Duration::from_millis(10);
pub const DEFAULT_RESTART_POLL: Duration = Duration::from_millis(50);

/// Pump timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpSettings {
    /// Bounded wait for one encoded buffer.
    pub dequeue_timeout: Duration,
    /// Sleep between checks while a restart is in progress.
    pub restart_poll: Duration,
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            dequeue_timeout: DEFAULT_DEQUEUE_TIMEOUT,
            restart_poll: DEFAULT_RESTART_POLL,
        }
    }
}

/// Counters for one pump's lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PumpStats {
    pub buffers_written: u64,
    pub bytes_written: u64,
    /// Buffers dequeued after a restart began; released unwritten.
    pub dropped_during_restart: u64,
    pub write_failures: u64,
    pub reconnects: u64,
}

/// Why the pump returned.
#[derive(Debug)]
pub enum PumpExit {
    Cancelled,
    SessionStopped,
    EncoderFailed(MirrorError),
}

enum Written {
    Ok,
    Failed(std::io::Error),
    Cancelled,
}

pub struct FramePump<C, D: Dialer> {
    session: Arc<EncoderSession<C>>,
    connector: Arc<TransportConnector<D>>,
    endpoint: Endpoint,
    stream: D::Stream,
    settings: PumpSettings,
    stats: PumpStats,
}

impl<C, D> FramePump<C, D>
where
    C: CaptureCapability,
    D: Dialer,
{
    /// `stream` is the already connected video link.
    pub fn new(
        session: Arc<EncoderSession<C>>,
        connector: Arc<TransportConnector<D>>,
        endpoint: Endpoint,
        stream: D::Stream,
        settings: PumpSettings,
    ) -> Self {
        Self {
            session,
            connector,
            endpoint,
            stream,
            settings,
            stats: PumpStats::default(),
        }
    }

    pub fn stats(&self) -> PumpStats {
        self.stats
    }

    /// Drain until the session stops, the encoder breaks, or `cancel` fires.
    pub async fn run(&mut self, cancel: &CancellationToken) -> PumpExit {
        info!(endpoint = %self.endpoint, "frame pump running");
        let exit = self.pump(cancel).await;
        info!(
            ?exit,
            written = self.stats.buffers_written,
            bytes = self.stats.bytes_written,
            reconnects = self.stats.reconnects,
            "frame pump exited"
        );
        exit
    }

    async fn pump(&mut self, cancel: &CancellationToken) -> PumpExit {
        loop {
            if cancel.is_cancelled() {
                return PumpExit::Cancelled;
            }

            let encoder = match self.session.drain_target() {
                DrainTarget::Ready(encoder) => encoder,
                DrainTarget::Stopped => return PumpExit::SessionStopped,
                DrainTarget::Paused => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.restart_poll) => continue,
                        _ = cancel.cancelled() => return PumpExit::Cancelled,
                    }
                }
            };

            let buffer = match self
                .session
                .capture()
                .dequeue_encoded_buffer(encoder, self.settings.dequeue_timeout)
                .await
            {
                Ok(Some(buffer)) => buffer,
                Ok(None) => continue,
                Err(e) => {
                    // The encoder may have been torn down under us by a restart.
                    if self.session.is_restarting() || self.session.encoder() != Some(encoder) {
                        debug!(%encoder, "dequeue failed on a replaced encoder: {e}");
                        continue;
                    }
                    error!(%encoder, "encoder failed: {e}");
                    return PumpExit::EncoderFailed(e);
                }
            };

            if let Some(exit) = self.forward(encoder, buffer, cancel).await {
                return exit;
            }
        }
    }

    /// Write one buffer and hand it back to the encoder. Returns an exit if
    /// the pump must stop.
    async fn forward(
        &mut self,
        encoder: EncoderHandle,
        buffer: EncodedBuffer,
        cancel: &CancellationToken,
    ) -> Option<PumpExit> {
        let capture = self.session.capture().clone();

        if self.session.is_restarting() {
            self.stats.dropped_during_restart += 1;
            capture.release_buffer(encoder, buffer.id).await;
            return None;
        }

        let written = tokio::select! {
            r = write_buffer(&mut self.stream, &buffer) => match r {
                Ok(()) => Written::Ok,
                Err(e) => Written::Failed(e),
            },
            _ = cancel.cancelled() => Written::Cancelled,
        };
        capture.release_buffer(encoder, buffer.id).await;

        match written {
            Written::Ok => {
                self.stats.buffers_written += 1;
                self.stats.bytes_written += buffer.len() as u64;
                trace!(len = buffer.len(), pts_us = buffer.pts_us, "buffer written");
                None
            }
            Written::Cancelled => Some(PumpExit::Cancelled),
            Written::Failed(e) => {
                self.stats.write_failures += 1;
                warn!(endpoint = %self.endpoint, "video write failed: {e}; reconnecting");
                match self.reconnect(cancel).await {
                    Ok(()) => None,
                    Err(_) => Some(PumpExit::Cancelled),
                }
            }
        }
    }

    async fn reconnect(&mut self, cancel: &CancellationToken) -> Result<(), MirrorError> {
        let stream = self.connector.connect(&self.endpoint, cancel).await?;
        self.stream = stream;
        self.stats.reconnects += 1;
        info!(endpoint = %self.endpoint, "video link re-established");
        Ok(())
    }
}

async fn write_buffer<W>(stream: &mut W, buffer: &EncodedBuffer) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    stream.write_all(&buffer.data).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SyntheticCapture;
    use crate::network::TcpDialer;
    use crate::resolution::Resolution;
    use crate::session::EncoderSettings;
    use crate::status::{NoopStatus, StatusReporter};
    use tokio::io::AsyncReadExt;

    async fn streaming_session(
        capture: &Arc<SyntheticCapture>,
    ) -> Arc<EncoderSession<SyntheticCapture>> {
        let session = Arc::new(EncoderSession::new(
            capture.clone(),
            EncoderSettings::default(),
            StatusReporter::new(NoopStatus),
        ));
        session.start(Resolution::default()).await.unwrap();
        session
    }

    async fn pump_over_tcp(
        session: Arc<EncoderSession<SyntheticCapture>>,
    ) -> (FramePump<SyntheticCapture, TcpDialer>, tokio::net::TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());
        let connector = Arc::new(TransportConnector::new(TcpDialer));
        let cancel = CancellationToken::new();
        let (stream, accepted) =
            tokio::join!(connector.connect(&endpoint, &cancel), listener.accept());
        let pump = FramePump::new(
            session,
            connector,
            endpoint,
            stream.unwrap(),
            PumpSettings::default(),
        );
        (pump, accepted.unwrap().0)
    }

    #[tokio::test]
    async fn writes_raw_elementary_stream() {
        let capture = Arc::new(SyntheticCapture::new());
        let session = streaming_session(&capture).await;
        let (mut pump, mut peer) = pump_over_tcp(session).await;

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let handle = tokio::spawn(async move {
            let exit = pump.run(&cancel).await;
            (exit, pump.stats())
        });

        let mut head = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(5), peer.read_exact(&mut head))
            .await
            .expect("timeout")
            .unwrap();
        assert_eq!(head, [0, 0, 0, 1, 0x67]);

        stopper.cancel();
        let (exit, stats) = handle.await.unwrap();
        assert!(matches!(exit, PumpExit::Cancelled));
        assert!(stats.buffers_written >= 1);
        assert_eq!(capture.buffers_outstanding(), 0);
        assert_eq!(capture.buffers_released(), capture.buffers_dequeued());
    }

    #[tokio::test]
    async fn exits_when_session_stops() {
        let capture = Arc::new(SyntheticCapture::new());
        let session = streaming_session(&capture).await;
        let (mut pump, _peer) = pump_over_tcp(session.clone()).await;

        session.stop(crate::session::StopReason::Requested).await;
        let exit = tokio::time::timeout(Duration::from_secs(5), pump.run(&CancellationToken::new()))
            .await
            .expect("timeout");
        assert!(matches!(exit, PumpExit::SessionStopped));
    }

    #[tokio::test]
    async fn encoder_failure_ends_pump() {
        let capture = Arc::new(SyntheticCapture::new());
        let session = streaming_session(&capture).await;
        let (mut pump, _peer) = pump_over_tcp(session).await;
        capture.fail_dequeue_after(0);

        let exit = tokio::time::timeout(Duration::from_secs(5), pump.run(&CancellationToken::new()))
            .await
            .expect("timeout");
        assert!(matches!(exit, PumpExit::EncoderFailed(MirrorError::Encoder(_))));
    }
}
