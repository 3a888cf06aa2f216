//! Opening the control link and settling the initial resolution.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::codec::{ControlCodec, ControlLine};
use crate::control::{ControlMessage, ControlMode, ControlReader};
use crate::error::MirrorError;
use crate::network::{Dialer, Endpoint, TransportConnector};
use crate::resolution::Resolution;

/// An established control link, before the reader task takes it over.
pub struct ControlChannel<S> {
    lines: FramedRead<ReadHalf<S>, ControlCodec>,
    writer: FramedWrite<WriteHalf<S>, ControlCodec>,
    mode: ControlMode,
}

impl<S> ControlChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Wrap an already connected stream.
    pub fn new(stream: S, mode: ControlMode) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            lines: FramedRead::new(read, ControlCodec::new()),
            writer: FramedWrite::new(write, ControlCodec::new()),
            mode,
        }
    }

    /// Dial the control endpoint and run the mode's opening exchange.
    ///
    /// Returns the channel and the resolution to configure first. Only
    /// cancellation is an error; a receiver that hangs up or sends garbage
    /// during the handshake leaves `default` in effect.
    pub async fn open<D>(
        mode: ControlMode,
        connector: &TransportConnector<D>,
        endpoint: &Endpoint,
        default: Resolution,
        cancel: &CancellationToken,
    ) -> Result<(Self, Resolution), MirrorError>
    where
        D: Dialer<Stream = S>,
    {
        let stream = connector.connect(endpoint, cancel).await?;
        info!(%endpoint, %mode, "control channel connected");
        let mut channel = Self::new(stream, mode);
        let initial = channel.negotiate(default, cancel).await?;
        Ok((channel, initial))
    }

    /// Run the opening exchange on an already wrapped stream.
    pub async fn negotiate(
        &mut self,
        default: Resolution,
        cancel: &CancellationToken,
    ) -> Result<Resolution, MirrorError> {
        match self.mode {
            ControlMode::Handshake => self.read_initial(default, cancel).await,
            ControlMode::SelfAnnounce => {
                if let Err(e) = self.announce(default).await {
                    warn!("failed to announce initial resolution: {e}");
                }
                Ok(default)
            }
        }
    }

    async fn read_initial(
        &mut self,
        default: Resolution,
        cancel: &CancellationToken,
    ) -> Result<Resolution, MirrorError> {
        let first = tokio::select! {
            line = self.lines.next() => line,
            _ = cancel.cancelled() => return Err(MirrorError::Cancelled),
        };

        let initial = match first {
            Some(Ok(ControlLine::Message(msg))) => match msg.resolution() {
                Ok(res) => res,
                Err(e) => {
                    warn!("initial resolution rejected: {e}; using {default}");
                    default
                }
            },
            Some(Ok(ControlLine::Malformed { line, reason })) => {
                warn!(%line, "failed to parse initial resolution: {reason}; using {default}");
                default
            }
            Some(Err(e)) => {
                warn!("control read failed during handshake: {e}; using {default}");
                default
            }
            None => {
                warn!("control channel closed before handshake; using {default}");
                default
            }
        };
        info!(width = initial.width, height = initial.height, "initial resolution");
        Ok(initial)
    }

    /// Write one resolution line to the receiver.
    pub async fn announce(&mut self, resolution: Resolution) -> Result<(), MirrorError> {
        self.writer.send(ControlMessage::from(resolution)).await
    }

    pub fn mode(&self) -> ControlMode {
        self.mode
    }

    /// Hand the link to the renegotiation reader.
    pub fn into_reader(self) -> ControlReader<S> {
        ControlReader::new(self.lines, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn handshake_reads_first_line() {
        let stream = tokio_test::io::Builder::new()
            .read(b"{\"width\":1920,\"height\":1080}\n")
            .build();
        let mut channel = ControlChannel::new(stream, ControlMode::Handshake);
        let res = channel
            .negotiate(Resolution::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(res, Resolution::new(1920, 1080).unwrap());
    }

    #[tokio::test]
    async fn handshake_falls_back_on_garbage() {
        let stream = tokio_test::io::Builder::new().read(b"hello\n").build();
        let mut channel = ControlChannel::new(stream, ControlMode::Handshake);
        let res = channel
            .negotiate(Resolution::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(res, Resolution::default());
    }

    #[tokio::test]
    async fn handshake_falls_back_on_eof() {
        let (ours, theirs) = tokio::io::duplex(256);
        drop(theirs);
        let mut channel = ControlChannel::new(ours, ControlMode::Handshake);
        let res = channel
            .negotiate(Resolution::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(res, Resolution::default());
    }

    #[tokio::test]
    async fn self_announce_writes_default_first() {
        let (ours, mut theirs) = tokio::io::duplex(256);
        let mut channel = ControlChannel::new(ours, ControlMode::SelfAnnounce);
        let default = Resolution::new(854, 480).unwrap();
        let res = channel
            .negotiate(default, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(res, default);

        let mut buf = vec![0u8; 64];
        let n = theirs.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"{\"width\":854,\"height\":480}\n");
    }

    #[tokio::test]
    async fn cancelled_handshake() {
        let (ours, _theirs) = tokio::io::duplex(256);
        let mut channel = ControlChannel::new(ours, ControlMode::Handshake);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = channel
            .negotiate(Resolution::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::Cancelled));
    }
}
