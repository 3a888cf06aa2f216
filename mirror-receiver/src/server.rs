//! Receiver side of the mirroring link.
//!
//! Listens on the video and control ports. The video listener forwards
//! each accepted link's raw elementary stream into a sink and goes back to
//! accepting when the sender drops. The control listener owns the current
//! resolution and pushes it to the sender: on accept in handshake mode,
//! and whenever it changes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mirror_core::{ControlCodec, ControlLine, ControlMessage, ControlMode, MirrorError, Resolution};

/// Read buffer for the video link.
const VIDEO_BUF: usize = 64 * 1024;

// ── ReceiverConfig ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub host: String,
    pub video_port: u16,
    pub control_port: u16,
    pub mode: ControlMode,
    /// Resolution requested from the sender until changed.
    pub resolution: Resolution,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            host: mirror_core::network::LOOPBACK_HOST.into(),
            video_port: mirror_core::VIDEO_PORT,
            control_port: mirror_core::CONTROL_PORT,
            mode: ControlMode::Handshake,
            resolution: Resolution::default(),
        }
    }
}

// ── Receiver ─────────────────────────────────────────────────────

type ControlWriter = FramedWrite<OwnedWriteHalf, ControlCodec>;

pub struct Receiver {
    mode: ControlMode,
    video: TcpListener,
    control: TcpListener,
    resolution: Mutex<Resolution>,
    control_writer: AsyncMutex<Option<ControlWriter>>,
    bytes_forwarded: AtomicU64,
    video_links: AtomicU64,
}

impl Receiver {
    /// Bind both listeners.
    pub async fn bind(config: &ReceiverConfig) -> Result<Arc<Self>, MirrorError> {
        let video = TcpListener::bind((config.host.as_str(), config.video_port)).await?;
        let control = TcpListener::bind((config.host.as_str(), config.control_port)).await?;
        info!(
            video = %video.local_addr()?,
            control = %control.local_addr()?,
            mode = %config.mode,
            "receiver listening"
        );
        Ok(Arc::new(Self {
            mode: config.mode,
            video,
            control,
            resolution: Mutex::new(config.resolution),
            control_writer: AsyncMutex::new(None),
            bytes_forwarded: AtomicU64::new(0),
            video_links: AtomicU64::new(0),
        }))
    }

    pub fn video_addr(&self) -> std::io::Result<SocketAddr> {
        self.video.local_addr()
    }

    pub fn control_addr(&self) -> std::io::Result<SocketAddr> {
        self.control.local_addr()
    }

    pub fn resolution(&self) -> Resolution {
        *self.resolution.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_current(&self, res: Resolution) {
        *self.resolution.lock().unwrap_or_else(|p| p.into_inner()) = res;
    }

    pub fn bytes_forwarded(&self) -> u64 {
        self.bytes_forwarded.load(Ordering::Relaxed)
    }

    /// Video links accepted so far.
    pub fn video_links(&self) -> u64 {
        self.video_links.load(Ordering::Relaxed)
    }

    pub async fn control_connected(&self) -> bool {
        self.control_writer.lock().await.is_some()
    }

    /// Change the requested resolution and push it to a connected sender.
    ///
    /// Returns whether a sender was connected to receive it.
    pub async fn set_resolution(&self, res: Resolution) -> bool {
        self.set_current(res);
        info!(width = res.width, height = res.height, "resolution requested");
        self.push_resolution().await
    }

    async fn push_resolution(&self) -> bool {
        let res = self.resolution();
        let mut slot = self.control_writer.lock().await;
        let Some(writer) = slot.as_mut() else {
            debug!("no control link; resolution will be sent on connect");
            return false;
        };
        match writer.send(ControlMessage::from(res)).await {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to send resolution: {e}");
                *slot = None;
                false
            }
        }
    }

    // ── Control ──────────────────────────────────────────────────

    /// Accept control links one at a time until cancelled.
    pub async fn run_control(&self, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                r = self.control.accept() => r,
                _ = cancel.cancelled() => break,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("control accept failed: {e}");
                    continue;
                }
            };
            info!(%peer, "control channel established");
            self.serve_control(stream, &cancel).await;
            *self.control_writer.lock().await = None;
            info!(%peer, "control channel closed");
        }
    }

    async fn serve_control(&self, stream: TcpStream, cancel: &CancellationToken) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {e}");
        }
        let (read, write) = stream.into_split();
        let mut lines = FramedRead::new(read, ControlCodec::new());
        *self.control_writer.lock().await = Some(FramedWrite::new(write, ControlCodec::new()));

        match self.mode {
            ControlMode::Handshake => {
                self.push_resolution().await;
            }
            ControlMode::SelfAnnounce => {
                let first = tokio::select! {
                    line = lines.next() => line,
                    _ = cancel.cancelled() => return,
                };
                match first {
                    Some(Ok(ControlLine::Message(msg))) => match msg.resolution() {
                        Ok(res) => {
                            info!(width = res.width, height = res.height, "sender announced resolution");
                            self.set_current(res);
                        }
                        Err(e) => warn!("bad announcement: {e}"),
                    },
                    Some(Ok(ControlLine::Malformed { line, reason })) => {
                        warn!(%line, "bad announcement: {reason}")
                    }
                    Some(Err(_)) | None => return,
                }
            }
        }

        Self::wait_for_close(lines.into_inner(), cancel).await;
    }

    /// The sender never writes after its opening line; any further read
    /// result means the link is gone.
    async fn wait_for_close(mut read: OwnedReadHalf, cancel: &CancellationToken) {
        let mut byte = [0u8; 1];
        tokio::select! {
            _ = read.read(&mut byte) => {}
            _ = cancel.cancelled() => {}
        }
    }

    // ── Video ────────────────────────────────────────────────────

    /// Accept video links and forward them into `sink` until cancelled.
    ///
    /// A dropped link is not fatal; the next accepted link continues
    /// writing into the same sink. A sink failure ends the loop.
    pub async fn run_video<W>(&self, sink: &mut W, cancel: CancellationToken) -> Result<(), MirrorError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        loop {
            info!("waiting for video connection");
            let accepted = tokio::select! {
                r = self.video.accept() => r,
                _ = cancel.cancelled() => return Ok(()),
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("video accept failed: {e}");
                    continue;
                }
            };
            self.video_links.fetch_add(1, Ordering::Relaxed);
            info!(%peer, "streaming");

            let forwarded = tokio::select! {
                r = self.forward(stream, sink) => r,
                _ = cancel.cancelled() => return Ok(()),
            };
            match forwarded {
                Ok(n) => info!(%peer, bytes = n, "video link closed; re-accepting"),
                Err(Forward::Link(e)) => warn!(%peer, "video read failed: {e}; re-accepting"),
                Err(Forward::Sink(e)) => {
                    warn!("output sink failed: {e}");
                    return Err(e.into());
                }
            }
        }
    }

    async fn forward<W>(&self, mut stream: TcpStream, sink: &mut W) -> Result<u64, Forward>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut buf = vec![0u8; VIDEO_BUF];
        let mut total = 0u64;
        loop {
            let n = stream.read(&mut buf).await.map_err(Forward::Link)?;
            if n == 0 {
                return Ok(total);
            }
            sink.write_all(&buf[..n]).await.map_err(Forward::Sink)?;
            sink.flush().await.map_err(Forward::Sink)?;
            total += n as u64;
            self.bytes_forwarded.fetch_add(n as u64, Ordering::Relaxed);
        }
    }
}

enum Forward {
    Link(std::io::Error),
    Sink(std::io::Error),
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};

    async fn receiver(mode: ControlMode) -> Arc<Receiver> {
        Receiver::bind(&ReceiverConfig {
            video_port: 0,
            control_port: 0,
            mode,
            ..ReceiverConfig::default()
        })
        .await
        .unwrap()
    }

    async fn next_line(lines: &mut tokio::io::Lines<BufReader<TcpStream>>) -> String {
        tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("timeout")
            .unwrap()
            .expect("control closed")
    }

    #[tokio::test]
    async fn handshake_sends_resolution_on_connect_and_change() {
        let rx = receiver(ControlMode::Handshake).await;
        let cancel = CancellationToken::new();
        let control = tokio::spawn({
            let rx = rx.clone();
            let cancel = cancel.clone();
            async move { rx.run_control(cancel).await }
        });

        let sender = TcpStream::connect(rx.control_addr().unwrap()).await.unwrap();
        let mut lines = BufReader::new(sender).lines();
        assert_eq!(next_line(&mut lines).await, r#"{"width":1280,"height":720}"#);

        assert!(rx.set_resolution(Resolution::new(1920, 1080).unwrap()).await);
        assert_eq!(next_line(&mut lines).await, r#"{"width":1920,"height":1080}"#);

        cancel.cancel();
        control.await.unwrap();
    }

    #[tokio::test]
    async fn change_before_connect_is_sent_on_connect() {
        let rx = receiver(ControlMode::Handshake).await;
        assert!(!rx.set_resolution(Resolution::new(854, 480).unwrap()).await);

        let cancel = CancellationToken::new();
        let control = tokio::spawn({
            let rx = rx.clone();
            let cancel = cancel.clone();
            async move { rx.run_control(cancel).await }
        });
        let sender = TcpStream::connect(rx.control_addr().unwrap()).await.unwrap();
        let mut lines = BufReader::new(sender).lines();
        assert_eq!(next_line(&mut lines).await, r#"{"width":854,"height":480}"#);

        cancel.cancel();
        control.await.unwrap();
    }

    #[tokio::test]
    async fn self_announce_adopts_sender_resolution() {
        let rx = receiver(ControlMode::SelfAnnounce).await;
        let cancel = CancellationToken::new();
        let control = tokio::spawn({
            let rx = rx.clone();
            let cancel = cancel.clone();
            async move { rx.run_control(cancel).await }
        });

        let mut sender = TcpStream::connect(rx.control_addr().unwrap()).await.unwrap();
        sender
            .write_all(b"{\"width\":1920,\"height\":1080}\n")
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while rx.resolution() != Resolution::new(1920, 1080).unwrap() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timeout");

        cancel.cancel();
        control.await.unwrap();
    }

    #[tokio::test]
    async fn video_reaccepts_after_disconnect() {
        let rx = receiver(ControlMode::Handshake).await;
        let cancel = CancellationToken::new();
        let addr = rx.video_addr().unwrap();

        let video = tokio::spawn({
            let rx = rx.clone();
            let cancel = cancel.clone();
            async move {
                let mut sink = Vec::new();
                rx.run_video(&mut sink, cancel).await.unwrap();
                sink
            }
        });

        for chunk in [&b"\x00\x00\x00\x01first"[..], &b"\x00\x00\x00\x01second"[..]] {
            let mut sender = TcpStream::connect(addr).await.unwrap();
            sender.write_all(chunk).await.unwrap();
            drop(sender);
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while rx.bytes_forwarded() < 19 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timeout");

        cancel.cancel();
        let sink = video.await.unwrap();
        assert_eq!(sink, b"\x00\x00\x00\x01first\x00\x00\x00\x01second");
        assert_eq!(rx.video_links(), 2);
    }
}
