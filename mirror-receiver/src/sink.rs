//! Where the received elementary stream goes.

use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::str::FromStr;
use std::task::{Context, Poll};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use mirror_core::MirrorError;

/// Output destination for the raw H.264 stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// Low-latency playback through an `ffplay` child.
    Ffplay,
    Stdout,
    File(PathBuf),
}

impl FromStr for OutputTarget {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err(MirrorError::Other("empty output target".into())),
            "ffplay" => Ok(Self::Ffplay),
            "-" | "stdout" => Ok(Self::Stdout),
            path => Ok(Self::File(PathBuf::from(path))),
        }
    }
}

impl fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ffplay => f.write_str("ffplay"),
            Self::Stdout => f.write_str("stdout"),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// `ffplay` arguments tuned for minimum display latency on a raw pipe.
pub fn ffplay_args(title: &str) -> Vec<String> {
    [
        "-fflags",
        "nobuffer+discardcorrupt",
        "-flags",
        "low_delay",
        "-framedrop",
        "-vf",
        "setpts=0",
        "-i",
        "pipe:0",
        "-window_title",
        title,
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

// ── OutputSink ───────────────────────────────────────────────────

/// An open output. Writes go straight through to the target.
pub struct OutputSink {
    writer: Pin<Box<dyn AsyncWrite + Send>>,
    player: Option<Child>,
    target: OutputTarget,
}

impl OutputSink {
    pub async fn open(target: OutputTarget, ffplay: &str) -> Result<Self, MirrorError> {
        let (writer, player): (Pin<Box<dyn AsyncWrite + Send>>, _) = match &target {
            OutputTarget::Stdout => (Box::pin(tokio::io::stdout()), None),
            OutputTarget::File(path) => {
                let file = tokio::fs::File::create(path).await?;
                (Box::pin(file), None)
            }
            OutputTarget::Ffplay => {
                let mut child = Command::new(ffplay)
                    .args(ffplay_args("Screen Mirror"))
                    .stdin(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| MirrorError::Other(format!("failed to start {ffplay}: {e}")))?;
                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| MirrorError::Other("ffplay stdin not captured".into()))?;
                (Box::pin(stdin), Some(child))
            }
        };
        info!(%target, "output opened");
        Ok(Self {
            writer,
            player,
            target,
        })
    }

    pub fn target(&self) -> &OutputTarget {
        &self.target
    }

    /// Flush and close the output. A player keeps its window open at end
    /// of input, so it is killed.
    pub async fn finish(mut self) {
        if let Err(e) = self.writer.shutdown().await {
            warn!(target = %self.target, "closing output failed: {e}");
        }
        if let Some(mut player) = self.player.take() {
            if let Err(e) = player.start_kill() {
                debug!("player already gone: {e}");
            }
            match player.wait().await {
                Ok(status) => info!(%status, "player exited"),
                Err(e) => warn!("waiting for player failed: {e}"),
            }
        }
    }
}

impl AsyncWrite for OutputSink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.writer.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.writer.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.writer.as_mut().poll_shutdown(cx)
    }
}
