//! Mirror receiver entry point.
//!
//! ```text
//! mirror-receiver                       Listen on loopback, play through ffplay
//! mirror-receiver --output capture.h264 Write the raw stream to a file
//! mirror-receiver --mode self-announce  Adopt the sender's announced resolution
//! ```
//!
//! While running, typing `480`, `720` or `1080` on stdin requests that tier
//! from the sender. Unknown labels request 720.

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mirror_core::{CONTROL_PORT, ControlMode, ResolutionTier, VIDEO_PORT};
use mirror_receiver::{OutputSink, OutputTarget, Receiver, ReceiverConfig};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "mirror-receiver", about = "Adaptive screen-mirroring receiver")]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = mirror_core::network::LOOPBACK_HOST)]
    host: String,

    #[arg(long, default_value_t = VIDEO_PORT)]
    video_port: u16,

    #[arg(long, default_value_t = CONTROL_PORT)]
    control_port: u16,

    /// Control mode: handshake or self-announce.
    #[arg(short, long, default_value = "handshake")]
    mode: ControlMode,

    /// Initial resolution tier requested from the sender.
    #[arg(short, long, default_value = "720")]
    tier: ResolutionTier,

    /// Output: "ffplay", "-" for stdout, or a file path.
    #[arg(short, long, default_value = "ffplay")]
    output: OutputTarget,

    /// ffplay executable used for the ffplay output.
    #[arg(long, default_value = "ffplay")]
    ffplay: String,

    /// Log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so a stdout output stays clean.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("mirror-receiver v{}", env!("CARGO_PKG_VERSION"));

    let config = ReceiverConfig {
        host: cli.host,
        video_port: cli.video_port,
        control_port: cli.control_port,
        mode: cli.mode,
        resolution: cli.tier.resolution(),
    };
    let receiver = Receiver::bind(&config).await?;
    let cancel = CancellationToken::new();

    let control = tokio::spawn({
        let receiver = receiver.clone();
        let cancel = cancel.clone();
        async move { receiver.run_control(cancel).await }
    });

    // Tier requests from stdin.
    tokio::spawn({
        let receiver = receiver.clone();
        let cancel = cancel.clone();
        async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                let line = tokio::select! {
                    l = lines.next_line() => l,
                    _ = cancel.cancelled() => break,
                };
                let Ok(Some(line)) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let tier = ResolutionTier::from_label_or_default(&line);
                info!("requesting {tier}p");
                receiver.set_resolution(tier.resolution()).await;
            }
        }
    });

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Ctrl-C received; shutting down");
            cancel.cancel();
        }
    });

    let mut sink = OutputSink::open(cli.output, &cli.ffplay).await?;
    let result = receiver.run_video(&mut sink, cancel.clone()).await;
    cancel.cancel();
    sink.finish().await;
    control.await.ok();

    if let Err(e) = result {
        error!("receiver stopped: {e}");
        return Err(e.into());
    }
    info!(bytes = receiver.bytes_forwarded(), "mirror-receiver exiting");
    Ok(())
}
