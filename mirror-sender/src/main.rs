//! Mirror sender entry point.
//!
//! ```text
//! mirror-sender                   Stream with mirror-sender.toml (or defaults)
//! mirror-sender --config <path>   Load a custom config TOML
//! mirror-sender --gen-config      Print the default config to stdout
//! mirror-sender --write-config    Write the default config to --config's path
//! ```

use std::path::PathBuf;
use std::sync::Mutex;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mirror_core::ResolutionTier;
use mirror_sender::config::{CaptureBackend, SenderConfig};
use mirror_sender::service::SenderService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "mirror-sender", about = "Adaptive screen-mirroring sender")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "mirror-sender.toml")]
    config: PathBuf,

    /// Override the starting resolution tier (480, 720, 1080).
    #[arg(short, long)]
    tier: Option<ResolutionTier>,

    /// Use fabricated frames instead of capturing the screen.
    #[arg(long)]
    synthetic: bool,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Write the default configuration to the --config path and exit.
    #[arg(long)]
    write_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&SenderConfig::default())?;
        println!("{text}");
        return Ok(());
    }
    if cli.write_config {
        SenderConfig::write_default(&cli.config)?;
        println!("Wrote {}", cli.config.display());
        return Ok(());
    }

    // Load config.
    let mut config = SenderConfig::load(&cli.config);
    if let Some(tier) = cli.tier {
        config.stream.tier = tier;
    }
    if cli.synthetic {
        config.capture.backend = CaptureBackend::Synthetic;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.file.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.logging.file)?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init();
    }

    info!("mirror-sender v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "receiver: {}:{} (video) / {} (control)",
        config.network.host, config.network.video_port, config.network.control_port
    );
    info!("control mode: {}", config.network.control_mode);
    info!("starting tier: {}p", config.stream.tier);

    let service = SenderService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received; shutting down");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    let reason = service.run().await;
    info!(?reason, "mirror-sender exiting");

    Ok(())
}
