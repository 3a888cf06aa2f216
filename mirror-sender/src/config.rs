//! Configuration for the mirroring sender.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use mirror_core::network::{CONTROL_PORT, LOOPBACK_HOST, VIDEO_PORT};
use mirror_core::resolution::{DEFAULT_DENSITY, DEFAULT_FRAME_RATE};
use mirror_core::{ControlMode, Endpoint, ResolutionTier, SessionConfig};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Receiver addresses and control protocol.
    pub network: NetworkConfig,
    /// Initial stream parameters.
    pub stream: StreamConfig,
    /// Retry and restart timing.
    pub timing: TimingConfig,
    /// Capture backend selection.
    pub capture: CaptureConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host the receiver is reachable at (a tunnelled loopback by default).
    pub host: String,
    /// TCP port of the receiver's video listener.
    pub video_port: u16,
    /// TCP port of the receiver's control listener.
    pub control_port: u16,
    /// "handshake" (receiver speaks first) or "self_announce".
    pub control_mode: ControlMode,
}

/// Initial stream parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Resolution used until the receiver asks for another: "480", "720" or "1080".
    pub tier: ResolutionTier,
    /// Capture surface density (dpi).
    pub density: u32,
    /// Encoder frame rate.
    pub frame_rate: u32,
}

/// Retry and restart timing, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub connect_retry_ms: u64,
    pub restart_settle_ms: u64,
    pub restart_poll_ms: u64,
    pub dequeue_timeout_ms: u64,
}

/// Which capture capability drives the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackend {
    /// Screen grab + H.264 encode through an `ffmpeg` child process.
    #[default]
    Ffmpeg,
    /// Fabricated frames; no capture hardware needed.
    Synthetic,
}

/// Capture backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub backend: CaptureBackend,
    /// Path to the ffmpeg executable.
    pub ffmpeg_path: String,
    /// ffmpeg grab device: "x11grab", "gdigrab", "avfoundation" or "lavfi".
    pub input_format: String,
    /// Device input, e.g. ":0.0", "desktop" or "testsrc2=size=1920x1080".
    pub input: String,
    /// H.264 encoder name, e.g. "libx264" or "h264_nvenc".
    pub video_codec: String,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Optional log file path. If empty, logs to stderr.
    pub file: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: LOOPBACK_HOST.into(),
            video_port: VIDEO_PORT,
            control_port: CONTROL_PORT,
            control_mode: ControlMode::Handshake,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            tier: ResolutionTier::P720,
            density: DEFAULT_DENSITY,
            frame_rate: DEFAULT_FRAME_RATE,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_retry_ms: 500,
            restart_settle_ms: 100,
            restart_poll_ms: 50,
            dequeue_timeout_ms: 10,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        let (input_format, input) = default_grab_device();
        Self {
            backend: CaptureBackend::Ffmpeg,
            ffmpeg_path: "ffmpeg".into(),
            input_format: input_format.into(),
            input: input.into(),
            video_codec: "libx264".into(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: String::new(),
        }
    }
}

fn default_grab_device() -> (&'static str, &'static str) {
    if cfg!(target_os = "windows") {
        ("gdigrab", "desktop")
    } else if cfg!(target_os = "macos") {
        ("avfoundation", "1:none")
    } else {
        ("x11grab", ":0.0")
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl SenderConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Convert into the core session configuration.
    pub fn to_session_config(&self) -> SessionConfig {
        let t = &self.timing;
        SessionConfig {
            video: Endpoint::new(self.network.host.clone(), self.network.video_port),
            control: Endpoint::new(self.network.host.clone(), self.network.control_port),
            control_mode: self.network.control_mode,
            default_resolution: self.stream.tier.resolution(),
            density: self.stream.density.clamp(72, 640),
            frame_rate: self.stream.frame_rate.clamp(1, 60),
            connect_retry: Duration::from_millis(t.connect_retry_ms.max(10)),
            restart_settle: Duration::from_millis(t.restart_settle_ms.min(5_000)),
            restart_poll: Duration::from_millis(t.restart_poll_ms.clamp(1, 1_000)),
            dequeue_timeout: Duration::from_millis(t.dequeue_timeout_ms.clamp(1, 1_000)),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
