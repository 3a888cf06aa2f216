//! Sender service: hosts one mirroring session for the configured backend.
//!
//! Acts as the shell around the session. It picks the capture capability,
//! relays lifecycle status to the log, and turns the stop flag into a
//! session stop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use mirror_core::{
    CaptureCapability, LogStatus, MirrorSession, StopReason, SyntheticCapture, TcpDialer,
};

use crate::config::{CaptureBackend, SenderConfig};
use crate::ffmpeg::FfmpegCapture;

/// How often the stop flag is polled.
const STOP_POLL: Duration = Duration::from_millis(100);

// ── SenderService ────────────────────────────────────────────────

pub struct SenderService {
    config: SenderConfig,
    running: Arc<AtomicBool>,
}

impl SenderService {
    pub fn new(config: SenderConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle that stops the service when set to `false`.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Run one session to completion with the configured backend.
    pub async fn run(&self) -> StopReason {
        self.running.store(true, Ordering::SeqCst);
        let reason = match self.config.capture.backend {
            CaptureBackend::Ffmpeg => {
                info!(
                    ffmpeg = %self.config.capture.ffmpeg_path,
                    input_format = %self.config.capture.input_format,
                    input = %self.config.capture.input,
                    codec = %self.config.capture.video_codec,
                    "using ffmpeg capture"
                );
                let frame_rate = self.config.to_session_config().frame_rate;
                let capture = FfmpegCapture::new(self.config.capture.clone(), frame_rate);
                self.run_with(Arc::new(capture)).await
            }
            CaptureBackend::Synthetic => {
                info!("using synthetic capture");
                self.run_with(Arc::new(SyntheticCapture::new())).await
            }
        };
        self.running.store(false, Ordering::SeqCst);
        reason
    }

    async fn run_with<C: CaptureCapability>(&self, capture: Arc<C>) -> StopReason {
        let session = MirrorSession::new(
            self.config.to_session_config(),
            capture,
            TcpDialer,
            LogStatus,
        );
        let handle = session.handle();

        let running = Arc::clone(&self.running);
        let watcher = tokio::spawn(async move {
            Self::wait_for_stop(&running).await;
            info!("stop requested");
            handle.stop();
        });

        let reason = session.run().await;
        watcher.abort();

        match reason {
            StopReason::Requested | StopReason::GrantRevoked => info!(?reason, "sender stopped"),
            StopReason::EncoderFailure | StopReason::ConfigurationFailed => {
                warn!(?reason, "sender stopped on capture failure")
            }
        }
        reason
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn wait_for_stop(running: &Arc<AtomicBool>) {
        while running.load(Ordering::SeqCst) {
            tokio::time::sleep(STOP_POLL).await;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
