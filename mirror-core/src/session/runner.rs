//! Wires the connector, control channel, encoder session and frame pump
//! into one running mirroring session.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::capture::CaptureCapability;
use crate::control::{ControlChannel, ControlExit, ControlMode};
use crate::error::MirrorError;
use crate::network::connector::DEFAULT_RETRY_DELAY;
use crate::network::{CONTROL_PORT, Dialer, Endpoint, TransportConnector, VIDEO_PORT};
use crate::pump::{DEFAULT_DEQUEUE_TIMEOUT, DEFAULT_RESTART_POLL, FramePump, PumpExit, PumpSettings};
use crate::resolution::{DEFAULT_DENSITY, DEFAULT_FRAME_RATE, Resolution};
use crate::session::encoder::DEFAULT_RESTART_SETTLE;
use crate::session::{EncoderSession, EncoderSettings, RestartOutcome, StopReason};
use crate::state::SessionState;
use crate::status::{StatusReporter, StatusSink};

// ── SessionConfig ────────────────────────────────────────────────

/// Everything a session needs besides the capture capability and dialer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub video: Endpoint,
    pub control: Endpoint,
    pub control_mode: ControlMode,
    /// Used when the receiver does not supply a usable first resolution,
    /// and announced as-is in self-announce mode.
    pub default_resolution: Resolution,
    pub density: u32,
    pub frame_rate: u32,
    pub connect_retry: Duration,
    pub restart_settle: Duration,
    pub restart_poll: Duration,
    pub dequeue_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            video: Endpoint::loopback(VIDEO_PORT),
            control: Endpoint::loopback(CONTROL_PORT),
            control_mode: ControlMode::default(),
            default_resolution: Resolution::default(),
            density: DEFAULT_DENSITY,
            frame_rate: DEFAULT_FRAME_RATE,
            connect_retry: DEFAULT_RETRY_DELAY,
            restart_settle: DEFAULT_RESTART_SETTLE,
            restart_poll: DEFAULT_RESTART_POLL,
            dequeue_timeout: DEFAULT_DEQUEUE_TIMEOUT,
        }
    }
}

impl SessionConfig {
    pub fn encoder_settings(&self) -> EncoderSettings {
        EncoderSettings {
            density: self.density,
            frame_rate: self.frame_rate,
            restart_settle: self.restart_settle,
        }
    }

    pub fn pump_settings(&self) -> PumpSettings {
        PumpSettings {
            dequeue_timeout: self.dequeue_timeout,
            restart_poll: self.restart_poll,
        }
    }
}

// ── SessionHandle ────────────────────────────────────────────────

/// Cloneable remote control for a running [`MirrorSession`].
pub struct SessionHandle<C> {
    encoder: Arc<EncoderSession<C>>,
    cancel: CancellationToken,
    reason: Arc<Mutex<Option<StopReason>>>,
}

impl<C> Clone for SessionHandle<C> {
    fn clone(&self) -> Self {
        Self {
            encoder: self.encoder.clone(),
            cancel: self.cancel.clone(),
            reason: self.reason.clone(),
        }
    }
}

impl<C: CaptureCapability> SessionHandle<C> {
    /// Ask the session to stop. Observed by the pump within one iteration.
    pub fn stop(&self) {
        self.signal(StopReason::Requested);
    }

    /// The platform took the capture grant away.
    pub fn grant_revoked(&self) {
        self.signal(StopReason::GrantRevoked);
    }

    fn signal(&self, reason: StopReason) {
        self.reason
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get_or_insert(reason);
        self.cancel.cancel();
    }

    /// Renegotiate locally, as if the receiver had sent `resolution`.
    pub async fn request_resolution(
        &self,
        resolution: Resolution,
    ) -> Result<RestartOutcome, MirrorError> {
        self.encoder.request_restart(resolution).await
    }

    pub fn state(&self) -> SessionState {
        self.encoder.state()
    }

    pub fn current_resolution(&self) -> Option<Resolution> {
        self.encoder.current_resolution()
    }

    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// ── MirrorSession ────────────────────────────────────────────────

/// One capture grant's worth of mirroring.
pub struct MirrorSession<C, D> {
    config: SessionConfig,
    encoder: Arc<EncoderSession<C>>,
    connector: Arc<TransportConnector<D>>,
    cancel: CancellationToken,
    reason: Arc<Mutex<Option<StopReason>>>,
}

impl<C, D> MirrorSession<C, D>
where
    C: CaptureCapability,
    D: Dialer,
{
    pub fn new(config: SessionConfig, capture: Arc<C>, dialer: D, status: impl StatusSink) -> Self {
        let encoder = EncoderSession::new(
            capture,
            config.encoder_settings(),
            StatusReporter::new(status),
        );
        let connector = TransportConnector::with_retry_delay(dialer, config.connect_retry);
        Self {
            config,
            encoder: Arc::new(encoder),
            connector: Arc::new(connector),
            cancel: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    pub fn handle(&self) -> SessionHandle<C> {
        SessionHandle {
            encoder: self.encoder.clone(),
            cancel: self.cancel.clone(),
            reason: self.reason.clone(),
        }
    }

    pub fn encoder(&self) -> &Arc<EncoderSession<C>> {
        &self.encoder
    }

    pub fn connector(&self) -> &Arc<TransportConnector<D>> {
        &self.connector
    }

    /// Run until stopped. Always leaves the session `Stopped` with every
    /// capture resource released and "idle" reported.
    pub async fn run(self) -> StopReason {
        info!(
            video = %self.config.video,
            control = %self.config.control,
            mode = %self.config.control_mode,
            "mirroring session starting"
        );

        let fallback = match self.stream().await {
            Ok(exit) => match exit {
                PumpExit::EncoderFailed(_) => StopReason::EncoderFailure,
                PumpExit::Cancelled | PumpExit::SessionStopped => StopReason::Requested,
            },
            Err(MirrorError::Cancelled) => StopReason::Requested,
            Err(e) => {
                warn!("session setup failed: {e}");
                StopReason::ConfigurationFailed
            }
        };

        self.cancel.cancel();
        let reason = self
            .encoder
            .stop_reason()
            .or_else(|| *self.reason.lock().unwrap_or_else(|p| p.into_inner()))
            .unwrap_or(fallback);
        self.encoder.stop(reason).await;

        let reason = self.encoder.stop_reason().unwrap_or(reason);
        info!(?reason, restarts = self.encoder.restart_count(), "mirroring session ended");
        reason
    }

    async fn stream(&self) -> Result<PumpExit, MirrorError> {
        let video = self.connector.connect(&self.config.video, &self.cancel).await?;

        let (channel, initial) = ControlChannel::open(
            self.config.control_mode,
            &self.connector,
            &self.config.control,
            self.config.default_resolution,
            &self.cancel,
        )
        .await?;

        self.encoder.start(initial).await?;

        let mut reader = channel.into_reader();
        let reader_task = {
            let encoder = self.encoder.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                let exit = reader.run(encoder, cancel).await;
                (exit, reader.stats())
            })
        };

        let mut pump = FramePump::new(
            self.encoder.clone(),
            self.connector.clone(),
            self.config.video.clone(),
            video,
            self.config.pump_settings(),
        );
        let exit = pump.run(&self.cancel).await;

        self.cancel.cancel();
        match reader_task.await {
            Ok((ControlExit::RestartFailed, stats)) => {
                warn!(?stats, "control reader stopped after a failed restart")
            }
            Ok((exit, stats)) => info!(?exit, ?stats, "control reader finished"),
            Err(e) => warn!("control reader task failed: {e}"),
        }
        Ok(exit)
    }
}
