//! Encoder session: owner of the capture pipeline for one capture grant.
//!
//! All mutation of the encoder and capture-surface handles happens while
//! holding `restart_gate`, so there is exactly one writer at a time. The
//! frame pump is the only reader; it parks itself while `restarting` is
//! raised, which is what keeps it away from a half-replaced encoder.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info};

use crate::capture::{CaptureCapability, EncoderConfig, EncoderHandle, SurfaceHandle};
use crate::error::MirrorError;
use crate::resolution::{DEFAULT_DENSITY, DEFAULT_FRAME_RATE, Resolution};
use crate::state::SessionState;
use crate::status::StatusReporter;

/// Pause between raising the restart flag and tearing down the old
/// encoder, so an in-flight dequeue can finish.
pub const DEFAULT_RESTART_SETTLE: Duration = Duration::from_millis(100);

// ── Settings ─────────────────────────────────────────────────────

/// Fixed parameters applied to every encoder the session creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSettings {
    pub density: u32,
    pub frame_rate: u32,
    pub restart_settle: Duration,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            density: DEFAULT_DENSITY,
            frame_rate: DEFAULT_FRAME_RATE,
            restart_settle: DEFAULT_RESTART_SETTLE,
        }
    }
}

// ── Outcomes ─────────────────────────────────────────────────────

/// What became of a restart request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    /// The encoder was replaced at least once on behalf of this call.
    Restarted,
    /// The requested resolution was already in effect.
    Unchanged,
    /// Another restart was running; the request was left for it to apply.
    Coalesced,
    /// The session is not streaming (not started yet, or stopped).
    Ignored,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The hosting shell asked to stop.
    Requested,
    /// The capture grant was revoked by the platform.
    GrantRevoked,
    /// The encoder broke mid-stream or could not be replaced.
    EncoderFailure,
    /// The first configuration failed.
    ConfigurationFailed,
}

/// What the frame pump should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTarget {
    Ready(EncoderHandle),
    Paused,
    Stopped,
}

#[derive(Debug, Default)]
struct Pipeline {
    encoder: Option<EncoderHandle>,
    surface: Option<SurfaceHandle>,
    current: Option<Resolution>,
}

// ── EncoderSession ───────────────────────────────────────────────

pub struct EncoderSession<C> {
    capture: Arc<C>,
    settings: EncoderSettings,
    state: Mutex<SessionState>,
    pipeline: Mutex<Pipeline>,
    restarting: AtomicBool,
    restart_gate: AsyncMutex<()>,
    pending: Mutex<Option<Resolution>>,
    restarts: AtomicU64,
    stop_reason: Mutex<Option<StopReason>>,
    status: StatusReporter,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl<C: CaptureCapability> EncoderSession<C> {
    pub fn new(capture: Arc<C>, settings: EncoderSettings, status: StatusReporter) -> Self {
        Self {
            capture,
            settings,
            state: Mutex::new(SessionState::default()),
            pipeline: Mutex::new(Pipeline::default()),
            restarting: AtomicBool::new(false),
            restart_gate: AsyncMutex::new(()),
            pending: Mutex::new(None),
            restarts: AtomicU64::new(0),
            stop_reason: Mutex::new(None),
            status,
        }
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        *guard(&self.state)
    }

    pub fn current_resolution(&self) -> Option<Resolution> {
        guard(&self.pipeline).current
    }

    pub fn encoder(&self) -> Option<EncoderHandle> {
        guard(&self.pipeline).encoder
    }

    pub fn surface(&self) -> Option<SurfaceHandle> {
        guard(&self.pipeline).surface
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::SeqCst)
    }

    /// Completed restarts.
    pub fn restart_count(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        *guard(&self.stop_reason)
    }

    pub fn capture(&self) -> &Arc<C> {
        &self.capture
    }

    /// Encoder the frame pump may drain right now.
    pub fn drain_target(&self) -> DrainTarget {
        if self.is_restarting() {
            return DrainTarget::Paused;
        }
        if self.state().is_stopped() {
            return DrainTarget::Stopped;
        }
        match guard(&self.pipeline).encoder {
            Some(e) => DrainTarget::Ready(e),
            None => DrainTarget::Paused,
        }
    }

    // ── Start ────────────────────────────────────────────────────

    /// Configure the encoder and capture surface at `initial` and begin
    /// streaming.
    ///
    /// A failure here is terminal: the session is stopped and "idle" is
    /// reported before the error is returned.
    pub async fn start(&self, initial: Resolution) -> Result<(), MirrorError> {
        let _gate = self.restart_gate.lock().await;
        guard(&self.state).begin_configure()?;
        info!(
            width = initial.width,
            height = initial.height,
            bitrate = initial.bitrate(),
            "configuring encoder"
        );

        let (encoder, surface) = match self.build_pipeline(initial).await {
            Ok(pair) => pair,
            Err(e) => {
                error!("encoder setup failed: {e}");
                self.stop_locked(StopReason::ConfigurationFailed).await;
                return Err(e);
            }
        };

        {
            let mut p = guard(&self.pipeline);
            p.encoder = Some(encoder);
            p.surface = Some(surface);
            p.current = Some(initial);
        }

        guard(&self.state).begin_streaming()?;
        self.status.streaming();
        info!(%encoder, %surface, "streaming");
        Ok(())
    }

    async fn build_pipeline(
        &self,
        res: Resolution,
    ) -> Result<(EncoderHandle, SurfaceHandle), MirrorError> {
        let encoder = self.start_encoder(res).await?;
        match self
            .capture
            .create_capture_surface(res, self.settings.density, encoder)
            .await
        {
            Ok(surface) => Ok((encoder, surface)),
            Err(e) => {
                self.capture.stop(encoder).await;
                self.capture.release(encoder).await;
                Err(e)
            }
        }
    }

    async fn start_encoder(&self, res: Resolution) -> Result<EncoderHandle, MirrorError> {
        let config = EncoderConfig::with_frame_rate(res, self.settings.frame_rate);
        let encoder = self.capture.configure(&config).await?;
        if let Err(e) = self.capture.start(encoder).await {
            self.capture.release(encoder).await;
            return Err(e);
        }
        Ok(encoder)
    }

    // ── Restart ──────────────────────────────────────────────────

    /// Ask for the encoder to run at `target`.
    ///
    /// Requests that match the current resolution are no-ops. While a
    /// restart is running, later requests overwrite a single pending slot
    /// and the running restart applies the latest one when it finishes.
    /// An `Err` means the replacement encoder could not be brought up and
    /// the session has been stopped.
    pub async fn request_restart(&self, target: Resolution) -> Result<RestartOutcome, MirrorError> {
        if !self.state().is_streaming() && !self.is_restarting() {
            debug!(%target, state = %self.state(), "restart request ignored");
            return Ok(RestartOutcome::Ignored);
        }

        *guard(&self.pending) = Some(target);
        let mut outcome = RestartOutcome::Unchanged;

        loop {
            let Ok(gate) = self.restart_gate.try_lock() else {
                debug!(%target, "restart in progress; request coalesced");
                return Ok(RestartOutcome::Coalesced);
            };

            loop {
                let Some(next) = guard(&self.pending).take() else {
                    break;
                };
                if !self.state().accepts_restart() {
                    return Ok(RestartOutcome::Ignored);
                }
                if self.current_resolution() == Some(next) {
                    debug!(%next, "resolution unchanged; no restart");
                    continue;
                }
                self.restart_locked(next).await?;
                outcome = RestartOutcome::Restarted;
            }
            drop(gate);

            // A request may have landed between the last `take` and the
            // unlock, after its sender saw the gate held.
            if guard(&self.pending).is_none() {
                return Ok(outcome);
            }
        }
    }

    /// Replace the encoder for `next`. Caller holds `restart_gate`.
    async fn restart_locked(&self, next: Resolution) -> Result<(), MirrorError> {
        guard(&self.state).begin_restart()?;
        let from = self.current_resolution();

        // 1. Park the pump.
        self.restarting.store(true, Ordering::SeqCst);
        info!(
            from = ?from.map(|r| r.to_string()),
            to = %next,
            bitrate = next.bitrate(),
            "restarting encoder"
        );

        // 2. Let in-flight buffer work settle.
        tokio::time::sleep(self.settings.restart_settle).await;

        // 3. Tear down the old encoder only; the surface stays.
        let (old, surface) = {
            let mut p = guard(&self.pipeline);
            (p.encoder.take(), p.surface)
        };
        if let Some(old) = old {
            self.capture.stop(old).await;
            self.capture.release(old).await;
        }

        // 4 + 5. New encoder, then re-point the surviving surface at it.
        if let Err(e) = self.replace_encoder(next, surface).await {
            error!("encoder restart to {next} failed: {e}");
            self.stop_locked(StopReason::EncoderFailure).await;
            return Err(e);
        }

        guard(&self.pipeline).current = Some(next);
        guard(&self.state).begin_streaming()?;
        self.restarting.store(false, Ordering::SeqCst);
        self.restarts.fetch_add(1, Ordering::SeqCst);
        info!(width = next.width, height = next.height, "encoder restarted");
        Ok(())
    }

    async fn replace_encoder(
        &self,
        next: Resolution,
        surface: Option<SurfaceHandle>,
    ) -> Result<(), MirrorError> {
        let surface =
            surface.ok_or_else(|| MirrorError::Surface("no capture surface to re-point".into()))?;
        let encoder = self.start_encoder(next).await?;
        // Owned by the pipeline from here on so a failed attach still releases it.
        guard(&self.pipeline).encoder = Some(encoder);
        self.capture
            .resize_capture_surface(surface, next, self.settings.density)
            .await?;
        self.capture.attach_surface(surface, encoder).await?;
        debug!(%encoder, %surface, "capture surface re-attached");
        Ok(())
    }

    // ── Stop ─────────────────────────────────────────────────────

    /// Stop the session and release the encoder, surface and grant.
    ///
    /// Waits for a running restart to finish first. Returns `false` if the
    /// session was already stopped.
    pub async fn stop(&self, reason: StopReason) -> bool {
        let _gate = self.restart_gate.lock().await;
        self.stop_locked(reason).await
    }

    async fn stop_locked(&self, reason: StopReason) -> bool {
        if !guard(&self.state).stop() {
            return false;
        }
        guard(&self.stop_reason).get_or_insert(reason);
        *guard(&self.pending) = None;
        self.restarting.store(false, Ordering::SeqCst);

        self.release_pipeline().await;
        self.capture.release_grant().await;
        self.status.idle();
        info!(?reason, "session stopped");
        true
    }

    async fn release_pipeline(&self) {
        let (encoder, surface) = {
            let mut p = guard(&self.pipeline);
            (p.encoder.take(), p.surface.take())
        };
        if let Some(encoder) = encoder {
            self.capture.stop(encoder).await;
            self.capture.release(encoder).await;
        }
        if let Some(surface) = surface {
            self.capture.release_surface(surface).await;
        }
    }
}
