//! Boundary to the platform screen-capture and hardware encoder service.
//!
//! A [`CaptureCapability`] is handed to the session together with the
//! capture grant. The session drives it through opaque handles:
//!
//! 1. `configure` + `start` an encoder for a resolution.
//! 2. `create_capture_surface` once, feeding that encoder's input.
//! 3. Drain with `dequeue_encoded_buffer` / `release_buffer`.
//! 4. On a resolution change: `stop` + `release` the old encoder,
//!    `configure` + `start` a new one, `resize_capture_surface`, and
//!    `attach_surface` to the new encoder. The surface is never recreated.
//! 5. On stop: release encoder, surface and the grant.

pub mod synthetic;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::MirrorError;
use crate::resolution::{DEFAULT_FRAME_RATE, I_FRAME_INTERVAL_SECS, Resolution};

pub use synthetic::SyntheticCapture;

// ── Handles ──────────────────────────────────────────────────────

/// Opaque identity of one configured encoder instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EncoderHandle(pub u64);

/// Opaque identity of the capture surface (virtual display).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceHandle(pub u64);

/// Index of an encoder output buffer that must be handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl fmt::Display for EncoderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "encoder#{}", self.0)
    }
}

impl fmt::Display for SurfaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface#{}", self.0)
    }
}

// ── EncoderConfig ────────────────────────────────────────────────

/// Parameters for one H.264 encoder instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderConfig {
    pub resolution: Resolution,
    /// Bits per second, derived from the resolution width.
    pub bitrate: u32,
    pub frame_rate: u32,
    /// Seconds between sync frames; 0 makes every frame a sync frame.
    pub i_frame_interval: u32,
    /// Repeat SPS/PPS in front of every sync frame so a receiver can join
    /// mid-stream.
    pub prepend_parameter_sets: bool,
}

impl EncoderConfig {
    pub fn for_resolution(resolution: Resolution) -> Self {
        Self::with_frame_rate(resolution, DEFAULT_FRAME_RATE)
    }

    pub fn with_frame_rate(resolution: Resolution, frame_rate: u32) -> Self {
        Self {
            resolution,
            bitrate: resolution.bitrate(),
            frame_rate: frame_rate.max(1),
            i_frame_interval: I_FRAME_INTERVAL_SECS,
            prepend_parameter_sets: true,
        }
    }
}

// ── EncodedBuffer ────────────────────────────────────────────────

/// Encoded output copied out of the encoder.
///
/// The underlying encoder slot stays owned by the encoder until
/// [`CaptureCapability::release_buffer`] is called with `id`.
#[derive(Debug, Clone)]
pub struct EncodedBuffer {
    pub id: BufferId,
    /// Annex-B elementary stream bytes.
    pub data: Bytes,
    pub key_frame: bool,
    /// Presentation timestamp in microseconds.
    pub pts_us: u64,
}

impl EncodedBuffer {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// ── CaptureCapability ────────────────────────────────────────────

/// Screen capture plus video encoder, provided by the platform.
///
/// `stop`, `release`, `release_surface`, `release_buffer` and
/// `release_grant` are best-effort and must not fail; releasing a
/// buffer against an encoder that was stopped in the meantime must be
/// tolerated.
#[async_trait]
pub trait CaptureCapability: Send + Sync + 'static {
    /// Create an encoder for `config`. Not started yet.
    async fn configure(&self, config: &EncoderConfig) -> Result<EncoderHandle, MirrorError>;

    async fn start(&self, encoder: EncoderHandle) -> Result<(), MirrorError>;

    async fn stop(&self, encoder: EncoderHandle);

    async fn release(&self, encoder: EncoderHandle);

    /// Create the capture surface and feed it into `encoder`'s input.
    async fn create_capture_surface(
        &self,
        resolution: Resolution,
        density: u32,
        encoder: EncoderHandle,
    ) -> Result<SurfaceHandle, MirrorError>;

    /// Resize the existing capture surface in place.
    async fn resize_capture_surface(
        &self,
        surface: SurfaceHandle,
        resolution: Resolution,
        density: u32,
    ) -> Result<(), MirrorError>;

    /// Point the capture surface at `encoder`'s input.
    async fn attach_surface(
        &self,
        surface: SurfaceHandle,
        encoder: EncoderHandle,
    ) -> Result<(), MirrorError>;

    async fn release_surface(&self, surface: SurfaceHandle);

    /// Wait up to `timeout` for the next encoded buffer.
    ///
    /// `Ok(None)` means nothing was ready; an `Err` means the encoder is
    /// broken.
    async fn dequeue_encoded_buffer(
        &self,
        encoder: EncoderHandle,
        timeout: Duration,
    ) -> Result<Option<EncodedBuffer>, MirrorError>;

    async fn release_buffer(&self, encoder: EncoderHandle, buffer: BufferId);

    /// Give up the capture grant. Called once when the session stops.
    async fn release_grant(&self);
}
