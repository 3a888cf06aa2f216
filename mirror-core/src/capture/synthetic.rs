//! In-memory capture capability.
//!
//! Emits Annex-B shaped buffers at the encoder's frame rate without any
//! real capture hardware. Every call is recorded so the lifecycle can be
//! inspected afterwards, and failures can be injected to exercise the
//! session's fatal paths. Used for dry runs of the sender and in tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::time::Instant;
use tracing::debug;

use crate::capture::{
    BufferId, CaptureCapability, EncodedBuffer, EncoderConfig, EncoderHandle, SurfaceHandle,
};
use crate::error::MirrorError;
use crate::resolution::Resolution;

/// Annex-B start code.
const START_CODE: [u8; 4] = [0, 0, 0, 1];
const NAL_SPS: u8 = 0x67;
const NAL_PPS: u8 = 0x68;
const NAL_IDR: u8 = 0x65;

// ── Internal bookkeeping ─────────────────────────────────────────

#[derive(Debug)]
struct EncoderSlot {
    config: EncoderConfig,
    started: bool,
    stopped: bool,
    released: bool,
    next_frame_at: Option<Instant>,
    frames: u64,
}

#[derive(Debug)]
struct SurfaceSlot {
    resolution: Resolution,
    density: u32,
    target: EncoderHandle,
    released: bool,
}

#[derive(Debug, Default)]
struct Faults {
    /// Fail every `configure` call from this (1-based) call onward.
    fail_configure_from: Option<u64>,
    /// Fail `dequeue` once this many buffers have been handed out.
    fail_dequeue_after: Option<u64>,
    /// Produce no output while set.
    hold_output: bool,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    configure_calls: u64,
    encoders: HashMap<EncoderHandle, EncoderSlot>,
    surfaces: HashMap<SurfaceHandle, SurfaceSlot>,
    outstanding: HashSet<(EncoderHandle, BufferId)>,
    attach_log: Vec<(SurfaceHandle, EncoderHandle)>,
    resize_log: Vec<Resolution>,
    surfaces_created: u64,
    dequeued: u64,
    released_buffers: u64,
    unknown_releases: u64,
    grant_released: bool,
    faults: Faults,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

// ── SyntheticCapture ─────────────────────────────────────────────

/// A capture capability that fabricates encoder output.
#[derive(Debug, Default)]
pub struct SyntheticCapture {
    inner: Mutex<Inner>,
}

impl SyntheticCapture {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock only happens in a failing test.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ── Fault injection ──────────────────────────────────────────

    /// Fail the `nth` (1-based) and every later `configure` call.
    pub fn fail_configure_from(&self, nth: u64) {
        self.lock().faults.fail_configure_from = Some(nth);
    }

    /// Report an encoder failure once `count` buffers have been dequeued.
    pub fn fail_dequeue_after(&self, count: u64) {
        self.lock().faults.fail_dequeue_after = Some(count);
    }

    /// Stop or resume producing output.
    pub fn hold_output(&self, hold: bool) {
        self.lock().faults.hold_output = hold;
    }

    // ── Inspection ───────────────────────────────────────────────

    pub fn encoders_configured(&self) -> u64 {
        self.lock().configure_calls
    }

    /// Encoders that are started and not yet stopped.
    pub fn live_encoders(&self) -> Vec<EncoderHandle> {
        let inner = self.lock();
        let mut live: Vec<_> = inner
            .encoders
            .iter()
            .filter(|(_, e)| e.started && !e.stopped)
            .map(|(h, _)| *h)
            .collect();
        live.sort();
        live
    }

    pub fn encoder_config(&self, encoder: EncoderHandle) -> Option<EncoderConfig> {
        self.lock().encoders.get(&encoder).map(|e| e.config)
    }

    pub fn is_encoder_released(&self, encoder: EncoderHandle) -> bool {
        self.lock()
            .encoders
            .get(&encoder)
            .is_some_and(|e| e.released)
    }

    pub fn surfaces_created(&self) -> u64 {
        self.lock().surfaces_created
    }

    pub fn surface_resolution(&self, surface: SurfaceHandle) -> Option<(Resolution, u32)> {
        self.lock()
            .surfaces
            .get(&surface)
            .map(|s| (s.resolution, s.density))
    }

    pub fn surface_target(&self, surface: SurfaceHandle) -> Option<EncoderHandle> {
        self.lock().surfaces.get(&surface).map(|s| s.target)
    }

    pub fn is_surface_released(&self, surface: SurfaceHandle) -> bool {
        self.lock()
            .surfaces
            .get(&surface)
            .is_some_and(|s| s.released)
    }

    pub fn attach_log(&self) -> Vec<(SurfaceHandle, EncoderHandle)> {
        self.lock().attach_log.clone()
    }

    pub fn resize_log(&self) -> Vec<Resolution> {
        self.lock().resize_log.clone()
    }

    pub fn buffers_dequeued(&self) -> u64 {
        self.lock().dequeued
    }

    pub fn buffers_released(&self) -> u64 {
        self.lock().released_buffers
    }

    /// Buffers handed out and not yet released.
    pub fn buffers_outstanding(&self) -> usize {
        self.lock().outstanding.len()
    }

    /// Releases of buffers that were never handed out or released twice.
    pub fn unknown_releases(&self) -> u64 {
        self.lock().unknown_releases
    }

    pub fn grant_released(&self) -> bool {
        self.lock().grant_released
    }

    fn frame_interval(config: &EncoderConfig) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(config.frame_rate.max(1)))
    }

    fn fabricate(encoder: EncoderHandle, slot: &EncoderSlot) -> Bytes {
        let res = slot.config.resolution;
        let mut buf = BytesMut::with_capacity(48);
        if slot.config.prepend_parameter_sets {
            buf.put_slice(&START_CODE);
            buf.put_u8(NAL_SPS);
            buf.put_u32(res.width);
            buf.put_u32(res.height);
            buf.put_slice(&START_CODE);
            buf.put_u8(NAL_PPS);
            buf.put_u8(0xCE);
        }
        buf.put_slice(&START_CODE);
        buf.put_u8(NAL_IDR);
        buf.put_u64(encoder.0);
        buf.put_u64(slot.frames);
        buf.freeze()
    }
}

#[async_trait]
impl CaptureCapability for SyntheticCapture {
    async fn configure(&self, config: &EncoderConfig) -> Result<EncoderHandle, MirrorError> {
        let mut inner = self.lock();
        inner.configure_calls += 1;
        if let Some(nth) = inner.faults.fail_configure_from {
            if inner.configure_calls >= nth {
                return Err(MirrorError::Configure(format!(
                    "synthetic encoder refused {}",
                    config.resolution
                )));
            }
        }
        let handle = EncoderHandle(inner.next_id());
        inner.encoders.insert(
            handle,
            EncoderSlot {
                config: *config,
                started: false,
                stopped: false,
                released: false,
                next_frame_at: None,
                frames: 0,
            },
        );
        debug!(%handle, resolution = %config.resolution, bitrate = config.bitrate, "synthetic encoder configured");
        Ok(handle)
    }

    async fn start(&self, encoder: EncoderHandle) -> Result<(), MirrorError> {
        let mut inner = self.lock();
        let slot = inner
            .encoders
            .get_mut(&encoder)
            .ok_or_else(|| MirrorError::Configure(format!("unknown {encoder}")))?;
        if slot.released {
            return Err(MirrorError::Configure(format!("{encoder} already released")));
        }
        slot.started = true;
        slot.next_frame_at = Some(Instant::now());
        Ok(())
    }

    async fn stop(&self, encoder: EncoderHandle) {
        if let Some(slot) = self.lock().encoders.get_mut(&encoder) {
            slot.stopped = true;
        }
    }

    async fn release(&self, encoder: EncoderHandle) {
        if let Some(slot) = self.lock().encoders.get_mut(&encoder) {
            slot.stopped = true;
            slot.released = true;
        }
    }

    async fn create_capture_surface(
        &self,
        resolution: Resolution,
        density: u32,
        encoder: EncoderHandle,
    ) -> Result<SurfaceHandle, MirrorError> {
        let mut inner = self.lock();
        if !inner.encoders.contains_key(&encoder) {
            return Err(MirrorError::Surface(format!("unknown {encoder}")));
        }
        let handle = SurfaceHandle(inner.next_id());
        inner.surfaces.insert(
            handle,
            SurfaceSlot {
                resolution,
                density,
                target: encoder,
                released: false,
            },
        );
        inner.surfaces_created += 1;
        inner.attach_log.push((handle, encoder));
        Ok(handle)
    }

    async fn resize_capture_surface(
        &self,
        surface: SurfaceHandle,
        resolution: Resolution,
        density: u32,
    ) -> Result<(), MirrorError> {
        let mut inner = self.lock();
        let slot = inner
            .surfaces
            .get_mut(&surface)
            .ok_or_else(|| MirrorError::Surface(format!("unknown {surface}")))?;
        slot.resolution = resolution;
        slot.density = density;
        inner.resize_log.push(resolution);
        Ok(())
    }

    async fn attach_surface(
        &self,
        surface: SurfaceHandle,
        encoder: EncoderHandle,
    ) -> Result<(), MirrorError> {
        let mut inner = self.lock();
        if !inner.encoders.contains_key(&encoder) {
            return Err(MirrorError::Surface(format!("unknown {encoder}")));
        }
        let slot = inner
            .surfaces
            .get_mut(&surface)
            .ok_or_else(|| MirrorError::Surface(format!("unknown {surface}")))?;
        slot.target = encoder;
        inner.attach_log.push((surface, encoder));
        Ok(())
    }

    async fn release_surface(&self, surface: SurfaceHandle) {
        if let Some(slot) = self.lock().surfaces.get_mut(&surface) {
            slot.released = true;
        }
    }

    async fn dequeue_encoded_buffer(
        &self,
        encoder: EncoderHandle,
        timeout: Duration,
    ) -> Result<Option<EncodedBuffer>, MirrorError> {
        let deadline = Instant::now() + timeout;
        loop {
            let wake = {
                let mut inner = self.lock();
                if let Some(limit) = inner.faults.fail_dequeue_after {
                    if inner.dequeued >= limit {
                        return Err(MirrorError::Encoder(format!("{encoder} stopped producing")));
                    }
                }
                let hold = inner.faults.hold_output;
                let fed = inner
                    .surfaces
                    .values()
                    .any(|s| !s.released && s.target == encoder);
                let now = Instant::now();

                let slot = inner
                    .encoders
                    .get_mut(&encoder)
                    .ok_or_else(|| MirrorError::Encoder(format!("unknown {encoder}")))?;

                let producing = slot.started && !slot.stopped && fed && !hold;
                match slot.next_frame_at {
                    Some(at) if producing => {
                        if now >= at {
                            let data = Self::fabricate(encoder, slot);
                            let pts_us = slot.frames * Self::frame_interval(&slot.config).as_micros() as u64;
                            slot.frames += 1;
                            slot.next_frame_at = Some(now + Self::frame_interval(&slot.config));
                            let id = BufferId(inner.next_id());
                            inner.outstanding.insert((encoder, id));
                            inner.dequeued += 1;
                            return Ok(Some(EncodedBuffer {
                                id,
                                data,
                                key_frame: true,
                                pts_us,
                            }));
                        }
                        at.min(deadline)
                    }
                    _ => deadline,
                }
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep_until(wake).await;
        }
    }

    async fn release_buffer(&self, encoder: EncoderHandle, buffer: BufferId) {
        let mut inner = self.lock();
        if inner.outstanding.remove(&(encoder, buffer)) {
            inner.released_buffers += 1;
        } else {
            inner.unknown_releases += 1;
        }
    }

    async fn release_grant(&self) {
        self.lock().grant_released = true;
    }
}
