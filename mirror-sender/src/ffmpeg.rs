//! Capture capability backed by `ffmpeg` child processes.
//!
//! A capture surface owns one long-lived grab child. It reads the screen
//! device, scales it onto a fixed raw canvas and writes `yuv420p` frames to
//! stdout. A relay task hands whole frames to whichever encoder the surface
//! is attached to. Each encoder is its own `ffmpeg` child that reads raw
//! frames on stdin, scales them to the encoder's resolution and writes an
//! H.264 Annex-B elementary stream to stdout. A restart kills and replaces
//! the encoder child only; the grab child keeps running.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use mirror_core::capture::{
    BufferId, CaptureCapability, EncodedBuffer, EncoderConfig, EncoderHandle, SurfaceHandle,
};
use mirror_core::{MirrorError, Resolution, ResolutionTier};

use crate::config::CaptureConfig;

/// Read size for an encoder child's stdout.
const READ_CHUNK: usize = 64 * 1024;
/// Chunks buffered between the stdout reader and the frame pump.
const CHUNK_QUEUE: usize = 64;
/// Raw frames buffered between the relay and an encoder's stdin.
const FRAME_QUEUE: usize = 4;

/// Size of the raw canvas the grab child produces. Encoders scale down
/// from it, so it matches the largest tier.
pub const GRAB_CANVAS: Resolution = ResolutionTier::P1080.resolution();

/// Bytes in one `yuv420p` frame.
fn raw_frame_len(canvas: Resolution) -> usize {
    let pixels = canvas.width as usize * canvas.height as usize;
    pixels * 3 / 2
}

fn base_args() -> Vec<String> {
    vec!["-hide_banner".into(), "-loglevel".into(), "error".into()]
}

// ── Command lines ────────────────────────────────────────────────

/// Builds the `ffmpeg` argument list for a surface's grab child.
#[derive(Debug, Clone)]
pub struct GrabCommandBuilder {
    input_format: String,
    input_source: String,
    framerate: u32,
    canvas: Resolution,
}

impl GrabCommandBuilder {
    pub fn new(input_format: impl Into<String>, input_source: impl Into<String>) -> Self {
        Self {
            input_format: input_format.into(),
            input_source: input_source.into(),
            framerate: 30,
            canvas: GRAB_CANVAS,
        }
    }

    pub fn with_framerate(mut self, framerate: u32) -> Self {
        self.framerate = framerate;
        self
    }

    pub fn build(&self) -> Vec<String> {
        let mut args = base_args();
        // lavfi sources are filter graphs and take no grab frame rate.
        if self.input_format != "lavfi" {
            args.extend(["-framerate".into(), self.framerate.to_string()]);
        }
        args.extend([
            "-f".into(),
            self.input_format.clone(),
            "-i".into(),
            self.input_source.clone(),
            "-vf".into(),
            format!("scale={}:{}", self.canvas.width, self.canvas.height),
            "-r".into(),
            self.framerate.to_string(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-an".into(),
            "-f".into(),
            "rawvideo".into(),
            "pipe:1".into(),
        ]);
        args
    }
}

/// Builds the `ffmpeg` argument list for one encoder child.
#[derive(Debug, Clone)]
pub struct FfmpegCommandBuilder {
    canvas: Resolution,
    framerate: u32,
    video_codec: String,
    bitrate: u32,
    resolution: Resolution,
    gop: u32,
    repeat_headers: bool,
}

impl FfmpegCommandBuilder {
    pub fn new(canvas: Resolution) -> Self {
        Self {
            canvas,
            framerate: 30,
            video_codec: "libx264".into(),
            bitrate: Resolution::default().bitrate(),
            resolution: Resolution::default(),
            gop: 1,
            repeat_headers: true,
        }
    }

    pub fn with_video_codec(mut self, codec: impl Into<String>) -> Self {
        self.video_codec = codec.into();
        self
    }

    /// Output size, bitrate, frame rate and GOP from an encoder config.
    pub fn with_encoder(mut self, config: &EncoderConfig) -> Self {
        self.resolution = config.resolution;
        self.bitrate = config.bitrate;
        self.framerate = config.frame_rate;
        // An interval of 0 seconds means every frame is a sync frame.
        self.gop = (config.i_frame_interval * config.frame_rate).max(1);
        self.repeat_headers = config.prepend_parameter_sets;
        self
    }

    pub fn build(&self) -> Vec<String> {
        let mut args = base_args();
        args.extend([
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-video_size".into(),
            format!("{}x{}", self.canvas.width, self.canvas.height),
            "-framerate".into(),
            self.framerate.to_string(),
            "-i".into(),
            "pipe:0".into(),
            "-vf".into(),
            format!("scale={}:{}", self.resolution.width, self.resolution.height),
            "-c:v".into(),
            self.video_codec.clone(),
            "-b:v".into(),
            self.bitrate.to_string(),
            "-g".into(),
            self.gop.to_string(),
            "-pix_fmt".into(),
            "yuv420p".into(),
        ]);
        if self.video_codec == "libx264" {
            args.extend([
                "-preset".into(),
                "ultrafast".into(),
                "-tune".into(),
                "zerolatency".into(),
            ]);
        }
        if self.repeat_headers {
            args.extend(["-bsf:v".into(), "dump_extra".into()]);
        }
        args.extend(["-an".into(), "-f".into(), "h264".into(), "pipe:1".into()]);
        args
    }
}

// ── Bookkeeping ──────────────────────────────────────────────────

/// Where the relay delivers raw frames: the attached encoder's stdin queue.
type Feed = Arc<Mutex<Option<mpsc::Sender<Bytes>>>>;

struct GrabSource {
    child: Child,
    relay: JoinHandle<()>,
    feed: Feed,
}

impl GrabSource {
    fn kill(&mut self, surface: SurfaceHandle) {
        self.relay.abort();
        if let Err(e) = self.child.start_kill() {
            debug!(%surface, "grab already gone: {e}");
        }
    }
}

struct EncoderChild {
    child: Child,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    chunks: Arc<AsyncMutex<mpsc::Receiver<Bytes>>>,
}

struct EncoderSlot {
    config: EncoderConfig,
    started: bool,
    running: Option<EncoderChild>,
    started_at: Instant,
}

struct SurfaceSlot {
    resolution: Resolution,
    target: EncoderHandle,
    grab: GrabSource,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    encoders: HashMap<EncoderHandle, EncoderSlot>,
    surfaces: HashMap<SurfaceHandle, SurfaceSlot>,
    outstanding: HashSet<(EncoderHandle, BufferId)>,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

// ── FfmpegCapture ────────────────────────────────────────────────

pub struct FfmpegCapture {
    settings: CaptureConfig,
    frame_rate: u32,
    inner: Mutex<Inner>,
}

impl FfmpegCapture {
    pub fn new(settings: CaptureConfig, frame_rate: u32) -> Self {
        Self {
            settings,
            frame_rate,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn grab_command(&self) -> GrabCommandBuilder {
        GrabCommandBuilder::new(&self.settings.input_format, &self.settings.input)
            .with_framerate(self.frame_rate)
    }

    pub fn command_for(&self, config: &EncoderConfig) -> FfmpegCommandBuilder {
        FfmpegCommandBuilder::new(GRAB_CANVAS)
            .with_video_codec(&self.settings.video_codec)
            .with_encoder(config)
    }

    fn spawn_grab(&self) -> Result<GrabSource, MirrorError> {
        let args = self.grab_command().build();
        debug!(program = %self.settings.ffmpeg_path, ?args, "spawning grab");

        let mut child = Command::new(&self.settings.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MirrorError::Surface(format!("failed to spawn ffmpeg grab: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MirrorError::Surface("ffmpeg grab stdout not captured".into()))?;

        let feed: Feed = Arc::new(Mutex::new(None));
        let relay = tokio::spawn(relay_frames(stdout, feed.clone(), raw_frame_len(GRAB_CANVAS)));
        Ok(GrabSource { child, relay, feed })
    }

    fn spawn_encoder(
        &self,
        config: &EncoderConfig,
    ) -> Result<(EncoderChild, mpsc::Sender<Bytes>), MirrorError> {
        let args = self.command_for(config).build();
        debug!(program = %self.settings.ffmpeg_path, ?args, "spawning encoder");

        let mut child = Command::new(&self.settings.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MirrorError::Configure(format!("failed to spawn ffmpeg: {e}")))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| MirrorError::Configure("ffmpeg stdin not captured".into()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| MirrorError::Configure("ffmpeg stdout not captured".into()))?;

        let (frame_tx, mut frame_rx) = mpsc::channel::<Bytes>(FRAME_QUEUE);
        let writer = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if let Err(e) = stdin.write_all(&frame).await {
                    debug!("encoder stdin closed: {e}");
                    break;
                }
            }
        });

        let (tx, rx) = mpsc::channel(CHUNK_QUEUE);
        let reader = tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(READ_CHUNK);
            loop {
                buf.reserve(READ_CHUNK);
                match stdout.read_buf(&mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.send(buf.split().freeze()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("ffmpeg stdout read failed: {e}");
                        break;
                    }
                }
            }
        });

        let running = EncoderChild {
            child,
            reader,
            writer,
            chunks: Arc::new(AsyncMutex::new(rx)),
        };
        Ok((running, frame_tx))
    }

    /// Spawn the child for `encoder` if it is started and fed by a surface,
    /// and point that surface's frames at it.
    fn ensure_running(&self, encoder: EncoderHandle) -> Result<(), MirrorError> {
        let mut inner = self.lock();
        let Some(source) = inner.surfaces.values().find(|s| s.target == encoder) else {
            return Ok(());
        };
        if source.grab.relay.is_finished() {
            return Err(MirrorError::Surface("capture source exited".into()));
        }
        let feed = source.grab.feed.clone();
        let slot = inner
            .encoders
            .get_mut(&encoder)
            .ok_or_else(|| MirrorError::Configure(format!("unknown {encoder}")))?;
        if !slot.started || slot.running.is_some() {
            return Ok(());
        }
        let (running, frames) = self.spawn_encoder(&slot.config)?;
        *feed.lock().unwrap_or_else(|p| p.into_inner()) = Some(frames);
        slot.running = Some(running);
        slot.started_at = Instant::now();
        info!(%encoder, resolution = %slot.config.resolution, bitrate = slot.config.bitrate, "ffmpeg encoder running");
        Ok(())
    }

    fn kill(encoder: EncoderHandle, slot: &mut EncoderSlot) {
        if let Some(mut running) = slot.running.take() {
            running.reader.abort();
            running.writer.abort();
            if let Err(e) = running.child.start_kill() {
                debug!(%encoder, "ffmpeg already gone: {e}");
            }
        }
    }

    #[cfg(test)]
    fn grab_pid(&self, surface: SurfaceHandle) -> Option<u32> {
        self.lock().surfaces.get(&surface)?.grab.child.id()
    }

    #[cfg(test)]
    fn encoder_pid(&self, encoder: EncoderHandle) -> Option<u32> {
        self.lock().encoders.get(&encoder)?.running.as_ref()?.child.id()
    }
}

/// Copy whole raw frames from the grab child to the attached encoder.
///
/// Frames with no encoder to take them, or that find its queue full, are
/// dropped. When the grab child exits the feed is cleared so the attached
/// encoder sees end of input.
async fn relay_frames(mut stdout: ChildStdout, feed: Feed, frame_len: usize) {
    loop {
        let mut frame = BytesMut::zeroed(frame_len);
        if let Err(e) = stdout.read_exact(&mut frame).await {
            warn!("capture source ended: {e}");
            break;
        }
        let target = feed.lock().unwrap_or_else(|p| p.into_inner()).clone();
        if let Some(target) = target {
            if target.try_send(frame.freeze()).is_err() {
                debug!("encoder not keeping up; raw frame dropped");
            }
        }
    }
    feed.lock().unwrap_or_else(|p| p.into_inner()).take();
}

/// Whether `data` contains an IDR slice start.
fn contains_idr(data: &[u8]) -> bool {
    data.windows(4)
        .any(|w| w[0] == 0 && w[1] == 0 && w[2] == 1 && w[3] & 0x1f == 5)
}

#[async_trait]
impl CaptureCapability for FfmpegCapture {
    async fn configure(&self, config: &EncoderConfig) -> Result<EncoderHandle, MirrorError> {
        let mut inner = self.lock();
        let handle = EncoderHandle(inner.next_id());
        inner.encoders.insert(
            handle,
            EncoderSlot {
                config: *config,
                started: false,
                running: None,
                started_at: Instant::now(),
            },
        );
        Ok(handle)
    }

    async fn start(&self, encoder: EncoderHandle) -> Result<(), MirrorError> {
        self.lock()
            .encoders
            .get_mut(&encoder)
            .ok_or_else(|| MirrorError::Configure(format!("unknown {encoder}")))?
            .started = true;
        self.ensure_running(encoder)
    }

    async fn stop(&self, encoder: EncoderHandle) {
        if let Some(slot) = self.lock().encoders.get_mut(&encoder) {
            slot.started = false;
            Self::kill(encoder, slot);
        }
    }

    async fn release(&self, encoder: EncoderHandle) {
        let mut inner = self.lock();
        if let Some(mut slot) = inner.encoders.remove(&encoder) {
            Self::kill(encoder, &mut slot);
        }
        inner.outstanding.retain(|(e, _)| *e != encoder);
    }

    async fn create_capture_surface(
        &self,
        resolution: Resolution,
        density: u32,
        encoder: EncoderHandle,
    ) -> Result<SurfaceHandle, MirrorError> {
        if !self.lock().encoders.contains_key(&encoder) {
            return Err(MirrorError::Surface(format!("unknown {encoder}")));
        }
        let grab = self.spawn_grab()?;
        let handle = {
            let mut inner = self.lock();
            let handle = SurfaceHandle(inner.next_id());
            inner.surfaces.insert(
                handle,
                SurfaceSlot {
                    resolution,
                    target: encoder,
                    grab,
                },
            );
            handle
        };
        info!(%handle, %resolution, density, format = %self.settings.input_format, "capture source running");
        if let Err(e) = self.ensure_running(encoder) {
            if let Some(mut slot) = self.lock().surfaces.remove(&handle) {
                slot.grab.kill(handle);
            }
            return Err(MirrorError::Surface(e.to_string()));
        }
        Ok(handle)
    }

    async fn resize_capture_surface(
        &self,
        surface: SurfaceHandle,
        resolution: Resolution,
        _density: u32,
    ) -> Result<(), MirrorError> {
        // The grab canvas is fixed; the attached encoder does the scaling.
        let mut inner = self.lock();
        let slot = inner
            .surfaces
            .get_mut(&surface)
            .ok_or_else(|| MirrorError::Surface(format!("unknown {surface}")))?;
        slot.resolution = resolution;
        Ok(())
    }

    async fn attach_surface(
        &self,
        surface: SurfaceHandle,
        encoder: EncoderHandle,
    ) -> Result<(), MirrorError> {
        {
            let mut inner = self.lock();
            if !inner.encoders.contains_key(&encoder) {
                return Err(MirrorError::Surface(format!("unknown {encoder}")));
            }
            let slot = inner
                .surfaces
                .get_mut(&surface)
                .ok_or_else(|| MirrorError::Surface(format!("unknown {surface}")))?;
            slot.target = encoder;
            debug!(%surface, %encoder, resolution = %slot.resolution, "capture surface attached");
        }
        self.ensure_running(encoder)
            .map_err(|e| MirrorError::Surface(e.to_string()))
    }

    async fn release_surface(&self, surface: SurfaceHandle) {
        if let Some(mut slot) = self.lock().surfaces.remove(&surface) {
            slot.grab.kill(surface);
        }
    }

    async fn dequeue_encoded_buffer(
        &self,
        encoder: EncoderHandle,
        timeout: Duration,
    ) -> Result<Option<EncodedBuffer>, MirrorError> {
        let (chunks, started_at) = {
            let inner = self.lock();
            let slot = inner
                .encoders
                .get(&encoder)
                .ok_or_else(|| MirrorError::Encoder(format!("unknown {encoder}")))?;
            (slot.running.as_ref().map(|r| r.chunks.clone()), slot.started_at)
        };
        let Some(chunks) = chunks else {
            // Not fed by a surface yet, or torn down by a restart.
            tokio::time::sleep(timeout).await;
            return Ok(None);
        };

        let mut rx = chunks.lock().await;
        let data = match tokio::time::timeout(timeout, rx.recv()).await {
            Err(_) => return Ok(None),
            Ok(Some(data)) => data,
            Ok(None) => {
                return Err(MirrorError::Encoder(format!("ffmpeg for {encoder} exited")));
            }
        };

        let mut inner = self.lock();
        let id = BufferId(inner.next_id());
        inner.outstanding.insert((encoder, id));
        Ok(Some(EncodedBuffer {
            id,
            key_frame: contains_idr(&data),
            pts_us: started_at.elapsed().as_micros() as u64,
            data,
        }))
    }

    async fn release_buffer(&self, encoder: EncoderHandle, buffer: BufferId) {
        self.lock().outstanding.remove(&(encoder, buffer));
    }

    async fn release_grant(&self) {
        let mut inner = self.lock();
        for (handle, slot) in inner.encoders.iter_mut() {
            Self::kill(*handle, slot);
        }
        for (handle, slot) in inner.surfaces.iter_mut() {
            slot.grab.kill(*handle);
        }
        inner.encoders.clear();
        inner.surfaces.clear();
        inner.outstanding.clear();
        info!("capture released");
    }
}
