//! Integration tests: full session lifecycle over scripted in-memory links
//! and over real TCP on localhost.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mirror_core::{
    ChannelStatus, ControlMode, Dialer, EncoderHandle, EncoderSession, Endpoint, MirrorSession,
    Resolution, SessionConfig, SessionHandle, StopReason, StreamStatus, SyntheticCapture,
    TcpDialer,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

const VIDEO: u16 = 15557;
const CONTROL: u16 = 15558;

/// Size of one synthetic encoder output buffer: SPS + PPS + IDR.
const FRAME_LEN: usize = 40;

// ── Helpers ──────────────────────────────────────────────────────

/// Hands out pre-arranged in-memory links per port, in order. A port with
/// nothing left refuses the connection.
#[derive(Default)]
struct ScriptedDialer {
    links: Mutex<HashMap<u16, VecDeque<Option<DuplexStream>>>>,
}

impl ScriptedDialer {
    /// Queue one successful dial to `port`; returns the receiver's end.
    fn link(&self, port: u16) -> DuplexStream {
        let (near, far) = tokio::io::duplex(64 * 1024);
        self.push(port, Some(near));
        far
    }

    /// Queue one refused dial to `port`.
    fn refuse(&self, port: u16) {
        self.push(port, None);
    }

    fn push(&self, port: u16, link: Option<DuplexStream>) {
        self.links
            .lock()
            .unwrap()
            .entry(port)
            .or_default()
            .push_back(link);
    }
}

#[async_trait]
impl Dialer for ScriptedDialer {
    type Stream = DuplexStream;

    async fn dial(&self, endpoint: &Endpoint) -> std::io::Result<DuplexStream> {
        let next = self
            .links
            .lock()
            .unwrap()
            .get_mut(&endpoint.port())
            .and_then(|q| q.pop_front());
        match next {
            Some(Some(stream)) => Ok(stream),
            _ => Err(std::io::ErrorKind::ConnectionRefused.into()),
        }
    }
}

struct Harness {
    capture: Arc<SyntheticCapture>,
    encoder: Arc<EncoderSession<SyntheticCapture>>,
    handle: SessionHandle<SyntheticCapture>,
    status: UnboundedReceiver<StreamStatus>,
    task: JoinHandle<StopReason>,
}

fn config(mode: ControlMode) -> SessionConfig {
    SessionConfig {
        video: Endpoint::loopback(VIDEO),
        control: Endpoint::loopback(CONTROL),
        control_mode: mode,
        connect_retry: Duration::from_millis(20),
        ..SessionConfig::default()
    }
}

fn spawn_session<D: Dialer>(config: SessionConfig, dialer: D, capture: Arc<SyntheticCapture>) -> Harness {
    let (sink, status) = ChannelStatus::new();
    let session = MirrorSession::new(config, capture.clone(), dialer, sink);
    let encoder = session.encoder().clone();
    let handle = session.handle();
    let task = tokio::spawn(session.run());
    Harness {
        capture,
        encoder,
        handle,
        status,
        task,
    }
}

/// Read everything the sender writes into a shared buffer.
fn drain(mut far: DuplexStream) -> Arc<Mutex<Vec<u8>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        while let Ok(n) = far.read(&mut buf).await {
            if n == 0 {
                break;
            }
            sink.lock().unwrap().extend_from_slice(&buf[..n]);
        }
    });
    seen
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timeout waiting for {what}"));
}

fn res(w: u32, h: u32) -> Resolution {
    Resolution::new(w, h).unwrap()
}

fn line(w: u32, h: u32) -> Vec<u8> {
    format!("{{\"width\":{w},\"height\":{h}}}\n").into_bytes()
}

/// (width, height, encoder id) for every complete synthetic frame.
fn frames(stream: &[u8]) -> Vec<(u32, u32, u64)> {
    stream
        .chunks_exact(FRAME_LEN)
        .map(|f| {
            assert_eq!(&f[0..5], &[0, 0, 0, 1, 0x67]);
            assert_eq!(&f[19..24], &[0, 0, 0, 1, 0x65]);
            let w = u32::from_be_bytes(f[5..9].try_into().unwrap());
            let h = u32::from_be_bytes(f[9..13].try_into().unwrap());
            let enc = u64::from_be_bytes(f[24..32].try_into().unwrap());
            (w, h, enc)
        })
        .collect()
}

async fn finish(mut h: Harness) -> (StopReason, Harness) {
    h.handle.stop();
    let reason = tokio::time::timeout(Duration::from_secs(30), &mut h.task)
        .await
        .expect("timeout")
        .unwrap();
    (reason, h)
}

fn assert_all_released(capture: &SyntheticCapture) {
    assert_eq!(capture.buffers_outstanding(), 0);
    assert_eq!(capture.buffers_released(), capture.buffers_dequeued());
    assert_eq!(capture.unknown_releases(), 0);
    assert!(capture.live_encoders().is_empty());
    assert!(capture.grant_released());
}

// ── Renegotiation ────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_renegotiation_scenario() {
    let dialer = ScriptedDialer::default();
    let video = drain(dialer.link(VIDEO));
    let mut control = dialer.link(CONTROL);
    control.write_all(&line(1280, 720)).await.unwrap();

    let mut h = spawn_session(config(ControlMode::Handshake), dialer, Arc::new(SyntheticCapture::new()));
    wait_for("streaming", || h.handle.state().is_streaming()).await;
    assert_eq!(h.handle.current_resolution(), Some(res(1280, 720)));
    assert_eq!(h.status.recv().await, Some(StreamStatus::Streaming));

    control.write_all(&line(1920, 1080)).await.unwrap();
    control.write_all(b"not json\n").await.unwrap();
    control.write_all(&line(1920, 1080)).await.unwrap();
    // Sentinel: once 480p is live every earlier line has been handled.
    control.write_all(&line(854, 480)).await.unwrap();

    wait_for("480p", || {
        h.encoder.current_resolution() == Some(res(854, 480)) && h.handle.state().is_streaming()
    })
    .await;
    // 1080p once, the repeat was a no-op, then the sentinel.
    assert_eq!(h.encoder.restart_count(), 2);
    assert_eq!(h.capture.encoders_configured(), 3);
    assert_eq!(h.capture.surfaces_created(), 1);
    assert_eq!(h.capture.resize_log(), vec![res(1920, 1080), res(854, 480)]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let (reason, mut h) = finish(h).await;
    assert_eq!(reason, StopReason::Requested);
    assert_eq!(h.status.recv().await, Some(StreamStatus::Idle));
    assert_all_released(&h.capture);

    // Every emitted frame came from a fully configured encoder, in order.
    let seen = frames(&video.lock().unwrap());
    assert!(!seen.is_empty());
    let mut last = 0;
    for (width, height, enc) in seen {
        assert!(enc >= last, "frame from replaced encoder {enc} after {last}");
        last = enc;
        let cfg = h.capture.encoder_config(EncoderHandle(enc)).unwrap();
        assert_eq!((width, height), (cfg.resolution.width, cfg.resolution.height));
    }
    assert_eq!(h.capture.encoder_config(EncoderHandle(last)).unwrap().resolution, res(854, 480));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_utf8_lines_keep_control_open() {
    let dialer = ScriptedDialer::default();
    let _video = drain(dialer.link(VIDEO));
    let mut control = dialer.link(CONTROL);
    // Unusable handshake line: falls back to the default resolution.
    control.write_all(b"\xff\xfe\n").await.unwrap();

    let h = spawn_session(config(ControlMode::Handshake), dialer, Arc::new(SyntheticCapture::new()));
    wait_for("streaming", || h.handle.state().is_streaming()).await;
    assert_eq!(h.handle.current_resolution(), Some(Resolution::default()));

    control.write_all(b"\xc3\x28\n").await.unwrap();
    control.write_all(&line(1920, 1080)).await.unwrap();
    wait_for("1080p", || {
        h.encoder.current_resolution() == Some(res(1920, 1080)) && h.handle.state().is_streaming()
    })
    .await;
    assert_eq!(h.encoder.restart_count(), 1);

    let (reason, h) = finish(h).await;
    assert_eq!(reason, StopReason::Requested);
    assert_all_released(&h.capture);
}

#[tokio::test(start_paused = true)]
async fn test_pump_silent_while_restarting() {
    let dialer = ScriptedDialer::default();
    let video = drain(dialer.link(VIDEO));
    let mut control = dialer.link(CONTROL);
    control.write_all(&line(1280, 720)).await.unwrap();

    let h = spawn_session(config(ControlMode::Handshake), dialer, Arc::new(SyntheticCapture::new()));
    wait_for("streaming", || h.handle.state().is_streaming()).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!video.lock().unwrap().is_empty());

    control.write_all(&line(1920, 1080)).await.unwrap();
    wait_for("restart", || h.encoder.is_restarting()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let bytes = video.lock().unwrap().len();
    let dequeued = h.capture.buffers_dequeued();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(h.encoder.is_restarting());
    assert_eq!(video.lock().unwrap().len(), bytes);
    assert_eq!(h.capture.buffers_dequeued(), dequeued);

    wait_for("restarted", || h.encoder.restart_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(video.lock().unwrap().len() > bytes);

    let (_, h) = finish(h).await;
    assert_all_released(&h.capture);
}

#[tokio::test(start_paused = true)]
async fn test_self_announce_then_renegotiate() {
    let dialer = ScriptedDialer::default();
    let _video = drain(dialer.link(VIDEO));
    let control = dialer.link(CONTROL);

    let cfg = SessionConfig {
        default_resolution: res(1920, 1080),
        ..config(ControlMode::SelfAnnounce)
    };
    let h = spawn_session(cfg, dialer, Arc::new(SyntheticCapture::new()));

    let (read, mut write) = tokio::io::split(control);
    let mut lines = BufReader::new(read).lines();
    let announced = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("timeout")
        .unwrap()
        .unwrap();
    assert_eq!(announced, r#"{"width":1920,"height":1080}"#);

    wait_for("streaming", || h.handle.state().is_streaming()).await;
    assert_eq!(h.handle.current_resolution(), Some(res(1920, 1080)));

    write.write_all(&line(854, 480)).await.unwrap();
    wait_for("480p", || h.encoder.current_resolution() == Some(res(854, 480))).await;
    assert_eq!(h.encoder.restart_count(), 1);

    let (_, h) = finish(h).await;
    assert_all_released(&h.capture);
}

#[tokio::test(start_paused = true)]
async fn test_garbage_handshake_uses_default() {
    let dialer = ScriptedDialer::default();
    let _video = drain(dialer.link(VIDEO));
    let mut control = dialer.link(CONTROL);
    control.write_all(b"hello receiver\n").await.unwrap();

    let h = spawn_session(config(ControlMode::Handshake), dialer, Arc::new(SyntheticCapture::new()));
    wait_for("streaming", || h.handle.state().is_streaming()).await;
    assert_eq!(h.handle.current_resolution(), Some(Resolution::default()));

    let (_, h) = finish(h).await;
    assert_all_released(&h.capture);
}

#[tokio::test(start_paused = true)]
async fn test_local_resolution_request() {
    let dialer = ScriptedDialer::default();
    let _video = drain(dialer.link(VIDEO));
    let mut control = dialer.link(CONTROL);
    control.write_all(&line(1280, 720)).await.unwrap();

    let h = spawn_session(config(ControlMode::Handshake), dialer, Arc::new(SyntheticCapture::new()));
    wait_for("streaming", || h.handle.state().is_streaming()).await;

    let outcome = h.handle.request_resolution(res(1920, 1080)).await.unwrap();
    assert_eq!(outcome, mirror_core::RestartOutcome::Restarted);
    assert_eq!(h.handle.current_resolution(), Some(res(1920, 1080)));

    let (_, h) = finish(h).await;
    assert_all_released(&h.capture);
}

// ── Failure domains ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_write_failure() {
    let dialer = ScriptedDialer::default();
    let first = dialer.link(VIDEO);
    let mut control = dialer.link(CONTROL);
    dialer.refuse(VIDEO);
    dialer.refuse(VIDEO);
    let second = drain(dialer.link(VIDEO));
    control.write_all(&line(1280, 720)).await.unwrap();

    let h = spawn_session(config(ControlMode::Handshake), dialer, Arc::new(SyntheticCapture::new()));
    wait_for("streaming", || h.handle.state().is_streaming()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Receiver goes away mid-stream.
    drop(first);
    wait_for("video resumed", || !second.lock().unwrap().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(h.handle.state().is_streaming());
    assert_eq!(h.encoder.restart_count(), 0);
    assert_eq!(h.capture.encoders_configured(), 1);

    let (reason, h) = finish(h).await;
    assert_eq!(reason, StopReason::Requested);
    assert_all_released(&h.capture);
    assert!(!frames(&second.lock().unwrap()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_connect_waits_for_receiver() {
    let dialer = ScriptedDialer::default();
    dialer.refuse(VIDEO);
    dialer.refuse(VIDEO);
    let _video = drain(dialer.link(VIDEO));
    let mut control = dialer.link(CONTROL);
    control.write_all(&line(854, 480)).await.unwrap();

    let h = spawn_session(config(ControlMode::Handshake), dialer, Arc::new(SyntheticCapture::new()));
    wait_for("streaming", || h.handle.state().is_streaming()).await;
    assert_eq!(h.handle.current_resolution(), Some(res(854, 480)));

    let (_, h) = finish(h).await;
    assert_all_released(&h.capture);
}

#[tokio::test(start_paused = true)]
async fn test_control_close_keeps_video_flowing() {
    let dialer = ScriptedDialer::default();
    let video = drain(dialer.link(VIDEO));
    let mut control = dialer.link(CONTROL);
    control.write_all(&line(1280, 720)).await.unwrap();

    let h = spawn_session(config(ControlMode::Handshake), dialer, Arc::new(SyntheticCapture::new()));
    wait_for("streaming", || h.handle.state().is_streaming()).await;

    drop(control);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let before = video.lock().unwrap().len();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(video.lock().unwrap().len() > before);
    assert!(h.handle.state().is_streaming());

    let (reason, h) = finish(h).await;
    assert_eq!(reason, StopReason::Requested);
    assert_all_released(&h.capture);
}

#[tokio::test(start_paused = true)]
async fn test_failed_restart_stops_session() {
    let dialer = ScriptedDialer::default();
    let _video = drain(dialer.link(VIDEO));
    let mut control = dialer.link(CONTROL);
    control.write_all(&line(1280, 720)).await.unwrap();

    let capture = Arc::new(SyntheticCapture::new());
    capture.fail_configure_from(2);
    let mut h = spawn_session(config(ControlMode::Handshake), dialer, capture);
    wait_for("streaming", || h.handle.state().is_streaming()).await;

    control.write_all(&line(1920, 1080)).await.unwrap();
    let reason = tokio::time::timeout(Duration::from_secs(30), &mut h.task)
        .await
        .expect("timeout")
        .unwrap();

    assert_eq!(reason, StopReason::EncoderFailure);
    assert!(h.handle.state().is_stopped());
    assert_eq!(h.status.recv().await, Some(StreamStatus::Streaming));
    assert_eq!(h.status.recv().await, Some(StreamStatus::Idle));
    assert_all_released(&h.capture);
}

#[tokio::test(start_paused = true)]
async fn test_encoder_failure_ends_session() {
    let dialer = ScriptedDialer::default();
    let _video = drain(dialer.link(VIDEO));
    let mut control = dialer.link(CONTROL);
    control.write_all(&line(1280, 720)).await.unwrap();

    let capture = Arc::new(SyntheticCapture::new());
    capture.fail_dequeue_after(5);
    let mut h = spawn_session(config(ControlMode::Handshake), dialer, capture);

    let reason = tokio::time::timeout(Duration::from_secs(30), &mut h.task)
        .await
        .expect("timeout")
        .unwrap();
    assert_eq!(reason, StopReason::EncoderFailure);
    assert_eq!(h.capture.buffers_dequeued(), 5);
    assert_eq!(h.status.recv().await, Some(StreamStatus::Streaming));
    assert_eq!(h.status.recv().await, Some(StreamStatus::Idle));
    assert_all_released(&h.capture);
}

#[tokio::test(start_paused = true)]
async fn test_configuration_failure() {
    let dialer = ScriptedDialer::default();
    let _video = drain(dialer.link(VIDEO));
    let mut control = dialer.link(CONTROL);
    control.write_all(&line(1280, 720)).await.unwrap();

    let capture = Arc::new(SyntheticCapture::new());
    capture.fail_configure_from(1);
    let mut h = spawn_session(config(ControlMode::Handshake), dialer, capture);

    let reason = tokio::time::timeout(Duration::from_secs(30), &mut h.task)
        .await
        .expect("timeout")
        .unwrap();
    assert_eq!(reason, StopReason::ConfigurationFailed);
    assert_eq!(h.status.recv().await, Some(StreamStatus::Idle));
    assert!(h.status.try_recv().is_err());
    assert!(h.capture.grant_released());
}

#[tokio::test(start_paused = true)]
async fn test_grant_revoked_mid_stream() {
    let dialer = ScriptedDialer::default();
    let _video = drain(dialer.link(VIDEO));
    let mut control = dialer.link(CONTROL);
    control.write_all(&line(1280, 720)).await.unwrap();

    let mut h = spawn_session(config(ControlMode::Handshake), dialer, Arc::new(SyntheticCapture::new()));
    wait_for("streaming", || h.handle.state().is_streaming()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    h.handle.grant_revoked();
    let reason = tokio::time::timeout(Duration::from_secs(30), &mut h.task)
        .await
        .expect("timeout")
        .unwrap();
    assert_eq!(reason, StopReason::GrantRevoked);
    assert_all_released(&h.capture);
}

// ── Real TCP ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_tcp_handshake_and_stream() {
    let video_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let cfg = SessionConfig {
        video: Endpoint::loopback(video_listener.local_addr().unwrap().port()),
        control: Endpoint::loopback(control_listener.local_addr().unwrap().port()),
        ..config(ControlMode::Handshake)
    };

    let capture = Arc::new(SyntheticCapture::new());
    let h = spawn_session(cfg, TcpDialer, capture);

    let (mut video, _) = video_listener.accept().await.unwrap();
    let (mut control, _) = control_listener.accept().await.unwrap();
    control.write_all(&line(854, 480)).await.unwrap();

    let mut frame = [0u8; FRAME_LEN];
    tokio::time::timeout(Duration::from_secs(5), video.read_exact(&mut frame))
        .await
        .expect("timeout")
        .unwrap();
    assert_eq!(frames(&frame)[0].0, 854);
    assert_eq!(frames(&frame)[0].1, 480);

    let (reason, h) = finish(h).await;
    assert_eq!(reason, StopReason::Requested);
    assert_all_released(&h.capture);
}
