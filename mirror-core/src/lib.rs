//! # mirror-core
//!
//! Adaptive screen-mirroring session: capture the screen, encode it to
//! H.264, push the raw elementary stream to a receiver over TCP, and
//! follow the receiver's resolution requests without tearing down capture.
//!
//! This crate contains:
//! - **Network**: `TransportConnector`, a cancellable blocking-retry connector over a `Dialer`
//! - **Codec / Control**: newline-delimited JSON resolution messages and the control reader task
//! - **Capture**: `CaptureCapability`, the boundary to the platform capture + encoder service
//! - **Session**: `EncoderSession` state machine with coalesced restarts, and `MirrorSession` wiring
//! - **Pump**: `FramePump`, the buffer drain loop with reconnect-on-write-failure
//! - **Status**: best-effort "streaming" / "idle" notifications
//! - **Error**: `MirrorError`, a typed `thiserror`-based error hierarchy

pub mod capture;
pub mod codec;
pub mod control;
pub mod error;
pub mod network;
pub mod pump;
pub mod resolution;
pub mod session;
pub mod state;
pub mod status;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use capture::{
    BufferId, CaptureCapability, EncodedBuffer, EncoderConfig, EncoderHandle, SurfaceHandle,
    SyntheticCapture,
};
pub use codec::{ControlCodec, ControlLine};
pub use control::{ControlChannel, ControlExit, ControlMessage, ControlMode, ControlReader};
pub use error::MirrorError;
pub use network::{CONTROL_PORT, Dialer, Endpoint, TcpDialer, TransportConnector, VIDEO_PORT};
pub use pump::{FramePump, PumpExit, PumpSettings, PumpStats};
pub use resolution::{Resolution, ResolutionTier};
pub use session::{
    DrainTarget, EncoderSession, EncoderSettings, MirrorSession, RestartOutcome, SessionConfig,
    SessionHandle, StopReason,
};
pub use state::SessionState;
pub use status::{ChannelStatus, LogStatus, NoopStatus, StatusReporter, StatusSink, StreamStatus};
