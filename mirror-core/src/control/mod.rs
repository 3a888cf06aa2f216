//! Resolution control protocol.
//!
//! # Wire Protocol
//!
//! One UTF-8 JSON object per line, newline-terminated:
//!
//! ```text
//! {"width":1280,"height":720}
//! ```
//!
//! ## Handshake mode
//! ```text
//! Sender ──connect(control port)──────────────► Receiver
//! Sender ◄──{"width":W,"height":H}──────────── Receiver   (initial, read before streaming)
//! Sender ◄──{"width":W,"height":H}──────────── Receiver   (renegotiation, repeated)
//! ```
//!
//! ## Self-announce mode
//! ```text
//! Sender ──connect(control port)──────────────► Receiver
//! Sender ──{"width":W,"height":H}─────────────► Receiver   (sender's starting resolution)
//! Sender ◄──{"width":W,"height":H}──────────── Receiver   (renegotiation, repeated)
//! ```

pub mod channel;
pub mod reader;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MirrorError;
use crate::resolution::Resolution;

pub use channel::ControlChannel;
pub use reader::{ControlExit, ControlReader};

// ── ControlMessage ───────────────────────────────────────────────

/// The only message shape on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub width: u32,
    pub height: u32,
}

impl ControlMessage {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Validate into a [`Resolution`].
    pub fn resolution(&self) -> Result<Resolution, MirrorError> {
        Resolution::new(self.width, self.height)
    }
}

impl From<Resolution> for ControlMessage {
    fn from(r: Resolution) -> Self {
        Self::new(r.width, r.height)
    }
}

// ── ControlMode ──────────────────────────────────────────────────

/// How the initial resolution is established on the control link.
///
/// The receiver's deployment decides which one applies: a tunnelled
/// receiver pushes the resolution first, a direct one expects the sender
/// to announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    /// Block on the receiver's first line before configuring anything.
    #[default]
    Handshake,
    /// Write our default resolution first, then listen.
    SelfAnnounce,
}

impl ControlMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::SelfAnnounce => "self_announce",
        }
    }
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlMode {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "handshake" => Ok(Self::Handshake),
            "self_announce" | "announce" => Ok(Self::SelfAnnounce),
            other => Err(MirrorError::Other(format!("unknown control mode: {other}"))),
        }
    }
}
