//! # mirror-sender: screen-mirroring sender
//!
//! Hosts a `mirror-core` session: captures the local screen, encodes it
//! to H.264 and streams it to a receiver, following the receiver's
//! resolution requests.
//!
//! ## Capture backends
//!
//! - **ffmpeg**: screen grab and encode through an `ffmpeg` child process.
//! - **synthetic**: fabricated frames, for dry runs without a display.

pub mod config;
pub mod ffmpeg;
pub mod service;
