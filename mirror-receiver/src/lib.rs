//! # mirror-receiver
//!
//! Accepts a sender's H.264 stream on the video port and hands it to an
//! output (ffplay, a file or stdout). Owns the resolution the sender
//! should encode at and pushes changes over the control port.

pub mod server;
pub mod sink;

pub use server::{Receiver, ReceiverConfig};
pub use sink::{OutputSink, OutputTarget};
