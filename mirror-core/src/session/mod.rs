//! The mirroring session: encoder lifecycle and the task wiring around it.

pub mod encoder;
pub mod runner;

pub use encoder::{DrainTarget, EncoderSession, EncoderSettings, RestartOutcome, StopReason};
pub use runner::{MirrorSession, SessionConfig, SessionHandle};
