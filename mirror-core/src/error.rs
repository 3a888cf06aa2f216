//! Domain-specific error types for the mirroring session.
//!
//! All fallible operations return `Result<T, MirrorError>`.
//! Transport and protocol failures are transient and retried or dropped
//! by the caller; capture and encoder failures end the session.

use thiserror::Error;

use crate::state::SessionState;

/// The canonical error type for the mirroring core.
#[derive(Debug, Error)]
pub enum MirrorError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// A control line could not be interpreted as a resolution message.
    #[error("malformed control message: {0}")]
    MalformedControl(String),

    /// A control line exceeded the codec limit.
    #[error("control line too long (max {max} bytes)")]
    LineTooLong { max: usize },

    /// A resolution with a zero dimension was supplied.
    #[error("invalid resolution {width}x{height}")]
    InvalidResolution { width: u32, height: u32 },

    /// A resolution tier label did not match any known tier.
    #[error("unknown resolution tier: {0}")]
    UnknownTier(String),

    // ── Transport Errors ─────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The operation was abandoned because the session is shutting down.
    #[error("cancelled")]
    Cancelled,

    // ── Capture / Encoder Errors ─────────────────────────────────
    /// The capture capability or encoder could not be configured.
    #[error("encoder configuration failed: {0}")]
    Configure(String),

    /// The encoder failed while producing output.
    #[error("encoder failure: {0}")]
    Encoder(String),

    /// The capture surface could not be created or re-pointed.
    #[error("capture surface error: {0}")]
    Surface(String),

    // ── State Errors ─────────────────────────────────────────────
    /// A session state transition was attempted from the wrong state.
    #[error("invalid session transition: {from} -> {to}")]
    InvalidTransition {
        from: SessionState,
        to: &'static str,
    },

    // ── Serialization Errors ─────────────────────────────────────
    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl MirrorError {
    /// Whether the failure is expected to clear up on its own
    /// (reconnect, drop the message) rather than ending the session.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::MalformedControl(_)
                | Self::LineTooLong { .. }
                | Self::Json(_)
        )
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for MirrorError {
    fn from(s: String) -> Self {
        MirrorError::Other(s)
    }
}

impl From<&str> for MirrorError {
    fn from(s: &str) -> Self {
        MirrorError::Other(s.to_string())
    }
}

impl From<tokio_util::codec::LinesCodecError> for MirrorError {
    fn from(e: tokio_util::codec::LinesCodecError) -> Self {
        match e {
            tokio_util::codec::LinesCodecError::MaxLineLengthExceeded => {
                MirrorError::LineTooLong {
                    max: crate::codec::MAX_LINE_LENGTH,
                }
            }
            tokio_util::codec::LinesCodecError::Io(io) => MirrorError::Connection(io),
        }
    }
}
