//! Encoder session state machine.
//!
//! Provides a `SessionState` enum that models one capture grant's
//! configure → stream → (restart)* → stop lifecycle, with validated
//! transitions that return `Result` instead of panicking.

use std::fmt;
use std::time::Instant;

use crate::error::MirrorError;

// ── SessionState ─────────────────────────────────────────────────

/// The current phase of an encoder session.
///
/// ```text
///  Uninitialized ──► Configuring ──► Streaming ◄──► Restarting
///                         │              │              │
///                         ▼              ▼              ▼
///                         └──────────► Stopped ◄────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Created, nothing configured yet.
    #[default]
    Uninitialized,

    /// Creating the encoder and capture surface for the initial resolution.
    Configuring,

    /// Encoder output is flowing.
    Streaming {
        /// When the session last entered `Streaming`.
        since: Instant,
    },

    /// The encoder is being replaced for a new resolution.
    Restarting,

    /// Terminal. All capture resources are released.
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "Uninitialized",
            Self::Configuring => "Configuring",
            Self::Streaming { .. } => "Streaming",
            Self::Restarting => "Restarting",
            Self::Stopped => "Stopped",
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming { .. })
    }

    pub fn is_restarting(&self) -> bool {
        matches!(self, Self::Restarting)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Only a streaming session may begin a restart.
    pub fn accepts_restart(&self) -> bool {
        self.is_streaming()
    }

    /// How long the session has been streaming since the last (re)start.
    pub fn streaming_duration(&self) -> Option<std::time::Duration> {
        match self {
            Self::Streaming { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Transition to `Configuring`.
    ///
    /// Valid from: `Uninitialized`.
    pub fn begin_configure(&mut self) -> Result<(), MirrorError> {
        match self {
            Self::Uninitialized => {
                *self = Self::Configuring;
                Ok(())
            }
            other => Err(MirrorError::InvalidTransition {
                from: *other,
                to: "Configuring",
            }),
        }
    }

    /// Transition to `Streaming`.
    ///
    /// Valid from: `Configuring` (first start) or `Restarting`.
    pub fn begin_streaming(&mut self) -> Result<(), MirrorError> {
        match self {
            Self::Configuring | Self::Restarting => {
                *self = Self::Streaming {
                    since: Instant::now(),
                };
                Ok(())
            }
            other => Err(MirrorError::InvalidTransition {
                from: *other,
                to: "Streaming",
            }),
        }
    }

    /// Transition to `Restarting`.
    ///
    /// Valid from: `Streaming`.
    pub fn begin_restart(&mut self) -> Result<(), MirrorError> {
        match self {
            Self::Streaming { .. } => {
                *self = Self::Restarting;
                Ok(())
            }
            other => Err(MirrorError::InvalidTransition {
                from: *other,
                to: "Restarting",
            }),
        }
    }

    /// Transition to `Stopped`. Always valid; stopping twice is a no-op.
    ///
    /// Returns `true` if this call performed the transition.
    pub fn stop(&mut self) -> bool {
        if self.is_stopped() {
            return false;
        }
        *self = Self::Stopped;
        true
    }
}

// ── Tests ─────────────────────────────────────────────────────────
