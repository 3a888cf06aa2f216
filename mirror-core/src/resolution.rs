//! Capture resolution, bitrate tiers, and the symbolic tier labels the
//! hosting shell exposes to users.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MirrorError;

// ── Encoder constants ────────────────────────────────────────────

/// Encoder frame rate in frames per second.
pub const DEFAULT_FRAME_RATE: u32 = 30;

/// Key-frame interval in seconds. Zero asks for every frame to be a sync frame.
pub const I_FRAME_INTERVAL_SECS: u32 = 0;

/// Capture surface density in dots per inch.
pub const DEFAULT_DENSITY: u32 = 320;

/// Bitrate for widths of 1920 and above.
pub const BITRATE_HIGH: u32 = 4_000_000;
/// Bitrate for widths from 1280 up to 1920.
pub const BITRATE_MEDIUM: u32 = 2_000_000;
/// Bitrate for anything narrower than 1280.
pub const BITRATE_LOW: u32 = 1_000_000;

/// Bitrate in bits/second for a capture `width`.
pub const fn bitrate_for_width(width: u32) -> u32 {
    if width >= 1920 {
        BITRATE_HIGH
    } else if width >= 1280 {
        BITRATE_MEDIUM
    } else {
        BITRATE_LOW
    }
}

// ── Resolution ───────────────────────────────────────────────────

/// Capture and encode dimensions in pixels.
///
/// Portrait sizes are allowed. Two resolutions are the same exactly when
/// both dimensions match, which is the only input to restart decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Build a resolution, rejecting zero-sized dimensions.
    pub fn new(width: u32, height: u32) -> Result<Self, MirrorError> {
        if width == 0 || height == 0 {
            return Err(MirrorError::InvalidResolution { width, height });
        }
        Ok(Self { width, height })
    }

    /// Bitrate tier for this resolution. Recomputed on every (re)configure.
    pub const fn bitrate(&self) -> u32 {
        bitrate_for_width(self.width)
    }

    pub fn is_portrait(&self) -> bool {
        self.height > self.width
    }
}

impl Default for Resolution {
    fn default() -> Self {
        ResolutionTier::P720.resolution()
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// ── ResolutionTier ───────────────────────────────────────────────

/// Named resolution bucket offered to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResolutionTier {
    #[serde(rename = "480")]
    P480,
    #[default]
    #[serde(rename = "720")]
    P720,
    #[serde(rename = "1080")]
    P1080,
}

impl ResolutionTier {
    pub const ALL: [ResolutionTier; 3] = [Self::P480, Self::P720, Self::P1080];

    /// Concrete pixel dimensions for the tier.
    pub const fn resolution(self) -> Resolution {
        match self {
            Self::P480 => Resolution {
                width: 854,
                height: 480,
            },
            Self::P720 => Resolution {
                width: 1280,
                height: 720,
            },
            Self::P1080 => Resolution {
                width: 1920,
                height: 1080,
            },
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::P480 => "480",
            Self::P720 => "720",
            Self::P1080 => "1080",
        }
    }

    /// Parse a tier label, falling back to 720 for anything unknown.
    pub fn from_label_or_default(label: &str) -> Self {
        label.parse().unwrap_or_default()
    }
}

impl FromStr for ResolutionTier {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_suffix('p')
            .or_else(|| trimmed.strip_suffix('P'))
            .unwrap_or(trimmed);
        match digits {
            "480" => Ok(Self::P480),
            "720" => Ok(Self::P720),
            "1080" => Ok(Self::P1080),
            _ => Err(MirrorError::UnknownTier(s.to_string())),
        }
    }
}

impl fmt::Display for ResolutionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl From<ResolutionTier> for Resolution {
    fn from(tier: ResolutionTier) -> Self {
        tier.resolution()
    }
}
