//! Priority tiers.
//!
//! Four urgency classes, `P0` being the most urgent. The derived ordering
//! puts `P0` first, so sorting ascending yields dispatch order.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Priority tier of a request (lower level = higher priority)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PriorityTier {
    /// Critical
    P0 = 0,
    /// High
    P1 = 1,
    /// Normal
    P2 = 2,
    /// Low
    P3 = 3,
}

/// Errors produced when parsing a tier
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TierError {
    #[error("priority must be between {min} and {max}, got {got}")]
    OutOfRange { got: i64, min: u8, max: u8 },

    #[error("unrecognised priority '{0}'")]
    Unrecognised(String),
}

impl PriorityTier {
    /// All tiers in dispatch order
    pub const ALL: [PriorityTier; 4] =
        [PriorityTier::P0, PriorityTier::P1, PriorityTier::P2, PriorityTier::P3];

    /// Number of tiers
    pub const COUNT: usize = 4;

    pub const MIN_LEVEL: u8 = 0;
    pub const MAX_LEVEL: u8 = 3;

    /// Build a tier from its numeric level (0..=3)
    pub fn from_level(level: i64) -> Result<Self, TierError> {
        match level {
            0 => Ok(Self::P0),
            1 => Ok(Self::P1),
            2 => Ok(Self::P2),
            3 => Ok(Self::P3),
            got => Err(TierError::OutOfRange {
                got,
                min: Self::MIN_LEVEL,
                max: Self::MAX_LEVEL,
            }),
        }
    }

    /// Numeric level of this tier
    pub fn level(self) -> u8 {
        self as u8
    }

    /// Index into per-tier arrays
    pub fn index(self) -> usize {
        self as usize
    }

    /// Metric label value for this tier
    pub fn label(self) -> &'static str {
        match self {
            Self::P0 => "0",
            Self::P1 => "1",
            Self::P2 => "2",
            Self::P3 => "3",
        }
    }
}

impl Default for PriorityTier {
    fn default() -> Self {
        Self::P2
    }
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.level())
    }
}

impl FromStr for PriorityTier {
    type Err = TierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix('p')
            .or_else(|| trimmed.strip_prefix('P'))
            .unwrap_or(trimmed);

        let level: i64 = digits
            .parse()
            .map_err(|_| TierError::Unrecognised(s.to_string()))?;
        Self::from_level(level)
    }
}

impl TryFrom<u8> for PriorityTier {
    type Error = TierError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        Self::from_level(i64::from(level))
    }
}

impl From<PriorityTier> for u8 {
    fn from(tier: PriorityTier) -> Self {
        tier.level()
    }
}
