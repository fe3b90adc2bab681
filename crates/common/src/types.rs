//! Core types with newtype pattern for type safety.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ticks per second of a track (or movie) clock.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeScale(pub u32);

impl TimeScale {
    /// Standard video clock (90kHz, same as MPEG-TS).
    pub const VIDEO: Self = Self(90_000);
    /// Movie-level clock (millisecond precision).
    pub const MOVIE: Self = Self(1000);

    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Convert microseconds to ticks, rounding to the nearest tick.
    ///
    /// Durations between two timestamps must be computed as
    /// `ticks(t1) - ticks(t0)`, never `ticks(t1 - t0)`: rounding each
    /// absolute position keeps the sum of durations equal to the span.
    pub fn ticks(self, us: i64) -> i64 {
        let scaled = us.unsigned_abs() as u128 * self.0 as u128;
        let rounded = ((scaled + 500_000) / 1_000_000) as i64;
        if us < 0 {
            -rounded
        } else {
            rounded
        }
    }

    /// Convert ticks back to microseconds (truncating).
    pub fn to_us(self, ticks: i64) -> i64 {
        if self.0 == 0 {
            return 0;
        }
        (ticks as i128 * 1_000_000 / self.0 as i128) as i64
    }
}

impl fmt::Display for TimeScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Hz", self.0)
    }
}

/// Rotation hint for a video track, in clockwise degrees.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Map a degree value onto one of the four representable rotations.
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees {
            0 => Some(Self::Deg0),
            90 => Some(Self::Deg90),
            180 => Some(Self::Deg180),
            270 => Some(Self::Deg270),
            _ => None,
        }
    }

    pub fn degrees(self) -> i32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }
}
