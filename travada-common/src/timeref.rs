//! Universal-rate time reference for sample-accurate timeline positions
//!
//! Every position and duration in the engine is stored as a [`TimeRef`]: a
//! signed 64-bit count of "universal samples" at [`UNIVERSAL_RATE`]
//! (28,224,000 Hz). The rate is a common multiple of every supported device
//! rate, so converting a `TimeRef` to frames at a device rate and back is
//! exact up to sub-frame truncation:
//!
//! | Rate (Hz) | Universal samples / frame |
//! |-----------|---------------------------|
//! | 22,050    | 1,280 |
//! | 32,000    | 882 |
//! | 44,100    | 640 |
//! | 48,000    | 588 |
//! | 88,200    | 320 |
//! | 96,000    | 294 |
//! | 176,400   | 160 |
//! | 192,000   | 147 |
//!
//! An `i64` at this rate covers roughly ±10 years of audio, which is far
//! beyond any project length we care about.
//!
//! Timeline math (clip placement, fades, automation, ring slot locations)
//! stays in `TimeRef` space; the conversion to frames happens only at the
//! edges, where buffers are filled at a concrete device or file rate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

/// The universal sample rate: 28,224,000 Hz.
///
/// Least common multiple of the supported device rates (22.05 k up to 192 k),
/// so `UNIVERSAL_RATE / rate` is an integer for each of them.
pub const UNIVERSAL_RATE: i64 = 28_224_000;

/// Universal samples per millisecond (28,224,000 / 1000).
pub const UNIVERSAL_PER_MS: i64 = 28_224;

/// A position or duration in universal samples.
///
/// `TimeRef` is `Copy`, totally ordered and supports the usual additive
/// arithmetic. [`TimeRef::INVALID`] is a dedicated sentinel (`i64::MIN`)
/// used for "no position yet", e.g. a ring slot that has never been filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeRef(i64);

impl TimeRef {
    /// Zero position / empty duration.
    pub const ZERO: TimeRef = TimeRef(0);

    /// Sentinel for "not a valid position".
    ///
    /// Compares less than every valid `TimeRef`; arithmetic on it is
    /// meaningless and callers are expected to check [`TimeRef::is_valid`]
    /// first.
    pub const INVALID: TimeRef = TimeRef(i64::MIN);

    /// One second of universal samples.
    pub const ONE_SECOND: TimeRef = TimeRef(UNIVERSAL_RATE);

    /// Construct from a raw universal-sample count.
    pub const fn new(universal: i64) -> Self {
        TimeRef(universal)
    }

    /// Construct from a frame count at the given sample rate.
    ///
    /// Exact for every rate that divides [`UNIVERSAL_RATE`]; other rates
    /// fall back to 128-bit intermediate math and truncate toward zero.
    pub fn from_frames(frames: i64, rate: u32) -> Self {
        debug_assert!(rate > 0);
        let rate = rate as i64;
        let per_frame = UNIVERSAL_RATE / rate;
        if per_frame * rate == UNIVERSAL_RATE {
            TimeRef(frames * per_frame)
        } else {
            TimeRef((frames as i128 * UNIVERSAL_RATE as i128 / rate as i128) as i64)
        }
    }

    /// Construct from milliseconds.
    pub const fn from_ms(ms: i64) -> Self {
        TimeRef(ms * UNIVERSAL_PER_MS)
    }

    /// The raw universal-sample count.
    pub const fn universal(self) -> i64 {
        self.0
    }

    /// Convert to a frame count at the given sample rate, truncating
    /// toward zero.
    pub fn to_frames(self, rate: u32) -> i64 {
        debug_assert!(rate > 0);
        (self.0 as i128 * rate as i128 / UNIVERSAL_RATE as i128) as i64
    }

    /// Convert to whole milliseconds (truncating).
    pub const fn to_ms(self) -> i64 {
        self.0 / UNIVERSAL_PER_MS
    }

    /// `false` for the [`TimeRef::INVALID`] sentinel.
    pub const fn is_valid(self) -> bool {
        self.0 != i64::MIN
    }

    /// Add a frame count at the given rate in place.
    pub fn add_frames(&mut self, frames: i64, rate: u32) {
        *self = *self + TimeRef::from_frames(frames, rate);
    }

    /// Clamp negative positions to zero.
    pub fn max_zero(self) -> Self {
        if self.0 < 0 {
            TimeRef::ZERO
        } else {
            self
        }
    }
}

impl Add for TimeRef {
    type Output = TimeRef;

    fn add(self, rhs: TimeRef) -> TimeRef {
        TimeRef(self.0 + rhs.0)
    }
}

impl Sub for TimeRef {
    type Output = TimeRef;

    fn sub(self, rhs: TimeRef) -> TimeRef {
        TimeRef(self.0 - rhs.0)
    }
}

impl AddAssign for TimeRef {
    fn add_assign(&mut self, rhs: TimeRef) {
        self.0 += rhs.0;
    }
}

impl SubAssign for TimeRef {
    fn sub_assign(&mut self, rhs: TimeRef) {
        self.0 -= rhs.0;
    }
}

impl Neg for TimeRef {
    type Output = TimeRef;

    fn neg(self) -> TimeRef {
        TimeRef(-self.0)
    }
}

impl fmt::Display for TimeRef {
    /// Formats as `m:ss.mmm` (used in log output and the CLI).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return write!(f, "invalid");
        }
        let negative = self.0 < 0;
        let ms = self.0.unsigned_abs() / UNIVERSAL_PER_MS as u64;
        let minutes = ms / 60_000;
        let seconds = (ms / 1000) % 60;
        let millis = ms % 1000;
        if negative {
            write!(f, "-{}:{:02}.{:03}", minutes, seconds, millis)
        } else {
            write!(f, "{}:{:02}.{:03}", minutes, seconds, millis)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUPPORTED_RATES: [u32; 8] = [
        22_050, 32_000, 44_100, 48_000, 88_200, 96_000, 176_400, 192_000,
    ];

    #[test]
    fn universal_rate_divides_supported_rates() {
        for rate in SUPPORTED_RATES {
            assert_eq!(
                UNIVERSAL_RATE % rate as i64,
                0,
                "rate {} must divide the universal rate",
                rate
            );
        }
    }

    #[test]
    fn frame_round_trip_is_exact() {
        for rate in SUPPORTED_RATES {
            for frames in [0i64, 1, 63, 512, 44_100, 192_000, 10_000_000] {
                let t = TimeRef::from_frames(frames, rate);
                assert_eq!(t.to_frames(rate), frames, "rate {}", rate);
            }
        }
    }

    #[test]
    fn to_frames_truncates_subframe_remainder() {
        for rate in SUPPORTED_RATES {
            let step = UNIVERSAL_RATE / rate as i64;
            // One universal sample short of a full frame still truncates down.
            let t = TimeRef::new(5 * step + step - 1);
            assert_eq!(t.to_frames(rate), 5);
            // from(to(t)) == t - (t mod step)
            let t = TimeRef::new(123_456_789);
            let round_tripped = TimeRef::from_frames(t.to_frames(rate), rate);
            assert_eq!(round_tripped.universal(), t.universal() - t.universal() % step);
        }
    }

    #[test]
    fn arithmetic_and_ordering() {
        let a = TimeRef::from_frames(1000, 48_000);
        let b = TimeRef::from_frames(500, 48_000);
        assert_eq!((a + b).to_frames(48_000), 1500);
        assert_eq!((a - b).to_frames(48_000), 500);
        assert!(a > b);
        assert_eq!(-b + a, b);
    }

    #[test]
    fn invalid_sentinel() {
        assert!(!TimeRef::INVALID.is_valid());
        assert!(TimeRef::ZERO.is_valid());
        assert!(TimeRef::INVALID < TimeRef::from_ms(-1_000_000));
    }

    #[test]
    fn ms_conversions() {
        let t = TimeRef::from_ms(5000);
        assert_eq!(t.universal(), 141_120_000);
        assert_eq!(t.to_ms(), 5000);
        assert_eq!(t.to_frames(44_100), 220_500);
        assert_eq!(t.to_frames(48_000), 240_000);
    }

    #[test]
    fn display_format() {
        assert_eq!(TimeRef::from_ms(61_234).to_string(), "1:01.234");
        assert_eq!(TimeRef::INVALID.to_string(), "invalid");
        assert_eq!((-TimeRef::from_ms(500)).to_string(), "-0:00.500");
    }
}
