//! NTP-style timestamps.
//!
//! A `Timetag` counts whole seconds since 1900-01-01 plus a 32-bit binary
//! fraction of a second. Ordering is lexicographic on `(secs, frac)`, which
//! is chronological because `frac` can never leave `[0, 2^32)`.

use std::ops::{Add, Sub};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Fractional units per second.
pub const FRAC_PER_SEC: f64 = 4_294_967_296.0;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// A (seconds, fraction) timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timetag {
    pub secs: u64,
    pub frac: u32,
}

impl Timetag {
    pub const ZERO: Timetag = Timetag { secs: 0, frac: 0 };

    pub fn new(secs: u64, frac: u32) -> Self {
        Self { secs, frac }
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        let now = Utc::now();
        let unix = now.timestamp().max(0) as u64;
        // Leap seconds report up to 2e9 - 1 nanos.
        let nanos = now.timestamp_subsec_nanos().min(999_999_999);
        Self {
            secs: unix + NTP_UNIX_OFFSET,
            frac: Self::frac_from_nanos(nanos) as u32,
        }
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        if secs <= 0.0 {
            return Self::ZERO;
        }
        let whole = secs.floor();
        let frac = ((secs - whole) * FRAC_PER_SEC) as u64;
        Self { secs: whole as u64, frac: frac.min(u32::MAX as u64) as u32 }
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.secs as f64 + self.frac as f64 / FRAC_PER_SEC
    }

    /// Shift by a signed number of seconds, clamping at zero.
    pub fn add_secs(&self, delta: f64) -> Self {
        let total = self.as_secs_f64() + delta;
        if total <= 0.0 {
            return Self::ZERO;
        }
        let whole = total.floor();
        let mut frac = ((total - whole) * FRAC_PER_SEC).round();
        let mut secs = whole as u64;
        if frac >= FRAC_PER_SEC {
            frac -= FRAC_PER_SEC;
            secs += 1;
        }
        Self { secs, frac: frac as u32 }
    }

    /// `self - other` in seconds (negative if `other` is later).
    pub fn difference(&self, other: &Timetag) -> f64 {
        (self.secs as f64 - other.secs as f64)
            + (self.frac as f64 - other.frac as f64) / FRAC_PER_SEC
    }

    /// Seconds elapsed between `self` and now; negative for future tags.
    pub fn elapsed(&self) -> f64 {
        Timetag::now().difference(self)
    }

    fn frac_from_nanos(nanos: u32) -> u64 {
        ((nanos as u64) << 32) / 1_000_000_000
    }
}

impl Add<Duration> for Timetag {
    type Output = Timetag;

    fn add(self, rhs: Duration) -> Timetag {
        let frac = self.frac as u64 + Self::frac_from_nanos(rhs.subsec_nanos());
        Timetag {
            secs: self.secs + rhs.as_secs() + (frac >> 32),
            frac: (frac & 0xFFFF_FFFF) as u32,
        }
    }
}

impl Sub<Duration> for Timetag {
    type Output = Timetag;

    /// Saturates at [`Timetag::ZERO`].
    fn sub(self, rhs: Duration) -> Timetag {
        let sub_frac = Self::frac_from_nanos(rhs.subsec_nanos());
        let (mut secs, frac) = if (self.frac as u64) >= sub_frac {
            (self.secs, self.frac as u64 - sub_frac)
        } else {
            match self.secs.checked_sub(1) {
                Some(s) => (s, self.frac as u64 + (1u64 << 32) - sub_frac),
                None => return Timetag::ZERO,
            }
        };
        secs = match secs.checked_sub(rhs.as_secs()) {
            Some(s) => s,
            None => return Timetag::ZERO,
        };
        Timetag { secs, frac: frac as u32 }
    }
}

impl Sub<Timetag> for Timetag {
    type Output = TimeDelta;

    fn sub(self, rhs: Timetag) -> TimeDelta {
        let nanos = (self.difference(&rhs) * 1e9).round() as i64;
        TimeDelta::nanoseconds(nanos)
    }
}

impl std::fmt::Display for Timetag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:08x}", self.secs, self.frac)
    }
}
