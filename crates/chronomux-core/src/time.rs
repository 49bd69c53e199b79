//! Time representation
//!
//! The scheduler works with absolute timestamps, not relative delays:
//! a recurring clock re-arms at `scheduled_time + period`, so dispatch
//! latency never accumulates into drift. [`TimePoint`] is that absolute
//! timestamp: a duration since the clock's epoch.
//!
//! Two clocks are supported. `Monotonic` measures from a process-wide
//! origin captured on first use, so time points from different scheduler
//! instances compare correctly and never jump backwards. `Realtime`
//! measures from `UNIX_EPOCH` and follows wall-clock adjustments.

use std::ops::{Add, AddAssign, Sub};
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Which OS clock timestamps are read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockType {
    /// Steady clock, immune to wall-clock adjustments. The default.
    #[default]
    Monotonic,

    /// Wall clock (`UNIX_EPOCH`-based). Follows NTP steps and manual
    /// clock changes.
    Realtime,
}

impl ClockType {
    /// Read the current time on this clock.
    pub fn now(self) -> TimePoint {
        match self {
            ClockType::Monotonic => {
                TimePoint(Instant::now().duration_since(monotonic_origin()))
            }
            ClockType::Realtime => TimePoint(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::ZERO),
            ),
        }
    }
}

fn monotonic_origin() -> Instant {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

/// An absolute timestamp: duration since the owning clock's epoch.
///
/// Time points are plain values: `Copy`, totally ordered, and cheap to
/// compare. Arithmetic with `Duration` is saturating on subtraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimePoint(Duration);

impl TimePoint {
    /// The clock's epoch itself.
    pub const ZERO: TimePoint = TimePoint(Duration::ZERO);

    /// Construct from a duration since the clock epoch.
    #[inline]
    pub const fn from_epoch(since_epoch: Duration) -> Self {
        TimePoint(since_epoch)
    }

    /// Duration since the clock epoch.
    #[inline]
    pub const fn since_epoch(self) -> Duration {
        self.0
    }

    /// Duration from `earlier` to `self`, or zero if `earlier` is later.
    #[inline]
    pub fn saturating_duration_since(self, earlier: TimePoint) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for TimePoint {
    type Output = TimePoint;

    #[inline]
    fn add(self, rhs: Duration) -> TimePoint {
        TimePoint(self.0 + rhs)
    }
}

impl AddAssign<Duration> for TimePoint {
    #[inline]
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs;
    }
}

impl Sub<Duration> for TimePoint {
    type Output = TimePoint;

    /// Saturates at the epoch.
    #[inline]
    fn sub(self, rhs: Duration) -> TimePoint {
        TimePoint(self.0.saturating_sub(rhs))
    }
}
