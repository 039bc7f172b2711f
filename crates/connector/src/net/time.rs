//! Wall-clock time as the connector schedules it.
//!
//! Attempts are spaced whole seconds apart and the queue dump prints
//! plain Unix timestamps, so one-second resolution is all the connector
//! ever needs. Both types here are thin wrappers around a second count.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A point in wall-clock time, in whole seconds since the Unix epoch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LocalTime {
    secs: u64,
}

impl LocalTime {
    /// The current wall-clock time.
    ///
    /// Never runs backwards: if the system clock is turned back, the
    /// highest time observed so far is returned until the clock catches
    /// up again. Backoff windows would otherwise reopen on clock
    /// adjustments.
    pub fn now() -> Self {
        static HIGH_WATER: AtomicU64 = AtomicU64::new(0);

        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let seen = HIGH_WATER.fetch_max(secs, Ordering::Relaxed);

        Self {
            secs: secs.max(seen),
        }
    }

    /// A time from whole seconds since the epoch.
    pub const fn from_secs(secs: u64) -> Self {
        Self { secs }
    }

    /// Whole seconds since the epoch.
    pub const fn as_secs(&self) -> u64 {
        self.secs
    }

    /// Turn the hands forward by the given duration.
    pub fn elapse(&mut self, duration: LocalDuration) {
        self.secs += duration.as_secs();
    }
}

impl fmt::Display for LocalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.secs)
    }
}

/// The time elapsed since an earlier point. Saturates at zero, so the
/// elapsed time handed to the peer registry can never be negative even
/// if the two timestamps were taken out of order.
impl std::ops::Sub for LocalTime {
    type Output = LocalDuration;

    fn sub(self, earlier: LocalTime) -> LocalDuration {
        LocalDuration::from_secs(self.secs.saturating_sub(earlier.secs))
    }
}

impl std::ops::Add<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn add(self, duration: LocalDuration) -> LocalTime {
        LocalTime {
            secs: self.secs + duration.as_secs(),
        }
    }
}

/// A span of wall-clock time, in whole seconds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LocalDuration {
    secs: u64,
}

impl LocalDuration {
    /// A duration from whole seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self { secs }
    }

    /// The number of whole seconds in this duration.
    pub const fn as_secs(&self) -> u64 {
        self.secs
    }
}

impl fmt::Display for LocalDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.secs / 60, self.secs % 60) {
            (0, s) => write!(f, "{}s", s),
            (m, 0) => write!(f, "{}m", m),
            (m, s) => write!(f, "{}m{}s", m, s),
        }
    }
}

impl std::ops::Add for LocalDuration {
    type Output = LocalDuration;

    fn add(self, other: LocalDuration) -> LocalDuration {
        LocalDuration {
            secs: self.secs + other.secs,
        }
    }
}

impl From<LocalDuration> for Duration {
    fn from(duration: LocalDuration) -> Self {
        Duration::from_secs(duration.secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_time_saturates() {
        let earlier = LocalTime::from_secs(100);
        let later = LocalTime::from_secs(130);

        assert_eq!(later - earlier, LocalDuration::from_secs(30));
        assert_eq!(earlier - later, LocalDuration::from_secs(0));
    }

    #[test]
    fn test_schedule_arithmetic() {
        let mut t = LocalTime::from_secs(1_000);

        t.elapse(LocalDuration::from_secs(5));
        assert_eq!(t, LocalTime::from_secs(1_005));
        assert_eq!(t + LocalDuration::from_secs(30), LocalTime::from_secs(1_035));
    }

    #[test]
    fn test_duration_display() {
        assert_eq!(LocalDuration::from_secs(10).to_string(), "10s");
        assert_eq!(LocalDuration::from_secs(60).to_string(), "1m");
        assert_eq!(LocalDuration::from_secs(90).to_string(), "1m30s");
    }
}
