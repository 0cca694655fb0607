// clock.rs — wall-clock readings with microsecond resolution
//
// The simulation schedules events at absolute wall-clock moments and
// persists them as signed offsets relative to "now", so both an absolute
// time and a signed delta type are needed. Values are kept normalized:
// the microsecond field is always in [0, USEC_PER_SEC).

use std::cmp::Ordering;
use std::ops::{Add, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const USEC_PER_SEC: i32 = 1_000_000;

/// An absolute wall-clock moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallTime {
    sec: i64,
    usec: i32,
}

/// A signed time offset. Negative offsets are represented with a negative
/// `sec` and a microsecond field still in [0, USEC_PER_SEC), so -0.3s is
/// `{ sec: -1, usec: 700_000 }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeDelta {
    pub sec: i64,
    pub usec: i32,
}

const fn normalize(sec: i64, usec: i64) -> (i64, i32) {
    let mut carry = usec / USEC_PER_SEC as i64;
    let mut rem = usec % USEC_PER_SEC as i64;
    if rem < 0 {
        carry -= 1;
        rem += USEC_PER_SEC as i64;
    }
    (sec + carry, rem as i32)
}

impl WallTime {
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        WallTime {
            sec: elapsed.as_secs() as i64,
            usec: elapsed.subsec_micros() as i32,
        }
    }

    pub const fn from_parts(sec: i64, usec: i64) -> Self {
        let (sec, usec) = normalize(sec, usec);
        WallTime { sec, usec }
    }

    pub const fn sec(&self) -> i64 {
        self.sec
    }

    pub const fn usec(&self) -> i32 {
        self.usec
    }
}

impl Ord for WallTime {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.sec, self.usec).cmp(&(other.sec, other.usec))
    }
}

impl PartialOrd for WallTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl TimeDelta {
    pub const ZERO: TimeDelta = TimeDelta { sec: 0, usec: 0 };

    pub const fn new(sec: i64, usec: i64) -> Self {
        let (sec, usec) = normalize(sec, usec);
        TimeDelta { sec, usec }
    }

    pub const fn from_millis(ms: i64) -> Self {
        Self::new(0, ms * 1000)
    }

    pub const fn is_zero(&self) -> bool {
        self.sec == 0 && self.usec == 0
    }

    /// Converts to an unsigned `Duration`, clamping negative offsets to
    /// zero. Used for I/O timeouts.
    pub fn to_duration(self) -> Duration {
        if self.sec < 0 {
            Duration::ZERO
        } else {
            Duration::new(self.sec as u64, self.usec as u32 * 1000)
        }
    }
}

impl Add<TimeDelta> for WallTime {
    type Output = WallTime;

    fn add(self, rhs: TimeDelta) -> WallTime {
        let (sec, usec) = normalize(
            self.sec + rhs.sec,
            self.usec as i64 + rhs.usec as i64,
        );
        WallTime { sec, usec }
    }
}

impl Sub for WallTime {
    type Output = TimeDelta;

    fn sub(self, rhs: WallTime) -> TimeDelta {
        let (sec, usec) = normalize(
            self.sec - rhs.sec,
            self.usec as i64 - rhs.usec as i64,
        );
        TimeDelta { sec, usec }
    }
}
