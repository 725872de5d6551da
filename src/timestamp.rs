use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{Error, Result};

const USEC_PER_SEC: i64 = 1_000_000;

/// Microsecond-resolution wall time used as the time-index key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub sec: i64,
    pub usec: i64,
}

impl Timestamp {
    /// Unset cursor position.
    pub const NONE: Timestamp = Timestamp { sec: -1, usec: -1 };
    pub const ZERO: Timestamp = Timestamp { sec: 0, usec: 0 };
    /// End of time. Sorts after every real insertion time.
    pub const ENDT: Timestamp = Timestamp {
        sec: 0x7fff_ffff,
        usec: 999_999,
    };

    pub const fn new(sec: i64, usec: i64) -> Self {
        Self { sec, usec }
    }

    pub fn now() -> Self {
        let since = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before UNIX epoch");
        Self::from_duration(since)
    }

    pub fn from_duration(since_epoch: Duration) -> Self {
        Self {
            sec: since_epoch.as_secs() as i64,
            usec: since_epoch.subsec_micros() as i64,
        }
    }

    pub fn from_micros(micros: i64) -> Self {
        Self {
            sec: micros.div_euclid(USEC_PER_SEC),
            usec: micros.rem_euclid(USEC_PER_SEC),
        }
    }

    pub fn as_micros(&self) -> i64 {
        self.sec.saturating_mul(USEC_PER_SEC).saturating_add(self.usec)
    }

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    /// Smallest later timestamp.
    pub fn incr(self) -> Self {
        if self.usec + 1 >= USEC_PER_SEC {
            Self::new(self.sec + 1, 0)
        } else {
            Self::new(self.sec, self.usec + 1)
        }
    }

    /// Largest earlier timestamp.
    pub fn decr(self) -> Self {
        if self.usec <= 0 {
            Self::new(self.sec - 1, USEC_PER_SEC - 1)
        } else {
            Self::new(self.sec, self.usec - 1)
        }
    }

    pub fn add_secs(self, secs: i64) -> Self {
        Self::new(self.sec + secs, self.usec)
    }

    pub fn sub_secs(self, secs: i64) -> Self {
        Self::new(self.sec - secs, self.usec)
    }

    pub fn add_duration(self, span: Duration) -> Self {
        Self::from_micros(self.as_micros().saturating_add(span.as_micros() as i64))
    }

    /// `self - earlier` in seconds.
    pub fn secs_since(&self, earlier: Timestamp) -> f64 {
        (self.as_micros() - earlier.as_micros()) as f64 / USEC_PER_SEC as f64
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.sec, self.usec)
    }
}

impl FromStr for Timestamp {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let text = text.trim();
        let (sec, usec) = text.split_once('.').unwrap_or((text, "0"));
        let sec = sec
            .parse::<i64>()
            .map_err(|_| Error::Invalid("timestamp seconds"))?;
        let usec = usec
            .parse::<i64>()
            .map_err(|_| Error::Invalid("timestamp microseconds"))?;
        if !(0..USEC_PER_SEC).contains(&usec) {
            return Err(Error::Invalid("timestamp microseconds out of range"));
        }
        Ok(Self::new(sec, usec))
    }
}

/// Match mode for time-index lookups and cursor movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Greatest key below the target; iterate towards older products.
    Backward,
    /// Key equal to the target.
    Exact,
    /// Least key above the target; iterate towards newer products.
    Forward,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::Backward => Direction::Forward,
            Direction::Exact => Direction::Exact,
            Direction::Forward => Direction::Backward,
        }
    }
}

/// A source of insertion timestamps.
///
/// Wall-clock time is the default. `QuantaClock` trades NTP slewing for a
/// cheaper, monotonic TSC read anchored to wall time at construction.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

#[derive(Debug, Clone)]
pub struct QuantaClock {
    clock: quanta::Clock,
    start_wall: Timestamp,
    start_instant: quanta::Instant,
}

impl Default for QuantaClock {
    fn default() -> Self {
        let clock = quanta::Clock::new();
        let start_instant = clock.now();
        Self {
            clock,
            start_wall: Timestamp::now(),
            start_instant,
        }
    }
}

impl QuantaClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for QuantaClock {
    fn now(&self) -> Timestamp {
        let delta = self.clock.now().duration_since(self.start_instant);
        self.start_wall.add_duration(delta)
    }
}
