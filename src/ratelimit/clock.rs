//! Clock sources for callers that do not supply their own timestamps.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A point in time in the caller's chosen unit.
///
/// The limiter never interprets the unit; it only compares timestamps
/// against each other and against the configured window.
pub type Timestamp = u64;

/// A source of "now" for the sweeper and other scheduled callers.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Resolution of a [`UnixClock`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockUnit {
    #[default]
    Seconds,
    Milliseconds,
}

/// Wall clock reporting time since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixClock {
    unit: ClockUnit,
}

impl UnixClock {
    pub fn new(unit: ClockUnit) -> Self {
        Self { unit }
    }

    pub fn unit(&self) -> ClockUnit {
        self.unit
    }
}

impl Clock for UnixClock {
    fn now(&self) -> Timestamp {
        let now = Utc::now();
        let raw = match self.unit {
            ClockUnit::Seconds => now.timestamp(),
            ClockUnit::Milliseconds => now.timestamp_millis(),
        };
        // Pre-epoch wall time clamps to zero.
        Timestamp::try_from(raw).unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move the clock forward and return the new time.
    pub fn advance(&self, by: Timestamp) -> Timestamp {
        self.now.fetch_add(by, Ordering::SeqCst) + by
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}
