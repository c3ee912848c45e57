//! Time abstraction.
//!
//! Wall-clock time stamps artifacts and audit rows; monotonic time measures
//! latency. Components take a `Clock` so tests can pin both.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    /// Current UTC wall time.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Monotonic instant for latency measurement.
    fn monotonic(&self) -> Instant;
}

pub type SharedClock = Arc<dyn Clock>;

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// A clock pinned to a fixed wall time. Monotonic time still advances.
#[derive(Debug, Clone)]
pub struct FixedClock {
    now: DateTime<Utc>,
}

impl FixedClock {
    pub fn at(now: DateTime<Utc>) -> FixedClock {
        FixedClock { now }
    }
}

impl Clock for FixedClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.now
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// Format a wall time the way artifact names embed it: `YYYYmmdd_HHMMSS` UTC.
pub fn artifact_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%d_%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn artifact_timestamp_format() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 6, 30, 9).unwrap();
        assert_eq!(artifact_timestamp(ts), "20240115_063009");
    }
}
