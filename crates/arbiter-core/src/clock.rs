//! Injected time source
//!
//! Engines, sessions and analyzers read time only through a [`Clock`] handed to them at
//! construction, so tests can drive durations and timestamps deterministically.

use chrono::{DateTime, TimeDelta, Utc};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Time source used for rule timings and timestamps
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current monotonic instant
    fn now(&self) -> Instant;

    /// Current wall-clock time, used for `last_executed` and report timestamps
    fn wall_time(&self) -> DateTime<Utc>;

    /// Time elapsed since `start`, never negative
    fn elapsed_since(&self, start: Instant) -> Duration {
        self.now().saturating_duration_since(start)
    }
}

/// Wall clock backed by `Instant::now`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_time(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    wall_origin: DateTime<Utc>,
    offset_nanos: AtomicU64,
}

impl ManualClock {
    /// Clock frozen at the Unix epoch
    pub fn new() -> Self {
        Self::starting_at(DateTime::UNIX_EPOCH)
    }

    /// Clock frozen at `wall_time`
    pub fn starting_at(wall_time: DateTime<Utc>) -> Self {
        Self { origin: Instant::now(), wall_origin: wall_time, offset_nanos: AtomicU64::new(0) }
    }

    fn offset(&self) -> Duration {
        Duration::from_nanos(self.offset_nanos.load(Ordering::SeqCst))
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.offset_nanos.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.offset()
    }

    fn wall_time(&self) -> DateTime<Utc> {
        TimeDelta::from_std(self.offset())
            .ok()
            .and_then(|delta| self.wall_origin.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Shared handle to the default clock
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}
