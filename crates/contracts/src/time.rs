//! Clock abstraction separating wall-clock from monotonic time.
//!
//! Scheme activation/expiry is specified in absolute wall time, so the
//! timeline must follow clock adjustments. Interval measurements inside
//! workers use monotonic time so they stay stable under clock jumps.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Milliseconds, either since the Unix epoch (wall) or since an arbitrary
/// monotonic origin; the containing field decides which.
pub type Timestamp = u64;

/// A point in time captured on both clocks at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimePoint {
    /// Wall-clock milliseconds since the Unix epoch.
    pub system_time_ms: Timestamp,
    /// Monotonic milliseconds since an arbitrary origin.
    pub monotonic_time_ms: Timestamp,
}

/// Injectable time source.
pub trait Clock: Send + Sync {
    /// Wall-clock milliseconds since the Unix epoch.
    fn system_time_since_epoch_ms(&self) -> Timestamp;

    /// Monotonic milliseconds since an arbitrary origin.
    fn monotonic_time_ms(&self) -> Timestamp;

    /// Capture both clocks.
    fn time_since_epoch(&self) -> TimePoint {
        TimePoint {
            system_time_ms: self.system_time_since_epoch_ms(),
            monotonic_time_ms: self.monotonic_time_ms(),
        }
    }
}

/// Map a future wall-clock target onto a [`TimePoint`] relative to `now`.
///
/// If the target is in the past relative to `now`, the monotonic estimate
/// saturates at `now`'s monotonic time.
pub fn timepoint_from_system_time(now: TimePoint, system_time_ms: Timestamp) -> TimePoint {
    let monotonic_time_ms = if system_time_ms >= now.system_time_ms {
        now.monotonic_time_ms + (system_time_ms - now.system_time_ms)
    } else {
        now.monotonic_time_ms
    };
    TimePoint {
        system_time_ms,
        monotonic_time_ms,
    }
}

/// Default [`Clock`] backed by `SystemTime` and `Instant`.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn system_time_since_epoch_ms(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Timestamp)
            .unwrap_or(0)
    }

    fn monotonic_time_ms(&self) -> Timestamp {
        self.origin.elapsed().as_millis() as Timestamp
    }
}

/// Manually driven clock for time-dependent tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    state: parking_lot::Mutex<TimePoint>,
}

impl ManualClock {
    pub fn new(system_time_ms: Timestamp) -> Self {
        Self {
            state: parking_lot::Mutex::new(TimePoint {
                system_time_ms,
                monotonic_time_ms: 0,
            }),
        }
    }

    /// Advance both clocks by `delta_ms`.
    pub fn advance(&self, delta_ms: Timestamp) {
        let mut state = self.state.lock();
        state.system_time_ms += delta_ms;
        state.monotonic_time_ms += delta_ms;
    }

    /// Jump the wall clock only, leaving the monotonic clock untouched.
    pub fn jump_system_time(&self, system_time_ms: Timestamp) {
        self.state.lock().system_time_ms = system_time_ms;
    }
}

impl Clock for ManualClock {
    fn system_time_since_epoch_ms(&self) -> Timestamp {
        self.state.lock().system_time_ms
    }

    fn monotonic_time_ms(&self) -> Timestamp {
        self.state.lock().monotonic_time_ms
    }
}

/// Reset-on-trigger interval timer over the monotonic clock.
#[derive(Clone)]
pub struct MonotonicTimer {
    clock: Arc<dyn Clock>,
    started_ms: Timestamp,
}

impl MonotonicTimer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let started_ms = clock.monotonic_time_ms();
        Self { clock, started_ms }
    }

    pub fn reset(&mut self) {
        self.started_ms = self.clock.monotonic_time_ms();
    }

    pub fn elapsed_ms(&self) -> Timestamp {
        self.clock.monotonic_time_ms().saturating_sub(self.started_ms)
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.elapsed_ms() / 1000
    }
}
