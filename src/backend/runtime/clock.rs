/**
 * Clock & ID Source
 *
 * Every component reads time through the `Clock` trait so that tests can
 * drive heartbeats, TTLs and backoff deterministically with `ManualClock`.
 *
 * `IdSource::monotonic_id` produces strictly increasing ids derived from
 * the clock's microsecond timestamp. Sync tokens are minted from it, so a
 * client comparing two tokens can order them.
 */
use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Source of wall-clock time
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

/// System time, never moving backwards within the process
#[derive(Debug, Default)]
pub struct SystemClock {
    last_micros: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let sampled = Utc::now().timestamp_micros();
        let previous = self.last_micros.fetch_max(sampled, Ordering::AcqRel);
        from_micros(sampled.max(previous))
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    micros: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            micros: AtomicI64::new(start.timestamp_micros()),
        }
    }

    /// Starts at 2026-01-01T00:00:00Z
    pub fn at_epoch() -> Self {
        Self::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap_or_default())
    }

    pub fn advance(&self, by: Duration) {
        let delta = i64::try_from(by.as_micros()).unwrap_or(i64::MAX);
        self.micros.fetch_add(delta, Ordering::AcqRel);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.micros.store(at.timestamp_micros(), Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        from_micros(self.micros.load(Ordering::Acquire))
    }
}

fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

/// Strictly increasing ids anchored to the clock
pub struct IdSource {
    clock: SharedClock,
    last: AtomicI64,
}

impl IdSource {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            last: AtomicI64::new(0),
        }
    }

    /// `max(now_micros, last + 1)`
    pub fn monotonic_id(&self) -> i64 {
        let now = self.clock.now().timestamp_micros();
        let mut current = self.last.load(Ordering::Acquire);
        loop {
            let next = now.max(current + 1);
            match self
                .last
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    /// Raise the floor so later ids sort after `id`
    pub fn observe(&self, id: i64) {
        self.last.fetch_max(id, Ordering::AcqRel);
    }
}

/// Uniform random factor in `[low, high)`
pub fn jitter(low: f64, high: f64) -> f64 {
    if high <= low {
        return low;
    }
    rand::thread_rng().gen_range(low..high)
}
