use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

static PROCESS_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Time source for every windowed or decayed statistic in flow-x.
///
/// ## Epoch Semantics
/// `now()` is the elapsed time since a fixed epoch, never a wall-clock reading.
/// Timestamps stored in atomics (cooldown markers, pick times, completion
/// times) are all expressed against the same epoch, so differences between
/// them are meaningful. The epoch is fixed at the first read, so early
/// readings are close to zero: stored timestamps are clamped to at least 1
/// and a stored `0` means "never", which readers treat as always expired.
pub trait Clock: Send + Sync + core::fmt::Debug {
    fn now(&self) -> Duration;

    #[inline]
    fn now_nanos(&self) -> u64 {
        self.now().as_nanos() as u64
    }
}

/// Monotonic clock anchored at the first time any `MonotonicClock` is read.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl MonotonicClock {
    pub fn epoch() -> Instant {
        *PROCESS_EPOCH.get_or_init(Instant::now)
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        Self::epoch().elapsed()
    }
}

/// A clock that only moves when told to. Used to drive window recycling,
/// cache expiry and cooldowns deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Duration) -> Self {
        Self {
            nanos: AtomicU64::new(start.as_nanos() as u64),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::AcqRel);
    }

    pub fn set(&self, at: Duration) {
        self.nanos.store(at.as_nanos() as u64, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Acquire))
    }
}
