use std::time::Duration;

use flowx_core::SharedClock;

use crate::iter::Iter;
use crate::policy::RollingPolicy;
use crate::reduce::{self, Aggregation};
use crate::window::Window;

/// Shape of a rolling window: `size` buckets of `bucket_duration` each.
#[derive(Debug, Clone, Copy)]
pub struct RollingOpts {
    pub size: usize,
    pub bucket_duration: Duration,
}

impl RollingOpts {
    pub fn new(size: usize, bucket_duration: Duration) -> Self {
        Self {
            size,
            bucket_duration,
        }
    }

    /// Splits `window` into `size` equal buckets.
    pub fn spanning(window: Duration, size: usize) -> Self {
        Self::new(size, window / size.max(1) as u32)
    }

    fn policy(self, clock: SharedClock) -> RollingPolicy {
        RollingPolicy::new(Window::new(self.size), self.bucket_duration, clock)
    }
}

/// A monotonically growing counter over a trailing time window.
///
/// Each bucket keeps a single running point; `add` merges into it and bumps
/// the bucket's sample count, so [`reduce::avg`] yields the mean per sample.
#[derive(Debug)]
pub struct RollingCounter {
    policy: RollingPolicy,
}

impl RollingCounter {
    pub fn new(opts: RollingOpts, clock: SharedClock) -> Self {
        Self {
            policy: opts.policy(clock),
        }
    }

    pub fn add(&self, val: u64) {
        self.policy.add(val as f64);
    }

    pub fn reduce<F>(&self, f: F) -> f64
    where
        F: FnOnce(Iter<'_>) -> f64,
    {
        self.policy.reduce(f)
    }

    /// Integral view of the windowed sum.
    pub fn value(&self) -> i64 {
        self.sum() as i64
    }

    pub fn timespan(&self) -> usize {
        self.policy.timespan()
    }

    pub fn policy(&self) -> &RollingPolicy {
        &self.policy
    }
}

impl Aggregation for RollingCounter {
    fn sum(&self) -> f64 {
        self.policy.reduce(reduce::sum)
    }

    fn avg(&self) -> f64 {
        self.policy.reduce(reduce::avg)
    }

    fn min(&self) -> f64 {
        self.policy.reduce(reduce::min)
    }

    fn max(&self) -> f64 {
        self.policy.reduce(reduce::max)
    }
}

/// A rolling window that keeps every sample as its own point.
#[derive(Debug)]
pub struct RollingGauge {
    policy: RollingPolicy,
}

impl RollingGauge {
    pub fn new(opts: RollingOpts, clock: SharedClock) -> Self {
        Self {
            policy: opts.policy(clock),
        }
    }

    pub fn add(&self, val: f64) {
        self.policy.append(val);
    }

    pub fn reduce<F>(&self, f: F) -> f64
    where
        F: FnOnce(Iter<'_>) -> f64,
    {
        self.policy.reduce(f)
    }

    pub fn policy(&self) -> &RollingPolicy {
        &self.policy
    }
}

impl Aggregation for RollingGauge {
    fn sum(&self) -> f64 {
        self.policy.reduce(reduce::sum)
    }

    fn avg(&self) -> f64 {
        self.policy.reduce(reduce::avg)
    }

    fn min(&self) -> f64 {
        self.policy.reduce(reduce::min)
    }

    fn max(&self) -> f64 {
        self.policy.reduce(reduce::max)
    }
}
