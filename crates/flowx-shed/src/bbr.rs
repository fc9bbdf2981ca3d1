//! # BBR Admission Control
//!
//! Estimates the concurrency a service can sustain from its own recent
//! history (Little's law: throughput x latency) and rejects requests once CPU
//! is saturated and in-flight work exceeds that estimate.

use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_epoch::{self as epoch, Atomic, Owned};
use flowx_core::{FlowXError, SharedClock, ShedConfig};
use flowx_metric::{RollingCounter, RollingOpts};
use parking_lot::RwLock;
use serde::Serialize;

use crate::cpu::CpuUsage;

/// How long rejections keep being considered after CPU falls back under the threshold.
pub const COOLDOWN: Duration = Duration::from_secs(1);

/// Admission gate in front of a protected endpoint.
///
/// ## Performance Guarantee
/// `allow` is lock-free apart from the read lock taken on a rolling counter
/// when a cached estimate has expired (at most once per bucket duration).
pub trait Shedder: Send + Sync {
    /// Returns a [`Promise`] if the request may proceed, otherwise
    /// [`FlowXError::Overloaded`].
    fn allow(&self) -> Result<Promise, FlowXError>;
}

/// Snapshot of a shedder's view of the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stat {
    pub cpu: u64,
    pub in_flight: i64,
    pub max_in_flight: i64,
    pub min_rt: i64,
    pub max_pass: i64,
}

/// A cached estimate, valid for one bucket duration after `time`.
struct CounterCache {
    val: i64,
    /// Nanos since the clock epoch.
    time: u64,
}

struct BbrInner {
    cpu: Arc<dyn CpuUsage>,
    clock: SharedClock,
    conf: ShedConfig,
    /// Completed-and-passed requests per bucket.
    pass_stat: RollingCounter,
    /// Response times in milliseconds.
    rt_stat: RollingCounter,
    in_flight: AtomicI64,
    buckets_per_sec: i64,
    bucket_nanos: u64,
    /// Nanos since the clock epoch of the first rejection of the current
    /// overload episode. `0` means no episode.
    pre_drop: AtomicU64,
    max_pass_cache: Atomic<CounterCache>,
    min_rt_cache: Atomic<CounterCache>,
}

/// CPU-aware overload shedder. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Bbr {
    inner: Arc<BbrInner>,
}

impl Bbr {
    pub fn new(conf: ShedConfig, cpu: Arc<dyn CpuUsage>, clock: SharedClock) -> Result<Self, FlowXError> {
        conf.validate()?;
        Ok(Self {
            inner: Arc::new(BbrInner::from_parts(&conf, cpu, clock)),
        })
    }

    pub fn in_flight(&self) -> i64 {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    pub fn max_pass(&self) -> i64 {
        self.inner.max_pass()
    }

    pub fn min_rt(&self) -> i64 {
        self.inner.min_rt()
    }

    pub fn max_flight(&self) -> i64 {
        self.inner.max_flight()
    }

    pub fn stat(&self) -> Stat {
        self.inner.stat()
    }
}

impl Shedder for Bbr {
    fn allow(&self) -> Result<Promise, FlowXError> {
        if self.inner.should_drop() {
            return Err(FlowXError::Overloaded);
        }
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(Promise {
            bbr: self.inner.clone(),
            since: self.inner.clock.now_nanos(),
            reported: false,
        })
    }
}

impl BbrInner {
    /// Builds the shedder state. `conf` must already be validated.
    fn from_parts(conf: &ShedConfig, cpu: Arc<dyn CpuUsage>, clock: SharedClock) -> Self {
        let bucket_duration = conf.bucket_duration();
        let opts = RollingOpts::new(conf.buckets, bucket_duration);
        let bucket_nanos = bucket_duration.as_nanos() as u64;
        let buckets_per_sec = (Duration::from_secs(1).as_nanos() as u64 / bucket_nanos).max(1) as i64;

        tracing::debug!(
            "Bbr: window {:?} split into {} buckets ({} per second), cpu threshold {}",
            conf.window(),
            conf.buckets,
            buckets_per_sec,
            conf.cpu_threshold
        );

        Self {
            cpu,
            pass_stat: RollingCounter::new(opts, clock.clone()),
            rt_stat: RollingCounter::new(opts, clock.clone()),
            clock,
            conf: conf.clone(),
            in_flight: AtomicI64::new(0),
            buckets_per_sec,
            bucket_nanos,
            pre_drop: AtomicU64::new(0),
            max_pass_cache: Atomic::null(),
            min_rt_cache: Atomic::null(),
        }
    }

    /// Returns the cached value if it was stored less than one bucket ago.
    fn cached(&self, slot: &Atomic<CounterCache>, now: u64) -> Option<i64> {
        let guard = epoch::pin();
        let shared = slot.load(Ordering::Acquire, &guard);
        // # Safety: The guard keeps the cache alive even if a concurrent
        // `store_cache` swaps it out; the old value is only reclaimed once
        // every pinned reader has moved on.
        let cache = unsafe { shared.as_ref() }?;
        if now.saturating_sub(cache.time) / self.bucket_nanos < 1 {
            Some(cache.val)
        } else {
            None
        }
    }

    fn store_cache(&self, slot: &Atomic<CounterCache>, val: i64, now: u64) {
        let guard = epoch::pin();
        let old = slot.swap(Owned::new(CounterCache { val, time: now }), Ordering::AcqRel, &guard);
        // # Safety: `old` is unreachable from the slot after the swap and is
        // destroyed only after all readers pinned in this epoch unpin.
        unsafe {
            if !old.is_null() {
                guard.defer_destroy(old);
            }
        }
    }

    /// Largest pass count seen in one complete bucket. The bucket still being
    /// filled is excluded. Never below 1.
    fn max_pass(&self) -> i64 {
        let now = self.clock.now_nanos();
        if let Some(val) = self.cached(&self.max_pass_cache, now) {
            return val;
        }

        let complete = self.conf.buckets.saturating_sub(1);
        let raw = self.pass_stat.reduce(|iter| {
            iter.take(complete).map(|bucket| bucket.sum()).fold(1.0, f64::max)
        }) as i64;
        let val = raw.max(1);

        self.store_cache(&self.max_pass_cache, val, now);
        val
    }

    /// Smallest per-bucket average response time in milliseconds over complete
    /// buckets. Never below 1.
    fn min_rt(&self) -> i64 {
        let now = self.clock.now_nanos();
        if let Some(val) = self.cached(&self.min_rt_cache, now) {
            return val;
        }

        let complete = self.conf.buckets.saturating_sub(1);
        let raw = self.rt_stat.reduce(|iter| {
            iter.take(complete)
                .filter(|bucket| !bucket.is_empty())
                .map(|bucket| bucket.sum() / bucket.count as f64)
                .fold(f64::MAX, f64::min)
        });
        let val = if raw >= f64::MAX { 1 } else { (raw.ceil() as i64).max(1) };

        self.store_cache(&self.min_rt_cache, val, now);
        val
    }

    /// Sustainable concurrency: peak throughput per second times the best
    /// latency in seconds, rounded half up.
    fn max_flight(&self) -> i64 {
        let product = self.max_pass() * self.min_rt() * self.buckets_per_sec;
        (product as f64 / 1e3 + 0.5).floor() as i64
    }

    fn over_limit(&self) -> bool {
        let in_flight = self.in_flight.load(Ordering::Acquire);
        in_flight > 1 && in_flight > self.max_flight()
    }

    fn should_drop(&self) -> bool {
        if !self.conf.enabled {
            return false;
        }
        let now = self.clock.now_nanos();

        if self.cpu.usage() < self.conf.cpu_threshold {
            let pre_drop = self.pre_drop.load(Ordering::Acquire);
            if pre_drop == 0 {
                return false;
            }
            // Still cooling down from the last episode.
            if now.saturating_sub(pre_drop) <= COOLDOWN.as_nanos() as u64 {
                return self.over_limit();
            }
            self.pre_drop.store(0, Ordering::Release);
            tracing::info!("Bbr: cooldown elapsed, admission restored");
            return false;
        }

        let drop = self.over_limit();
        if drop
            && self
                .pre_drop
                .compare_exchange(0, now.max(1), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            tracing::warn!(
                "Bbr: overload detected (cpu: {}, in_flight: {}, max_flight: {}). Shedding.",
                self.cpu.usage(),
                self.in_flight.load(Ordering::Acquire),
                self.max_flight()
            );
        }
        drop
    }

    fn stat(&self) -> Stat {
        Stat {
            cpu: self.cpu.usage(),
            in_flight: self.in_flight.load(Ordering::Acquire),
            max_in_flight: self.max_flight(),
            min_rt: self.min_rt(),
            max_pass: self.max_pass(),
        }
    }
}

impl Drop for BbrInner {
    fn drop(&mut self) {
        let guard = epoch::pin();
        for slot in [&self.max_pass_cache, &self.min_rt_cache] {
            let old = slot.swap(epoch::Shared::null(), Ordering::AcqRel, &guard);
            // # Safety: We own the shedder; no other handle can reach the slot.
            unsafe {
                if !old.is_null() {
                    guard.defer_destroy(old);
                }
            }
        }
    }
}

/// Outcome report for one admitted request.
///
/// Dropping a promise without calling [`pass`](Promise::pass) or
/// [`fail`](Promise::fail) reports it as failed, so in-flight accounting can
/// never leak.
#[must_use = "an admitted request must be reported with pass() or fail()"]
pub struct Promise {
    bbr: Arc<BbrInner>,
    /// Admission time in nanos since the clock epoch.
    since: u64,
    reported: bool,
}

impl Promise {
    /// The request completed usefully: counts towards throughput.
    pub fn pass(mut self) {
        self.report(true);
    }

    /// The request failed: only its latency is recorded.
    pub fn fail(mut self) {
        self.report(false);
    }

    fn report(&mut self, passed: bool) {
        if self.reported {
            return;
        }
        self.reported = true;

        let bbr = &self.bbr;
        let rt_ms = bbr.clock.now_nanos().saturating_sub(self.since) / 1_000_000;
        bbr.rt_stat.add(rt_ms);
        bbr.in_flight.fetch_sub(1, Ordering::AcqRel);

        if passed {
            bbr.pass_stat.add(1);
            if bbr.conf.debug {
                tracing::debug!("Bbr: {:?}", bbr.stat());
            }
        }
    }
}

impl Drop for Promise {
    fn drop(&mut self) {
        self.report(false);
    }
}

/// One shedder per protected endpoint, created on first use.
pub struct ShedderGroup {
    conf: ShedConfig,
    cpu: Arc<dyn CpuUsage>,
    clock: SharedClock,
    shedders: RwLock<HashMap<String, Bbr>>,
}

impl ShedderGroup {
    pub fn new(conf: ShedConfig, cpu: Arc<dyn CpuUsage>, clock: SharedClock) -> Result<Self, FlowXError> {
        conf.validate()?;
        Ok(Self {
            conf,
            cpu,
            clock,
            shedders: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the shedder guarding `endpoint`, creating it if needed.
    pub fn get(&self, endpoint: &str) -> Bbr {
        if let Some(bbr) = self.shedders.read().get(endpoint) {
            return bbr.clone();
        }
        let mut shedders = self.shedders.write();
        if let Some(bbr) = shedders.get(endpoint) {
            return bbr.clone();
        }
        let bbr = Bbr {
            inner: Arc::new(BbrInner::from_parts(&self.conf, self.cpu.clone(), self.clock.clone())),
        };
        tracing::debug!("ShedderGroup: created shedder for {}", endpoint);
        shedders.insert(endpoint.to_string(), bbr.clone());
        bbr
    }

    pub fn len(&self) -> usize {
        self.shedders.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
