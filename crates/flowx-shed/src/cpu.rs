//! # CPU Usage Monitor
//!
//! A background task samples CPU usage on a fixed tick and folds each sample
//! into a decayed value: `cpu = prev * decay + sample * (1 - decay)`.
//! Shedders only read the decayed value through [`CpuUsage`].

use core::sync::atomic::{AtomicU64, Ordering};
use std::fs;
use std::io;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flowx_core::CpuConfig;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

/// Upper bound of the usage scale (1000 = every available core saturated).
pub const MAX_USAGE: u64 = 1000;

/// Read-only accessor for the current CPU usage on the 0..=1000 scale.
pub trait CpuUsage: Send + Sync {
    fn usage(&self) -> u64;
}

impl<F> CpuUsage for F
where
    F: Fn() -> u64 + Send + Sync,
{
    fn usage(&self) -> u64 {
        self()
    }
}

/// A raw CPU usage source. Each call reports usage since the previous call.
pub trait CpuSampler: Send + 'static {
    fn sample(&mut self) -> io::Result<u64>;
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Host-wide usage derived from the aggregate `cpu` line of `/proc/stat`.
#[derive(Debug)]
pub struct ProcStatSampler {
    stat_path: PathBuf,
    /// (busy ticks, total ticks) at the previous sample.
    prev: Option<(u64, u64)>,
}

impl ProcStatSampler {
    pub fn new() -> io::Result<Self> {
        Self::with_root("/proc")
    }

    /// Reads `<root>/stat` instead of `/proc/stat`.
    pub fn with_root(root: impl AsRef<Path>) -> io::Result<Self> {
        let mut sampler = Self {
            stat_path: root.as_ref().join("stat"),
            prev: None,
        };
        sampler.prev = Some(sampler.read_ticks()?);
        Ok(sampler)
    }

    fn read_ticks(&self) -> io::Result<(u64, u64)> {
        let raw = fs::read_to_string(&self.stat_path)?;
        let line = raw
            .lines()
            .find(|l| l.split_whitespace().next() == Some("cpu"))
            .ok_or_else(|| invalid("no aggregate cpu line in stat"))?;

        // user nice system idle iowait irq softirq
        let fields = line
            .split_whitespace()
            .skip(1)
            .take(7)
            .map(|f| f.parse::<u64>().map_err(|e| invalid(e.to_string())))
            .collect::<io::Result<Vec<_>>>()?;
        if fields.len() < 7 {
            return Err(invalid("bad format of cpu stats"));
        }

        let total: u64 = fields.iter().sum();
        let idle = fields[3] + fields[4];
        Ok((total - idle, total))
    }
}

impl CpuSampler for ProcStatSampler {
    fn sample(&mut self) -> io::Result<u64> {
        let (busy, total) = self.read_ticks()?;
        let usage = match self.prev {
            Some((prev_busy, prev_total)) if total > prev_total => {
                busy.saturating_sub(prev_busy) * MAX_USAGE / (total - prev_total)
            }
            _ => 0,
        };
        self.prev = Some((busy, total));
        Ok(usage.min(MAX_USAGE))
    }
}

/// Usage of the current cgroup (v2) relative to its CPU quota.
#[derive(Debug)]
pub struct CgroupSampler {
    root: PathBuf,
    /// Logical cores available to the cgroup, after applying `cpu.max`.
    quota: f64,
    prev_usage_usec: u64,
    prev_at: Instant,
}

impl CgroupSampler {
    pub fn new() -> io::Result<Self> {
        Self::with_root("/sys/fs/cgroup")
    }

    pub fn with_root(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let cores = num_cpus::get() as f64;
        let quota = match Self::read_max(&root)? {
            Some(limit) if limit < cores => limit,
            _ => cores,
        };
        let prev_usage_usec = Self::read_usage_usec(&root)?;
        Ok(Self {
            root,
            quota,
            prev_usage_usec,
            prev_at: Instant::now(),
        })
    }

    pub fn quota(&self) -> f64 {
        self.quota
    }

    /// `cpu.max` holds `"<quota> <period>"` or `"max <period>"`.
    fn read_max(root: &Path) -> io::Result<Option<f64>> {
        let raw = match fs::read_to_string(root.join("cpu.max")) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut parts = raw.split_whitespace();
        let (Some(quota), Some(period)) = (parts.next(), parts.next()) else {
            return Err(invalid("bad format of cpu.max"));
        };
        if quota == "max" {
            return Ok(None);
        }
        let quota: f64 = quota.parse().map_err(|_| invalid("bad cpu.max quota"))?;
        let period: f64 = period.parse().map_err(|_| invalid("bad cpu.max period"))?;
        if period <= 0.0 {
            return Err(invalid("cpu.max period must be > 0"));
        }
        Ok(Some(quota / period))
    }

    fn read_usage_usec(root: &Path) -> io::Result<u64> {
        let raw = fs::read_to_string(root.join("cpu.stat"))?;
        raw.lines()
            .find_map(|line| line.strip_prefix("usage_usec "))
            .ok_or_else(|| invalid("no usage_usec in cpu.stat"))?
            .trim()
            .parse()
            .map_err(|_| invalid("bad usage_usec value"))
    }
}

impl CpuSampler for CgroupSampler {
    fn sample(&mut self) -> io::Result<u64> {
        let usage_usec = Self::read_usage_usec(&self.root)?;
        let now = Instant::now();
        let wall_usec = now.duration_since(self.prev_at).as_micros() as f64;

        let used = usage_usec.saturating_sub(self.prev_usage_usec) as f64;
        let usage = if wall_usec > 0.0 {
            (used * MAX_USAGE as f64 / (wall_usec * self.quota)) as u64
        } else {
            0
        };

        self.prev_usage_usec = usage_usec;
        self.prev_at = now;
        Ok(usage.min(MAX_USAGE))
    }
}

/// Picks the cgroup sampler when the cgroup v2 files are readable, else
/// falls back to `/proc/stat`.
pub fn default_sampler() -> io::Result<Box<dyn CpuSampler>> {
    match CgroupSampler::new() {
        Ok(sampler) => Ok(Box::new(sampler)),
        Err(e) => {
            tracing::debug!("CpuMonitor: cgroup sampler unavailable ({}), using /proc/stat", e);
            Ok(Box::new(ProcStatSampler::new()?))
        }
    }
}

impl CpuSampler for Box<dyn CpuSampler> {
    fn sample(&mut self) -> io::Result<u64> {
        (**self).sample()
    }
}

/// Process-wide decayed CPU usage.
///
/// ## Lifecycle
/// Created once at startup, driven by [`CpuMonitor::spawn`], and handed to
/// every shedder as an `Arc<dyn CpuUsage>`. Clones share the same value.
#[derive(Debug, Clone)]
pub struct CpuMonitor {
    value: Arc<AtomicU64>,
    decay: f64,
}

impl CpuMonitor {
    pub fn new(decay: f64) -> Self {
        Self {
            value: Arc::new(AtomicU64::new(0)),
            decay,
        }
    }

    pub fn from_config(config: &CpuConfig) -> Self {
        Self::new(config.decay)
    }

    /// Folds one raw sample into the decayed value and returns the new value.
    pub fn record(&self, sample: u64) -> u64 {
        let fold = |prev: u64| -> u64 {
            (prev as f64 * self.decay + sample as f64 * (1.0 - self.decay)) as u64
        };
        match self
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| Some(fold(prev)))
        {
            Ok(prev) | Err(prev) => fold(prev),
        }
    }

    /// Starts the sampling loop on the current tokio runtime.
    ///
    /// The loop ticks every `interval`. A failed sample is logged and skipped.
    /// A panicking sampler restarts the loop with the same sampler and ticker,
    /// so the restart waits for the next tick.
    pub fn spawn<S: CpuSampler>(&self, sampler: S, interval: Duration) -> JoinHandle<()> {
        let monitor = self.clone();
        let sampler = Mutex::new(sampler);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let run = monitor.sample_loop(&sampler, &mut ticker);
                if let Err(panic) = AssertUnwindSafe(run).catch_unwind().await {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_default();
                    tracing::error!("CpuMonitor: sampling loop panicked ({}), restarting", reason);
                }
            }
        })
    }

    async fn sample_loop<S: CpuSampler>(&self, sampler: &Mutex<S>, ticker: &mut Interval) {
        loop {
            ticker.tick().await;
            let sample = sampler.lock().sample();
            match sample {
                Ok(raw) => {
                    let cur = self.record(raw);
                    tracing::trace!(raw, cur, "CpuMonitor: sample folded");
                }
                Err(e) => tracing::warn!("CpuMonitor: failed to sample cpu usage: {}", e),
            }
        }
    }
}

impl CpuUsage for CpuMonitor {
    fn usage(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }
}
