//! # Shed Layer Tests: CPU Monitor and Samplers
//!
//! Validates the decayed fold, the file-backed samplers against fake
//! `/proc` and cgroup trees, and the background sampling task.

use flowx_core::CpuConfig;
use flowx_shed::cpu::MAX_USAGE;
use flowx_shed::{CgroupSampler, CpuMonitor, CpuSampler, CpuUsage, ProcStatSampler};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn write(dir: &Path, name: &str, contents: &str) {
    fs::write(dir.join(name), contents).expect("write fake cpu file");
}

/// Verifies `cpu = prev * 0.95 + sample * 0.05`, truncated.
#[test]
fn test_record_folds_with_decay() {
    let monitor = CpuMonitor::from_config(&CpuConfig::default());
    assert_eq!(monitor.usage(), 0);

    assert_eq!(monitor.record(1000), 50);
    // 50 * 0.95 + 50 = 97.5
    assert_eq!(monitor.record(1000), 97);
    assert_eq!(monitor.usage(), 97);

    let shared = monitor.clone();
    shared.record(0);
    assert_eq!(monitor.usage(), 92, "clones share the value");
}

/// Verifies a steady sample converges on itself.
#[test]
fn test_record_converges() {
    let monitor = CpuMonitor::new(0.5);
    for _ in 0..64 {
        monitor.record(800);
    }
    let usage = monitor.usage();
    assert!((798..=800).contains(&usage), "converged to {}", usage);
}

/// Verifies usage is the busy share of the tick delta between samples.
#[test]
fn test_proc_stat_sampler_delta() {
    let dir = tempfile::tempdir().expect("temp dir");
    write(
        dir.path(),
        "stat",
        "cpu  100 0 100 800 0 0 0 0 0 0\ncpu0 100 0 100 800 0 0 0 0 0 0\nintr 0\n",
    );
    let mut sampler = ProcStatSampler::with_root(dir.path()).expect("sampler");

    write(dir.path(), "stat", "cpu  200 0 200 1400 0 0 0 0 0 0\n");
    // busy 200 -> 400 over total 1000 -> 1800
    assert_eq!(sampler.sample().expect("sample"), 250);

    write(dir.path(), "stat", "cpu  200 0 200 1400 0 0 0 0 0 0\n");
    assert_eq!(sampler.sample().expect("sample"), 0, "no ticks elapsed");
}

/// Verifies malformed or missing stat files are errors, not panics.
#[test]
fn test_proc_stat_sampler_rejects_bad_input() {
    let dir = tempfile::tempdir().expect("temp dir");
    assert!(ProcStatSampler::with_root(dir.path()).is_err());

    write(dir.path(), "stat", "intr 0\nctxt 12\n");
    let err = ProcStatSampler::with_root(dir.path()).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);

    write(dir.path(), "stat", "cpu 1 2 3\n");
    assert!(ProcStatSampler::with_root(dir.path()).is_err());
}

/// Verifies the cgroup quota is read from `cpu.max` and capped by host cores.
#[test]
fn test_cgroup_sampler_quota() {
    let dir = tempfile::tempdir().expect("temp dir");
    write(dir.path(), "cpu.stat", "usage_usec 1000\nuser_usec 600\nsystem_usec 400\n");
    let cores = num_cpus::get() as f64;

    write(dir.path(), "cpu.max", "50000 100000\n");
    assert_eq!(CgroupSampler::with_root(dir.path()).expect("sampler").quota(), 0.5);

    write(dir.path(), "cpu.max", "max 100000\n");
    assert_eq!(CgroupSampler::with_root(dir.path()).expect("sampler").quota(), cores);

    fs::remove_file(dir.path().join("cpu.max")).expect("remove cpu.max");
    assert_eq!(CgroupSampler::with_root(dir.path()).expect("sampler").quota(), cores);

    write(dir.path(), "cpu.max", "garbage\n");
    assert!(CgroupSampler::with_root(dir.path()).is_err());
}

/// Verifies a cgroup sample is clamped to the usage scale.
#[test]
fn test_cgroup_sampler_clamps_usage() {
    let dir = tempfile::tempdir().expect("temp dir");
    write(dir.path(), "cpu.max", "10000 100000\n");
    write(dir.path(), "cpu.stat", "usage_usec 0\n");
    let mut sampler = CgroupSampler::with_root(dir.path()).expect("sampler");

    std::thread::sleep(Duration::from_millis(10));
    // Far more CPU time than 0.1 cores could burn in the elapsed wall time.
    write(dir.path(), "cpu.stat", "usage_usec 60000000\n");
    assert_eq!(sampler.sample().expect("sample"), MAX_USAGE);

    fs::remove_file(dir.path().join("cpu.stat")).expect("remove cpu.stat");
    assert!(sampler.sample().is_err());
}

struct FixedSampler(u64);

impl CpuSampler for FixedSampler {
    fn sample(&mut self) -> io::Result<u64> {
        Ok(self.0)
    }
}

/// Panics on its first sample, then reports full load.
struct FlakySampler {
    calls: Arc<AtomicUsize>,
}

impl CpuSampler for FlakySampler {
    fn sample(&mut self) -> io::Result<u64> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("sampler exploded");
        }
        Ok(MAX_USAGE)
    }
}

/// Panics on every sample.
struct BrokenSampler {
    calls: Arc<AtomicUsize>,
}

impl CpuSampler for BrokenSampler {
    fn sample(&mut self) -> io::Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("sampler always fails");
    }
}

/// Verifies the background task folds samples into the shared value.
#[tokio::test]
async fn test_spawned_monitor_updates_usage() {
    let monitor = CpuMonitor::new(0.5);
    let handle = monitor.spawn(FixedSampler(600), Duration::from_millis(5));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let usage = monitor.usage();
    handle.abort();

    assert!(usage > 500 && usage <= 600, "usage {} did not converge on 600", usage);
}

/// Verifies a panicking sampler restarts the loop instead of stopping it.
#[tokio::test]
async fn test_spawned_monitor_survives_panic() {
    let calls = Arc::new(AtomicUsize::new(0));
    let monitor = CpuMonitor::new(0.5);
    let handle = monitor.spawn(FlakySampler { calls: calls.clone() }, Duration::from_millis(5));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!handle.is_finished(), "sampling task must keep running");
    handle.abort();

    assert!(calls.load(Ordering::SeqCst) > 1, "sampler was not called again after panic");
    assert!(monitor.usage() > 0);
}

/// Verifies a sampler that always panics is retried once per tick, not in a
/// tight loop.
#[tokio::test]
async fn test_spawned_monitor_restart_waits_for_tick() {
    let calls = Arc::new(AtomicUsize::new(0));
    let monitor = CpuMonitor::new(0.95);
    let handle = monitor.spawn(BrokenSampler { calls: calls.clone() }, Duration::from_millis(250));

    tokio::time::sleep(Duration::from_millis(600)).await;
    handle.abort();

    let n = calls.load(Ordering::SeqCst);
    assert!((1..=4).contains(&n), "sampler called {} times in 600ms at a 250ms tick", n);
    assert_eq!(monitor.usage(), 0);
}
