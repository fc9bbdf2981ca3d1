//! # flowx-shed: Overload Protection
//!
//! CPU-aware adaptive shedding ([`Bbr`]), the CPU monitor that feeds it, and
//! static-rate limiters.

pub mod bbr;
pub mod cpu;
pub mod limiter;

pub use bbr::{Bbr, Promise, Shedder, ShedderGroup, Stat};
pub use cpu::{CgroupSampler, CpuMonitor, CpuSampler, CpuUsage, ProcStatSampler};
pub use limiter::{FixedWindow, LeakyBucket, Limiter, TokenBucket};

static_assertions::assert_impl_all!(Bbr: Send, Sync);
static_assertions::assert_impl_all!(Promise: Send);
static_assertions::assert_impl_all!(CpuMonitor: Send, Sync);
