pub mod clock;
pub mod config;
pub mod error;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{BalancerConfig, CpuConfig, FlowConfig, ShedConfig};
pub use error::FlowXError;

use std::sync::Arc;

/// Shared handle to the clock that drives a component.
pub type SharedClock = Arc<dyn Clock>;

/// The process-wide monotonic clock as a shared handle.
pub fn system_clock() -> SharedClock {
    Arc::new(MonotonicClock)
}

static_assertions::assert_impl_all!(ManualClock: Send, Sync);
static_assertions::assert_impl_all!(FlowXError: Send, Sync);
