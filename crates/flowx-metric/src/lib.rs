//! # flowx-metric: Sliding-Window Statistics
//!
//! A fixed ring of time buckets and the policy that rolls it forward with the
//! clock. Counters built on top produce sum/avg/min/max over a trailing span.

pub mod counter;
pub mod iter;
pub mod policy;
pub mod reduce;
pub mod window;

pub use counter::{RollingCounter, RollingGauge, RollingOpts};
pub use iter::Iter;
pub use policy::RollingPolicy;
pub use reduce::Aggregation;
pub use window::{Bucket, Window};

static_assertions::assert_impl_all!(RollingCounter: Send, Sync);
static_assertions::assert_impl_all!(RollingGauge: Send, Sync);
