use std::time::Duration;

use flowx_core::SharedClock;
use parking_lot::RwLock;

use crate::iter::Iter;
use crate::window::{Bucket, Window};

struct PolicyState {
    window: Window,
    /// Bucket currently being filled.
    offset: usize,
    /// Start of the current bucket, in nanos since the clock epoch. Always
    /// advanced by whole bucket durations so bucket boundaries stay aligned.
    last_append: u64,
}

/// Maps clock time onto a moving cursor in a [`Window`].
///
/// ## Ring Recycling
/// Every write first moves the cursor forward by the number of whole bucket
/// durations elapsed since the last write and resets each bucket it skips.
/// The work is bounded by the ring size no matter how long the policy sat idle.
///
/// ## Locking
/// Writers take the write lock. `reduce` takes the read lock, so concurrent
/// reducers share access but exclude writers.
pub struct RollingPolicy {
    state: RwLock<PolicyState>,
    size: usize,
    bucket_nanos: u64,
    clock: SharedClock,
}

impl RollingPolicy {
    pub fn new(window: Window, bucket_duration: Duration, clock: SharedClock) -> Self {
        let bucket_nanos = bucket_duration.as_nanos() as u64;
        assert!(bucket_nanos > 0, "RollingPolicy: bucket duration must be > 0");
        let size = window.size();
        let last_append = clock.now_nanos();
        Self {
            state: RwLock::new(PolicyState {
                window,
                offset: 0,
                last_append,
            }),
            size,
            bucket_nanos,
            clock,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn bucket_duration(&self) -> Duration {
        Duration::from_nanos(self.bucket_nanos)
    }

    /// Whole bucket durations elapsed since `last_append`, unclamped.
    #[inline(always)]
    fn elapsed_buckets(&self, state: &PolicyState, now: u64) -> u64 {
        now.saturating_sub(state.last_append) / self.bucket_nanos
    }

    /// Whole bucket durations elapsed since the last write, clamped to `[0, size]`.
    /// A value of `size` means the entire window is stale.
    pub fn timespan(&self) -> usize {
        let now = self.clock.now_nanos();
        let state = self.state.read();
        self.clamp(self.elapsed_buckets(&state, now))
    }

    #[inline(always)]
    fn clamp(&self, elapsed: u64) -> usize {
        elapsed.min(self.size as u64) as usize
    }

    fn write_with(&self, val: f64, write: fn(&mut Window, usize, f64)) {
        let now = self.clock.now_nanos();
        let mut state = self.state.write();

        let elapsed = self.elapsed_buckets(&state, now);
        if elapsed > 0 {
            state.last_append += elapsed * self.bucket_nanos;

            let span = self.clamp(elapsed);
            tracing::trace!(span, offset = state.offset, "RollingPolicy: recycling stale buckets");

            let mut offset = state.offset;
            for _ in 0..span {
                offset = state.window.next_offset(offset);
                state.window.reset_bucket(offset);
            }
            state.offset = offset;
        }

        let offset = state.offset;
        write(&mut state.window, offset, val);
    }

    /// Merges `val` into the running point of the current bucket.
    pub fn add(&self, val: f64) {
        self.write_with(val, Window::add_bucket_point);
    }

    /// Pushes `val` as a new point of the current bucket.
    pub fn append(&self, val: f64) {
        self.write_with(val, Window::append_bucket_point);
    }

    /// Applies `f` to the buckets that are still inside the trailing window.
    ///
    /// Iteration starts right after the current bucket, skips the `timespan`
    /// buckets that went stale since the last write, and ends on the current
    /// bucket. Returns `0.0` when the whole window is stale.
    pub fn reduce<F>(&self, f: F) -> f64
    where
        F: FnOnce(Iter<'_>) -> f64,
    {
        let now = self.clock.now_nanos();
        let state = self.state.read();

        let span = self.clamp(self.elapsed_buckets(&state, now));
        let count = self.size - span;
        if count == 0 {
            return 0.0;
        }

        let mut offset = state.offset + span + 1;
        if offset >= self.size {
            offset -= self.size;
        }
        f(state.window.iter(offset, count))
    }

    /// Index of the bucket currently being filled.
    pub fn offset(&self) -> usize {
        self.state.read().offset
    }

    /// Copies every bucket in storage order (index 0 first).
    pub fn snapshot(&self) -> Vec<Bucket> {
        let state = self.state.read();
        (0..self.size).map(|i| state.window.bucket(i).clone()).collect()
    }
}

impl core::fmt::Debug for RollingPolicy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RollingPolicy")
            .field("size", &self.size)
            .field("bucket_duration", &self.bucket_duration())
            .field("offset", &self.offset())
            .finish()
    }
}
