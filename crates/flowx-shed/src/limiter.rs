//! # Local Rate Limiters
//!
//! Static-rate gates for callers that need a fixed ceiling rather than the
//! adaptive one computed by [`Bbr`](crate::Bbr).

use std::time::Duration;

use flowx_core::SharedClock;
use parking_lot::Mutex;

/// A yes/no admission gate.
pub trait Limiter: Send + Sync {
    fn allow(&self) -> bool;
}

struct LeakyState {
    water: f64,
    last_leak_ms: u64,
}

/// Leaky bucket: water drains at `rate` units per second; a request adds one
/// unit and is admitted only while the level stays below `capacity`.
pub struct LeakyBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<LeakyState>,
    clock: SharedClock,
}

impl LeakyBucket {
    pub fn new(rate: f64, capacity: f64, clock: SharedClock) -> Self {
        let last_leak_ms = clock.now().as_millis() as u64;
        Self {
            rate,
            capacity,
            state: Mutex::new(LeakyState {
                water: 0.0,
                last_leak_ms,
            }),
            clock,
        }
    }
}

impl Limiter for LeakyBucket {
    fn allow(&self) -> bool {
        let now = self.clock.now().as_millis() as u64;
        let mut state = self.state.lock();

        let leaked = now.saturating_sub(state.last_leak_ms) as f64 * self.rate / 1000.0;
        state.water = (state.water - leaked).max(0.0);
        state.last_leak_ms = now;

        if state.water + 1.0 < self.capacity {
            state.water += 1.0;
            true
        } else {
            false
        }
    }
}

struct TokenState {
    tokens: f64,
    last_refill: Duration,
}

/// Token bucket: refills `rate` tokens per second up to `capacity`; each
/// request takes one token. Starts full.
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<TokenState>,
    clock: SharedClock,
}

impl TokenBucket {
    pub fn new(rate: f64, capacity: f64, clock: SharedClock) -> Self {
        let last_refill = clock.now();
        Self {
            rate,
            capacity,
            state: Mutex::new(TokenState {
                tokens: capacity,
                last_refill,
            }),
            clock,
        }
    }

    /// Tokens currently available, after refilling up to now.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    fn refill(&self, state: &mut TokenState) {
        let now = self.clock.now();
        let elapsed = now.saturating_sub(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.last_refill = now;
    }
}

impl Limiter for TokenBucket {
    fn allow(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct WindowState {
    begin: Duration,
    count: u64,
}

/// Fixed-window counter: at most `limit` admissions per `cycle`, the window
/// restarting at the first request after it expires.
pub struct FixedWindow {
    limit: u64,
    cycle: Duration,
    state: Mutex<WindowState>,
    clock: SharedClock,
}

impl FixedWindow {
    pub fn new(limit: u64, cycle: Duration, clock: SharedClock) -> Self {
        let begin = clock.now();
        Self {
            limit,
            cycle,
            state: Mutex::new(WindowState { begin, count: 0 }),
            clock,
        }
    }
}

impl Limiter for FixedWindow {
    fn allow(&self) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();

        if now.saturating_sub(state.begin) >= self.cycle {
            state.begin = now;
            state.count = 0;
        }
        if state.count < self.limit {
            state.count += 1;
            true
        } else {
            false
        }
    }
}
