use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use flowx_core::{BalancerConfig, FlowXError, SharedClock};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::code::Code;

/// Health score of a backend that has never failed.
pub const INIT_SUCCESS: u64 = 1000;
/// Backends at or below this score are avoided when drawing candidates.
pub const THROTTLE_SUCCESS: u64 = INIT_SUCCESS / 2;
/// Load reported for a backend with no usable score.
pub const PENALTY: i64 = i32::MAX as i64;
/// Random draws attempted to find a healthy pair.
const PICK_TIMES: usize = 3;

/// A ready backend handed to the builder.
#[derive(Debug, Clone)]
pub struct Backend<C> {
    pub addr: String,
    pub conn: C,
}

impl<C> Backend<C> {
    pub fn new(addr: impl Into<String>, conn: C) -> Self {
        Self {
            addr: addr.into(),
            conn,
        }
    }
}

/// Decayed score of one backend. All timestamps are nanos since the clock epoch.
struct Node<C> {
    addr: String,
    conn: C,
    /// Decayed round-trip latency in nanos.
    lag_ewma: AtomicU64,
    in_flight: AtomicI64,
    /// Decayed health, `INIT_SUCCESS` = always succeeded.
    success_ewma: AtomicU64,
    /// Selections since the last stats flush.
    requests: AtomicI64,
    last_lag: AtomicU64,
    pick_time: AtomicU64,
}

impl<C> Node<C> {
    fn new(backend: Backend<C>) -> Self {
        Self {
            addr: backend.addr,
            conn: backend.conn,
            lag_ewma: AtomicU64::new(0),
            in_flight: AtomicI64::new(0),
            success_ewma: AtomicU64::new(INIT_SUCCESS),
            requests: AtomicI64::new(0),
            last_lag: AtomicU64::new(0),
            pick_time: AtomicU64::new(0),
        }
    }

    fn healthy(&self) -> bool {
        self.success_ewma.load(Ordering::Acquire) > THROTTLE_SUCCESS
    }

    /// `sqrt(lag + 1) * (in_flight + 1)`: latency is damped, queue depth is not.
    fn load(&self) -> i64 {
        let lag = ((self.lag_ewma.load(Ordering::Acquire) as f64) + 1.0).sqrt() as i64;
        let load = lag * (self.in_flight.load(Ordering::Acquire) + 1);
        if load == 0 {
            return PENALTY;
        }
        load
    }
}

/// Point-in-time view of one backend's score.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeStat {
    pub addr: String,
    pub load: i64,
    pub in_flight: i64,
    pub lag_ewma: u64,
    pub success_ewma: u64,
    pub requests: i64,
}

struct PickerInner<C> {
    nodes: Vec<Node<C>>,
    rng: Mutex<StdRng>,
    clock: SharedClock,
    decay_nanos: f64,
    force_pick_nanos: u64,
    log_interval_nanos: u64,
    /// Time of the last stats flush.
    stamp: AtomicU64,
}

/// Power-of-two-choices picker over a fixed set of backends.
///
/// ## Selection
/// Two distinct backends are drawn at random (preferring a healthy pair) and
/// the one with the lower load wins, unless the loser has not been selected
/// for longer than the force-pick interval, in which case it is taken once to
/// refresh its score.
pub struct P2cPicker<C> {
    inner: Arc<PickerInner<C>>,
}

impl<C> Clone for P2cPicker<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Builds pickers. Every build starts from fresh scores.
#[derive(Debug, Clone)]
pub struct P2cBuilder {
    conf: BalancerConfig,
    clock: SharedClock,
    seed: Option<u64>,
}

impl P2cBuilder {
    pub fn new(conf: BalancerConfig, clock: SharedClock) -> Self {
        Self {
            conf,
            clock,
            seed: None,
        }
    }

    /// Makes candidate draws reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build<C, I>(&self, ready: I) -> P2cPicker<C>
    where
        I: IntoIterator<Item = Backend<C>>,
    {
        let nodes: Vec<Node<C>> = ready.into_iter().map(Node::new).collect();
        tracing::info!(
            "P2cBuilder: building picker over [{}]",
            nodes.iter().map(|n| n.addr.as_str()).collect::<Vec<_>>().join(", ")
        );

        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        P2cPicker {
            inner: Arc::new(PickerInner {
                nodes,
                rng: Mutex::new(rng),
                clock: self.clock.clone(),
                decay_nanos: self.conf.decay_time().as_nanos() as f64,
                force_pick_nanos: self.conf.force_pick().as_nanos() as u64,
                log_interval_nanos: self.conf.log_interval().as_nanos() as u64,
                stamp: AtomicU64::new(0),
            }),
        }
    }
}

impl<C: Clone> P2cPicker<C> {
    /// Selects a backend and returns it with the handle that reports its completion.
    pub fn pick(&self) -> Result<Pick<C>, FlowXError> {
        let inner = &self.inner;
        let chosen = {
            let mut rng = inner.rng.lock();
            match inner.nodes.len() {
                0 => return Err(FlowXError::NoBackendAvailable),
                1 => inner.choose(0, None),
                2 => {
                    let a = rng.gen_range(0..2);
                    inner.choose(a, Some(1 - a))
                }
                n => {
                    let (mut a, mut b) = (0, 1);
                    for _ in 0..PICK_TIMES {
                        a = rng.gen_range(0..n);
                        b = rng.gen_range(0..n - 1);
                        if b >= a {
                            b += 1;
                        }
                        if inner.nodes[a].healthy() && inner.nodes[b].healthy() {
                            break;
                        }
                    }
                    inner.choose(a, Some(b))
                }
            }
        };

        let node = &inner.nodes[chosen];
        node.in_flight.fetch_add(1, Ordering::AcqRel);
        node.requests.fetch_add(1, Ordering::AcqRel);

        Ok(Pick {
            conn: node.conn.clone(),
            addr: node.addr.clone(),
            done: Done {
                picker: inner.clone(),
                index: chosen,
                start: inner.clock.now_nanos(),
                finished: false,
            },
        })
    }
}

impl<C> P2cPicker<C> {
    pub fn len(&self) -> usize {
        self.inner.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.nodes.is_empty()
    }

    pub fn stats(&self) -> Vec<NodeStat> {
        self.inner
            .nodes
            .iter()
            .map(|node| NodeStat {
                addr: node.addr.clone(),
                load: node.load(),
                in_flight: node.in_flight.load(Ordering::Acquire),
                lag_ewma: node.lag_ewma.load(Ordering::Acquire),
                success_ewma: node.success_ewma.load(Ordering::Acquire),
                requests: node.requests.load(Ordering::Acquire),
            })
            .collect()
    }
}

impl<C> PickerInner<C> {
    fn choose(&self, a: usize, b: Option<usize>) -> usize {
        // 0 is reserved for "never picked".
        let start = self.clock.now_nanos().max(1);
        let Some(b) = b else {
            self.nodes[a].pick_time.store(start, Ordering::Release);
            return a;
        };

        let (low, high) = if self.nodes[a].load() > self.nodes[b].load() {
            (b, a)
        } else {
            (a, b)
        };

        // Give the disfavoured backend a turn if it has been starved too long.
        let pick = self.nodes[high].pick_time.load(Ordering::Acquire);
        if (pick == 0 || start.saturating_sub(pick) > self.force_pick_nanos)
            && self.nodes[high]
                .pick_time
                .compare_exchange(pick, start, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return high;
        }

        self.nodes[low].pick_time.store(start, Ordering::Release);
        low
    }

    fn complete(&self, index: usize, start: u64, outcome: Result<(), Code>) {
        let node = &self.nodes[index];
        node.in_flight.fetch_sub(1, Ordering::AcqRel);

        let now = self.clock.now_nanos();
        let last = node.last_lag.swap(now, Ordering::AcqRel);
        let td = now.saturating_sub(last);

        // Newton's law of cooling: beta = e^(-td / decay).
        let mut beta = (-(td as f64) / self.decay_nanos).exp();
        let lag = now.saturating_sub(start);
        let old_lag = node.lag_ewma.load(Ordering::Acquire);
        if old_lag == 0 {
            beta = 0.0;
        }
        let lag_ewma = old_lag as f64 * beta + lag as f64 * (1.0 - beta);
        node.lag_ewma.store(lag_ewma as u64, Ordering::Release);

        let success = match outcome {
            Err(code) if code.is_failure() => 0,
            _ => INIT_SUCCESS,
        };
        let old_success = node.success_ewma.load(Ordering::Acquire);
        let success_ewma = old_success as f64 * beta + success as f64 * (1.0 - beta);
        node.success_ewma.store(success_ewma as u64, Ordering::Release);

        let stamp = self.stamp.load(Ordering::Acquire);
        if (stamp == 0 || now.saturating_sub(stamp) >= self.log_interval_nanos)
            && self
                .stamp
                .compare_exchange(stamp, now.max(1), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.flush_stats();
        }
    }

    /// Logs per-backend load and resets the request counters.
    fn flush_stats(&self) {
        let stats = self
            .nodes
            .iter()
            .map(|node| {
                format!(
                    "conn: {}, load: {}, reqs: {}",
                    node.addr,
                    node.load(),
                    node.requests.swap(0, Ordering::AcqRel)
                )
            })
            .collect::<Vec<_>>();
        tracing::info!("P2cPicker: {}", stats.join("; "));
    }
}

/// A selected backend.
pub struct Pick<C> {
    pub conn: C,
    pub addr: String,
    pub done: Done<C>,
}

/// Completion handle for one picked call.
///
/// Dropping it without [`finish`](Done::finish) only releases the in-flight
/// slot; the backend's scores are left untouched.
#[must_use = "report the call outcome with finish()"]
pub struct Done<C> {
    picker: Arc<PickerInner<C>>,
    index: usize,
    /// Selection time in nanos since the clock epoch.
    start: u64,
    finished: bool,
}

impl<C> Done<C> {
    /// Folds the call's latency and outcome into the backend's decayed scores.
    pub fn finish(mut self, outcome: Result<(), Code>) {
        self.finished = true;
        self.picker.complete(self.index, self.start, outcome);
    }
}

impl<C> Drop for Done<C> {
    fn drop(&mut self) {
        if !self.finished {
            self.picker.nodes[self.index]
                .in_flight
                .fetch_sub(1, Ordering::AcqRel);
        }
    }
}
