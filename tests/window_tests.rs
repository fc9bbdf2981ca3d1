//! # Metric Layer Tests: Window, RollingPolicy, RollingCounter
//!
//! Validates bucket recycling, reducer arithmetic and the trailing-span
//! semantics of the rolling window.

use flowx_core::{system_clock, ManualClock, SharedClock};
use flowx_metric::{reduce, Aggregation, Bucket, RollingCounter, RollingGauge, RollingOpts};
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const MS: Duration = Duration::from_millis(1);

fn manual(start: Duration) -> (Arc<ManualClock>, SharedClock) {
    let clock = Arc::new(ManualClock::new(start));
    let shared: SharedClock = clock.clone();
    (clock, shared)
}

fn bucket(points: &[f64], count: u64) -> Bucket {
    Bucket {
        points: points.to_vec(),
        count,
    }
}

/// Fills every bucket of a `size`-bucket counter with `index + 1`, leaving the
/// cursor on the last bucket.
fn filled_counter(size: usize, clock: &ManualClock, shared: SharedClock) -> RollingCounter {
    let counter = RollingCounter::new(RollingOpts::new(size, 100 * MS), shared);
    for i in 0..size {
        if i > 0 {
            clock.advance(100 * MS);
        }
        counter.add(i as u64 + 1);
    }
    counter
}

/// Verifies that after `k` idle bucket durations the next write resets exactly
/// the `k` buckets it skips, for every `k` in `0..=size` and beyond.
#[test]
fn test_window_recycling_resets_exactly_skipped_buckets() {
    let size = 10;
    for k in (0..=size).chain([size + 1, 3 * size]) {
        let (clock, shared) = manual(Duration::from_secs(1));
        let counter = filled_counter(size, &clock, shared);
        assert_eq!(counter.policy().offset(), size - 1);

        clock.advance(100 * MS * k as u32);
        counter.add(100);

        let span = k.min(size);
        let last = (size - 1 + span) % size;
        let reset: Vec<usize> = (1..=span).map(|m| (size - 1 + m) % size).collect();

        let snapshot = counter.policy().snapshot();
        for (i, got) in snapshot.iter().enumerate() {
            let expected = if k == 0 && i == last {
                bucket(&[size as f64 + 100.0], 2)
            } else if i == last {
                bucket(&[100.0], 1)
            } else if reset.contains(&i) {
                bucket(&[], 0)
            } else {
                bucket(&[i as f64 + 1.0], 1)
            };
            assert_eq!(*got, expected, "k = {}, bucket {}", k, i);
        }
        assert_eq!(counter.policy().offset(), last, "k = {}", k);
    }
}

/// Verifies `timespan` counts whole bucket durations and clamps at the size.
#[test]
fn test_timespan_clamps_to_window_size() {
    let (clock, shared) = manual(Duration::from_secs(5));
    let counter = RollingCounter::new(RollingOpts::new(4, 250 * MS), shared);
    assert_eq!(counter.timespan(), 0);

    clock.advance(249 * MS);
    assert_eq!(counter.timespan(), 0);
    clock.advance(MS);
    assert_eq!(counter.timespan(), 1);
    clock.advance(500 * MS);
    assert_eq!(counter.timespan(), 3);
    clock.advance(Duration::from_secs(60));
    assert_eq!(counter.timespan(), 4);
}

/// Verifies sum/avg/min/max against hand-computed values over known buckets.
#[test]
fn test_reduce_aggregates_known_buckets() {
    let (clock, shared) = manual(Duration::from_secs(1));
    let counter = RollingCounter::new(RollingOpts::new(5, Duration::from_secs(1)), shared);

    // bucket 0: one running point 8 from two samples
    counter.add(3);
    counter.add(5);
    // bucket 1: 10
    clock.advance(Duration::from_secs(1));
    counter.add(10);
    // bucket 2 skipped, bucket 3: 3 from three samples
    clock.advance(Duration::from_secs(2));
    counter.add(1);
    counter.add(1);
    counter.add(1);

    assert_eq!(counter.sum(), 21.0);
    assert_eq!(counter.avg(), 21.0 / 6.0);
    assert_eq!(counter.min(), 3.0);
    assert_eq!(counter.max(), 10.0);
    assert_eq!(counter.value(), 21);

    // Two idle buckets push bucket 0 out of the trailing span.
    clock.advance(Duration::from_secs(2));
    assert_eq!(counter.timespan(), 2);
    assert_eq!(counter.sum(), 13.0);
    assert_eq!(counter.max(), 10.0);

    // Idle for longer than the window: nothing left.
    clock.advance(Duration::from_secs(10));
    assert_eq!(counter.sum(), 0.0);
    assert_eq!(counter.min(), 0.0);
    assert_eq!(counter.avg(), 0.0);
}

/// Verifies `avg` divides by the number of points, not the number of buckets.
#[test]
fn test_gauge_avg_divides_by_point_count() {
    let (clock, shared) = manual(Duration::from_secs(1));
    let gauge = RollingGauge::new(RollingOpts::new(4, Duration::from_secs(1)), shared);

    gauge.add(2.0);
    gauge.add(4.0);
    clock.advance(Duration::from_secs(1));
    gauge.add(6.0);

    assert_eq!(gauge.avg(), 4.0);
    assert_eq!(gauge.sum(), 12.0);
    assert_eq!(gauge.min(), 2.0);
    assert_eq!(gauge.max(), 6.0);

    let points = gauge.reduce(|iter| iter.map(|b| b.points.len() as f64).sum());
    assert_eq!(points, 3.0);
}

/// Verifies repeated reductions of an idle window return the same value.
#[test]
fn test_idle_window_reduce_is_idempotent() {
    let (clock, shared) = manual(Duration::from_secs(1));
    let counter = RollingCounter::new(RollingOpts::new(8, 100 * MS), shared);
    for _ in 0..8 {
        counter.add(7);
        clock.advance(100 * MS);
    }
    clock.advance(250 * MS);

    let first = counter.sum();
    for _ in 0..100 {
        assert_eq!(counter.sum(), first);
        assert_eq!(counter.reduce(reduce::max), 7.0);
    }
}

/// Verifies iteration walks ring order from the bucket after the cursor.
#[test]
fn test_reduce_iterates_in_ring_order() {
    let (clock, shared) = manual(Duration::from_secs(1));
    let counter = RollingCounter::new(RollingOpts::new(4, 100 * MS), shared);
    for v in [1, 2, 3, 4, 5, 6] {
        counter.add(v);
        clock.advance(100 * MS);
    }
    // Cursor wrapped to bucket 1 (value 6); one idle bucket since.
    let order = counter.reduce(|iter| {
        assert_eq!(iter.len(), 3);
        iter.fold(0.0, |acc, b| acc * 10.0 + b.sum())
    });
    assert_eq!(order, 456.0);
}

/// Verifies reading past the declared bucket count is a hard failure.
#[test]
#[should_panic(expected = "iteration out of range")]
fn test_iterator_overrun_panics() {
    let (_clock, shared) = manual(Duration::from_secs(1));
    let counter = RollingCounter::new(RollingOpts::new(4, 100 * MS), shared);
    counter.add(1);
    counter.reduce(|mut iter| {
        for _ in 0..=iter.len() {
            iter.bucket();
        }
        0.0
    });
}

/// Scenario: 10,000 `add(1)` spread over a 10s/100-bucket window.
#[test]
fn test_ten_thousand_adds_over_full_window() {
    let (clock, shared) = manual(Duration::from_secs(3));
    let counter = RollingCounter::new(RollingOpts::spanning(Duration::from_secs(10), 100), shared);

    for i in 0..10_000 {
        if i > 0 {
            clock.advance(MS);
        }
        counter.add(1);
    }
    // Adds span 0..=9999ms: buckets 0..=99, 100 adds each, none stale yet.
    assert_eq!(counter.sum(), 10_000.0);
    assert_eq!(counter.timespan(), 0);

    // One more second makes the current slot 109 and evicts buckets 0..=9.
    clock.advance(Duration::from_secs(1));
    assert_eq!(counter.sum(), 9_000.0);
}

/// Scenario: 10,000 `add(1)` on the real clock. Only time that actually
/// elapsed during the test may evict anything.
#[test]
fn test_ten_thousand_adds_real_clock() {
    let t = Instant::now();
    let counter = RollingCounter::new(RollingOpts::spanning(Duration::from_secs(10), 100), system_clock());
    for _ in 0..10_000 {
        counter.add(1);
    }
    let sum = counter.sum();
    let overhead = t.elapsed();

    assert!(sum <= 10_000.0);
    if overhead < Duration::from_secs(9) {
        assert_eq!(sum, 10_000.0);
    }
    println!("test_ten_thousand_adds_real_clock: Testing Overhead = {:?}", overhead);
}

/// Verifies concurrent writers lose no samples while readers reduce.
#[test]
fn test_concurrent_add_and_reduce() {
    let (_clock, shared) = manual(Duration::from_secs(1));
    let counter = Arc::new(RollingCounter::new(RollingOpts::new(10, 100 * MS), shared));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let c = counter.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..1000 {
                c.add(1);
            }
        }));
    }
    for _ in 0..2 {
        let c = counter.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..1000 {
                let s = c.sum();
                assert!((0.0..=8000.0).contains(&s));
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(counter.sum(), 8000.0);
}

proptest! {
    /// The windowed sum equals the sum of samples whose bucket lies within
    /// the last `size` buckets, for any sequence of writes and idle gaps.
    #[test]
    fn prop_sum_matches_trailing_buckets(
        ops in prop::collection::vec((0u64..400, 0u64..100), 1..60),
        tail in 0u64..2000,
    ) {
        let size = 10usize;
        let d = 100u64;
        let (clock, shared) = manual(Duration::from_secs(1));
        let counter = RollingCounter::new(RollingOpts::new(size, Duration::from_millis(d)), shared);

        let mut now = 0u64;
        let mut samples = Vec::new();
        for (gap, value) in ops {
            now += gap;
            clock.advance(Duration::from_millis(gap));
            counter.add(value);
            samples.push((now / d, value));
        }
        now += tail;
        clock.advance(Duration::from_millis(tail));

        let current = (now / d) as i64;
        let expected: u64 = samples
            .iter()
            .filter(|(slot, _)| *slot as i64 > current - size as i64)
            .map(|(_, v)| v)
            .sum();
        prop_assert_eq!(counter.sum(), expected as f64);
    }
}
