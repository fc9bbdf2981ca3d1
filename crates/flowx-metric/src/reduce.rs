//! Aggregators applied by [`RollingPolicy::reduce`](crate::RollingPolicy::reduce).

use crate::iter::Iter;

/// Sum of every point.
pub fn sum(iter: Iter<'_>) -> f64 {
    iter.map(|bucket| bucket.sum()).sum()
}

/// Sum of every point divided by the number of samples behind them.
/// Returns `0.0` for an empty run.
pub fn avg(iter: Iter<'_>) -> f64 {
    let (total, count) = iter.fold((0.0, 0u64), |(total, count), bucket| {
        (total + bucket.sum(), count + bucket.count)
    });
    if count == 0 {
        return 0.0;
    }
    total / count as f64
}

/// Smallest point, or `0.0` when no point was recorded.
pub fn min(iter: Iter<'_>) -> f64 {
    let res = iter
        .flat_map(|bucket| bucket.points.iter().copied())
        .fold(f64::INFINITY, f64::min);
    if res.is_infinite() {
        0.0
    } else {
        res
    }
}

/// Largest point, seeded at `0.0`.
pub fn max(iter: Iter<'_>) -> f64 {
    iter.flat_map(|bucket| bucket.points.iter().copied())
        .fold(0.0, f64::max)
}

/// Read-side aggregate view over a rolling window.
pub trait Aggregation {
    fn sum(&self) -> f64;
    fn avg(&self) -> f64;
    fn min(&self) -> f64;
    fn max(&self) -> f64;
}
