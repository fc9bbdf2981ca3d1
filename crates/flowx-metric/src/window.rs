use crate::iter::Iter;

/// Samples accumulated during one time slice of a rolling window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bucket {
    /// Every point recorded in this slice. `add` keeps a single running point,
    /// `append` pushes one point per sample.
    pub points: Vec<f64>,
    /// Number of samples folded into `points`.
    pub count: u64,
}

impl Bucket {
    pub fn append(&mut self, point: f64) {
        self.points.push(point);
        self.count += 1;
    }

    /// Adds `delta` to the point at `offset`.
    pub fn add(&mut self, offset: usize, delta: f64) {
        self.points[offset] += delta;
        self.count += 1;
    }

    /// Empties the bucket. The point buffer keeps its capacity.
    pub fn reset(&mut self) {
        self.points.clear();
        self.count = 0;
    }

    pub fn sum(&self) -> f64 {
        self.points.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// A fixed ring of buckets.
///
/// ## Mechanical Sympathy: Index Ring
/// The buckets live in one contiguous allocation and the ring is expressed
/// with modular index arithmetic: the successor of bucket `i` is
/// `(i + 1) % size`. The ring is never reallocated after construction.
#[derive(Debug, Clone)]
pub struct Window {
    buckets: Vec<Bucket>,
}

impl Window {
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "Window: size must be > 0");
        let mut buckets = Vec::with_capacity(size);
        buckets.resize_with(size, Bucket::default);
        Self { buckets }
    }

    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    /// Index of the bucket that follows `offset` in the ring.
    #[inline(always)]
    pub fn next_offset(&self, offset: usize) -> usize {
        let next = offset + 1;
        if next == self.buckets.len() {
            0
        } else {
            next
        }
    }

    pub fn reset(&mut self) {
        for bucket in &mut self.buckets {
            bucket.reset();
        }
    }

    pub fn reset_bucket(&mut self, offset: usize) {
        self.buckets[offset].reset();
    }

    pub fn reset_buckets(&mut self, offsets: &[usize]) {
        for &offset in offsets {
            self.buckets[offset].reset();
        }
    }

    /// Pushes a new point into the bucket at `offset`.
    pub fn append_bucket_point(&mut self, offset: usize, point: f64) {
        self.buckets[offset].append(point);
    }

    /// Merges `val` into the running point of the bucket at `offset`,
    /// creating that point if the bucket is empty.
    pub fn add_bucket_point(&mut self, offset: usize, val: f64) {
        let bucket = &mut self.buckets[offset];
        if bucket.count == 0 {
            bucket.append(val);
        } else {
            bucket.add(0, val);
        }
    }

    pub fn bucket(&self, offset: usize) -> &Bucket {
        &self.buckets[offset]
    }

    /// Returns an iterator over `count` buckets starting at `offset`.
    pub fn iter(&self, offset: usize, count: usize) -> Iter<'_> {
        assert!(
            offset < self.buckets.len(),
            "Window: iterator offset {} out of range (size {})",
            offset,
            self.buckets.len()
        );
        Iter::new(self, offset, count)
    }
}
