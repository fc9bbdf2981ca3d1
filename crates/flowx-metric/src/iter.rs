use crate::window::{Bucket, Window};

/// A one-shot cursor over a run of buckets in a [`Window`].
///
/// Walks exactly `count` buckets following ring order. It is consumed once and
/// cannot be restarted.
#[derive(Debug)]
pub struct Iter<'a> {
    window: &'a Window,
    cur: usize,
    count: usize,
    iterated: usize,
}

impl<'a> Iter<'a> {
    pub(crate) fn new(window: &'a Window, offset: usize, count: usize) -> Self {
        Self {
            window,
            cur: offset,
            count,
            iterated: 0,
        }
    }

    /// `true` until all `count` buckets have been handed out.
    pub fn has_next(&self) -> bool {
        self.iterated != self.count
    }

    /// Returns the next bucket.
    ///
    /// # Panics
    /// Panics when called after all `count` buckets have been consumed: an
    /// aggregator that reads past its run is broken.
    pub fn bucket(&mut self) -> &'a Bucket {
        if !self.has_next() {
            panic!(
                "Iter: iteration out of range iterated: {} count: {}",
                self.iterated, self.count
            );
        }
        let bucket = self.window.bucket(self.cur);
        self.iterated += 1;
        self.cur = self.window.next_offset(self.cur);
        bucket
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Bucket;

    fn next(&mut self) -> Option<Self::Item> {
        if self.has_next() {
            Some(self.bucket())
        } else {
            None
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.count - self.iterated;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Iter<'_> {}
