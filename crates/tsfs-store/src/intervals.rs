//! Inclusive integer interval sets for valid-data and provenance tracking.
//!
//! Sets stay sorted, non-overlapping and coalesced. Adding an interval
//! replaces whatever previously covered its range, which is how a later
//! writer supersedes an earlier producer's origin on a sub-range.

use serde::{Deserialize, Serialize};

/// Common behaviour of interval types stored in an [`IntervalSet`].
pub trait Span: Clone + PartialEq {
    /// First covered point.
    fn start(&self) -> u64;
    /// Last covered point (inclusive).
    fn end(&self) -> u64;
    /// Copy of this interval restricted to `[start, end]`.
    fn with_bounds(&self, start: u64, end: u64) -> Self;
    /// Whether two touching intervals may be merged into one.
    fn mergeable(&self, other: &Self) -> bool;
}

/// A plain inclusive interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SimpleInterval {
    /// First covered point.
    pub start: u64,
    /// Last covered point.
    pub end: u64,
}

impl SimpleInterval {
    /// Creates `[start, end]`.
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }
}

impl Span for SimpleInterval {
    fn start(&self) -> u64 {
        self.start
    }
    fn end(&self) -> u64 {
        self.end
    }
    fn with_bounds(&self, start: u64, end: u64) -> Self {
        Self { start, end }
    }
    fn mergeable(&self, _other: &Self) -> bool {
        true
    }
}

/// An inclusive interval tagged with the producer that wrote it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaggedInterval {
    /// First covered point.
    pub start: u64,
    /// Last covered point.
    pub end: u64,
    /// Origin tag, usually a pipeline task id.
    pub tag: u64,
}

impl TaggedInterval {
    /// Creates `[start, end]` tagged with `tag`.
    pub fn new(start: u64, end: u64, tag: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end, tag }
    }
}

impl Span for TaggedInterval {
    fn start(&self) -> u64 {
        self.start
    }
    fn end(&self) -> u64 {
        self.end
    }
    fn with_bounds(&self, start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            tag: self.tag,
        }
    }
    fn mergeable(&self, other: &Self) -> bool {
        self.tag == other.tag
    }
}

/// Sorted, coalesced set of non-overlapping intervals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalSet<I> {
    intervals: Vec<I>,
}

impl<I> Default for IntervalSet<I> {
    fn default() -> Self {
        Self {
            intervals: Vec::new(),
        }
    }
}

impl<I: Span> IntervalSet<I> {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set by adding each interval in order.
    pub fn from_intervals(intervals: impl IntoIterator<Item = I>) -> Self {
        let mut set = Self::new();
        for iv in intervals {
            set.add(iv);
        }
        set
    }

    /// Adds `iv`, replacing anything previously covering its range.
    pub fn add(&mut self, iv: I) {
        self.remove(iv.start(), iv.end());
        let pos = self
            .intervals
            .partition_point(|existing| existing.start() < iv.start());
        self.intervals.insert(pos, iv);
        self.coalesce_around(pos);
    }

    /// Removes coverage of `[start, end]`, splitting intervals at the edges.
    pub fn remove(&mut self, start: u64, end: u64) {
        if start > end {
            return;
        }
        let mut kept = Vec::with_capacity(self.intervals.len() + 1);
        for iv in self.intervals.drain(..) {
            if iv.end() < start || iv.start() > end {
                kept.push(iv);
                continue;
            }
            if iv.start() < start {
                kept.push(iv.with_bounds(iv.start(), start - 1));
            }
            if iv.end() > end {
                kept.push(iv.with_bounds(end + 1, iv.end()));
            }
        }
        self.intervals = kept;
    }

    /// Intervals overlapping `[start, end]`, clipped to it.
    pub fn spanned(&self, start: u64, end: u64) -> Vec<I> {
        self.intervals
            .iter()
            .filter(|iv| iv.end() >= start && iv.start() <= end)
            .map(|iv| iv.with_bounds(iv.start().max(start), iv.end().min(end)))
            .collect()
    }

    /// The interval covering `point`, if any.
    pub fn find(&self, point: u64) -> Option<&I> {
        let pos = self.intervals.partition_point(|iv| iv.end() < point);
        self.intervals
            .get(pos)
            .filter(|iv| iv.start() <= point)
    }

    /// Returns true if `point` is covered.
    pub fn contains(&self, point: u64) -> bool {
        self.find(point).is_some()
    }

    /// Smallest covered point.
    pub fn min(&self) -> Option<u64> {
        self.intervals.first().map(|iv| iv.start())
    }

    /// Largest covered point.
    pub fn max(&self) -> Option<u64> {
        self.intervals.last().map(|iv| iv.end())
    }

    /// Returns true if nothing is covered.
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Number of disjoint intervals.
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    /// The intervals in ascending order.
    pub fn intervals(&self) -> &[I] {
        &self.intervals
    }

    fn coalesce_around(&mut self, pos: usize) {
        let mut pos = pos;
        if pos > 0 && Self::touches(&self.intervals[pos - 1], &self.intervals[pos]) {
            let merged = self.intervals[pos - 1]
                .with_bounds(self.intervals[pos - 1].start(), self.intervals[pos].end());
            self.intervals[pos - 1] = merged;
            self.intervals.remove(pos);
            pos -= 1;
        }
        if pos + 1 < self.intervals.len()
            && Self::touches(&self.intervals[pos], &self.intervals[pos + 1])
        {
            let merged = self.intervals[pos]
                .with_bounds(self.intervals[pos].start(), self.intervals[pos + 1].end());
            self.intervals[pos] = merged;
            self.intervals.remove(pos + 1);
        }
    }

    fn touches(left: &I, right: &I) -> bool {
        left.mergeable(right) && left.end().checked_add(1) == Some(right.start())
    }
}

/// Set of valid (written, non-gap) points.
pub type ValidSet = IntervalSet<SimpleInterval>;
/// Set of origin-tagged ranges.
pub type OriginSet = IntervalSet<TaggedInterval>;
