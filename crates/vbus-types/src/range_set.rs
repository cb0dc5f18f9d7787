use serde::{Deserialize, Serialize};

/// A half-open address range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRange {
    pub start: u64,
    pub end: u64,
}

impl AddressRange {
    /// A reversed pair collapses to the empty range at `start`.
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A set of disjoint, sorted address ranges.
///
/// The address mapper uses it to track free space while placing devices.
///
/// Invariants:
/// - Ranges are stored in ascending order.
/// - No ranges overlap or touch (adjacent ranges are merged).
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRangeSet {
    ranges: Vec<AddressRange>,
}

impl AddressRangeSet {
    pub fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// A set holding the single range `[start, end)`.
    pub fn with_range(start: u64, end: u64) -> Self {
        let mut set = Self::new();
        set.insert(start, end);
        set
    }

    pub fn ranges(&self) -> &[AddressRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn total_len(&self) -> u64 {
        self.ranges
            .iter()
            .map(AddressRange::len)
            .fold(0, u64::saturating_add)
    }

    pub fn contains_range(&self, start: u64, end: u64) -> bool {
        if start >= end {
            return true;
        }
        let idx = self.ranges.partition_point(|r| r.end <= start);
        self.ranges
            .get(idx)
            .is_some_and(|r| r.start <= start && r.end >= end)
    }

    /// Start of the lowest range holding at least `len` addresses.
    pub fn first_fit(&self, len: u64) -> Option<u64> {
        if len == 0 {
            return None;
        }
        self.ranges.iter().find(|r| r.len() >= len).map(|r| r.start)
    }

    /// Lowest range holding at least `len` addresses.
    pub fn first_range_at_least(&self, len: u64) -> Option<AddressRange> {
        self.ranges.iter().copied().find(|r| len > 0 && r.len() >= len)
    }

    /// Insert `[start, end)`, coalescing with every range it overlaps or touches.
    pub fn insert(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }

        let first = self.ranges.partition_point(|r| r.end < start);
        let last = self.ranges.partition_point(|r| r.start <= end);
        let mut joined = AddressRange::new(start, end);
        if let Some(touched) = self.ranges.get(first..last) {
            if let (Some(lo), Some(hi)) = (touched.first(), touched.last()) {
                joined = AddressRange::new(lo.start.min(start), hi.end.max(end));
            }
        }
        self.ranges.splice(first..last, [joined]);
    }

    /// Remove `[start, end)`, splitting any range that straddles either edge.
    pub fn remove(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }

        let first = self.ranges.partition_point(|r| r.end <= start);
        let last = self.ranges.partition_point(|r| r.start < end);
        let Some(cut) = self.ranges.get(first..last) else {
            return;
        };
        let (Some(lo), Some(hi)) = (cut.first(), cut.last()) else {
            return;
        };
        let kept = [
            AddressRange::new(lo.start, start),
            AddressRange::new(end, hi.end),
        ];
        self.ranges
            .splice(first..last, kept.into_iter().filter(|r| !r.is_empty()));
    }
}
