//! A ledger of reserved offset ranges.
//!
//! `RegionLedger` records which offsets of a backing object (or of a private
//! mapping) are covered by a reservation. Offsets are block indices, and the
//! ledger stores them as half-open `Range<usize>` values that are kept sorted
//! and merged whenever they overlap or touch.
//!
//! The operations come in two flavours:
//!
//! - **Queries**: [`chg`](RegionLedger::chg) reports how many offsets of a
//!   range are *not* yet covered, [`count`](RegionLedger::count) how many are.
//!   Neither mutates the ledger, so a caller can learn the cost of a
//!   reservation, charge it elsewhere, and only then commit it.
//! - **Mutations**: [`add`](RegionLedger::add) commits a range,
//!   [`remove`](RegionLedger::remove) punches a hole and
//!   [`truncate`](RegionLedger::truncate) drops everything past an offset.
//!   Each returns how many offsets it changed.
//!
//! # Examples
//!
//! ```
//! use region_ledger::RegionLedger;
//!
//! let mut ledger = RegionLedger::new();
//!
//! assert_eq!(ledger.chg(0..5), 5);
//! assert_eq!(ledger.add(0..5), 5);
//! assert_eq!(ledger.add(3..8), 3); // merges with the existing range
//! assert_eq!(ledger.as_slice(), &[0..8]);
//!
//! assert_eq!(ledger.count(6..10), 2);
//! assert_eq!(ledger.truncate(4), 4);
//! assert_eq!(ledger.as_slice(), &[0..4]);
//! ```
//!
//! # Performance
//!
//! - Add / remove / truncate: O(n) worst case, where n is the number of
//!   ranges
//! - Chg / count: O(n)

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::vec::Vec;
use core::{mem, ops::Range, slice};

/// Sorted, non-overlapping, merged offset ranges.
///
/// # Examples
///
/// ```
/// use region_ledger::RegionLedger;
///
/// let mut ledger = RegionLedger::new();
/// ledger.add(1..5);
/// ledger.add(5..7);
/// assert_eq!(ledger.as_slice(), &[1..7]); // abutting ranges are merged
/// ```
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct RegionLedger {
    regions: Vec<Range<usize>>,
}

fn overlap(a: &Range<usize>, b: &Range<usize>) -> usize {
    let start = usize::max(a.start, b.start);
    let end = usize::min(a.end, b.end);
    end.saturating_sub(start)
}

impl RegionLedger {
    /// Creates a new empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an iterator over the recorded ranges in ascending order.
    pub fn iter(&self) -> slice::Iter<'_, Range<usize>> {
        self.regions.iter()
    }

    /// Returns the recorded ranges in ascending order.
    #[must_use]
    pub fn as_slice(&self) -> &[Range<usize>] {
        self.regions.as_slice()
    }

    /// Returns `true` if no offset is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Returns the number of offsets covered by the ledger.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.iter().map(ExactSizeIterator::len).sum()
    }

    /// Records `range`, merging it with every range it overlaps or touches.
    ///
    /// Returns the number of offsets that were not covered before.
    ///
    /// # Panics
    ///
    /// Panics if `range.start > range.end`.
    ///
    /// # Examples
    ///
    /// ```
    /// use region_ledger::RegionLedger;
    ///
    /// let mut ledger = RegionLedger::new();
    /// assert_eq!(ledger.add(1..3), 2);
    /// assert_eq!(ledger.add(5..7), 2);
    /// assert_eq!(ledger.add(2..6), 2);
    /// assert_eq!(ledger.as_slice(), &[1..7]);
    /// assert_eq!(ledger.add(1..7), 0);
    /// ```
    pub fn add(&mut self, range: Range<usize>) -> usize {
        assert!(range.start <= range.end, "Invalid range: {range:?}");
        if range.is_empty() {
            return 0;
        }

        let added = self.chg(range.clone());
        if added == 0 {
            return 0;
        }

        let mut inserted = false;
        let mut ir = range;
        let mut regions = mem::take(&mut self.regions).into_iter();
        for r in regions.by_ref() {
            if ir.end < r.start {
                inserted = true;
                self.regions.push(ir.clone());
                self.regions.push(r);
                break;
            }

            if ir.start > r.end {
                self.regions.push(r);
                continue;
            }

            ir.start = usize::min(ir.start, r.start);
            ir.end = usize::max(ir.end, r.end);
        }
        if inserted {
            self.regions.extend(regions);
        } else {
            assert!(regions.as_slice().is_empty());
            self.regions.push(ir);
        }
        added
    }

    /// Returns how many offsets of `range` are not covered yet.
    ///
    /// This is the cost of committing `range` with [`add`](Self::add). The
    /// ledger is left untouched.
    ///
    /// # Panics
    ///
    /// Panics if `range.start > range.end`.
    #[must_use]
    pub fn chg(&self, range: Range<usize>) -> usize {
        let len = range.len();
        len - self.count(range)
    }

    /// Returns how many offsets of `range` are covered.
    ///
    /// # Panics
    ///
    /// Panics if `range.start > range.end`.
    #[must_use]
    pub fn count(&self, range: Range<usize>) -> usize {
        assert!(range.start <= range.end, "Invalid range: {range:?}");
        self.regions
            .iter()
            .skip_while(|r| r.end <= range.start)
            .take_while(|r| r.start < range.end)
            .map(|r| overlap(r, &range))
            .sum()
    }

    /// Removes `range` from the ledger, trimming or splitting ranges as
    /// necessary.
    ///
    /// Returns the number of offsets removed.
    ///
    /// # Panics
    ///
    /// Panics if `range.start > range.end`.
    ///
    /// # Examples
    ///
    /// ```
    /// use region_ledger::RegionLedger;
    ///
    /// let mut ledger = RegionLedger::new();
    /// ledger.add(1..10);
    /// assert_eq!(ledger.remove(3..7), 4);
    /// assert_eq!(ledger.as_slice(), &[1..3, 7..10]);
    /// ```
    pub fn remove(&mut self, range: Range<usize>) -> usize {
        assert!(range.start <= range.end, "Invalid range: {range:?}");
        if range.is_empty() {
            return 0;
        }

        let rr = range;
        let mut removed = 0;
        let mut regions = mem::take(&mut self.regions).into_iter();
        for r in regions.by_ref() {
            if rr.end <= r.start {
                self.regions.push(r);
                break;
            }
            if r.start < rr.end && rr.start < r.end {
                removed += overlap(&r, &rr);
                if r.start < rr.start {
                    self.regions.push(r.start..rr.start);
                }
                if rr.end < r.end {
                    self.regions.push(rr.end..r.end);
                }
            } else {
                self.regions.push(r);
            }
        }
        self.regions.extend(regions);
        removed
    }

    /// Drops every offset at or beyond `end`.
    ///
    /// Returns the number of offsets removed.
    ///
    /// # Examples
    ///
    /// ```
    /// use region_ledger::RegionLedger;
    ///
    /// let mut ledger: RegionLedger = [0..4, 6..9].into_iter().collect();
    /// assert_eq!(ledger.truncate(2), 5);
    /// assert_eq!(ledger.as_slice(), &[0..2]);
    /// ```
    pub fn truncate(&mut self, end: usize) -> usize {
        self.remove(end..usize::MAX)
    }

    /// Drops every recorded offset, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let len = self.len();
        self.regions.clear();
        len
    }
}

impl FromIterator<Range<usize>> for RegionLedger {
    fn from_iter<T: IntoIterator<Item = Range<usize>>>(iter: T) -> Self {
        let mut this = Self::new();
        this.extend(iter);
        this
    }
}

impl Extend<Range<usize>> for RegionLedger {
    fn extend<T: IntoIterator<Item = Range<usize>>>(&mut self, iter: T) {
        for range in iter {
            self.add(range);
        }
    }
}

impl IntoIterator for RegionLedger {
    type Item = Range<usize>;
    type IntoIter = alloc::vec::IntoIter<Range<usize>>;

    fn into_iter(self) -> Self::IntoIter {
        self.regions.into_iter()
    }
}

impl<'a> IntoIterator for &'a RegionLedger {
    type Item = &'a Range<usize>;
    type IntoIter = slice::Iter<'a, Range<usize>>;

    fn into_iter(self) -> Self::IntoIter {
        self.regions.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[expect(clippy::single_range_in_vec_init)]
    fn test_add_overlapping() {
        let mut ledger = RegionLedger::new();
        assert_eq!(ledger.add(0..5), 5);
        assert_eq!(ledger.add(3..8), 3);
        assert_eq!(ledger.as_slice(), &[0..8]);
    }

    #[test]
    #[expect(clippy::single_range_in_vec_init)]
    fn test_add_adjacent() {
        let mut ledger = RegionLedger::new();
        ledger.add(1..3);
        ledger.add(3..5);
        assert_eq!(ledger.as_slice(), &[1..5]);
    }

    #[test]
    #[expect(clippy::single_range_in_vec_init)]
    fn test_add_is_idempotent() {
        let mut ledger = RegionLedger::new();
        assert_eq!(ledger.add(2..6), 4);
        assert_eq!(ledger.add(2..6), 0);
        assert_eq!(ledger.add(3..4), 0);
        assert_eq!(ledger.as_slice(), &[2..6]);
    }

    #[test]
    fn test_add_disjoint_at_middle() {
        let mut ledger = RegionLedger::new();
        ledger.add(1..3);
        ledger.add(7..10);
        ledger.add(14..20);
        ledger.add(4..6);
        assert_eq!(ledger.as_slice(), &[1..3, 4..6, 7..10, 14..20]);
    }

    #[test]
    #[expect(clippy::single_range_in_vec_init)]
    fn test_add_swallows_many() {
        let mut ledger: RegionLedger = [1..2, 4..5, 7..8].into_iter().collect();
        assert_eq!(ledger.add(0..9), 6);
        assert_eq!(ledger.as_slice(), &[0..9]);
    }

    #[test]
    fn test_add_empty_range() {
        let mut ledger = RegionLedger::new();
        assert_eq!(ledger.add(3..3), 0);
        assert!(ledger.is_empty());
    }

    #[test]
    #[should_panic(expected = "Invalid range: 5..2")]
    fn test_add_invalid_range() {
        let mut ledger = RegionLedger::new();
        #[expect(clippy::reversed_empty_ranges)]
        ledger.add(5..2);
    }

    #[test]
    fn test_chg_does_not_mutate() {
        let mut ledger = RegionLedger::new();
        ledger.add(2..4);
        assert_eq!(ledger.chg(0..10), 8);
        assert_eq!(ledger.chg(2..4), 0);
        assert_eq!(ledger.chg(3..5), 1);
        assert_eq!(ledger.chg(20..21), 1);
        assert_eq!(ledger.as_slice(), &[2..4]);
    }

    #[test]
    fn test_count() {
        let ledger: RegionLedger = [0..3, 5..8, 10..12].into_iter().collect();
        assert_eq!(ledger.count(0..12), 8);
        assert_eq!(ledger.count(2..6), 2);
        assert_eq!(ledger.count(3..5), 0);
        assert_eq!(ledger.count(11..100), 1);
        assert_eq!(ledger.count(4..4), 0);
    }

    #[test]
    fn test_remove_middle_split() {
        let mut ledger = RegionLedger::new();
        ledger.add(1..10);
        assert_eq!(ledger.remove(3..7), 4);
        assert_eq!(ledger.as_slice(), &[1..3, 7..10]);
    }

    #[test]
    fn test_remove_multiple_ranges() {
        let mut ledger: RegionLedger = [1..3, 5..7, 9..11].into_iter().collect();
        assert_eq!(ledger.remove(5..10), 3);
        assert_eq!(ledger.as_slice(), &[1..3, 10..11]);
    }

    #[test]
    #[expect(clippy::single_range_in_vec_init)]
    fn test_remove_non_overlapping() {
        let mut ledger = RegionLedger::new();
        ledger.add(1..5);
        assert_eq!(ledger.remove(5..8), 0);
        assert_eq!(ledger.as_slice(), &[1..5]);
    }

    #[test]
    fn test_truncate() {
        let mut ledger: RegionLedger = [0..4, 6..9, 12..20].into_iter().collect();
        assert_eq!(ledger.truncate(7), 10);
        assert_eq!(ledger.as_slice(), &[0..4, 6..7]);
        assert_eq!(ledger.truncate(0), 5);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_len_and_clear() {
        let mut ledger: RegionLedger = [0..4, 6..9].into_iter().collect();
        assert_eq!(ledger.len(), 7);
        assert_eq!(ledger.clear(), 7);
        assert!(ledger.is_empty());
    }

    /// Replays a pseudo-random operation sequence against a bitmap.
    #[test]
    fn test_matches_bitmap_model() {
        const SPAN: usize = 64;

        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        let mut next = move |bound: usize| {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            usize::try_from(seed % (bound as u64)).unwrap()
        };

        let mut ledger = RegionLedger::new();
        let mut model = [false; SPAN];

        for _ in 0..2000 {
            let a = next(SPAN);
            let b = next(SPAN);
            let range = usize::min(a, b)..usize::max(a, b);
            let expected_count = model[range.clone()].iter().filter(|x| **x).count();
            assert_eq!(ledger.count(range.clone()), expected_count);
            assert_eq!(ledger.chg(range.clone()), range.len() - expected_count);

            match next(3) {
                0 => {
                    let added = ledger.add(range.clone());
                    assert_eq!(added, range.len() - expected_count);
                    model[range].fill(true);
                }
                1 => {
                    let removed = ledger.remove(range.clone());
                    assert_eq!(removed, expected_count);
                    model[range].fill(false);
                }
                _ => {
                    let end = range.end;
                    let expected = model[end..].iter().filter(|x| **x).count();
                    assert_eq!(ledger.truncate(end), expected);
                    model[end..].fill(false);
                }
            }

            for pair in ledger.as_slice().windows(2) {
                assert!(pair[0].end < pair[1].start, "not merged: {pair:?}");
            }
            assert!(ledger.iter().all(|r| !r.is_empty()));
            assert_eq!(ledger.len(), model.iter().filter(|x| **x).count());
        }
    }

    #[test]
    fn test_into_iter() {
        let ledger: RegionLedger = [1..3, 4..6].into_iter().collect();
        let ranges: Vec<_> = ledger.iter().cloned().collect();
        assert_eq!(ranges, vec![1..3, 4..6]);
        let ranges: Vec<_> = ledger.into_iter().collect();
        assert_eq!(ranges, vec![1..3, 4..6]);
    }
}
