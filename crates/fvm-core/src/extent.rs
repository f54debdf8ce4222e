//! Run-length-encoded slice maps.
//!
//! A [`SliceExtent`] maps a contiguous run of virtual slices onto recorded
//! physical slices; a [`SliceMap`] is the per-partition ordered collection
//! of extents. Memory cost is proportional to the number of contiguous
//! *runs*, not the number of slices, which is what matters in practice:
//! sequential workloads produce a handful of large extents.
//!
//! Map invariants, maintained by every mutation:
//! - extents are non-overlapping;
//! - adjacent extents are always merged (`slice_set` re-merges eagerly);
//! - a live extent never records physical slice 0.

use fvm_error::{FvmError, Result};
use fvm_types::{Pslice, Vslice};
use std::collections::BTreeMap;

/// A contiguous run of virtual slices `[start, start + len)` and the
/// physical slice backing each one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceExtent {
    start: u64,
    pslices: Vec<u64>,
}

impl SliceExtent {
    #[must_use]
    pub fn new(start: Vslice) -> Self {
        Self {
            start: start.0,
            pslices: Vec::new(),
        }
    }

    #[must_use]
    pub fn start(&self) -> Vslice {
        Vslice(self.start)
    }

    /// One past the last virtual slice covered.
    #[must_use]
    pub fn end(&self) -> Vslice {
        Vslice(self.start + self.pslices.len() as u64)
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.pslices.len() as u64
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pslices.is_empty()
    }

    #[must_use]
    pub fn contains(&self, vslice: Vslice) -> bool {
        vslice.0 >= self.start && vslice.0 < self.end().0
    }

    /// Physical slice backing `vslice`, if this extent covers it.
    #[must_use]
    pub fn get(&self, vslice: Vslice) -> Option<Pslice> {
        if !self.contains(vslice) {
            return None;
        }
        let idx = usize::try_from(vslice.0 - self.start).ok()?;
        self.pslices.get(idx).copied().map(Pslice)
    }

    /// Append one more mapping at the tail (`end()` gains one).
    ///
    /// Fails only when growing the backing vector fails.
    pub fn push_back(&mut self, pslice: Pslice) -> Result<()> {
        debug_assert!(!pslice.is_free(), "extent must not record the free sentinel");
        self.pslices
            .try_reserve(1)
            .map_err(|_| FvmError::NoMemory)?;
        self.pslices.push(pslice.0);
        Ok(())
    }

    /// Remove and return the tail mapping. Infallible while non-empty.
    pub fn pop_back(&mut self) -> Option<Pslice> {
        self.pslices.pop().map(Pslice)
    }

    /// Split at `vslice`: the mapping for `vslice` itself is discarded,
    /// `self` is truncated to `[start, vslice)`, and the returned extent
    /// covers `[vslice + 1, old_end)`.
    ///
    /// On allocation failure the extent is left unchanged.
    pub fn split(&mut self, vslice: Vslice) -> Result<Self> {
        debug_assert!(self.contains(vslice));
        let idx = usize::try_from(vslice.0 - self.start).map_err(|_| {
            FvmError::Internal("extent index overflows usize".into())
        })?;

        let tail_len = self.pslices.len() - idx - 1;
        let mut tail = Vec::new();
        tail.try_reserve_exact(tail_len)
            .map_err(|_| FvmError::NoMemory)?;
        tail.extend_from_slice(&self.pslices[idx + 1..]);

        self.pslices.truncate(idx);
        Ok(Self {
            start: vslice.0 + 1,
            pslices: tail,
        })
    }

    /// Append `other`'s mappings when it starts exactly at `self.end()`.
    ///
    /// The caller removes `other` from its map afterwards.
    pub fn merge(&mut self, other: &Self) -> Result<()> {
        debug_assert_eq!(self.end().0, other.start);
        self.pslices
            .try_reserve(other.pslices.len())
            .map_err(|_| FvmError::NoMemory)?;
        self.pslices.extend_from_slice(&other.pslices);
        Ok(())
    }

    /// Iterate the `(vslice, pslice)` pairs covered by this extent.
    pub fn mappings(&self) -> impl Iterator<Item = (Vslice, Pslice)> + '_ {
        self.pslices
            .iter()
            .enumerate()
            .map(|(i, p)| (Vslice(self.start + i as u64), Pslice(*p)))
    }
}

/// Per-partition ordered collection of extents, keyed by starting vslice.
#[derive(Debug, Default, Clone)]
pub struct SliceMap {
    extents: BTreeMap<u64, SliceExtent>,
}

impl SliceMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The extent containing `vslice`, found via predecessor lookup.
    fn extent_key_for(&self, vslice: Vslice) -> Option<u64> {
        let (key, extent) = self.extents.range(..=vslice.0).next_back()?;
        extent.contains(vslice).then_some(*key)
    }

    /// Physical slice backing `vslice`, or the free sentinel.
    #[must_use]
    pub fn get(&self, vslice: Vslice) -> Pslice {
        self.extent_key_for(vslice)
            .and_then(|key| self.extents.get(&key))
            .and_then(|extent| extent.get(vslice))
            .unwrap_or(Pslice::FREE)
    }

    #[must_use]
    pub fn contains(&self, vslice: Vslice) -> bool {
        self.extent_key_for(vslice).is_some()
    }

    /// Record a newly allocated mapping.
    ///
    /// Precondition (caller-checked): `vslice` is not yet allocated.
    /// Appends to the extent ending at `vslice` when one exists, otherwise
    /// inserts a singleton; then re-merges with the following extent if the
    /// two became adjacent. Fails only with `NoMemory`, leaving the map in
    /// its prior state.
    pub fn slice_set(&mut self, vslice: Vslice, pslice: Pslice) -> Result<()> {
        debug_assert!(!self.contains(vslice), "slice_set requires an unallocated vslice");

        // Extend the predecessor when it ends exactly at vslice.
        let appended_to = match self.extents.range_mut(..=vslice.0).next_back() {
            Some((key, extent)) if extent.end() == vslice => {
                extent.push_back(pslice)?;
                Some(*key)
            }
            _ => None,
        };

        let key = match appended_to {
            Some(key) => key,
            None => {
                let mut extent = SliceExtent::new(vslice);
                extent.push_back(pslice)?;
                self.extents.insert(vslice.0, extent);
                vslice.0
            }
        };

        // Re-merge with the successor if the insert made them adjacent.
        if let Some(next) = self.extents.remove(&(vslice.0 + 1)) {
            let merged = self
                .extents
                .get_mut(&key)
                .ok_or_else(|| FvmError::Internal("extent vanished during slice_set".into()))?
                .merge(&next);
            if let Err(err) = merged {
                // Roll the whole set back so the failed call is a no-op.
                self.extents.insert(next.start().0, next);
                if appended_to.is_some() {
                    if let Some(extent) = self.extents.get_mut(&key) {
                        let _ = extent.pop_back();
                    }
                } else {
                    self.extents.remove(&key);
                }
                return Err(err);
            }
        }

        Ok(())
    }

    /// Remove the mapping for one virtual slice.
    ///
    /// Tail and head frees are infallible pops/trims; a mid-extent free
    /// splits first and can fail with `NoMemory`, in which case the slice
    /// stays allocated and the map is unchanged.
    pub fn slice_free(&mut self, vslice: Vslice) -> Result<()> {
        let key = self
            .extent_key_for(vslice)
            .ok_or_else(|| FvmError::OutOfRange(format!("vslice {vslice} is not allocated")))?;

        let extent = self
            .extents
            .get_mut(&key)
            .ok_or_else(|| FvmError::Internal("extent vanished during slice_free".into()))?;

        if vslice.0 == extent.end().0 - 1 {
            // Tail free: guaranteed-success pop.
            let _ = extent.pop_back();
            if extent.is_empty() {
                self.extents.remove(&key);
            }
        } else if vslice.0 == extent.start().0 {
            // Head free: re-key the remainder.
            let tail = extent.split(vslice)?;
            self.extents.remove(&key);
            self.extents.insert(tail.start().0, tail);
        } else {
            let tail = extent.split(vslice)?;
            self.extents.insert(tail.start().0, tail);
        }

        Ok(())
    }

    /// Remove the entire extent containing `vslice`, returning how many
    /// slices it covered. Used for whole-partition teardown, where freeing
    /// slice-by-slice would be quadratic bookkeeping for nothing.
    pub fn extent_destroy(&mut self, vslice: Vslice) -> Option<u64> {
        let key = self.extent_key_for(vslice)?;
        self.extents.remove(&key).map(|extent| extent.len())
    }

    /// Run length of consecutive virtual slices sharing `vslice`'s
    /// allocation status, and that status.
    ///
    /// `vslice_max` caps the free-run length at the partition's address
    /// space.
    #[must_use]
    pub fn range_status(&self, vslice: Vslice, vslice_max: u64) -> (u64, bool) {
        if let Some(key) = self.extent_key_for(vslice) {
            // Allocated: run extends to the end of the containing extent.
            // Adjacent extents cannot exist, so no need to look further.
            let end = self.extents.get(&key).map_or(vslice.0 + 1, |e| e.end().0);
            (end - vslice.0, true)
        } else {
            // Free: run extends to the next extent start, or vslice_max.
            let next_start = self
                .extents
                .range(vslice.0..)
                .next()
                .map_or(vslice_max, |(start, _)| *start);
            (next_start.saturating_sub(vslice.0), false)
        }
    }

    /// Number of extents (contiguous runs).
    #[must_use]
    pub fn extent_count(&self) -> usize {
        self.extents.len()
    }

    /// Total number of allocated slices.
    #[must_use]
    pub fn slice_count(&self) -> u64 {
        self.extents.values().map(SliceExtent::len).sum()
    }

    /// Iterate every `(vslice, pslice)` mapping in ascending vslice order.
    pub fn mappings(&self) -> impl Iterator<Item = (Vslice, Pslice)> + '_ {
        self.extents.values().flat_map(SliceExtent::mappings)
    }

    /// Starting vslice of each extent, in order.
    pub fn extent_starts(&self) -> impl Iterator<Item = Vslice> + '_ {
        self.extents.keys().copied().map(Vslice)
    }

    /// Drop every extent.
    pub fn clear(&mut self) {
        self.extents.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(map: &mut SliceMap, v: u64, p: u64) {
        map.slice_set(Vslice(v), Pslice(p)).expect("slice_set");
    }

    #[test]
    fn set_get_free_round_trip() {
        let mut map = SliceMap::new();
        set(&mut map, 0, 10);
        set(&mut map, 1, 11);
        set(&mut map, 2, 12);

        assert_eq!(map.get(Vslice(1)), Pslice(11));
        assert_eq!(map.extent_count(), 1);

        // Middle-of-extent free: split correctness.
        map.slice_free(Vslice(1)).expect("free");
        assert_eq!(map.get(Vslice(1)), Pslice::FREE);
        assert_eq!(map.get(Vslice(0)), Pslice(10));
        assert_eq!(map.get(Vslice(2)), Pslice(12));
        assert_eq!(map.extent_count(), 2);
        assert_eq!(map.slice_count(), 2);
    }

    #[test]
    fn out_of_order_inserts_converge_to_one_extent() {
        // In-order.
        let mut forward = SliceMap::new();
        set(&mut forward, 0, 10);
        set(&mut forward, 1, 11);
        set(&mut forward, 2, 12);
        assert_eq!(forward.extent_count(), 1);

        // Out of order: 1, then 0, then 2.
        let mut shuffled = SliceMap::new();
        set(&mut shuffled, 1, 11);
        set(&mut shuffled, 0, 10);
        set(&mut shuffled, 2, 12);
        assert_eq!(shuffled.extent_count(), 1);

        for v in 0..3 {
            assert_eq!(shuffled.get(Vslice(v)), forward.get(Vslice(v)));
        }
    }

    #[test]
    fn gap_insert_then_fill_merges() {
        let mut map = SliceMap::new();
        set(&mut map, 0, 5);
        set(&mut map, 2, 7);
        assert_eq!(map.extent_count(), 2);
        assert_eq!(map.get(Vslice(1)), Pslice::FREE);

        // Filling the hole merges all three runs into one.
        set(&mut map, 1, 6);
        assert_eq!(map.extent_count(), 1);
        assert_eq!(map.get(Vslice(1)), Pslice(6));
        assert_eq!(map.slice_count(), 3);
    }

    #[test]
    fn head_and_tail_frees() {
        let mut map = SliceMap::new();
        for v in 0..4 {
            set(&mut map, v, 100 + v);
        }

        map.slice_free(Vslice(3)).expect("tail free");
        assert_eq!(map.get(Vslice(3)), Pslice::FREE);
        assert_eq!(map.extent_count(), 1);

        map.slice_free(Vslice(0)).expect("head free");
        assert_eq!(map.get(Vslice(0)), Pslice::FREE);
        assert_eq!(map.get(Vslice(1)), Pslice(101));
        assert_eq!(map.extent_count(), 1);

        map.slice_free(Vslice(1)).expect("free");
        map.slice_free(Vslice(2)).expect("free");
        assert_eq!(map.extent_count(), 0);
    }

    #[test]
    fn free_unallocated_is_out_of_range() {
        let mut map = SliceMap::new();
        set(&mut map, 5, 9);
        assert!(matches!(
            map.slice_free(Vslice(4)),
            Err(FvmError::OutOfRange(_))
        ));
        assert!(map.slice_free(Vslice(6)).is_err());
    }

    #[test]
    fn extent_destroy_removes_whole_run() {
        let mut map = SliceMap::new();
        for v in 0..5 {
            set(&mut map, v, 50 + v);
        }
        for v in 10..16 {
            set(&mut map, v, 80 + v);
        }
        assert_eq!(map.extent_count(), 2);

        assert_eq!(map.extent_destroy(Vslice(12)), Some(6));
        assert_eq!(map.extent_count(), 1);
        assert_eq!(map.get(Vslice(12)), Pslice::FREE);
        assert_eq!(map.get(Vslice(2)), Pslice(52));

        assert_eq!(map.extent_destroy(Vslice(7)), None);
    }

    #[test]
    fn range_status_reports_runs() {
        let mut map = SliceMap::new();
        for v in 2..5 {
            set(&mut map, v, 30 + v);
        }

        assert_eq!(map.range_status(Vslice(0), 100), (2, false));
        assert_eq!(map.range_status(Vslice(2), 100), (3, true));
        assert_eq!(map.range_status(Vslice(3), 100), (2, true));
        assert_eq!(map.range_status(Vslice(5), 100), (95, false));
    }

    #[test]
    fn extent_split_drops_pivot() {
        let mut extent = SliceExtent::new(Vslice(10));
        for p in 1..=5 {
            extent.push_back(Pslice(p)).expect("push");
        }

        let tail = extent.split(Vslice(12)).expect("split");
        assert_eq!(extent.start(), Vslice(10));
        assert_eq!(extent.end(), Vslice(12));
        assert_eq!(tail.start(), Vslice(13));
        assert_eq!(tail.end(), Vslice(15));
        assert_eq!(extent.get(Vslice(11)), Some(Pslice(2)));
        assert_eq!(tail.get(Vslice(13)), Some(Pslice(4)));
        assert_eq!(tail.get(Vslice(12)), None);
    }

    #[test]
    fn extent_merge_requires_adjacency() {
        let mut left = SliceExtent::new(Vslice(0));
        left.push_back(Pslice(1)).expect("push");
        left.push_back(Pslice(2)).expect("push");

        let mut right = SliceExtent::new(Vslice(2));
        right.push_back(Pslice(3)).expect("push");

        left.merge(&right).expect("merge");
        assert_eq!(left.end(), Vslice(3));
        assert_eq!(left.get(Vslice(2)), Some(Pslice(3)));
    }

    #[test]
    fn mappings_iterate_in_order() {
        let mut map = SliceMap::new();
        set(&mut map, 7, 3);
        set(&mut map, 0, 1);
        set(&mut map, 1, 2);

        let pairs: Vec<_> = map.mappings().collect();
        assert_eq!(
            pairs,
            vec![
                (Vslice(0), Pslice(1)),
                (Vslice(1), Pslice(2)),
                (Vslice(7), Pslice(3)),
            ]
        );
    }
}
