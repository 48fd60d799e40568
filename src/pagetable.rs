//! Ordered address index over resident regions.
//!
//! Keyed by region start address. Entries are pairwise disjoint intervals,
//! which is what makes the backward walk in [`PageTable::overlapping`]
//! correct: the regions intersecting a query interval are contiguous in
//! start order.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::region::Region;

#[derive(Default)]
pub(crate) struct PageTable {
    map: BTreeMap<usize, Arc<Region>>,
}

impl PageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The unique region with `start <= addr < end`, if resident.
    pub fn lookup_containing(&self, addr: usize) -> Option<&Arc<Region>> {
        self.map
            .range(..=addr)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.end() > addr)
    }

    /// All regions whose interval intersects `[lo, hi)`, ascending by start.
    ///
    /// O(log n + k): seek to `hi`, walk backwards while intervals still
    /// reach past `lo`.
    pub fn overlapping(&self, lo: usize, hi: usize) -> Vec<Arc<Region>> {
        let mut found: Vec<Arc<Region>> = self
            .map
            .range(..hi)
            .rev()
            .take_while(|(_, r)| r.end() > lo)
            .map(|(_, r)| Arc::clone(r))
            .collect();
        found.reverse();
        found
    }

    /// Insert a region whose interval is disjoint from all current entries.
    pub fn insert(&mut self, region: Arc<Region>) {
        debug_assert!(
            self.overlapping(region.start(), region.end()).is_empty(),
            "inserting overlapping region {:?}",
            region
        );
        let prev = self.map.insert(region.start(), region);
        debug_assert!(prev.is_none());
    }

    pub fn remove(&mut self, start: usize) -> Option<Arc<Region>> {
        self.map.remove(&start)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Region>> {
        self.map.values()
    }

    /// Remove and return every entry, ascending by start.
    pub fn drain(&mut self) -> Vec<Arc<Region>> {
        std::mem::take(&mut self.map).into_values().collect()
    }
}
