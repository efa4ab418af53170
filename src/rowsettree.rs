//! Module `rowsettree` implement the interval index routing
//! primary-key probes and scan ranges to the rowsets covering them.
//!
//! The tree is immutable; every rowset-set change (flush, compaction
//! swap) builds a fresh tree and publishes it atomically. Readers
//! hold an `Arc` to whichever tree they started with.

use std::{ops::Bound, sync::Arc};

use crate::{drs::DiskRowSet, mrs::MemRowSet};

/// Rowset variants addressed by the tree. The MemRowSet covers the
/// whole key space; DiskRowSets cover `[min_key, max_key]`.
#[derive(Clone)]
pub enum RowSetRef {
    Mrs(Arc<MemRowSet>),
    Drs(Arc<DiskRowSet>),
}

/// Interval index over the committed rowsets plus the live MemRowSet.
pub struct RowSetTree {
    mrs: Arc<MemRowSet>,
    /// DiskRowSets sorted by min_key.
    drs: Vec<Arc<DiskRowSet>>,
    /// prefix_max[i] = max over drs[..=i] of max_key; bounds the
    /// leftward walk of interval stabs.
    prefix_max: Vec<Vec<u8>>,
}

impl RowSetTree {
    /// Build a fresh tree from the current rowset set.
    pub fn new(mrs: Arc<MemRowSet>, mut drs: Vec<Arc<DiskRowSet>>) -> RowSetTree {
        drs.sort_by(|a, b| a.as_min_key().cmp(b.as_min_key()));

        let mut prefix_max: Vec<Vec<u8>> = Vec::with_capacity(drs.len());
        for rs in drs.iter() {
            let mut max = rs.as_max_key().to_vec();
            if let Some(prev) = prefix_max.last() {
                if *prev > max {
                    max = prev.clone();
                }
            }
            prefix_max.push(max);
        }

        RowSetTree {
            mrs,
            drs,
            prefix_max,
        }
    }

    pub fn as_mrs(&self) -> &Arc<MemRowSet> {
        &self.mrs
    }

    pub fn as_drs(&self) -> &[Arc<DiskRowSet>] {
        &self.drs
    }

    /// Every DiskRowSet whose `[min_key, max_key]` contains `key`, in
    /// min_key order. The MemRowSet, which always contains the point,
    /// is not repeated here.
    pub fn find_drs_containing(&self, key: &[u8]) -> Vec<Arc<DiskRowSet>> {
        let mut found = vec![];
        // right-most candidate: first rowset with min_key > key
        let end = self
            .drs
            .partition_point(|rs| rs.as_min_key() <= key);
        for i in (0..end).rev() {
            if self.prefix_max[i].as_slice() < key {
                break;
            }
            if self.drs[i].range_contains(key) {
                found.push(Arc::clone(&self.drs[i]));
            }
        }
        found.reverse();
        found
    }

    /// Every DiskRowSet whose key range intersects `range`, in
    /// min_key order.
    pub fn find_drs_intersecting(
        &self,
        range: &(Bound<Vec<u8>>, Bound<Vec<u8>>),
    ) -> Vec<Arc<DiskRowSet>> {
        let mut found = vec![];
        for rs in self.drs.iter() {
            let above_lower = match &range.0 {
                Bound::Unbounded => true,
                Bound::Included(lo) => rs.as_max_key() >= lo.as_slice(),
                Bound::Excluded(lo) => rs.as_max_key() > lo.as_slice(),
            };
            let below_upper = match &range.1 {
                Bound::Unbounded => true,
                Bound::Included(hi) => rs.as_min_key() <= hi.as_slice(),
                Bound::Excluded(hi) => rs.as_min_key() < hi.as_slice(),
            };
            if above_lower && below_upper {
                found.push(Arc::clone(rs));
            }
        }
        found
    }

    /// Rowsets a point write consults: containing DiskRowSets then
    /// the MemRowSet.
    pub fn find_rowsets_containing(&self, key: &[u8]) -> Vec<RowSetRef> {
        let mut found: Vec<RowSetRef> = self
            .find_drs_containing(key)
            .into_iter()
            .map(RowSetRef::Drs)
            .collect();
        found.push(RowSetRef::Mrs(Arc::clone(&self.mrs)));
        found
    }

    pub fn len(&self) -> usize {
        self.drs.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

#[cfg(test)]
#[path = "rowsettree_test.rs"]
mod rowsettree_test;
