//! Routing between the root table and the data table.
//!
//! The tree walks one virtual shape but interns into two surrogate
//! spaces: interior pairs go to the data table, the topmost pair of each
//! externally visible vector goes to the root table, keyed on its length
//! as well so that equal pairs of different-length vectors stay distinct.
//! Which tables actually back those two spaces is a compile-time
//! composition choice.

use crate::hashset::{HashSet128, HashSet64, Prober, QuadLinear, TableStats};

/// Combined occupancy of a store's tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Root-table occupancy (zero-sized for [`SingleLevel`]).
    pub root: TableStats,
    /// Data-table occupancy.
    pub data: TableStats,
}

impl StoreStats {
    /// Root and data tables combined.
    pub fn combined(&self) -> TableStats {
        let mut t = self.root;
        t += self.data;
        t
    }
}

/// Backing-table policy for a tree.
///
/// All three operations take the pair value, the vector length the pair
/// roots (meaningful for root accesses only), and the `is_root` flag that
/// is true exactly for the outermost access of an operation. Results use
/// the [`FRESH`](crate::hashset::FRESH)/[`NOT_FOUND`](crate::hashset::NOT_FOUND)
/// encoding of the hash sets.
pub trait Storage: Send + Sync {
    /// Find-or-put a pair, returning its slot.
    fn fop(&self, pair: u64, length: u64, is_root: bool) -> u64;

    /// Find a pair without inserting.
    fn find(&self, pair: u64, length: u64, is_root: bool) -> u64;

    /// Read the pair stored at `slot`.
    fn get(&self, slot: u64, is_root: bool) -> u64;

    /// Occupancy of the backing tables.
    fn stats(&self) -> StoreStats;
}

/// Roots in a 128-bit table keyed on (pair, length); interior pairs in a
/// 64-bit table. The canonical policy.
pub struct SeparateRoot<P: Prober = QuadLinear> {
    roots: HashSet128<P>,
    data: HashSet64<P>,
}

impl<P: Prober> SeparateRoot<P> {
    /// Allocate the root and data tables with `2^scale` slots each.
    pub fn new(root_scale: u32, data_scale: u32) -> Self {
        // Interior surrogates are packed into 32-bit pair halves; root
        // surrogates must fit the 40-bit handle id.
        assert!(data_scale <= 32, "data table scale limited to 32");
        assert!(root_scale <= 40, "root table scale limited to 40");
        Self {
            roots: HashSet128::new(root_scale),
            data: HashSet64::new(data_scale),
        }
    }

    /// The root table.
    pub fn roots(&self) -> &HashSet128<P> {
        &self.roots
    }

    /// The data table.
    pub fn data(&self) -> &HashSet64<P> {
        &self.data
    }
}

impl<P: Prober> Storage for SeparateRoot<P> {
    #[inline]
    fn fop(&self, pair: u64, length: u64, is_root: bool) -> u64 {
        if is_root {
            self.roots.insert(pair, length)
        } else {
            self.data.insert(pair)
        }
    }

    #[inline]
    fn find(&self, pair: u64, length: u64, is_root: bool) -> u64 {
        if is_root {
            self.roots.find(pair, length)
        } else {
            self.data.find(pair)
        }
    }

    #[inline]
    fn get(&self, slot: u64, is_root: bool) -> u64 {
        if is_root {
            self.roots.get(slot).0
        } else {
            self.data.get(slot)
        }
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            root: self.roots.stats(),
            data: self.data.stats(),
        }
    }
}

/// Everything in one 64-bit table; roots lose their length binding and
/// carry it only in the handle.
pub struct SingleLevel<P: Prober = QuadLinear> {
    data: HashSet64<P>,
}

impl<P: Prober> SingleLevel<P> {
    /// Allocate the table with `2^scale` slots.
    pub fn new(scale: u32) -> Self {
        assert!(scale <= 32, "table scale limited to 32");
        Self {
            data: HashSet64::new(scale),
        }
    }

    /// The backing table.
    pub fn data(&self) -> &HashSet64<P> {
        &self.data
    }
}

impl<P: Prober> Storage for SingleLevel<P> {
    #[inline]
    fn fop(&self, pair: u64, _length: u64, _is_root: bool) -> u64 {
        self.data.insert(pair)
    }

    #[inline]
    fn find(&self, pair: u64, _length: u64, _is_root: bool) -> u64 {
        self.data.find(pair)
    }

    #[inline]
    fn get(&self, slot: u64, _is_root: bool) -> u64 {
        self.data.get(slot)
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            root: TableStats::default(),
            data: self.data.stats(),
        }
    }
}
